//! Tessera CLI - single-host task executor.

mod colors;
mod data;
mod run;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tessera_core::ExecutorConfig;

#[derive(Parser)]
#[command(name = "tessera")]
#[command(about = "Run task subgraphs as isolated processes on this host")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (JSON). Defaults to the user config directory.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a pre-scheduled plan of subgraphs, stage by stage
    Run {
        /// Path to the plan (.json file)
        plan: PathBuf,

        /// Maximum number of concurrently running units
        #[arg(long)]
        pool_size: Option<usize>,
    },

    /// Print the bytes of a task output
    Fetch {
        task: String,
        output: String,

        /// Write to this file instead of stdout
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Delete a task output
    Purge { task: String, output: String },

    /// Show whether a task output is ready
    Status { task: String, output: String },

    /// Describe the host this executor runs on
    Env,
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("tessera").join("config.json"))
}

/// Explicit file, else the default file if it exists, else defaults; then
/// `TESSERA_*` overrides.
fn load_config(path: Option<&PathBuf>) -> anyhow::Result<ExecutorConfig> {
    let config = match path {
        Some(path) => ExecutorConfig::load(path)?,
        None => match default_config_path().filter(|p| p.exists()) {
            Some(path) => ExecutorConfig::load(&path)?,
            None => ExecutorConfig::default(),
        },
    };
    Ok(config.with_env_overrides()?)
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    // Attach recovery hints to tessera-core errors
    let format_error = |err: anyhow::Error| -> anyhow::Error {
        if let Some(core_err) = err.downcast_ref::<tessera_core::Error>() {
            anyhow::anyhow!("{}", core_err.with_hint())
        } else {
            err
        }
    };

    let mut config = load_config(cli.config.as_ref()).map_err(format_error)?;

    match cli.command {
        Commands::Run { plan, pool_size } => {
            if let Some(size) = pool_size {
                config.pool_size = size;
            }
            run::execute(&plan, config).map_err(format_error)?;
        }

        Commands::Fetch { task, output, out } => {
            data::fetch(config, &task, &output, out.as_deref()).map_err(format_error)?;
        }

        Commands::Purge { task, output } => {
            data::purge(config, &task, &output).map_err(format_error)?;
        }

        Commands::Status { task, output } => {
            data::status(config, &task, &output).map_err(format_error)?;
        }

        Commands::Env => {
            data::environment(config).map_err(format_error)?;
        }
    }

    Ok(())
}
