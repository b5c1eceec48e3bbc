//! Commands that inspect or remove published task outputs.

use std::io::Write;
use std::path::Path;

use tessera_core::{DataFuture, Executor, ExecutorConfig};

use crate::colors;

pub fn fetch(
    config: ExecutorConfig,
    task: &str,
    output: &str,
    out: Option<&Path>,
) -> anyhow::Result<()> {
    let executor = Executor::new(config)?;
    let bytes = executor.fetch_as_value(task, output)?;

    match out {
        Some(path) => {
            std::fs::write(path, &bytes)?;
            eprintln!("Wrote {} bytes to {}", bytes.len(), path.display());
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&bytes)?;
            stdout.flush()?;
        }
    }
    Ok(())
}

pub fn purge(config: ExecutorConfig, task: &str, output: &str) -> anyhow::Result<()> {
    let executor = Executor::new(config)?;
    executor.purge(task, output, None)?;
    println!("Purged {}{}{}", colors::CYAN, DataFuture::new(task, output).as_ctrl_id(), colors::RESET);
    Ok(())
}

pub fn status(config: ExecutorConfig, task: &str, output: &str) -> anyhow::Result<()> {
    let mut executor = Executor::new(config)?;
    let ctrl_id = DataFuture::new(task, output).as_ctrl_id();

    if executor.is_done(&ctrl_id)? {
        println!("{}{}{} ready", colors::CYAN, ctrl_id, colors::RESET);
    } else {
        println!(
            "{}{}{} {}pending{}",
            colors::CYAN,
            ctrl_id,
            colors::RESET,
            colors::YELLOW,
            colors::RESET
        );
    }
    Ok(())
}

pub fn environment(config: ExecutorConfig) -> anyhow::Result<()> {
    let executor = Executor::new(config)?;
    println!("{}", serde_json::to_string_pretty(&executor.get_environment())?);
    Ok(())
}
