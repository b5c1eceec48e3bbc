//! Tessera worker process.
//!
//! Spawned by the scheduler, one process per unit. Reads its subgraph from
//! stdin, runs the tasks against shared memory and exits 0 on success or 1
//! after writing a failure report to the descriptor named by
//! `TESSERA_REPORT_FD`. Logs go to stderr.

mod catalog;

use std::process::ExitCode;

use tessera_core::{PosixShmClient, SerdeRegistry, run_worker};

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let resolver = catalog::catalog();
    let registry = SerdeRegistry::with_builtins();
    let client = PosixShmClient::new();

    run_worker(&resolver, &registry, &client)
}
