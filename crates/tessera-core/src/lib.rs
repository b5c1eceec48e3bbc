//! Core engine for the Tessera single-host task executor.
//!
//! This crate provides:
//! - A bounded process-pool scheduler running subgraphs as isolated processes
//! - Opaque control-ids for processes and data outputs
//! - Shared-memory exchange of task outputs with scoped handle release
//! - Per-unit isolated package directories
//! - The worker-side entrypoint that resolves, wires and invokes tasks

pub mod config;
pub mod entrypoint;
pub mod environment;
pub mod error;
pub mod executor;
pub mod futures;
pub mod ipc;
pub mod memory;
pub mod procwatch;
pub mod serde_registry;
pub mod shm;
pub mod task;

pub use config::{DEFAULT_SEARCH_PATH_VAR, ExecutorConfig, SEARCH_PATH_NAME_VAR};
pub use entrypoint::{Call, CallableRef, CallableResolver, TaskFailure, TaskFn, WorkerRuntime, run_worker};
pub use environment::{EnvironmentManager, PackageEnv};
pub use error::{Error, Result};
pub use executor::{Environment, Executor};
pub use futures::{DataFuture, Future, TaskFuture, ctrl_id_to_future};
pub use ipc::ChildReport;
pub use memory::ExecutionMemoryManager;
pub use procwatch::{
    JoinSummary, Launcher, ProcId, ProcWatch, ProcessHandle, SpawnObserver, UnitStatus,
    WaitOutcome, WorkerLauncher,
};
pub use serde_registry::{SerdeRegistry, Value};
pub use shm::{InMemoryShmClient, PosixShmClient, SegmentStatus, ShmClient, ShmError};
pub use task::{EncodedValue, KwArg, OutputDecl, Subgraph, TaskUnit, WireTarget, Wiring};
