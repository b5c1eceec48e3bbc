//! Error types for tessera-core.

use thiserror::Error;

use crate::shm::ShmError;

/// Result type for tessera-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in tessera-core.
#[derive(Debug, Error)]
pub enum Error {
    /// No process id could be obtained for a unit.
    #[error("failed to spawn unit {unit}: {message}")]
    Spawn { unit: u64, message: String },

    /// A host name other than the single local host was requested.
    #[error("unknown host: {0}")]
    UnknownHost(String),

    /// A control-id matched neither the task nor the data prefix.
    #[error("unrecognized control id: {0}")]
    UnrecognizedId(String),

    /// A task unit declared more than one output.
    #[error("task {task} declares {count} outputs, multiple outputs unsupported")]
    MultipleOutputs { task: String, count: usize },

    /// Neither an inline closure nor an entrypoint could be resolved.
    #[error("no resolvable callable for task {task}{}", .reference.as_ref().map(|r| format!(" ({})", r)).unwrap_or_default())]
    NoCallable {
        task: String,
        reference: Option<String>,
    },

    /// A positional slot was neither statically supplied nor wired.
    #[error("task {task} is missing positional argument {position}")]
    MissingArgument { task: String, position: usize },

    /// A keyword or positional argument was requested that does not exist.
    #[error("argument not found: {0}")]
    ArgumentNotFound(String),

    /// No serializer is registered under the given annotation.
    #[error("unknown annotation: {0}")]
    UnknownAnnotation(String),

    /// A value did not have the type its annotation promises.
    #[error("type mismatch for annotation {annotation}: expected {expected}")]
    TypeMismatch {
        annotation: String,
        expected: &'static str,
    },

    /// Shared-memory client error, propagated unchanged.
    #[error(transparent)]
    Shm(#[from] ShmError),

    /// The package installer exited unsuccessfully.
    #[error("package installer failed ({status}): {stderr}")]
    Installer { status: String, stderr: String },

    /// Communication error with a worker process.
    #[error("IPC error: {0}")]
    Ipc(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// A task body returned an error or panicked.
    #[error("task {task} failed: {message}")]
    Task { task: String, message: String },

    /// Operation is not offered by this executor.
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    /// A bounded wait elapsed.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// A suggestion for fixing the error, where one is known.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Error::UnknownHost(_) => Some("this executor runs on one host; use the name from `tessera env`"),
            Error::NoCallable { .. } => {
                Some("register the callable in the worker's CallableResolver and rebuild tessera-worker")
            }
            Error::MultipleOutputs { .. } => Some("split the task so that each declares one output"),
            Error::UnknownAnnotation(_) => Some("register a serializer for the annotation in the SerdeRegistry"),
            Error::Installer { .. } => Some("check the `installer` setting and network access, or set TESSERA_OFFLINE"),
            Error::Config(_) => Some("check the configuration file and TESSERA_* environment variables"),
            Error::Timeout(_) => Some("the producing task may have failed; check its status"),
            _ => None,
        }
    }

    /// The error message followed by its hint, if any.
    pub fn with_hint(&self) -> String {
        match self.hint() {
            Some(hint) => format!("{}\n  hint: {}", self, hint),
            None => self.to_string(),
        }
    }
}
