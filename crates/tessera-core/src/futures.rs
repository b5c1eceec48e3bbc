//! Opaque control-ids for running processes and data outputs.
//!
//! A controller never sees process handles or segment names directly. It
//! holds flat strings ("control-ids") and asks the executor about them:
//!
//! ```text
//! TaskFuture { proc_id: 7 }                  <-> "task-7"
//! DataFuture { task: "a-b", output: "out" }  <-> "data3-a-b-out"
//!                                             -> shm id "9f3c..." (24 hex)
//! ```
//!
//! The `task` and `data` prefixes keep the two kinds apart in one namespace.

use std::fmt;

use crate::error::{Error, Result};

const TASK_PREFIX: &str = "task-";
const DATA_PREFIX: &str = "data";

/// Length of a shared-memory id in hex characters.
pub const SHM_ID_LEN: usize = 24;

/// Identifies a process submitted to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskFuture {
    pub proc_id: u64,
}

impl TaskFuture {
    pub fn from_proc_id(proc_id: u64) -> Self {
        Self { proc_id }
    }

    pub fn as_proc_id(&self) -> u64 {
        self.proc_id
    }

    pub fn as_ctrl_id(&self) -> String {
        format!("{}{}", TASK_PREFIX, self.proc_id)
    }

    pub fn from_ctrl_id(ctrl_id: &str) -> Result<Self> {
        let rest = ctrl_id
            .strip_prefix(TASK_PREFIX)
            .ok_or_else(|| Error::UnrecognizedId(ctrl_id.to_string()))?;
        let proc_id = rest
            .parse()
            .map_err(|_| Error::UnrecognizedId(ctrl_id.to_string()))?;
        Ok(Self { proc_id })
    }
}

/// Identifies one named output of one task.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DataFuture {
    pub task: String,
    pub output: String,
}

impl DataFuture {
    pub fn new(task: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            output: output.into(),
        }
    }

    /// Encode as `data{len(task)}-{task}-{output}`.
    ///
    /// The length is in bytes; task names may contain `-`.
    pub fn as_ctrl_id(&self) -> String {
        format!("{}{}-{}-{}", DATA_PREFIX, self.task.len(), self.task, self.output)
    }

    pub fn from_ctrl_id(ctrl_id: &str) -> Result<Self> {
        let unrecognized = || Error::UnrecognizedId(ctrl_id.to_string());

        let rest = ctrl_id.strip_prefix(DATA_PREFIX).ok_or_else(unrecognized)?;
        let (len, rest) = rest.split_once('-').ok_or_else(unrecognized)?;
        if len.is_empty() || !len.bytes().all(|b| b.is_ascii_digit()) {
            return Err(unrecognized());
        }
        let len: usize = len.parse().map_err(|_| unrecognized())?;

        let task = rest.get(..len).ok_or_else(unrecognized)?;
        let output = rest
            .get(len..)
            .and_then(|s| s.strip_prefix('-'))
            .ok_or_else(unrecognized)?;

        Ok(Self::new(task, output))
    }

    /// Shared-memory segment name for this output.
    ///
    /// BLAKE3 of `task + output`, truncated to 96 bits. The task length is
    /// hashed first so that `("ab", "c")` and `("a", "bc")` differ. Distinct
    /// pairs can still collide in principle; segment creation is exclusive,
    /// so a collision surfaces as an allocation error rather than an
    /// overwrite.
    pub fn as_shm_id(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&(self.task.len() as u64).to_le_bytes());
        hasher.update(self.task.as_bytes());
        hasher.update(self.output.as_bytes());
        let hash = hasher.finalize();
        hash.to_hex().as_str()[..SHM_ID_LEN].to_string()
    }
}

/// Either kind of future, as decoded from a control-id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Future {
    Task(TaskFuture),
    Data(DataFuture),
}

impl Future {
    pub fn as_ctrl_id(&self) -> String {
        match self {
            Future::Task(f) => f.as_ctrl_id(),
            Future::Data(f) => f.as_ctrl_id(),
        }
    }
}

impl fmt::Display for Future {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_ctrl_id())
    }
}

/// Decode a control-id: data prefix first, then task prefix.
pub fn ctrl_id_to_future(ctrl_id: &str) -> Result<Future> {
    if ctrl_id.starts_with(DATA_PREFIX) {
        return DataFuture::from_ctrl_id(ctrl_id).map(Future::Data);
    }
    if ctrl_id.starts_with(TASK_PREFIX) {
        return TaskFuture::from_ctrl_id(ctrl_id).map(Future::Task);
    }
    Err(Error::UnrecognizedId(ctrl_id.to_string()))
}
