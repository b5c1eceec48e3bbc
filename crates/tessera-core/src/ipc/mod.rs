//! Inter-process communication between the scheduler and worker processes.
//!
//! The parent writes one [`WorkerPayload`] to the worker's stdin. The worker
//! writes at most one [`ChildReport`] to the report pipe before it exits.

mod pipe;
pub mod protocol;

pub use pipe::{
    REPORT_FD, REPORT_FD_VAR, install_report_fd, open_report_channel, poll_readable, report_pipe,
    set_cloexec, set_nonblocking,
};
pub use protocol::{ChildReport, WorkerPayload, read_message, write_message};
