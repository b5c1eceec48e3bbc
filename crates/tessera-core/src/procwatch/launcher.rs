//! Starting unit processes.
//!
//! A [`Launcher`] turns a subgraph into a running [`ProcessHandle`]. The
//! default [`WorkerLauncher`] re-executes the `tessera-worker` binary and
//! hands it the subgraph on stdin; everything else the child needs (package
//! search path, report descriptor, log filter) is set explicitly on its
//! command.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::Duration;

use crate::config::{ExecutorConfig, WORKER_PATH_VAR};
use crate::environment::PackageEnv;
use crate::error::{Error, Result};
use crate::ipc::{self, ChildReport, WorkerPayload};
use crate::task::Subgraph;

use super::ProcId;

/// Starts the process for one unit.
pub trait Launcher {
    /// Start a process running `subgraph`.
    ///
    /// `env` is the unit's prepared package directory, if it has one; it
    /// outlives the process.
    fn launch(
        &mut self,
        id: ProcId,
        subgraph: &Subgraph,
        env: Option<&PackageEnv>,
    ) -> Result<ProcessHandle>;
}

/// Largest report the parent buffers; anything beyond it is discarded.
pub const MAX_REPORT_LEN: usize = 1024 * 1024;

/// How long a blocking [`ProcessHandle::reap`] sleeps between exit checks.
const REAP_INTERVAL: Duration = Duration::from_millis(10);

/// A running unit process and the read end of its report pipe.
///
/// The read end is non-blocking. Report bytes are buffered as they arrive
/// with [`drain_report`](Self::drain_report), and exit is detected with
/// [`try_exit`](Self::try_exit): the pipe can stay open after the child
/// exits if a descendant inherited the write end.
#[derive(Debug)]
pub struct ProcessHandle {
    child: Child,
    report: File,
    report_buf: Vec<u8>,
    report_open: bool,
    report_overflow: bool,
}

/// What was collected from a unit process after it exited.
#[derive(Debug)]
pub struct Reaped {
    pub status: ExitStatus,
    pub report: Option<ChildReport>,
}

impl Reaped {
    /// Exit code, `None` if the process was killed by a signal.
    pub fn exit_code(&self) -> Option<i32> {
        self.status.code()
    }

    pub fn success(&self) -> bool {
        self.status.success()
    }
}

impl ProcessHandle {
    /// Spawn `cmd` with a report pipe installed and `stdin_bytes` on stdin.
    ///
    /// The parent's copy of the write end is closed before returning.
    pub fn spawn(cmd: &mut Command, stdin_bytes: &[u8]) -> io::Result<Self> {
        let (report, write_end) = ipc::report_pipe()?;
        ipc::set_nonblocking(report.as_raw_fd())?;
        let write_fd = write_end.as_raw_fd();

        cmd.stdin(Stdio::piped())
            .env(ipc::REPORT_FD_VAR, ipc::REPORT_FD.to_string());
        // SAFETY: install_report_fd only calls async-signal-safe functions.
        unsafe {
            cmd.pre_exec(move || ipc::install_report_fd(write_fd));
        }

        let mut child = cmd.spawn()?;
        drop(write_end);

        if let Some(mut stdin) = child.stdin.take() {
            match stdin.write_all(stdin_bytes) {
                Ok(()) => {}
                // The child exited without reading its input; its exit code
                // tells the rest.
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {}
                Err(e) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(e);
                }
            }
        }

        Ok(Self {
            child,
            report,
            report_buf: Vec::new(),
            report_open: true,
            report_overflow: false,
        })
    }

    /// OS process id.
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Read end of the report pipe.
    pub fn report_fd(&self) -> RawFd {
        self.report.as_raw_fd()
    }

    /// Whether more report bytes may still arrive.
    ///
    /// False after end-of-file, or once the report grew past
    /// [`MAX_REPORT_LEN`] and further bytes are ignored.
    pub fn report_open(&self) -> bool {
        self.report_open
    }

    /// Exit status if the child has exited, without blocking.
    pub fn try_exit(&mut self) -> io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    /// Buffer whatever report bytes are available, without blocking.
    pub fn drain_report(&mut self) -> io::Result<()> {
        let mut chunk = [0u8; 4096];
        while self.report_open {
            match self.report.read(&mut chunk) {
                Ok(0) => self.report_open = false,
                Ok(n) => {
                    if self.report_buf.len() + n > MAX_REPORT_LEN {
                        tracing::warn!(pid = self.pid(), "child report exceeds {} bytes", MAX_REPORT_LEN);
                        self.report_buf = Vec::new();
                        self.report_overflow = true;
                        self.report_open = false;
                    } else {
                        self.report_buf.extend_from_slice(&chunk[..n]);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Collect an exited child: take the last report bytes and decode them.
    ///
    /// `status` must come from [`try_exit`](Self::try_exit). Does not wait
    /// for the report pipe to close.
    pub fn finish(mut self, status: ExitStatus) -> Reaped {
        if let Err(e) = self.drain_report() {
            tracing::warn!(pid = self.pid(), "failed to read child report: {}", e);
        }
        let report = self.decode_report();
        Reaped { status, report }
    }

    fn decode_report(&self) -> Option<ChildReport> {
        if self.report_overflow || self.report_buf.is_empty() {
            return None;
        }
        match ipc::read_message::<_, ChildReport>(&mut self.report_buf.as_slice()) {
            Ok(report) => Some(report),
            Err(e) => {
                tracing::warn!(pid = self.pid(), "discarding unreadable child report: {}", e);
                None
            }
        }
    }

    /// Block until the child exits, then collect it.
    pub fn reap(mut self) -> io::Result<Reaped> {
        loop {
            if let Some(status) = self.try_exit()? {
                return Ok(self.finish(status));
            }
            let fd = self.report.as_raw_fd();
            let fds: &[RawFd] = if self.report_open {
                std::slice::from_ref(&fd)
            } else {
                &[]
            };
            if !ipc::poll_readable(fds, Some(REAP_INTERVAL))?.is_empty() {
                self.drain_report()?;
            }
        }
    }

    /// Kill the child and wait for it.
    pub fn kill(mut self) -> io::Result<ExitStatus> {
        if let Err(e) = self.child.kill() {
            // InvalidInput: already reaped.
            if e.kind() != io::ErrorKind::InvalidInput {
                tracing::warn!(pid = self.child.id(), "failed to kill unit process: {}", e);
            }
        }
        self.child.wait()
    }
}

/// Launches units by re-executing the worker binary.
///
/// Without a configured path the binary is looked up on first launch.
#[derive(Debug, Clone, Default)]
pub struct WorkerLauncher {
    worker_path: Option<PathBuf>,
}

impl WorkerLauncher {
    pub fn new(worker_path: impl Into<PathBuf>) -> Self {
        Self {
            worker_path: Some(worker_path.into()),
        }
    }

    /// Use the configured worker binary, deferring discovery until needed.
    pub fn from_config(config: &ExecutorConfig) -> Self {
        Self {
            worker_path: config.worker_path.clone(),
        }
    }

    /// Use the configured worker binary, or look for one now.
    ///
    /// Search order:
    /// 1. `worker_path` in the configuration (also set by `TESSERA_WORKER_PATH`)
    /// 2. `TESSERA_WORKER_PATH` environment variable
    /// 3. Same directory as the current executable, or its parent (test binaries
    ///    live in `target/<profile>/deps`)
    /// 4. System PATH
    /// 5. `target/debug` or `target/release` of this workspace
    pub fn discover(config: &ExecutorConfig) -> Result<Self> {
        if let Some(path) = &config.worker_path {
            if path.exists() {
                return Ok(Self::new(path.clone()));
            }
            return Err(Error::Config(format!(
                "worker binary not found at {}",
                path.display()
            )));
        }
        find_worker_binary().map(Self::new)
    }

    pub fn worker_path(&self) -> Option<&Path> {
        self.worker_path.as_deref()
    }

    fn resolve(&mut self) -> Result<PathBuf> {
        if let Some(path) = &self.worker_path {
            return Ok(path.clone());
        }
        let path = find_worker_binary()?;
        tracing::debug!(worker = %path.display(), "found worker binary");
        self.worker_path = Some(path.clone());
        Ok(path)
    }
}

impl Launcher for WorkerLauncher {
    fn launch(
        &mut self,
        id: ProcId,
        subgraph: &Subgraph,
        env: Option<&PackageEnv>,
    ) -> Result<ProcessHandle> {
        let worker_path = self.resolve()?;

        let mut stdin_bytes = Vec::new();
        ipc::write_message(
            &mut stdin_bytes,
            &WorkerPayload {
                proc_id: id,
                subgraph: subgraph.clone(),
            },
        )?;

        let mut cmd = Command::new(&worker_path);
        cmd.stderr(Stdio::inherit());
        if let Ok(filter) = std::env::var("RUST_LOG") {
            cmd.env("RUST_LOG", filter);
        }
        if let Some(env) = env {
            env.apply(&mut cmd)?;
        }

        ProcessHandle::spawn(&mut cmd, &stdin_bytes).map_err(|e| Error::Spawn {
            unit: id,
            message: format!("{}: {}", worker_path.display(), e),
        })
    }
}

fn worker_name() -> &'static str {
    if cfg!(windows) {
        "tessera-worker.exe"
    } else {
        "tessera-worker"
    }
}

fn find_worker_binary() -> Result<PathBuf> {
    if let Ok(path) = std::env::var(WORKER_PATH_VAR) {
        let path = PathBuf::from(path);
        if path.exists() {
            return Ok(path);
        }
    }

    if let Ok(exe_path) = std::env::current_exe() {
        for dir in exe_path.ancestors().skip(1).take(2) {
            let candidate = dir.join(worker_name());
            if candidate.exists() {
                return Ok(candidate);
            }
        }
    }

    if let Ok(path) = which::which(worker_name()) {
        return Ok(path);
    }

    for profile in ["debug", "release"] {
        let path = Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("..")
            .join("..")
            .join("target")
            .join(profile)
            .join(worker_name());
        if path.exists() {
            return Ok(path.canonicalize().unwrap_or(path));
        }
    }

    Err(Error::Config(format!(
        "could not find {} binary; set {} or ensure it is in PATH",
        worker_name(),
        WORKER_PATH_VAR
    )))
}
