//! Bounded process-pool scheduler.
//!
//! [`ProcWatch`] runs each submitted [`Subgraph`] in its own OS process and
//! keeps at most `size` of them alive at once. Units that do not fit are
//! queued and admitted in submission order whenever capacity frees up.
//!
//! The scheduler is driven by a single thread: every operation takes
//! `&mut self`, and the only place it blocks is [`ProcWatch::wait_some`].
//! Exits are detected with `waitpid(2)`; between checks it sleeps in
//! `poll(2)` on the report pipes so reports are read as they arrive. A
//! pipe that stays open because a descendant inherited it delays nothing.
//!
//! Running processes cannot be cancelled. Dropping a `ProcWatch` with units
//! still running kills and reaps them so no zombie outlives it.

mod launcher;

use std::os::fd::RawFd;
use std::process::ExitStatus;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::environment::{EnvironmentManager, PackageEnv};
use crate::error::{Error, Result};
use crate::ipc::{self, ChildReport};
use crate::task::Subgraph;

pub use launcher::{Launcher, ProcessHandle, Reaped, WorkerLauncher};

/// Longest gap between exit checks while waiting.
const EXIT_CHECK_INTERVAL: Duration = Duration::from_millis(10);

/// Scheduler-assigned unit id, strictly increasing from 0.
pub type ProcId = u64;

/// Lifecycle of a unit. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Enqueued,
    Running,
    Succeeded,
    Failed,
}

impl UnitStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, UnitStatus::Succeeded | UnitStatus::Failed)
    }
}

/// Units that reached a terminal state during one [`ProcWatch::wait_some`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WaitOutcome {
    pub succeeded: Vec<ProcId>,
    pub failed: Vec<ProcId>,
}

impl WaitOutcome {
    pub fn is_empty(&self) -> bool {
        self.succeeded.is_empty() && self.failed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    /// All finished ids, in increasing order.
    pub fn finished(&self) -> Vec<ProcId> {
        let mut ids: Vec<ProcId> = self.succeeded.iter().chain(&self.failed).copied().collect();
        ids.sort_unstable();
        ids
    }
}

/// Final tally returned by [`ProcWatch::join`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JoinSummary {
    pub succeeded: Vec<ProcId>,
    pub failed: Vec<ProcId>,
}

impl JoinSummary {
    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Notified whenever a unit process starts or is reaped.
///
/// `running` is the number of running units after the event.
pub trait SpawnObserver {
    fn on_spawn(&self, id: ProcId, pid: u32, running: usize);

    fn on_exit(&self, _id: ProcId, _status: UnitStatus, _running: usize) {}
}

#[derive(Debug)]
struct Unit {
    /// Taken when the unit is spawned.
    subgraph: Option<Subgraph>,
    status: UnitStatus,
    pid: Option<u32>,
    exit_code: Option<i32>,
    report: Option<ChildReport>,
}

#[derive(Debug)]
struct Running {
    id: ProcId,
    handle: ProcessHandle,
    env: Option<PackageEnv>,
}

/// Bounded-concurrency spawner and waiter for unit processes.
pub struct ProcWatch<L: Launcher = WorkerLauncher> {
    size: usize,
    launcher: L,
    environments: EnvironmentManager,
    /// Indexed by `ProcId`.
    units: Vec<Unit>,
    /// Every unit before this index has left `Enqueued`.
    cursor: usize,
    running: Vec<Running>,
    /// Spawn failures not yet returned by `wait_some`.
    unreported_failures: Vec<ProcId>,
    observer: Option<Box<dyn SpawnObserver>>,
}

impl<L: Launcher> ProcWatch<L> {
    pub fn new(size: usize, launcher: L, environments: EnvironmentManager) -> Self {
        Self {
            size: size.max(1),
            launcher,
            environments,
            units: Vec::new(),
            cursor: 0,
            running: Vec::new(),
            unreported_failures: Vec::new(),
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: impl SpawnObserver + 'static) -> Self {
        self.set_observer(observer);
        self
    }

    pub fn set_observer(&mut self, observer: impl SpawnObserver + 'static) {
        self.observer = Some(Box::new(observer));
    }

    /// Queue a subgraph and spawn it right away if capacity allows.
    ///
    /// Never waits for capacity. If this unit's process cannot be started the
    /// unit is marked failed and the error is returned.
    pub fn submit(&mut self, subgraph: Subgraph) -> Result<ProcId> {
        let id = self.units.len() as ProcId;
        tracing::debug!(id, job = %subgraph.label(), "submitted unit");
        self.units.push(Unit {
            subgraph: Some(subgraph),
            status: UnitStatus::Enqueued,
            pid: None,
            exit_code: None,
            report: None,
        });

        let mut own_error = None;
        for (failed, error) in self.spawn_available() {
            if failed == id {
                own_error = Some(error);
            } else {
                tracing::warn!(id = failed, "failed to spawn queued unit: {}", error);
                self.unreported_failures.push(failed);
            }
        }
        match own_error {
            Some(error) => Err(error),
            None => Ok(id),
        }
    }

    /// Spawn queued units, oldest first, while capacity remains.
    ///
    /// Returns the units whose spawn failed; they are already marked failed.
    fn spawn_available(&mut self) -> Vec<(ProcId, Error)> {
        let mut failures = Vec::new();
        while self.running.len() < self.size && self.cursor < self.units.len() {
            let id = self.cursor as ProcId;
            self.cursor += 1;
            if self.units[id as usize].status != UnitStatus::Enqueued {
                continue;
            }
            if let Err(error) = self.spawn(id) {
                let unit = &mut self.units[id as usize];
                unit.status = UnitStatus::Failed;
                unit.report = Some(ChildReport::Failed {
                    task: None,
                    message: error.to_string(),
                });
                failures.push((id, error));
            }
        }
        failures
    }

    /// Prepare the unit's environment and start its process.
    fn spawn(&mut self, id: ProcId) -> Result<()> {
        let subgraph = self.units[id as usize]
            .subgraph
            .take()
            .ok_or_else(|| Error::Spawn {
                unit: id,
                message: "unit was already spawned".to_string(),
            })?;

        // Each unit gets its own package directory, removed when it is
        // reaped; units of the same job do not share one.
        let env = self
            .environments
            .prepare(&subgraph.job_id, &subgraph.packages)?;
        let handle = self.launcher.launch(id, &subgraph, env.as_ref())?;
        let pid = handle.pid();

        let unit = &mut self.units[id as usize];
        unit.status = UnitStatus::Running;
        unit.pid = Some(pid);
        self.running.push(Running { id, handle, env });

        tracing::debug!(id, pid, job = %subgraph.label(), running = self.running.len(), "spawned unit");
        if let Some(observer) = &self.observer {
            observer.on_spawn(id, pid, self.running.len());
        }
        Ok(())
    }

    /// Wait for at least one running unit to exit, or for `timeout`.
    ///
    /// Returns at once with an empty outcome if nothing is running. Every
    /// unit found exited is reaped and classified (exit code 0 succeeds,
    /// anything else including death by signal fails), then queued units
    /// are spawned into the freed capacity.
    pub fn wait_some(&mut self, timeout: Option<Duration>) -> Result<WaitOutcome> {
        let mut outcome = WaitOutcome {
            failed: std::mem::take(&mut self.unreported_failures),
            ..Default::default()
        };
        if self.running.is_empty() {
            return Ok(outcome);
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        let exited = loop {
            let exited = self.take_exited();
            if !exited.is_empty() {
                break exited;
            }
            let slice = match deadline {
                None => EXIT_CHECK_INTERVAL,
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Ok(outcome);
                    }
                    remaining.min(EXIT_CHECK_INTERVAL)
                }
            };
            self.read_reports(slice)?;
        };

        for (running, status) in exited {
            let id = running.id;
            let status = self.reap(running, status);
            match status {
                UnitStatus::Succeeded => outcome.succeeded.push(id),
                _ => outcome.failed.push(id),
            }
            if let Some(observer) = &self.observer {
                observer.on_exit(id, status, self.running.len());
            }
        }

        for (id, error) in self.spawn_available() {
            tracing::warn!(id, "failed to spawn queued unit: {}", error);
            outcome.failed.push(id);
        }

        outcome.failed.sort_unstable();
        Ok(outcome)
    }

    /// Remove every running unit whose process has exited.
    ///
    /// A unit whose status cannot be queried is returned with `None`.
    fn take_exited(&mut self) -> Vec<(Running, Option<ExitStatus>)> {
        let mut exited = Vec::new();
        for mut running in std::mem::take(&mut self.running) {
            match running.handle.try_exit() {
                Ok(Some(status)) => exited.push((running, Some(status))),
                Ok(None) => self.running.push(running),
                Err(e) => {
                    tracing::warn!(id = running.id, pid = running.handle.pid(), "failed to query unit: {}", e);
                    exited.push((running, None));
                }
            }
        }
        exited
    }

    /// Sleep up to `slice` on the open report pipes, buffering what arrives.
    fn read_reports(&mut self, slice: Duration) -> Result<()> {
        let (indices, fds): (Vec<usize>, Vec<RawFd>) = self
            .running
            .iter()
            .enumerate()
            .filter(|(_, r)| r.handle.report_open())
            .map(|(i, r)| (i, r.handle.report_fd()))
            .unzip();

        for ready in ipc::poll_readable(&fds, Some(slice))? {
            let running = &mut self.running[indices[ready]];
            if let Err(e) = running.handle.drain_report() {
                tracing::warn!(id = running.id, "failed to read unit report: {}", e);
            }
        }
        Ok(())
    }

    fn reap(&mut self, running: Running, status: Option<ExitStatus>) -> UnitStatus {
        let Running { id, handle, env } = running;
        let pid = handle.pid();
        let unit = &mut self.units[id as usize];

        match status {
            Some(status) => {
                let reaped = handle.finish(status);
                unit.exit_code = reaped.exit_code();
                unit.status = if reaped.success() {
                    UnitStatus::Succeeded
                } else {
                    UnitStatus::Failed
                };
                unit.report = reaped.report;
                tracing::debug!(id, pid, status = %reaped.status, "reaped unit");
            }
            None => {
                if let Err(e) = handle.kill() {
                    tracing::warn!(id, pid, "failed to reap unit: {}", e);
                }
                unit.status = UnitStatus::Failed;
            }
        }

        if unit.status == UnitStatus::Failed {
            match &unit.report {
                Some(report) => tracing::warn!(id, pid, "unit failed: {}", report),
                None => tracing::warn!(id, pid, exit_code = ?unit.exit_code, "unit failed"),
            }
        }

        if let Some(env) = env
            && let Err(e) = env.cleanup()
        {
            tracing::warn!(id, "failed to remove package directory: {}", e);
        }

        unit.status
    }

    /// Wait until no unit is running or queued.
    ///
    /// Failed units are logged, not raised.
    pub fn join(&mut self) -> Result<JoinSummary> {
        while self.outstanding() > 0 {
            if self.running.is_empty() {
                for (id, error) in self.spawn_available() {
                    tracing::warn!(id, "failed to spawn queued unit: {}", error);
                }
                continue;
            }
            self.wait_some(None)?;
        }
        self.unreported_failures.clear();

        let mut summary = JoinSummary::default();
        for (id, unit) in self.units.iter().enumerate() {
            match unit.status {
                UnitStatus::Succeeded => summary.succeeded.push(id as ProcId),
                UnitStatus::Failed => summary.failed.push(id as ProcId),
                _ => {}
            }
        }
        tracing::info!(
            succeeded = summary.succeeded.len(),
            failed = summary.failed.len(),
            "all units finished"
        );
        Ok(summary)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn status(&self, id: ProcId) -> Option<UnitStatus> {
        self.units.get(id as usize).map(|u| u.status)
    }

    /// OS process id of a unit that has been spawned.
    pub fn os_pid(&self, id: ProcId) -> Option<u32> {
        self.units.get(id as usize).and_then(|u| u.pid)
    }

    /// Exit code of a finished unit, `None` if it never ran or died by signal.
    pub fn exit_code(&self, id: ProcId) -> Option<i32> {
        self.units.get(id as usize).and_then(|u| u.exit_code)
    }

    /// Diagnostic sent by a failed unit, if any.
    pub fn report(&self, id: ProcId) -> Option<&ChildReport> {
        self.units.get(id as usize).and_then(|u| u.report.as_ref())
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    /// Units running or still queued.
    pub fn outstanding(&self) -> usize {
        let queued = self.units[self.cursor..]
            .iter()
            .filter(|u| u.status == UnitStatus::Enqueued)
            .count();
        self.running.len() + queued
    }
}

impl<L: Launcher> Drop for ProcWatch<L> {
    fn drop(&mut self) {
        for Running { id, handle, env } in self.running.drain(..) {
            tracing::warn!(id, pid = handle.pid(), "killing unit still running at shutdown");
            if let Err(e) = handle.kill() {
                tracing::warn!(id, "failed to reap killed unit: {}", e);
            }
            drop(env);
        }
    }
}
