//! Single-host executor façade.
//!
//! [`Executor`] is the whole surface a controller needs: submit subgraphs,
//! name and fetch their outputs, and wait on opaque control-ids. It combines
//! a [`ProcWatch`] for processes with a [`ShmClient`] for data.

use std::thread;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::config::ExecutorConfig;
use crate::environment::EnvironmentManager;
use crate::error::{Error, Result};
use crate::futures::{DataFuture, Future, TaskFuture, ctrl_id_to_future};
use crate::ipc::ChildReport;
use crate::procwatch::{
    JoinSummary, Launcher, ProcId, ProcWatch, SpawnObserver, UnitStatus, WorkerLauncher,
};
use crate::shm::{PosixShmClient, SegmentStatus, ShmClient, ShmError};
use crate::task::Subgraph;

/// Static description of the one host this executor runs on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    pub host_name: String,
    /// Maximum number of concurrently running units.
    pub capacity: usize,
}

/// Runs subgraphs on the local host and serves their outputs.
pub struct Executor<C: ShmClient = PosixShmClient, L: Launcher = WorkerLauncher> {
    config: ExecutorConfig,
    client: C,
    procwatch: ProcWatch<L>,
}

impl Executor {
    /// Executor backed by OS shared memory and the `tessera-worker` binary.
    ///
    /// The worker binary is looked up on first launch unless configured.
    pub fn new(config: ExecutorConfig) -> Result<Self> {
        config.validate()?;
        let launcher = WorkerLauncher::from_config(&config);
        Ok(Self::with_parts(config, PosixShmClient::new(), launcher))
    }
}

impl<C: ShmClient, L: Launcher> Executor<C, L> {
    pub fn with_parts(config: ExecutorConfig, client: C, launcher: L) -> Self {
        let procwatch = ProcWatch::new(
            config.pool_size,
            launcher,
            EnvironmentManager::new(&config),
        );
        Self {
            config,
            client,
            procwatch,
        }
    }

    /// Observe every unit spawn and exit.
    pub fn with_observer(mut self, observer: impl SpawnObserver + 'static) -> Self {
        self.procwatch.set_observer(observer);
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn procwatch(&self) -> &ProcWatch<L> {
        &self.procwatch
    }

    pub fn procwatch_mut(&mut self) -> &mut ProcWatch<L> {
        &mut self.procwatch
    }

    pub fn get_environment(&self) -> Environment {
        Environment {
            host_name: self.config.host_name.clone(),
            capacity: self.procwatch.size(),
        }
    }

    fn check_host(&self, host: &str) -> Result<()> {
        if host == self.config.host_name {
            Ok(())
        } else {
            Err(Error::UnknownHost(host.to_string()))
        }
    }

    fn check_hosts(&self, hosts: &[&str]) -> Result<()> {
        hosts.iter().try_for_each(|host| self.check_host(host))
    }

    /// Submit a subgraph to run on `host`. Returns its task control-id.
    pub fn run_at(&mut self, subgraph: Subgraph, host: &str) -> Result<String> {
        self.check_host(host)?;
        let id = self.procwatch.submit(subgraph)?;
        Ok(TaskFuture::from_proc_id(id).as_ctrl_id())
    }

    /// Control-id for an output that will be available on `hosts`.
    ///
    /// Only names the output; nothing is read or written.
    pub fn scatter(&self, task: &str, output: &str, hosts: &[&str]) -> Result<String> {
        self.check_hosts(hosts)?;
        Ok(DataFuture::new(task, output).as_ctrl_id())
    }

    /// Delete an output's segment. Deleting a missing segment is not an error.
    pub fn purge(&self, task: &str, output: &str, hosts: Option<&[&str]>) -> Result<()> {
        if let Some(hosts) = hosts {
            self.check_hosts(hosts)?;
        }
        let shm_id = DataFuture::new(task, output).as_shm_id();
        self.client.purge(&shm_id)?;
        tracing::debug!(task, output, shm_id, "purged output");
        Ok(())
    }

    /// Block until an output is published, then copy out its bytes.
    ///
    /// Polls at the configured interval. Gives up with [`Error::Timeout`]
    /// after the configured fetch timeout, if any.
    pub fn fetch_as_value(&self, task: &str, output: &str) -> Result<Vec<u8>> {
        let future = DataFuture::new(task, output);
        let shm_id = future.as_shm_id();
        let deadline = self.config.fetch_timeout().map(|t| Instant::now() + t);

        while self.client.status(&shm_id)? != SegmentStatus::Ready {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(Error::Timeout(format!(
                    "output {} of task {} not ready",
                    output, task
                )));
            }
            thread::sleep(self.config.fetch_poll_interval());
        }

        let segment = self.client.get(&shm_id)?;
        Ok(segment.as_bytes().to_vec())
    }

    /// Outputs are not served over any endpoint by this executor.
    pub fn fetch_as_url(&self, _task: &str, _output: &str) -> Result<String> {
        Err(Error::NotImplemented(
            "fetch_as_url: the single-host executor serves no endpoint",
        ))
    }

    /// Return the subset of `ids` that is ready.
    ///
    /// If any requested task is unfinished, blocks in [`ProcWatch::wait_some`]
    /// (bounded by `timeout`) until some unit exits. Data futures are checked
    /// once, without blocking, after that wait.
    pub fn wait_some(
        &mut self,
        ids: &[String],
        timeout: Option<std::time::Duration>,
    ) -> Result<Vec<String>> {
        let futures = ids
            .iter()
            .map(|id| ctrl_id_to_future(id))
            .collect::<Result<Vec<_>>>()?;

        let tasks_pending = futures.iter().any(|f| match f {
            Future::Task(task) => !self.task_finished(task.as_proc_id()),
            Future::Data(_) => false,
        });
        if tasks_pending {
            self.procwatch.wait_some(timeout)?;
        }

        let mut ready = Vec::new();
        for (id, future) in ids.iter().zip(&futures) {
            let is_ready = match future {
                Future::Task(task) => self.task_finished(task.as_proc_id()),
                Future::Data(data) => self.data_ready(data)?,
            };
            if is_ready {
                ready.push(id.clone());
            }
        }
        Ok(ready)
    }

    /// Whether one control-id is ready. Never blocks.
    pub fn is_done(&mut self, id: &str) -> Result<bool> {
        match ctrl_id_to_future(id)? {
            Future::Task(task) => {
                let proc_id = task.as_proc_id();
                if !self.task_finished(proc_id) {
                    self.procwatch.wait_some(Some(std::time::Duration::ZERO))?;
                }
                Ok(self.task_finished(proc_id))
            }
            Future::Data(data) => self.data_ready(&data),
        }
    }

    fn task_finished(&self, proc_id: ProcId) -> bool {
        self.procwatch
            .status(proc_id)
            .is_some_and(UnitStatus::is_terminal)
    }

    fn data_ready(&self, data: &DataFuture) -> Result<bool> {
        match self.client.status(&data.as_shm_id()) {
            Ok(status) => Ok(status == SegmentStatus::Ready),
            Err(ShmError::NotFound(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Run every submitted unit to completion.
    pub fn join(&mut self) -> Result<JoinSummary> {
        self.procwatch.join()
    }

    /// Status of the unit behind a task control-id.
    pub fn proc_status(&self, id: &str) -> Result<Option<UnitStatus>> {
        let task = TaskFuture::from_ctrl_id(id)?;
        Ok(self.procwatch.status(task.as_proc_id()))
    }

    /// Diagnostic a failed unit sent before exiting, if any.
    pub fn failure_report(&self, id: &str) -> Result<Option<ChildReport>> {
        let task = TaskFuture::from_ctrl_id(id)?;
        Ok(self.procwatch.report(task.as_proc_id()).cloned())
    }
}
