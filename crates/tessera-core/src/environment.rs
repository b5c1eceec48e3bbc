//! Isolated package environments.
//!
//! Every unit whose subgraph lists packages gets its own fresh directory,
//! named after the job id and populated by an external installer before the
//! unit's worker process is spawned. It is removed when the unit is reaped.
//! The directory reaches the worker through an environment variable set on
//! the worker's command, so nothing depends on state inherited from the
//! parent. The name of that variable travels alongside it in
//! [`SEARCH_PATH_NAME_VAR`].
//!
//! Directories are never shared, not even between units of one job, and
//! there is no locking between them; two units asking for the same package
//! install it twice.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::TempDir;

use crate::config::{ExecutorConfig, SEARCH_PATH_NAME_VAR};
use crate::error::{Error, Result};

/// Prepares isolated package directories for jobs.
#[derive(Debug, Clone)]
pub struct EnvironmentManager {
    installer: Vec<String>,
    offline: bool,
    cache_dir: Option<PathBuf>,
    work_dir: Option<PathBuf>,
    search_path_var: String,
}

impl EnvironmentManager {
    pub fn new(config: &ExecutorConfig) -> Self {
        Self {
            installer: config.installer.clone(),
            offline: config.offline,
            cache_dir: config.package_cache_dir.clone(),
            work_dir: config.work_dir.clone(),
            search_path_var: config.search_path_var.clone(),
        }
    }

    /// Install `packages` into a fresh directory for `job_id`.
    ///
    /// Returns `None` when there is nothing to install: the job runs in the
    /// ambient environment. The directory is removed if installation fails.
    pub fn prepare(&self, job_id: &str, packages: &[String]) -> Result<Option<PackageEnv>> {
        if packages.is_empty() {
            return Ok(None);
        }

        let (program, base_args) = self
            .installer
            .split_first()
            .ok_or_else(|| Error::Config("installer command is empty".to_string()))?;

        let prefix = format!("tessera-{}-", sanitize(job_id));
        let dir = match &self.work_dir {
            Some(root) => tempfile::Builder::new().prefix(&prefix).tempdir_in(root)?,
            None => tempfile::Builder::new().prefix(&prefix).tempdir()?,
        };

        let mut cmd = Command::new(program);
        cmd.args(base_args).arg("install").arg("--target").arg(dir.path());
        if self.offline {
            cmd.arg("--offline");
        }
        if let Some(cache) = &self.cache_dir {
            cmd.arg("--cache-dir").arg(cache);
        }
        cmd.args(packages);

        tracing::debug!(job_id, ?packages, dir = %dir.path().display(), "installing packages");
        let output = cmd.output().map_err(|e| Error::Installer {
            status: "not started".to_string(),
            stderr: format!("failed to run {}: {}", program, e),
        })?;

        if !output.status.success() {
            return Err(Error::Installer {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(Some(PackageEnv {
            dir,
            search_path_var: self.search_path_var.clone(),
        }))
    }
}

fn sanitize(job_id: &str) -> String {
    job_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// An installed package directory. Removed on [`cleanup`](Self::cleanup) or drop.
#[derive(Debug)]
pub struct PackageEnv {
    dir: TempDir,
    search_path_var: String,
}

impl PackageEnv {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Value of the search-path variable with this directory in front of
    /// whatever the current process has.
    pub fn search_path(&self) -> Result<OsString> {
        let mut paths = vec![self.dir.path().to_path_buf()];
        if let Some(existing) = std::env::var_os(&self.search_path_var) {
            paths.extend(std::env::split_paths(&existing));
        }
        std::env::join_paths(paths).map_err(|e| Error::Config(e.to_string()))
    }

    /// Set the search-path variable, and its name, on a command that is
    /// about to spawn.
    pub fn apply(&self, cmd: &mut Command) -> Result<()> {
        cmd.env(&self.search_path_var, self.search_path()?)
            .env(SEARCH_PATH_NAME_VAR, &self.search_path_var);
        Ok(())
    }

    /// Delete the directory.
    pub fn cleanup(self) -> Result<()> {
        let path = self.dir.path().to_path_buf();
        self.dir.close()?;
        tracing::debug!(dir = %path.display(), "removed package directory");
        Ok(())
    }
}
