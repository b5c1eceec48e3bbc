//! Executor configuration.
//!
//! Read from a JSON file with [`ExecutorConfig::load`], then adjusted from
//! `TESSERA_*` environment variables with
//! [`with_env_overrides`](ExecutorConfig::with_env_overrides). Every field
//! has a default, so an empty file (or no file) is a valid configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Environment variable naming the worker binary.
pub const WORKER_PATH_VAR: &str = "TESSERA_WORKER_PATH";

/// Default name of the variable carrying isolated package directories.
pub const DEFAULT_SEARCH_PATH_VAR: &str = "TESSERA_PACKAGE_PATH";

/// Set on every worker with packages: the name of the variable that
/// carries its package directories.
pub const SEARCH_PATH_NAME_VAR: &str = "TESSERA_SEARCH_PATH_VAR";

/// Configuration for the single-host executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Name of the one host this executor runs on.
    pub host_name: String,

    /// Maximum number of concurrently running worker processes.
    pub pool_size: usize,

    /// Worker binary. If None, discovered at launch time.
    pub worker_path: Option<PathBuf>,

    /// Installer command, followed by `install --target <dir> ...`.
    pub installer: Vec<String>,

    /// Pass `--offline` to the installer.
    pub offline: bool,

    /// Shared installer cache, passed as `--cache-dir`.
    pub package_cache_dir: Option<PathBuf>,

    /// Parent directory for per-unit package directories (system temp if None).
    pub work_dir: Option<PathBuf>,

    /// Variable through which a worker receives its package directory.
    pub search_path_var: String,

    /// Interval between status polls while fetching an output.
    pub fetch_poll_interval_ms: u64,

    /// Give up fetching an output after this long. Waits forever if None.
    pub fetch_timeout_ms: Option<u64>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            host_name: "localhost".to_string(),
            pool_size: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            worker_path: None,
            installer: vec!["uv".to_string(), "pip".to_string()],
            offline: false,
            package_cache_dir: None,
            work_dir: None,
            search_path_var: DEFAULT_SEARCH_PATH_VAR.to_string(),
            fetch_poll_interval_ms: 10,
            fetch_timeout_ms: None,
        }
    }
}

impl ExecutorConfig {
    /// Load a JSON configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `TESSERA_*` environment variable overrides.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(host) = lookup("TESSERA_HOST_NAME") {
            self.host_name = host;
        }
        if let Some(size) = lookup("TESSERA_POOL_SIZE") {
            self.pool_size = size
                .parse()
                .map_err(|_| Error::Config(format!("TESSERA_POOL_SIZE is not a number: {}", size)))?;
        }
        if let Some(path) = lookup(WORKER_PATH_VAR) {
            self.worker_path = Some(PathBuf::from(path));
        }
        if let Some(offline) = lookup("TESSERA_OFFLINE") {
            self.offline = matches!(offline.as_str(), "1" | "true" | "yes");
        }
        if let Some(cache) = lookup("TESSERA_PACKAGE_CACHE") {
            self.package_cache_dir = Some(PathBuf::from(cache));
        }
        self.validate()?;
        Ok(self)
    }

    /// Check invariants that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            return Err(Error::Config("pool_size must be at least 1".to_string()));
        }
        if self.installer.is_empty() {
            return Err(Error::Config("installer command is empty".to_string()));
        }
        if self.host_name.is_empty() {
            return Err(Error::Config("host_name is empty".to_string()));
        }
        Ok(())
    }

    pub fn fetch_poll_interval(&self) -> Duration {
        Duration::from_millis(self.fetch_poll_interval_ms.max(1))
    }

    pub fn fetch_timeout(&self) -> Option<Duration> {
        self.fetch_timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(&path, "{}").unwrap();

        let config = ExecutorConfig::load(&path).unwrap();
        assert_eq!(config, ExecutorConfig::default());
        assert!(config.pool_size >= 1);
    }

    #[test]
    fn test_partial_file() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(&path, r#"{"pool_size": 3, "offline": true}"#).unwrap();

        let config = ExecutorConfig::load(&path).unwrap();
        assert_eq!(config.pool_size, 3);
        assert!(config.offline);
        assert_eq!(config.host_name, "localhost");
    }

    #[test]
    fn test_zero_pool_rejected() {
        let config = ExecutorConfig {
            pool_size: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("TESSERA_POOL_SIZE", "2"),
            ("TESSERA_OFFLINE", "true"),
            ("TESSERA_WORKER_PATH", "/opt/tessera/worker"),
        ]
        .into_iter()
        .collect();

        let config = ExecutorConfig::default()
            .with_overrides_from(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.pool_size, 2);
        assert!(config.offline);
        assert_eq!(config.worker_path, Some(PathBuf::from("/opt/tessera/worker")));
    }

    #[test]
    fn test_bad_env_pool_size() {
        let result = ExecutorConfig::default()
            .with_overrides_from(|key| (key == "TESSERA_POOL_SIZE").then(|| "many".to_string()));
        assert!(result.is_err());
    }
}
