use benchtrail_analysis::RegressionConfig;
use globset::GlobBuilder;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap, fs, fs::File, io::Error, os::unix::fs::MetadataExt, path::Path,
    path::PathBuf, time::Duration,
};
use thiserror::Error;
use tracing::{error, warn};

// check if a file is executable
pub fn check_executable(path: &Path) -> Result<bool, ConfigErrors> {
    if !path.is_file() {
        Err(ConfigErrors::FileNotFound(path.to_path_buf()))
    } else {
        match File::open(path).map(|file| file.metadata()) {
            Ok(Ok(metadata)) => Ok((metadata.mode() & 0o111) != 0),
            Ok(Err(e)) | Err(e) => Err(ConfigErrors::MetadataNotFound(e)),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Failed to read config file")]
    ReadConfig(#[source] Error),
    #[error("Failed to parse config file")]
    ParseConfig(#[from] serde_yaml::Error),
    #[error("Config contains errors, see the log for details")]
    Invalid,
    #[error("Glob was invalid")]
    InvalidGlob(#[from] globset::Error),
    #[error("Adapter {0} is not defined")]
    UnknownAdapter(String),
    #[error("File not found: {0}")]
    FileNotFound(PathBuf),
    #[error("Metadata not found")]
    MetadataNotFound(#[source] Error),
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct RunnerConfig {
    // identity of the benchmarked repository, stored as `repoUrl`
    #[serde(default)]
    pub repo_url: String,

    #[serde(alias = "db")]
    pub store: StoreConfig,

    // bound for every store operation (lock acquisition, busy waits)
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub regression: RegressionConfig,

    // adapters normalizing raw benchmark output, selected with `--adapter`
    #[serde(default)]
    pub ingest: BTreeMap<String, AdapterConfig>,

    #[serde(default)]
    pub collect: CollectConfig,

    #[serde(default)]
    pub alert: AlertConfig,

    // runs that could not be persisted are written here for a manual replay
    pub replay_dir: Option<PathBuf>,

    // size of the ingestion thread pool, defaults to the number of CPUs
    pub threads: Option<usize>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub enum StoreConfig {
    /// dashboard document, `.js` files are written as `window.BENCHMARK_DATA = ...`
    File { path: PathBuf },
    /// versioned record per suite
    SQLite { path: PathBuf },
    /// process local, nothing survives the process
    Memory,
}

impl StoreConfig {
    /// Pick the backend from the file extension, `.db`/`.sqlite` select SQLite.
    pub fn from_path(path: PathBuf) -> Self {
        match path.extension().and_then(|extension| extension.to_str()) {
            Some("db" | "sqlite" | "sqlite3") => StoreConfig::SQLite { path },
            _ => StoreConfig::File { path },
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    // total attempts of one load -> merge -> commit sequence
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            backoff_ms: default_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RetryConfig {
    /// Exponential backoff after the given (1-based) failed attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);

        Duration::from_millis(
            self.backoff_ms
                .saturating_mul(factor)
                .min(self.max_backoff_ms),
        )
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub enum AdapterConfig {
    /// input files already hold a normalized run
    Null,
    /// raw output is piped through `exec`, which prints the normalized run
    Exec {
        exec: PathBuf,
        #[serde(default)]
        params: Vec<String>,
        // milliseconds
        #[serde(default = "default_adapter_timeout")]
        timeout: u64,
    },
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct CollectConfig {
    // files picked up when an input is a directory
    #[serde(default = "default_glob")]
    pub glob: String,
}

impl Default for CollectConfig {
    fn default() -> Self {
        Self {
            glob: default_glob(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct AlertConfig {
    // findings are appended here as JSON lines
    pub output: Option<PathBuf>,
    #[serde(default)]
    pub fail_on_regression: bool,
}

impl RunnerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let content = fs::read_to_string(path).map_err(ConfigErrors::ReadConfig)?;

        Ok(serde_yaml::from_str(&content)?)
    }

    /// Defaults for running without a config file.
    pub fn from_store(store: StoreConfig) -> Self {
        Self {
            repo_url: String::new(),
            store,
            timeout_ms: default_timeout_ms(),
            retry: RetryConfig::default(),
            regression: RegressionConfig::default(),
            ingest: BTreeMap::new(),
            collect: CollectConfig::default(),
            alert: AlertConfig::default(),
            replay_dir: None,
            threads: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Report every problem at once instead of piece-by-piece, returns whether an error was found.
    pub fn preflight_checks(&self) -> bool {
        let mut contains_error = false;

        match &self.store {
            StoreConfig::File { path } => {
                match path.extension().and_then(|extension| extension.to_str()) {
                    Some("json" | "js") => {}
                    _ => {
                        error!(
                            "store.File.path {} must end in .json or .js",
                            path.to_string_lossy()
                        );
                        contains_error = true;
                    }
                }
                contains_error |= !check_parent_dir("store.File.path", path);
            }
            StoreConfig::SQLite { path } => {
                contains_error |= !check_parent_dir("store.SQLite.path", path);
            }
            StoreConfig::Memory => {
                warn!("Using the memory store, nothing will be persisted");
            }
        }

        if self.timeout_ms == 0 {
            error!("timeout_ms cannot be 0, store operations would fail immediately");
            contains_error = true;
        }

        if self.retry.attempts == 0 {
            error!("retry.attempts must be at least 1");
            contains_error = true;
        }

        if self.retry.max_backoff_ms < self.retry.backoff_ms {
            warn!("retry.max_backoff_ms is smaller than retry.backoff_ms, the backoff will not grow");
        }

        if let Err(error) = self.regression.validate() {
            error!("{error}");
            contains_error = true;
        }

        if let Err(error) = GlobBuilder::new(&self.collect.glob).build() {
            error!("collect.glob is invalid: {error}");
            contains_error = true;
        }

        if self.threads == Some(0) {
            error!("threads cannot be 0, omit it to use one thread per CPU");
            contains_error = true;
        }

        if let Some(dir) = &self.replay_dir {
            if !dir.is_dir() {
                warn!(
                    "replay_dir {} does not exist yet, it will be created on demand",
                    dir.to_string_lossy()
                );
            }
        }

        for (name, adapter) in self.ingest.iter() {
            if let AdapterConfig::Exec { exec, timeout, .. } = adapter {
                if *timeout == 0 {
                    error!("ingest.{name}.timeout cannot be 0");
                    contains_error = true;
                }

                match check_executable(exec) {
                    Ok(true) => {}
                    Ok(false) => {
                        error!(
                            "ingest.{name}.exec ({}) is not executable",
                            exec.to_string_lossy()
                        );
                        contains_error = true;
                    }
                    Err(e) => {
                        error!(
                            "Failed to determine if ingest.{name}.exec ({}) is an executable: {e}",
                            exec.to_string_lossy()
                        );
                        contains_error = true;
                    }
                }
            }
        }

        contains_error
    }
}

fn check_parent_dir(field: &str, path: &Path) -> bool {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() && !parent.is_dir() => {
            error!(
                "{field} points into {}, which is not a directory",
                parent.to_string_lossy()
            );

            false
        }
        _ => true,
    }
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_attempts() -> u32 {
    5
}

fn default_backoff_ms() -> u64 {
    50
}

fn default_max_backoff_ms() -> u64 {
    2000
}

fn default_adapter_timeout() -> u64 {
    2000
}

fn default_glob() -> String {
    "*.json".to_owned()
}
