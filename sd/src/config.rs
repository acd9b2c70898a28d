//! speedd configuration types and loading

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors produced while turning a loaded [`Config`] into a [`DaemonConfig`]
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Unknown test mode: {0}. Use: quick, full, or dry-run")]
    UnknownMode(String),
}

/// Longest accepted interval or timeout: one year
pub const MAX_DURATION_SECS: u64 = 365 * 24 * 60 * 60;

/// Which probe call pattern each iteration uses
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TestMode {
    /// One probe call per iteration
    #[default]
    Quick,
    /// Three probe calls per iteration, averaged
    Full,
    /// No network traffic; a zero sample flows through the pipeline
    DryRun,
}

impl FromStr for TestMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "quick" => Ok(Self::Quick),
            "full" => Ok(Self::Full),
            "dry-run" | "dryrun" | "dry_run" => Ok(Self::DryRun),
            _ => Err(ConfigError::UnknownMode(s.to_string())),
        }
    }
}

impl fmt::Display for TestMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Quick => write!(f, "quick"),
            Self::Full => write!(f, "full"),
            Self::DryRun => write!(f, "dry-run"),
        }
    }
}

/// Main speedd configuration, as read from YAML
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Scheduling and process files
    pub daemon: DaemonSection,

    /// Probe selection
    pub probe: ProbeSection,

    /// Result storage
    pub sink: SinkSection,
}

/// Scheduling and process-file settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonSection {
    /// Seconds between iteration starts
    #[serde(rename = "interval-secs")]
    pub interval_secs: u64,

    /// Maximum seconds a single iteration may take
    #[serde(rename = "timeout-secs")]
    pub timeout_secs: u64,

    /// Path of the single-instance lock file
    #[serde(rename = "lock-file")]
    pub lock_file: PathBuf,

    /// Path of the append-only log file used once detached
    #[serde(rename = "log-file")]
    pub log_file: PathBuf,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            interval_secs: 600,
            timeout_secs: 120,
            lock_file: default_lock_path(),
            log_file: default_log_path(),
            log_level: None,
        }
    }
}

/// Probe settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeSection {
    /// Call pattern per iteration
    pub mode: TestMode,

    /// Probe target (speed-test server id)
    pub server: Option<String>,

    /// External speed-test executable
    pub command: String,
}

impl Default for ProbeSection {
    fn default() -> Self {
        Self {
            mode: TestMode::Quick,
            server: None,
            command: "speedtest".to_string(),
        }
    }
}

/// Result storage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkSection {
    /// SQLite database file
    pub database: PathBuf,

    /// Table receiving one row per iteration
    pub table: String,
}

impl Default for SinkSection {
    fn default() -> Self {
        Self {
            database: default_database_path(),
            table: "results".to_string(),
        }
    }
}

/// Command-line values that take precedence over the config file
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub interval_secs: Option<u64>,
    pub timeout_secs: Option<u64>,
    pub mode: Option<TestMode>,
    pub server: Option<String>,
    pub database: Option<PathBuf>,
    pub table: Option<String>,
    pub lock_file: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
}

/// Immutable settings handed to every daemon component after startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonConfig {
    pub interval: Duration,
    pub timeout: Duration,
    pub lock_file: PathBuf,
    pub log_file: PathBuf,
    pub mode: TestMode,
    pub target: Option<String>,
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Project-local config: .speedd.yml
        let local_config = PathBuf::from(".speedd.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => warn!("Failed to load config from {}: {}", local_config.display(), e),
            }
        }

        // User config: ~/.config/speedd/speedd.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("speedd").join("speedd.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => warn!("Failed to load config from {}: {}", user_config.display(), e),
                }
            }
        }

        debug!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Read only the log level, before logging is initialized
    pub fn load_log_level(config_path: Option<&PathBuf>) -> Option<String> {
        Self::load(config_path).ok().and_then(|c| c.daemon.log_level)
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        debug!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Apply command-line overrides on top of file values
    pub fn apply(&mut self, overrides: ConfigOverrides) {
        debug!(?overrides, "Config::apply: called");
        if let Some(v) = overrides.interval_secs {
            self.daemon.interval_secs = v;
        }
        if let Some(v) = overrides.timeout_secs {
            self.daemon.timeout_secs = v;
        }
        if let Some(v) = overrides.mode {
            self.probe.mode = v;
        }
        if let Some(v) = overrides.server {
            self.probe.server = Some(v);
        }
        if let Some(v) = overrides.database {
            self.sink.database = v;
        }
        if let Some(v) = overrides.table {
            self.sink.table = v;
        }
        if let Some(v) = overrides.lock_file {
            self.daemon.lock_file = v;
        }
        if let Some(v) = overrides.log_file {
            self.daemon.log_file = v;
        }
    }

    /// Validate and freeze the settings the daemon core runs on
    pub fn daemon_config(&self) -> Result<DaemonConfig, ConfigError> {
        if self.daemon.interval_secs > MAX_DURATION_SECS {
            return Err(ConfigError::InvalidConfig(format!(
                "interval must be at most {} seconds",
                MAX_DURATION_SECS
            )));
        }
        if self.daemon.timeout_secs > MAX_DURATION_SECS {
            return Err(ConfigError::InvalidConfig(format!(
                "timeout must be at most {} seconds",
                MAX_DURATION_SECS
            )));
        }
        if self.daemon.interval_secs == 0 {
            return Err(ConfigError::InvalidConfig("interval must be positive".to_string()));
        }
        if self.daemon.timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig("timeout must be positive".to_string()));
        }
        if self.daemon.timeout_secs >= self.daemon.interval_secs {
            warn!(
                timeout_secs = self.daemon.timeout_secs,
                interval_secs = self.daemon.interval_secs,
                "Timeout is not shorter than the interval"
            );
        }

        Ok(DaemonConfig {
            interval: Duration::from_secs(self.daemon.interval_secs),
            timeout: Duration::from_secs(self.daemon.timeout_secs),
            lock_file: absolutize(&self.daemon.lock_file),
            log_file: absolutize(&self.daemon.log_file),
            mode: self.probe.mode,
            target: self.probe.server.clone(),
        })
    }
}

/// Resolve a path against the current directory; the daemon later chdirs to `/`
fn absolutize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

/// Default lock file location
pub fn default_lock_path() -> PathBuf {
    dirs::runtime_dir()
        .or_else(dirs::data_local_dir)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("speedd")
        .join("speedd.pid")
}

/// Default log file location
pub fn default_log_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("speedd")
        .join("logs")
        .join("speedd.log")
}

/// Default results database location
pub fn default_database_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("speedd")
        .join("results.db")
}
