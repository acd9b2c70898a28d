//! Environment checks run before the daemon detaches

use std::fmt;

use thiserror::Error;
use tracing::debug;

use crate::config::{Config, TestMode};
use crate::sink::SqliteSink;

/// Result of checking an external tool
#[derive(Debug, Clone)]
pub struct ToolCheck {
    pub name: String,
    pub available: bool,
    pub version: Option<String>,
}

impl ToolCheck {
    /// Check if a tool is available and get its version
    pub fn check(name: &str, version_args: &[&str]) -> Self {
        debug!(name, ?version_args, "ToolCheck::check: called");
        match std::process::Command::new(name).args(version_args).output() {
            Ok(output) if output.status.success() => {
                let version_str = String::from_utf8_lossy(&output.stdout);
                Self {
                    name: name.to_string(),
                    available: true,
                    version: Some(parse_version(&version_str)),
                }
            }
            _ => Self {
                name: name.to_string(),
                available: false,
                version: None,
            },
        }
    }
}

/// Parse version from command output (extracts first version-like string)
pub fn parse_version(output: &str) -> String {
    for word in output.split_whitespace() {
        let word = word.trim_start_matches('v');
        if word.chars().next().is_some_and(|c| c.is_ascii_digit()) {
            let version: String = word.chars().take_while(|c| c.is_ascii_digit() || *c == '.').collect();
            if !version.is_empty() {
                return version;
            }
        }
    }
    "unknown".to_string()
}

/// One failed check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckFailure {
    pub check: &'static str,
    pub message: String,
}

impl fmt::Display for CheckFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.check, self.message)
    }
}

/// Every failed check, reported together
#[derive(Debug, Error)]
#[error("Preflight failed: {}", .failures.iter().map(|f| f.to_string()).collect::<Vec<_>>().join("; "))]
pub struct PreflightError {
    pub failures: Vec<CheckFailure>,
}

/// Gate the daemon on its collaborators being usable
pub fn check(config: &Config) -> Result<(), PreflightError> {
    let mut failures = Vec::new();

    if config.probe.mode != TestMode::DryRun {
        let tool = ToolCheck::check(&config.probe.command, &["--version"]);
        if !tool.available {
            failures.push(CheckFailure {
                check: "probe",
                message: format!("{} not found or not runnable", config.probe.command),
            });
        }
    }

    // Opened and dropped here; the detached process opens its own connection
    if let Err(e) = SqliteSink::open(&config.sink.database, &config.sink.table) {
        failures.push(CheckFailure {
            check: "sink",
            message: e.to_string(),
        });
    }

    debug!(failures = failures.len(), "preflight::check: done");
    if failures.is_empty() {
        Ok(())
    } else {
        Err(PreflightError { failures })
    }
}
