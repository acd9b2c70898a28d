//! CLI command definitions and subcommands

use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::debug;

use crate::config::{Config, ConfigOverrides, TestMode};
use crate::daemon;
use crate::preflight::ToolCheck;

/// speedd - periodic network speed probe daemon
#[derive(Parser)]
#[command(
    name = "speedd",
    about = "Run network speed tests on a fixed interval and record the results",
    version = env!("GIT_DESCRIBE"),
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the daemon
    Start {
        /// Don't fork to background (run in foreground)
        #[arg(long)]
        foreground: bool,

        #[command(flatten)]
        probe: ProbeArgs,

        /// Lock file path
        #[arg(long)]
        lock_file: Option<PathBuf>,

        /// Log file used once detached
        #[arg(long)]
        log_file: Option<PathBuf>,
    },

    /// Stop the daemon
    Stop {
        /// Lock file path
        #[arg(long)]
        lock_file: Option<PathBuf>,

        /// Seconds to wait for the current iteration to finish
        #[arg(short, long, default_value = "150")]
        wait: u64,

        /// Send SIGKILL if the daemon is still running after the wait
        #[arg(long)]
        force: bool,
    },

    /// Check daemon status
    Status {
        /// Lock file path
        #[arg(long)]
        lock_file: Option<PathBuf>,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Run a single bounded test in the foreground and store it
    Once {
        #[command(flatten)]
        probe: ProbeArgs,
    },

    /// Show daemon logs
    Logs {
        /// Follow log output (like tail -f)
        #[arg(short, long)]
        follow: bool,

        /// Number of lines to show
        #[arg(short = 'n', long, default_value = "50")]
        lines: usize,

        /// Log file path
        #[arg(long)]
        log_file: Option<PathBuf>,
    },
}

/// Probe and sink options shared by `start` and `once`
#[derive(Debug, Clone, Default, Args)]
pub struct ProbeArgs {
    /// Minutes between test starts
    #[arg(short, long)]
    pub interval: Option<u64>,

    /// Seconds a single test may take
    #[arg(short, long)]
    pub timeout: Option<u64>,

    /// Test mode (quick, full, dry-run)
    #[arg(short, long)]
    pub mode: Option<TestMode>,

    /// Speed-test server id
    #[arg(short, long)]
    pub server: Option<String>,

    /// SQLite database path
    #[arg(short, long)]
    pub database: Option<PathBuf>,

    /// Results table name
    #[arg(long)]
    pub table: Option<String>,
}

impl ProbeArgs {
    pub fn into_overrides(self) -> ConfigOverrides {
        ConfigOverrides {
            interval_secs: self.interval.map(|minutes| minutes.saturating_mul(60)),
            timeout_secs: self.timeout,
            mode: self.mode,
            server: self.server,
            database: self.database,
            table: self.table,
            ..Default::default()
        }
    }
}

/// Output format for the status command
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Generate the after_help text with tool checks and daemon status
///
/// Help is rendered before `--config` is parsed, so only the default
/// config search path is consulted.
pub fn generate_after_help() -> String {
    debug!("generate_after_help: called");
    after_help_for(&Config::load(None).unwrap_or_default())
}

/// After-help text for the probe, lock file and log file `config` names
pub fn after_help_for(config: &Config) -> String {
    let tool = ToolCheck::check(&config.probe.command, &["--version"]);
    let daemon_running = is_daemon_running(&config.daemon.lock_file);
    let log_path = &config.daemon.log_file;

    let mut help = String::new();

    help.push_str("Required Tools:\n");
    let icon = if tool.available { "\u{2705}" } else { "\u{274C}" };
    let version = tool.version.as_deref().unwrap_or("not found");
    help.push_str(&format!("  {} {:<10} {}\n", icon, tool.name, version));

    help.push('\n');
    help.push_str("Daemon:\n");
    let (daemon_icon, daemon_status) = if daemon_running {
        ("\u{2705}", "running")
    } else {
        ("\u{274C}", "stopped")
    };
    help.push_str(&format!("  {} {}\n", daemon_icon, daemon_status));

    help.push('\n');
    help.push_str(&format!("Logs are written to: {}\n", log_path.display()));

    help
}

/// Lightweight check for help display
fn is_daemon_running(lock_file: &Path) -> bool {
    daemon::status(lock_file).map(|s| s.running).unwrap_or(false)
}
