//! speedd - periodic network speed probe daemon
//!
//! CLI entry point for starting, stopping and inspecting the daemon.

use std::fs;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::time::Duration;

use clap::{CommandFactory, FromArgMatches};
use eyre::{Context, Result};
use tracing::{debug, error, info};

use speedd::cli::{Cli, Command, OutputFormat, ProbeArgs, generate_after_help};
use speedd::config::{Config, ConfigOverrides};
use speedd::daemon::{self, RunOptions, StopOutcome};

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    // Determine log level with priority: CLI --log-level > config file > default (INFO)
    let level = match cli_log_level.or(config_log_level) {
        Some(s) => match s.to_uppercase().as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        },
        None => tracing::Level::INFO,
    };

    // stderr is re-pointed at the log file once the daemon detaches
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .try_init()
        .map_err(|e| eyre::eyre!("Failed to initialize logging: {}", e))?;

    debug!("Logging initialized (level: {:?})", level);
    Ok(())
}

/// Route panics through the log stream, then let the default hook run
fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        error!(%panic_info, "speedd panicked");
        default_hook(panic_info);
    }));
}

// Not #[tokio::main]: `start` forks, and no runtime thread may exist before it does
fn main() -> Result<()> {
    // Build command with dynamic after_help that shows tool checks and daemon status
    let cmd = Cli::command().after_help(generate_after_help());
    let cli = Cli::from_arg_matches(&cmd.get_matches())?;

    // Load log level from config file early (before full config load)
    let config_log_level = Config::load_log_level(cli.config.as_ref());
    setup_logging(cli.log_level.as_deref(), config_log_level.as_deref()).context("Failed to setup logging")?;
    install_panic_hook();

    let mut config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    debug!(command = ?cli.command, "main: dispatching command");
    match cli.command {
        Command::Start {
            foreground,
            probe,
            lock_file,
            log_file,
        } => {
            config.apply(ConfigOverrides {
                lock_file,
                log_file,
                ..probe.into_overrides()
            });
            cmd_start(&config, foreground)
        }
        Command::Stop { lock_file, wait, force } => {
            config.apply(ConfigOverrides {
                lock_file,
                ..Default::default()
            });
            cmd_stop(&config, Duration::from_secs(wait), force)
        }
        Command::Status { lock_file, format } => {
            config.apply(ConfigOverrides {
                lock_file,
                ..Default::default()
            });
            cmd_status(&config, format)
        }
        Command::Once { probe } => cmd_once(config, probe),
        Command::Logs {
            follow,
            lines,
            log_file,
        } => {
            config.apply(ConfigOverrides {
                log_file,
                ..Default::default()
            });
            cmd_logs(&config.daemon.log_file, follow, lines)
        }
    }
}

/// Start the daemon
fn cmd_start(config: &Config, foreground: bool) -> Result<()> {
    debug!(foreground, "cmd_start: called");
    if foreground {
        println!("Starting speedd in foreground mode...");
    } else {
        println!("Starting speedd (logs: {})", config.daemon.log_file.display());
    }

    let summary = daemon::run(config, RunOptions { foreground })?;
    info!(?summary, "speedd exited cleanly");
    Ok(())
}

/// Stop the daemon
fn cmd_stop(config: &Config, wait: Duration, force: bool) -> Result<()> {
    debug!(?wait, force, "cmd_stop: called");
    match daemon::stop(&config.daemon.lock_file, wait, force)? {
        StopOutcome::NotRunning => println!("speedd is not running"),
        StopOutcome::Stopped { pid } => println!("speedd stopped (PID: {})", pid),
        StopOutcome::Killed { pid } => println!("speedd killed (PID: {})", pid),
        StopOutcome::StillRunning { pid } => {
            eyre::bail!(
                "speedd (PID: {}) is still finishing its current test; retry or use --force",
                pid
            );
        }
    }
    Ok(())
}

/// Show daemon status
fn cmd_status(config: &Config, format: OutputFormat) -> Result<()> {
    debug!(?format, "cmd_status: called");
    let status = daemon::status(&config.daemon.lock_file)?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&status)?),
        OutputFormat::Text => {
            println!("speedd Status");
            println!("-------------");
            if status.running {
                println!("Status: running");
            } else {
                println!("Status: stopped");
            }
            if let Some(pid) = status.pid {
                let suffix = if status.stale { " (stale)" } else { "" };
                println!("PID: {}{}", pid, suffix);
            } else if status.stale {
                println!("PID: unreadable (stale)");
            }
            println!("Lock file: {}", status.lock_file.display());
        }
    }
    Ok(())
}

/// Run one test in the foreground
fn cmd_once(mut config: Config, probe: ProbeArgs) -> Result<()> {
    debug!(?probe, "cmd_once: called");
    config.apply(probe.into_overrides());

    let runtime = tokio::runtime::Runtime::new().context("Failed to build async runtime")?;
    let report = runtime.block_on(daemon::run_once(&config))?;
    println!("{}", report.result);
    Ok(())
}

/// Show daemon logs
fn cmd_logs(log_path: &Path, follow: bool, lines: usize) -> Result<()> {
    debug!(?log_path, follow, lines, "cmd_logs: called");
    if !log_path.exists() {
        println!("No log file found at: {}", log_path.display());
        println!("The daemon may not have been started yet.");
        return Ok(());
    }

    if follow {
        println!("Following log file: {} (Ctrl+C to stop)", log_path.display());
        println!();

        let mut child = std::process::Command::new("tail")
            .args(["-f", "-n", &lines.to_string()])
            .arg(log_path)
            .spawn()
            .context("Failed to run tail -f")?;
        child.wait()?;
    } else {
        let file = fs::File::open(log_path).context("Failed to open log file")?;
        let all_lines: Vec<String> = BufReader::new(file).lines().map_while(|l| l.ok()).collect();
        let start = all_lines.len().saturating_sub(lines);
        for line in &all_lines[start..] {
            println!("{}", line);
        }
    }
    Ok(())
}
