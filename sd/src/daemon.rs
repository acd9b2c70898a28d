//! Daemon process management
//!
//! Startup ordering, the running phase, and operator-side stop/status.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use serde::Serialize;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::config::{Config, DaemonConfig};
use crate::detach::detach;
use crate::error::DaemonError;
use crate::executor::{Executor, IterationReport};
use crate::lockfile::{self, LockError, LockFile, PidStatus};
use crate::preflight;
use crate::probe::{CommandProbe, Probe};
use crate::redirect::LogTarget;
use crate::scheduler::{DaemonState, Lifecycle, RunSummary, Scheduler};
use crate::signals::{self, ShutdownFlag};
use crate::sink::{ResultSink, SqliteSink};

/// Signal `stop` sends to ask for a graceful exit
pub const STOP_SIGNAL: Signal = Signal::SIGTERM;

/// How often `stop` re-checks the daemon while waiting
const STOP_POLL: Duration = Duration::from_millis(100);

/// Startup options not carried by the config file
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Stay attached to the terminal and keep the standard streams
    pub foreground: bool,
}

/// Run the daemon from startup to termination
///
/// Blocks until the daemon stops. Must be called before any async runtime
/// or other thread exists, because it forks.
pub fn run(config: &Config, options: RunOptions) -> Result<RunSummary, DaemonError> {
    let mut lifecycle = Lifecycle::new();
    debug!(?options, "run: initializing");

    let daemon_config = config.daemon_config()?;
    preflight::check(config)?;
    let log_target = LogTarget::prepare(&daemon_config.log_file)?;

    // Report an existing instance while the operator can still see it
    lockfile::check(&daemon_config.lock_file)?;

    if !options.foreground {
        lifecycle.advance(DaemonState::Detaching);
        info!(log_file = ?daemon_config.log_file, "Detaching; further output goes to the log file");
        detach()?;
    }

    // Every line from here on, including the lock's, names the final PID
    let span = info_span!("speedd", pid = std::process::id());
    let _entered = span.clone().entered();

    lifecycle.advance(DaemonState::AcquiringLock);
    let lock = match LockFile::acquire(&daemon_config.lock_file) {
        Ok(lock) => lock,
        Err(e) => {
            lifecycle.advance(DaemonState::Terminated);
            return Err(e.into());
        }
    };

    if !options.foreground {
        log_target.redirect()?;
    }

    // Built only now: forking a process with runtime threads is unsound
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(DaemonError::Runtime)?;

    runtime.block_on(
        async move {
            info!(lock_file = ?lock.path(), "Starting speedd");
            let shutdown = ShutdownFlag::new();
            let _signal_tasks = signals::install(&shutdown).map_err(DaemonError::Signals)?;

            let probe: Arc<dyn Probe> = Arc::new(CommandProbe::new(config.probe.command.clone()));
            let sink = SqliteSink::open(&config.sink.database, &config.sink.table).map_err(DaemonError::SinkOpen)?;

            serve(daemon_config, lock, Some(&log_target), probe, Box::new(sink), shutdown, &mut lifecycle).await
        }
        .instrument(span),
    )
}

/// The running phase: scheduler loop, then draining
///
/// The lock is released on every exit from here, including a sink failure;
/// an unwinding panic releases it through [`LockFile`]'s drop.
pub async fn serve(
    config: DaemonConfig,
    lock: LockFile,
    log_target: Option<&LogTarget>,
    probe: Arc<dyn Probe>,
    sink: Box<dyn ResultSink>,
    shutdown: ShutdownFlag,
    lifecycle: &mut Lifecycle,
) -> Result<RunSummary, DaemonError> {
    lifecycle.advance(DaemonState::Running);
    let mut scheduler = Scheduler::new(config, Executor::new(probe, sink), shutdown);
    let outcome = scheduler.run().await;

    lifecycle.advance(DaemonState::Draining);
    match &outcome {
        Ok(summary) => info!(?summary, "Stopping speedd"),
        Err(e) => error!(error = %e, "Stopping speedd after fatal error"),
    }
    lock.release();
    if let Some(target) = log_target
        && let Ok(file) = target.writer()
        && let Err(e) = file.sync_all()
    {
        warn!(error = %e, "Failed to sync log file");
    }
    lifecycle.advance(DaemonState::Terminated);
    outcome
}

/// Run exactly one bounded iteration in the foreground
pub async fn run_once(config: &Config) -> Result<IterationReport, DaemonError> {
    let daemon_config = config.daemon_config()?;
    preflight::check(config)?;

    let probe: Arc<dyn Probe> = Arc::new(CommandProbe::new(config.probe.command.clone()));
    let sink = SqliteSink::open(&config.sink.database, &config.sink.table).map_err(DaemonError::SinkOpen)?;
    let mut executor = Executor::new(probe, Box::new(sink));

    executor
        .run_iteration(&daemon_config)
        .await
        .map_err(DaemonError::Persistence)
}

/// Daemon status information
#[derive(Debug, Clone, Serialize)]
pub struct DaemonStatus {
    /// Whether the daemon is running
    pub running: bool,
    /// Process ID (if running)
    pub pid: Option<i32>,
    /// Lock file holds a PID that is no longer alive
    pub stale: bool,
    /// Lock file path
    pub lock_file: PathBuf,
}

/// Inspect the lock file without changing it
pub fn status(lock_file: &Path) -> Result<DaemonStatus, LockError> {
    let (running, pid, stale) = match lockfile::pid_status(lock_file)? {
        PidStatus::Absent => (false, None, false),
        PidStatus::Incomplete => (true, None, false),
        PidStatus::Stale => (false, lockfile::read_pid(lock_file), true),
        PidStatus::Running(pid) | PidStatus::NotOwned(pid) => (true, Some(pid), false),
    };
    let status = DaemonStatus {
        running,
        pid,
        stale,
        lock_file: lock_file.to_path_buf(),
    };
    debug!(?status, "status: returning");
    Ok(status)
}

/// Result of asking the daemon to stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    NotRunning,
    Stopped { pid: i32 },
    Killed { pid: i32 },
    StillRunning { pid: i32 },
}

/// Ask the daemon to stop and wait up to `wait` for it to exit
///
/// The daemon finishes its current iteration first, so `wait` should cover
/// the iteration timeout. With `force`, a daemon still alive after `wait`
/// gets SIGKILL; its stale lock is purged by the next start.
pub fn stop(lock_file: &Path, wait: Duration, force: bool) -> Result<StopOutcome, DaemonError> {
    let pid = match lockfile::pid_status(lock_file)? {
        PidStatus::Running(pid) => pid,
        PidStatus::NotOwned(pid) => {
            return Err(DaemonError::Signal {
                pid,
                source: Errno::EPERM,
            });
        }
        // Nothing to signal until a starting instance has written its PID
        PidStatus::Absent | PidStatus::Stale | PidStatus::Incomplete => return Ok(StopOutcome::NotRunning),
    };

    info!(pid, signal = %STOP_SIGNAL, "Stopping daemon");
    kill(Pid::from_raw(pid), STOP_SIGNAL).map_err(|source| DaemonError::Signal { pid, source })?;

    // An unrepresentable deadline means wait indefinitely
    let deadline = Instant::now().checked_add(wait);
    while is_alive(pid) && deadline.is_none_or(|d| Instant::now() < d) {
        std::thread::sleep(STOP_POLL);
    }

    if !is_alive(pid) {
        info!(pid, "Daemon stopped");
        return Ok(StopOutcome::Stopped { pid });
    }

    if force {
        warn!(pid, "Daemon did not stop gracefully, sending SIGKILL");
        let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
        return Ok(StopOutcome::Killed { pid });
    }

    warn!(pid, ?wait, "Daemon still running");
    Ok(StopOutcome::StillRunning { pid })
}

fn is_alive(pid: i32) -> bool {
    matches!(lockfile::probe_pid(pid), PidStatus::Running(_) | PidStatus::NotOwned(_))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_status_without_lock_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("speedd.pid");

        let status = status(&path).unwrap();
        assert!(!status.running);
        assert!(status.pid.is_none());
        assert!(!status.stale);
        assert_eq!(status.lock_file, path);
    }

    #[test]
    fn test_status_with_live_pid() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("speedd.pid");
        fs::write(&path, std::process::id().to_string()).unwrap();

        let status = status(&path).unwrap();
        assert!(status.running);
        assert_eq!(status.pid, Some(std::process::id() as i32));
    }

    #[test]
    fn test_status_reports_stale_without_removing() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("speedd.pid");
        fs::write(&path, "garbage").unwrap();

        let status = status(&path).unwrap();
        assert!(!status.running);
        assert!(status.stale);
        assert!(path.exists());
    }

    #[test]
    fn test_status_with_record_being_written() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("speedd.pid");
        fs::File::create(&path).unwrap();

        let status = status(&path).unwrap();
        assert!(status.running);
        assert!(status.pid.is_none());
        assert_eq!(
            stop(&path, Duration::from_millis(10), false).unwrap(),
            StopOutcome::NotRunning
        );
    }

    #[test]
    fn test_stop_when_not_running() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("speedd.pid");

        let outcome = stop(&path, Duration::from_millis(10), false).unwrap();
        assert_eq!(outcome, StopOutcome::NotRunning);
    }

    #[test]
    fn test_stop_signals_process() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("speedd.pid");

        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id() as i32;
        fs::write(&path, pid.to_string()).unwrap();
        // Reap promptly so the PID stops answering kill(0)
        let reaper = std::thread::spawn(move || child.wait());

        let outcome = stop(&path, Duration::from_secs(5), false).unwrap();
        assert_eq!(outcome, StopOutcome::Stopped { pid });
        reaper.join().unwrap().unwrap();
    }

    #[test]
    fn test_stop_signal_is_sigterm() {
        assert_eq!(STOP_SIGNAL, Signal::SIGTERM);
    }
}
