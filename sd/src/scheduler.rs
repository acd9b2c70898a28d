//! Scheduler loop and daemon state machine
//!
//! ```text
//! Initializing -> Detaching -> AcquiringLock -> Running -> Draining -> Terminated
//!                                   |                                    ^
//!                                   +------------- lock failure ---------+
//! ```
//!
//! Inside `Running` iterations run strictly one after another. The shutdown
//! flag is consulted only between iterations.

use std::fmt;
use std::time::{Duration, Instant};

use tokio::time::sleep_until;
use tracing::{debug, info, warn};

use crate::config::DaemonConfig;
use crate::error::DaemonError;
use crate::executor::{Executor, IterationOutcome};
use crate::signals::ShutdownFlag;

/// Daemon lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Initializing,
    Detaching,
    AcquiringLock,
    Running,
    Draining,
    Terminated,
}

impl DaemonState {
    /// Whether `next` is a legal successor of `self`
    pub fn can_advance_to(self, next: DaemonState) -> bool {
        use DaemonState::*;
        matches!(
            (self, next),
            (Initializing, Detaching)
                // foreground runs skip detachment
                | (Initializing, AcquiringLock)
                | (Initializing, Terminated)
                | (Detaching, AcquiringLock)
                | (AcquiringLock, Running)
                | (AcquiringLock, Terminated)
                | (Running, Draining)
                | (Draining, Terminated)
        )
    }
}

impl fmt::Display for DaemonState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initializing => "initializing",
            Self::Detaching => "detaching",
            Self::AcquiringLock => "acquiring-lock",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Terminated => "terminated",
        };
        write!(f, "{}", name)
    }
}

/// Current state plus every state visited
#[derive(Debug, Clone)]
pub struct Lifecycle {
    state: DaemonState,
    history: Vec<DaemonState>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: DaemonState::Initializing,
            history: vec![DaemonState::Initializing],
        }
    }

    pub fn state(&self) -> DaemonState {
        self.state
    }

    pub fn history(&self) -> &[DaemonState] {
        &self.history
    }

    /// Move to `next`; illegal moves are logged and ignored
    pub fn advance(&mut self, next: DaemonState) {
        if !self.state.can_advance_to(next) {
            warn!(from = %self.state, to = %next, "Ignoring illegal state transition");
            return;
        }
        debug!(from = %self.state, to = %next, "Lifecycle::advance: transition");
        self.state = next;
        self.history.push(next);
    }
}

/// In-memory run state; only the scheduler and the signal gateway touch it
#[derive(Debug, Clone, Default)]
struct RunState {
    shutdown: ShutdownFlag,
    iteration_started: Option<Instant>,
    iterations: u64,
}

/// Counters reported when the loop ends
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub iterations: u64,
    pub timeouts: u64,
    pub probe_failures: u64,
}

/// Drives iterations on a fixed interval until shutdown
pub struct Scheduler {
    config: DaemonConfig,
    executor: Executor,
    state: RunState,
    summary: RunSummary,
}

impl Scheduler {
    pub fn new(config: DaemonConfig, executor: Executor, shutdown: ShutdownFlag) -> Self {
        Self {
            config,
            executor,
            state: RunState {
                shutdown,
                ..Default::default()
            },
            summary: RunSummary::default(),
        }
    }

    /// Run until shutdown is requested or the sink fails
    ///
    /// Iteration starts are `interval` apart. An iteration that overruns the
    /// interval is followed immediately by the next one, never overlapped.
    pub async fn run(&mut self) -> Result<RunSummary, DaemonError> {
        info!(
            interval = ?self.config.interval,
            timeout = ?self.config.timeout,
            mode = %self.config.mode,
            "Scheduler started"
        );

        loop {
            let started = Instant::now();
            self.state.iteration_started = Some(started);
            self.state.iterations += 1;
            self.summary.iterations = self.state.iterations;
            debug!(iteration = self.state.iterations, "Scheduler::run: iteration start");

            let report = self
                .executor
                .run_iteration(&self.config)
                .await
                .map_err(DaemonError::Persistence)?;
            match report.outcome {
                IterationOutcome::Measured => {}
                IterationOutcome::TimedOut => self.summary.timeouts += 1,
                IterationOutcome::ProbeFailed(_) => self.summary.probe_failures += 1,
            }
            if let Some(begun) = self.state.iteration_started.take() {
                debug!(
                    iteration = self.state.iterations,
                    elapsed = ?begun.elapsed(),
                    "Scheduler::run: iteration done"
                );
            }

            if self.state.shutdown.is_requested() {
                break;
            }

            let next = next_start(started, self.config.interval);
            tokio::select! {
                _ = sleep_until_or_forever(next) => {}
                _ = self.state.shutdown.wait() => {
                    debug!("Scheduler::run: shutdown requested while sleeping");
                }
            }

            if self.state.shutdown.is_requested() {
                break;
            }
        }

        info!(
            iterations = self.summary.iterations,
            timeouts = self.summary.timeouts,
            probe_failures = self.summary.probe_failures,
            "Shutdown requested, leaving scheduler loop"
        );
        Ok(self.summary)
    }
}

/// Start of the iteration after one begun at `started`
///
/// `None` when the instant is past what the clock can represent.
fn next_start(started: Instant, interval: Duration) -> Option<tokio::time::Instant> {
    started.checked_add(interval).map(tokio::time::Instant::from_std)
}

async fn sleep_until_or_forever(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
