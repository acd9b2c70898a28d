//! Bounded iteration executor
//!
//! One iteration is: measure under a deadline, stamp the result, hand it to
//! the sink. Timeouts and probe errors degrade to an all-zero result. Only a
//! sink failure escapes, because it ends the daemon.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Local;
use tracing::{Instrument, Span, debug, error, info, warn};

use crate::config::{DaemonConfig, TestMode};
use crate::probe::{Probe, ProbeError};
use crate::result::{FULL_TEST_SAMPLES, ProbeResult, ProbeSample};
use crate::sink::{ResultSink, SinkError};

/// How an iteration's measurement ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IterationOutcome {
    /// Probe finished inside the deadline
    Measured,
    /// Deadline passed first; result is all-zero
    TimedOut,
    /// Probe reported an error; result is all-zero
    ProbeFailed(String),
}

/// What one iteration produced and stored
#[derive(Debug, Clone)]
pub struct IterationReport {
    pub result: ProbeResult,
    pub outcome: IterationOutcome,
    pub elapsed: Duration,
}

/// Runs single iterations against a probe and a sink
pub struct Executor {
    probe: Arc<dyn Probe>,
    sink: Box<dyn ResultSink>,
}

impl Executor {
    pub fn new(probe: Arc<dyn Probe>, sink: Box<dyn ResultSink>) -> Self {
        Self { probe, sink }
    }

    /// Run one bounded iteration
    ///
    /// The result is stored exactly once whatever the outcome; the only
    /// error is the sink's.
    pub async fn run_iteration(&mut self, config: &DaemonConfig) -> Result<IterationReport, SinkError> {
        let started = Instant::now();
        info!(mode = %config.mode, probe = self.probe.name(), "Beginning connection test");

        let probe = Arc::clone(&self.probe);
        let mode = config.mode;
        let target = config.target.clone();
        // The probe runs on its own task so a probe that hogs its thread
        // cannot stall the deadline; it logs under the caller's span
        let mut task = tokio::spawn(
            async move { measure(probe.as_ref(), mode, target.as_deref()).await }.instrument(Span::current()),
        );

        let (result, outcome) = match tokio::time::timeout(config.timeout, &mut task).await {
            Ok(Ok(Ok(sample))) => (ProbeResult::from_sample(&sample, Local::now()), IterationOutcome::Measured),
            Ok(Ok(Err(e))) => {
                error!(error = %e, "Connection test failed, recording zeros");
                (ProbeResult::zeroed(Local::now()), IterationOutcome::ProbeFailed(e.to_string()))
            }
            Ok(Err(join_err)) => {
                if join_err.is_panic() {
                    std::panic::resume_unwind(join_err.into_panic());
                }
                error!(error = %join_err, "Connection test task was cancelled, recording zeros");
                (
                    ProbeResult::zeroed(Local::now()),
                    IterationOutcome::ProbeFailed(join_err.to_string()),
                )
            }
            Err(_) => {
                // Cooperative probes stop here; blocking ones may keep running
                task.abort();
                warn!(timeout = ?config.timeout, "Connection test timed out, recording zeros");
                (ProbeResult::zeroed(Local::now()), IterationOutcome::TimedOut)
            }
        };

        if let Err(e) = self.sink.store(&result) {
            error!(error = %e, sink = %self.sink.describe(), "Failed to store result");
            return Err(e);
        }

        let elapsed = started.elapsed();
        info!(%result, ?elapsed, "Connection test complete");
        Ok(IterationReport {
            result,
            outcome,
            elapsed,
        })
    }
}

/// Take the measurement the mode calls for
pub async fn measure(probe: &dyn Probe, mode: TestMode, target: Option<&str>) -> Result<ProbeSample, ProbeError> {
    match mode {
        TestMode::Quick | TestMode::DryRun => probe.run(mode, target).await,
        TestMode::Full => {
            let mut samples = Vec::with_capacity(FULL_TEST_SAMPLES);
            for n in 1..=FULL_TEST_SAMPLES {
                let sample = probe.run(mode, target).await?;
                debug!(n, ?sample, "measure: full test sample");
                samples.push(sample);
            }
            ProbeSample::mean(&samples).ok_or_else(|| ProbeError::Other("no samples collected".to_string()))
        }
    }
}
