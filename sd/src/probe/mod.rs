//! Probe capability
//!
//! A probe produces one raw [`ProbeSample`] per call. It may block for a long
//! time and offers no cancellation hook of its own; the executor bounds it by
//! dropping the future when the iteration deadline passes.

mod command;

pub use command::{CommandProbe, parse_csv_line};

use async_trait::async_trait;
use thiserror::Error;

use crate::config::TestMode;
use crate::result::ProbeSample;

/// Errors a probe can report
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("Failed to run probe command {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Probe command exited with {code:?}: {stderr}")]
    Failed { code: Option<i32>, stderr: String },

    #[error("Malformed probe output: {0}")]
    Malformed(String),

    #[error("Probe error: {0}")]
    Other(String),
}

/// Something that can measure the network once
#[async_trait]
pub trait Probe: Send + Sync {
    /// Take one sample in the given mode against an optional target
    async fn run(&self, mode: TestMode, target: Option<&str>) -> Result<ProbeSample, ProbeError>;

    /// Short name for logs
    fn name(&self) -> &str;
}
