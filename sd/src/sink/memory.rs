//! In-memory sink

use std::sync::{Arc, Mutex};

use super::{ResultSink, SinkError};
use crate::result::ProbeResult;

/// Keeps results in a shared vector; clones see the same results
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    results: Arc<Mutex<Vec<ProbeResult>>>,
    fail_after: Option<usize>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink that accepts `n` results and rejects every one after that
    pub fn failing_after(n: usize) -> Self {
        Self {
            results: Arc::default(),
            fail_after: Some(n),
        }
    }

    /// Copy of everything stored so far
    pub fn results(&self) -> Vec<ProbeResult> {
        self.results.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.results.lock().map(|r| r.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ResultSink for MemorySink {
    fn store(&mut self, result: &ProbeResult) -> Result<(), SinkError> {
        let mut results = self
            .results
            .lock()
            .map_err(|_| SinkError::Rejected("memory sink poisoned".to_string()))?;
        if self.fail_after.is_some_and(|n| results.len() >= n) {
            return Err(SinkError::Rejected("memory sink is full".to_string()));
        }
        results.push(result.clone());
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
