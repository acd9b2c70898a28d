//! Result sink capability
//!
//! The sink is the single durable record of every iteration. A failing
//! store is fatal to the daemon.

mod memory;
mod sqlite;

pub use memory::MemorySink;
pub use sqlite::{SqliteSink, validate_table_name};

use std::path::PathBuf;

use thiserror::Error;

use crate::result::ProbeResult;

/// Errors a sink can report
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Cannot open database {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Cannot create database directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid table name: {0:?}")]
    InvalidTable(String),

    #[error("Table {table} is missing columns: {}", .missing.join(", "))]
    Schema { table: String, missing: Vec<String> },

    #[error("SQL failure in {context}: {source}")]
    Sql {
        context: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Sink rejected result: {0}")]
    Rejected(String),
}

/// Durable destination for probe results
pub trait ResultSink: Send {
    /// Persist one result
    fn store(&mut self, result: &ProbeResult) -> Result<(), SinkError>;

    /// Short name for logs
    fn describe(&self) -> String;
}
