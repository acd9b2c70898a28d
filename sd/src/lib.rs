//! speedd - periodic network speed probe daemon
//!
//! speedd runs a bounded network speed test on a fixed interval and hands
//! every result to a sink, forever, until it is told to stop.
//!
//! # Core Concepts
//!
//! - **Single Instance**: a PID lock file guards against a second daemon
//! - **Bounded Iterations**: every test runs under a hard deadline; an
//!   expired test is recorded as all zeros and the loop keeps going
//! - **Cooperative Shutdown**: signals set a flag checked between iterations
//! - **Clean Exit**: the lock is released on every exit path
//!
//! # Modules
//!
//! - [`lockfile`] - Single-instance lock file
//! - [`detach`] - Double-fork session detachment
//! - [`signals`] - Shutdown signal gateway
//! - [`executor`] - Bounded iteration executor
//! - [`scheduler`] - Scheduler loop and lifecycle state machine
//! - [`redirect`] - Standard stream redirection to the log file
//! - [`probe`] - Speed-test probe trait and command implementation
//! - [`sink`] - Result sink trait with SQLite and in-memory implementations
//! - [`daemon`] - Startup ordering plus stop/status
//! - [`config`] - Configuration types and loading
//! - [`cli`] - Command-line interface

pub mod cli;
pub mod config;
pub mod daemon;
pub mod detach;
pub mod error;
pub mod executor;
pub mod lockfile;
pub mod preflight;
pub mod probe;
pub mod redirect;
pub mod result;
pub mod scheduler;
pub mod signals;
pub mod sink;

pub use config::{Config, DaemonConfig, TestMode};
pub use error::{DaemonError, ErrorKind};
pub use executor::{Executor, IterationOutcome, IterationReport};
pub use lockfile::{LockError, LockFile};
pub use probe::{Probe, ProbeError};
pub use result::{ProbeResult, ProbeSample};
pub use scheduler::{DaemonState, Lifecycle, RunSummary, Scheduler};
pub use signals::ShutdownFlag;
pub use sink::{MemorySink, ResultSink, SinkError, SqliteSink};
