//! Daemon error types

use std::io;

use thiserror::Error;

use crate::config::ConfigError;
use crate::detach::DetachError;
use crate::lockfile::LockError;
use crate::preflight::PreflightError;
use crate::redirect::RedirectError;
use crate::sink::SinkError;

/// How a failure ends the daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Raised before the first iteration; nothing to clean up but the lock
    StartupFatal,
    /// The sink stopped accepting results
    PersistenceFatal,
}

/// Errors that end the daemon
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Preflight(#[from] PreflightError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Detach(#[from] DetachError),

    #[error(transparent)]
    Redirect(#[from] RedirectError),

    #[error("Failed to build async runtime: {0}")]
    Runtime(#[source] io::Error),

    #[error("Failed to install signal handlers: {0}")]
    Signals(#[source] io::Error),

    #[error("Cannot open result sink: {0}")]
    SinkOpen(#[source] SinkError),

    #[error("Result sink failed, stopping: {0}")]
    Persistence(#[source] SinkError),

    #[error("Failed to signal PID {pid}: {source}")]
    Signal {
        pid: i32,
        #[source]
        source: nix::Error,
    },
}

impl DaemonError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Persistence(_) => ErrorKind::PersistenceFatal,
            _ => ErrorKind::StartupFatal,
        }
    }
}
