//! Session detachment
//!
//! Classic double fork: the invoking process exits, the first child becomes
//! a session leader, and the grandchild that survives is not a session
//! leader and so can never reacquire a controlling terminal.

use nix::unistd::{ForkResult, chdir, fork, setsid};
use thiserror::Error;
use tracing::debug;

/// Working directory of the detached process
pub const DETACHED_CWD: &str = "/";

/// Errors from detaching
#[derive(Debug, Error)]
pub enum DetachError {
    #[error("Fork failed: {0}")]
    Fork(#[source] nix::Error),

    #[error("Failed to create new session: {0}")]
    Setsid(#[source] nix::Error),

    #[error("Failed to change directory to /: {0}")]
    Chdir(#[source] nix::Error),
}

/// Detach from the launching session
///
/// Returns only in the final grandchild; both intermediate processes exit
/// with status 0. Must be called while the process is single-threaded,
/// before any async runtime is built.
pub fn detach() -> Result<(), DetachError> {
    debug!("detach: first fork");
    fork_and_exit_parent()?;

    setsid().map_err(DetachError::Setsid)?;

    debug!("detach: second fork");
    fork_and_exit_parent()?;

    chdir(DETACHED_CWD).map_err(DetachError::Chdir)?;
    debug!(pid = std::process::id(), "detach: detached");
    Ok(())
}

fn fork_and_exit_parent() -> Result<(), DetachError> {
    // SAFETY: callers guarantee the process is single-threaded here, so the
    // child cannot inherit a lock held by another thread.
    match unsafe { fork() }.map_err(DetachError::Fork)? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => Ok(()),
    }
}
