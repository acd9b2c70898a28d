//! Diagnostic output relocation
//!
//! After detachment the inherited standard streams point nowhere useful, so
//! stdout and stderr are re-pointed at an append-only log file and stdin at
//! `/dev/null`. The tracing subscriber writes to stderr unbuffered, one
//! `write(2)` per event, so the file is current for anyone tailing it.

use std::fs::{DirBuilder, File, OpenOptions};
use std::io;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use nix::unistd::{dup2_stderr, dup2_stdin, dup2_stdout};
use thiserror::Error;
use tracing::debug;

/// Mode for a log directory we create
pub const LOG_DIR_MODE: u32 = 0o755;
/// Mode for a log file we create
pub const LOG_FILE_MODE: u32 = 0o644;

/// Errors from preparing or installing the log target
#[derive(Debug, Error)]
pub enum RedirectError {
    #[error("Cannot create log directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Cannot write to log file {path}: {source}")]
    NotWritable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Cannot redirect standard streams: {0}")]
    Dup(#[source] nix::Error),

    #[error("Cannot open /dev/null: {0}")]
    DevNull(#[source] io::Error),
}

/// A log file verified to be appendable
#[derive(Debug)]
pub struct LogTarget {
    path: PathBuf,
    file: File,
}

impl LogTarget {
    /// Make sure `path` exists and can be appended to
    ///
    /// Missing parent directories are created with [`LOG_DIR_MODE`] and a
    /// missing file with [`LOG_FILE_MODE`]; existing ones keep their modes.
    pub fn prepare(path: &Path) -> Result<Self, RedirectError> {
        debug!(?path, "LogTarget::prepare: called");
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.is_dir()
        {
            debug!(?parent, "LogTarget::prepare: creating log directory");
            DirBuilder::new()
                .recursive(true)
                .mode(LOG_DIR_MODE)
                .create(parent)
                .map_err(|source| RedirectError::CreateDir {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .mode(LOG_FILE_MODE)
            .open(path)
            .map_err(|source| RedirectError::NotWritable {
                path: path.to_path_buf(),
                source,
            })?;

        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Point stdout and stderr at the log file and stdin at `/dev/null`
    pub fn redirect(&self) -> Result<(), RedirectError> {
        debug!(path = ?self.path, "LogTarget::redirect: redirecting standard streams");
        let null = File::open("/dev/null").map_err(RedirectError::DevNull)?;
        dup2_stdin(&null).map_err(RedirectError::Dup)?;
        dup2_stdout(&self.file).map_err(RedirectError::Dup)?;
        dup2_stderr(&self.file).map_err(RedirectError::Dup)?;
        Ok(())
    }

    /// Append handle onto the log file
    pub fn writer(&self) -> io::Result<File> {
        self.file.try_clone()
    }
}
