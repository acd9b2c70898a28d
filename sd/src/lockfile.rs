//! Single-instance lock file
//!
//! The lock file holds exactly one thing: the decimal PID of the running
//! daemon. A record whose PID does not name a live process is stale and is
//! purged before a new instance claims the path.
//!
//! Records are written to a temporary file and linked into place, so a
//! reader never observes a half-written record from this crate.

use std::fs::{self, DirBuilder, Permissions};
use std::io::{self, Write};
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use thiserror::Error;
use tracing::{debug, info, warn};

const LOCK_FILE_MODE: u32 = 0o644;
const LOCK_DIR_MODE: u32 = 0o755;

/// How long an empty record is taken to be an instance still writing it
pub const INCOMPLETE_GRACE: Duration = Duration::from_secs(10);

/// Errors from acquiring the lock
#[derive(Debug, Error)]
pub enum LockError {
    #[error("An instance is already running{} (check {path})", pid_suffix(.pid))]
    AlreadyRunning { pid: Option<i32>, path: PathBuf },

    #[error("An instance owned by another user is running (PID {pid}, check {path})")]
    NotOwned { pid: i32, path: PathBuf },

    #[error("Permission denied for lock file {path}")]
    PermissionDenied { path: PathBuf },

    #[error("Lock file IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn pid_suffix(pid: &Option<i32>) -> String {
    pid.map(|p| format!(" (PID {})", p)).unwrap_or_default()
}

impl LockError {
    /// Both a live owned instance and a live foreign one count as "running"
    pub fn is_already_running(&self) -> bool {
        matches!(self, Self::AlreadyRunning { .. } | Self::NotOwned { .. })
    }

    fn from_io(path: &Path, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::PermissionDenied {
            Self::PermissionDenied {
                path: path.to_path_buf(),
            }
        } else {
            Self::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    }
}

/// What the lock file says about the process it names
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PidStatus {
    /// No lock file
    Absent,
    /// Lock file names no live process (or holds garbage)
    Stale,
    /// Empty record young enough to belong to an instance mid-publish
    Incomplete,
    /// Live process we are permitted to signal
    Running(i32),
    /// Live process owned by someone else
    NotOwned(i32),
}

/// Probe whether `pid` names a live process without affecting it
pub fn probe_pid(pid: i32) -> PidStatus {
    // kill(0) and negative PIDs address process groups
    if pid <= 0 {
        return PidStatus::Stale;
    }
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => PidStatus::Running(pid),
        Err(Errno::EPERM) => PidStatus::NotOwned(pid),
        Err(_) => PidStatus::Stale,
    }
}

/// Read the PID stored in a lock file
pub fn read_pid(path: &Path) -> Option<i32> {
    let contents = fs::read_to_string(path).ok()?;
    contents.trim().parse().ok()
}

/// Classify the lock file at `path`
pub fn pid_status(path: &Path) -> Result<PidStatus, LockError> {
    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(PidStatus::Absent),
        Err(e) => return Err(LockError::from_io(path, e)),
    };

    let status = match contents.trim().parse::<i32>() {
        Ok(pid) => probe_pid(pid),
        Err(_) if contents.trim().is_empty() && is_young(path) => PidStatus::Incomplete,
        Err(_) => {
            debug!(?path, contents = contents.trim(), "pid_status: unparseable lock record");
            PidStatus::Stale
        }
    };
    debug!(?path, ?status, "pid_status: classified");
    Ok(status)
}

fn is_young(path: &Path) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .map(|modified| modified.elapsed().map(|age| age < INCOMPLETE_GRACE).unwrap_or(true))
        .unwrap_or(false)
}

/// Fail if a live instance holds `path`; purge the record if it is stale
pub fn check(path: &Path) -> Result<(), LockError> {
    match pid_status(path)? {
        PidStatus::Absent => Ok(()),
        PidStatus::Incomplete => Err(LockError::AlreadyRunning {
            pid: None,
            path: path.to_path_buf(),
        }),
        PidStatus::Running(pid) => Err(LockError::AlreadyRunning {
            pid: Some(pid),
            path: path.to_path_buf(),
        }),
        PidStatus::NotOwned(pid) => Err(LockError::NotOwned {
            pid,
            path: path.to_path_buf(),
        }),
        PidStatus::Stale => {
            warn!(?path, "Removing stale lock file");
            match fs::remove_file(path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(LockError::from_io(path, e)),
            }
        }
    }
}

/// A held lock; the file is removed when this is released or dropped
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
    pid: i32,
    released: bool,
}

impl LockFile {
    /// Acquire the lock for the current process
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        Self::acquire_as(path, std::process::id() as i32)
    }

    /// Acquire the lock recording `pid` as the owner
    pub fn acquire_as(path: &Path, pid: i32) -> Result<Self, LockError> {
        Self::acquire_with(path, pid, create_exclusive)
    }

    fn acquire_with<F>(path: &Path, pid: i32, mut create: F) -> Result<Self, LockError>
    where
        F: FnMut(&Path, i32) -> io::Result<()>,
    {
        debug!(?path, pid, "LockFile::acquire_as: called");
        ensure_parent(path)?;
        check(path)?;

        match create(path, pid) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                // Someone created the file between the check and the create
                debug!(?path, "LockFile::acquire_as: lost create race, re-checking once");
                check(path)?;
                create(path, pid).map_err(|e| {
                    if e.kind() == io::ErrorKind::AlreadyExists {
                        LockError::AlreadyRunning {
                            pid: read_pid(path),
                            path: path.to_path_buf(),
                        }
                    } else {
                        LockError::from_io(path, e)
                    }
                })?;
            }
            Err(e) => return Err(LockError::from_io(path, e)),
        }

        info!(?path, pid, "Lock acquired");
        Ok(Self {
            path: path.to_path_buf(),
            pid,
            released: false,
        })
    }

    /// Lock file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// PID recorded in the lock file
    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Remove the lock file now
    pub fn release(mut self) {
        self.remove();
    }

    fn remove(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        // Never delete a record some other instance wrote after us
        match read_pid(&self.path) {
            Some(pid) if pid == self.pid => match fs::remove_file(&self.path) {
                Ok(()) => info!(path = ?self.path, "Lock released"),
                Err(e) => warn!(path = ?self.path, error = %e, "Failed to remove lock file"),
            },
            Some(pid) => warn!(path = ?self.path, pid, "Lock file now names another process, leaving it"),
            None => debug!(path = ?self.path, "LockFile::remove: lock file already gone"),
        }
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        self.remove();
    }
}

fn ensure_parent(path: &Path) -> Result<(), LockError> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() && !parent.exists() => {
            debug!(?parent, "ensure_parent: creating lock directory");
            DirBuilder::new()
                .recursive(true)
                .mode(LOCK_DIR_MODE)
                .create(parent)
                .map_err(|e| LockError::from_io(parent, e))
        }
        _ => Ok(()),
    }
}

/// Publish `pid` at `path` in one step; fails with `AlreadyExists` if taken
fn create_exclusive(path: &Path, pid: i32) -> io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut record = tempfile::Builder::new()
        .prefix(".speedd-lock.")
        .permissions(Permissions::from_mode(LOCK_FILE_MODE))
        .tempfile_in(dir)?;
    write!(record, "{}", pid)?;
    record.as_file().sync_all()?;
    record.persist_noclobber(path).map(|_| ()).map_err(|e| e.error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn dead_pid() -> i32 {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id() as i32;
        child.wait().unwrap();
        pid
    }

    #[test]
    fn test_acquire_writes_pid_as_sole_content() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("speedd.pid");

        let lock = LockFile::acquire(&path).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents, std::process::id().to_string());
        assert_eq!(lock.pid(), std::process::id() as i32);
    }

    #[test]
    fn test_second_acquire_fails_and_preserves_first() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("speedd.pid");

        let _first = LockFile::acquire(&path).unwrap();
        let before = fs::read_to_string(&path).unwrap();

        let err = LockFile::acquire(&path).unwrap_err();
        assert!(err.is_already_running());
        assert!(matches!(err, LockError::AlreadyRunning { pid: Some(_), .. }));
        assert_eq!(fs::read_to_string(&path).unwrap(), before);
    }

    #[test]
    fn test_stale_lock_is_purged() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("speedd.pid");
        fs::write(&path, dead_pid().to_string()).unwrap();

        let lock = LockFile::acquire(&path).unwrap();
        assert_eq!(read_pid(&path), Some(lock.pid()));
    }

    #[test]
    fn test_garbage_lock_is_stale() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("speedd.pid");
        fs::write(&path, "not a pid").unwrap();

        assert_eq!(pid_status(&path).unwrap(), PidStatus::Stale);
        assert!(LockFile::acquire(&path).is_ok());
    }

    #[test]
    fn test_non_positive_pids_are_stale() {
        assert_eq!(probe_pid(0), PidStatus::Stale);
        assert_eq!(probe_pid(-1), PidStatus::Stale);
    }

    #[test]
    fn test_init_process_counts_as_running() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("speedd.pid");
        fs::write(&path, "1").unwrap();

        // Running when root, NotOwned otherwise; both block a second instance
        let err = LockFile::acquire(&path).unwrap_err();
        assert!(err.is_already_running());
        assert_eq!(fs::read_to_string(&path).unwrap(), "1");
    }

    #[test]
    fn test_release_removes_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("speedd.pid");

        let lock = LockFile::acquire(&path).unwrap();
        lock.release();
        assert!(!path.exists());
        assert_eq!(pid_status(&path).unwrap(), PidStatus::Absent);
    }

    #[test]
    fn test_drop_removes_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("speedd.pid");

        {
            let _lock = LockFile::acquire(&path).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_release_leaves_foreign_record() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("speedd.pid");

        let lock = LockFile::acquire(&path).unwrap();
        fs::write(&path, "1").unwrap();
        lock.release();

        assert_eq!(fs::read_to_string(&path).unwrap(), "1");
    }

    #[test]
    fn test_acquire_creates_parent_directory() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("run").join("speedd").join("speedd.pid");

        let _lock = LockFile::acquire(&path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_empty_record_in_progress_blocks_second_instance() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("speedd.pid");
        // Another instance has created the path but not yet written its PID
        fs::File::create(&path).unwrap();

        assert_eq!(pid_status(&path).unwrap(), PidStatus::Incomplete);
        let err = LockFile::acquire_as(&path, 424242).unwrap_err();
        assert!(matches!(err, LockError::AlreadyRunning { pid: None, .. }));
        assert!(path.exists());
    }

    #[test]
    fn test_old_empty_record_is_stale() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("speedd.pid");
        let file = fs::File::create(&path).unwrap();
        let old = std::time::SystemTime::now() - INCOMPLETE_GRACE * 2;
        file.set_modified(old).unwrap();

        assert_eq!(pid_status(&path).unwrap(), PidStatus::Stale);
        assert!(LockFile::acquire(&path).is_ok());
    }

    #[test]
    fn test_lost_race_against_live_record_is_already_running() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("speedd.pid");
        let mut calls = 0;

        let err = LockFile::acquire_with(&path, 424242, |p, _| {
            calls += 1;
            // The winner publishes between our check and our create
            fs::write(p, std::process::id().to_string())?;
            Err(io::Error::from(io::ErrorKind::AlreadyExists))
        })
        .unwrap_err();

        assert!(matches!(err, LockError::AlreadyRunning { pid: Some(p), .. } if p == std::process::id() as i32));
        assert_eq!(calls, 1);
        assert_eq!(fs::read_to_string(&path).unwrap(), std::process::id().to_string());
    }

    #[test]
    fn test_lost_race_against_stale_record_retries_once() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("speedd.pid");
        let stale = dead_pid();
        let mut calls = 0;

        let lock = LockFile::acquire_with(&path, 424242, |p, pid| {
            calls += 1;
            if calls == 1 {
                fs::write(p, stale.to_string())?;
                return Err(io::Error::from(io::ErrorKind::AlreadyExists));
            }
            create_exclusive(p, pid)
        })
        .unwrap();

        assert_eq!(calls, 2);
        assert_eq!(read_pid(&path), Some(lock.pid()));
    }

    #[test]
    fn test_race_retry_is_bounded() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("speedd.pid");
        let mut calls = 0;

        let err = LockFile::acquire_with(&path, 424242, |_, _| {
            calls += 1;
            Err(io::Error::from(io::ErrorKind::AlreadyExists))
        })
        .unwrap_err();

        assert!(matches!(err, LockError::AlreadyRunning { pid: None, .. }));
        assert_eq!(calls, 2);
    }

    #[test]
    fn test_publish_refuses_existing_record() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("speedd.pid");
        fs::write(&path, "1").unwrap();

        let err = create_exclusive(&path, 424242).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert_eq!(fs::read_to_string(&path).unwrap(), "1");
        // No temporary record left behind
        assert_eq!(fs::read_dir(temp_dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_published_record_mode() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("speedd.pid");

        let _lock = LockFile::acquire(&path).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        // The umask may narrow the mode but never widen it
        assert_eq!(mode & !LOCK_FILE_MODE, 0);
        assert_eq!(mode & 0o600, 0o600);
    }

    #[test]
    fn test_already_running_message_names_pid() {
        let err = LockError::AlreadyRunning {
            pid: Some(4242),
            path: PathBuf::from("/run/speedd.pid"),
        };
        let msg = err.to_string();
        assert!(msg.contains("4242"));
        assert!(msg.contains("/run/speedd.pid"));
    }
}
