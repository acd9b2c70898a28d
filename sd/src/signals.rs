//! Shutdown signal gateway
//!
//! OS signals only flip a flag. The scheduler looks at the flag between
//! iterations, so an in-flight probe always runs to completion or timeout.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Debug, Default)]
struct Inner {
    requested: AtomicBool,
    notify: Notify,
}

/// Cooperative shutdown request shared between the gateway and the scheduler
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag {
    inner: Arc<Inner>,
}

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the daemon to stop at the next safe point
    pub fn request(&self) {
        self.inner.requested.store(true, Ordering::SeqCst);
        // notify_one stores a permit, so a later wait() cannot miss it
        self.inner.notify.notify_one();
    }

    pub fn is_requested(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    /// Resolve once shutdown has been requested
    pub async fn wait(&self) {
        if self.is_requested() {
            return;
        }
        self.inner.notify.notified().await;
    }
}

/// Signals treated as "please stop gracefully"
///
/// SIGKILL is untouched and remains the forceful option.
pub fn graceful_signals() -> [SignalKind; 3] {
    [SignalKind::terminate(), SignalKind::quit(), SignalKind::interrupt()]
}

/// Route the graceful signals to `flag`
pub fn install(flag: &ShutdownFlag) -> io::Result<Vec<JoinHandle<()>>> {
    install_for(flag, &graceful_signals())
}

/// Route the given signals to `flag`
///
/// Handlers are registered before this returns. Must be called inside a
/// tokio runtime.
pub fn install_for(flag: &ShutdownFlag, kinds: &[SignalKind]) -> io::Result<Vec<JoinHandle<()>>> {
    let mut handles = Vec::with_capacity(kinds.len());
    for kind in kinds {
        let mut stream = signal(*kind)?;
        let flag = flag.clone();
        debug!(signal = kind.as_raw_value(), "install_for: registered handler");
        handles.push(tokio::spawn(async move {
            while stream.recv().await.is_some() {
                flag.request();
            }
        }));
    }
    Ok(handles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::time::Duration;

    #[test]
    fn test_flag_starts_clear() {
        let flag = ShutdownFlag::new();
        assert!(!flag.is_requested());
    }

    #[test]
    fn test_request_is_visible_through_clones() {
        let flag = ShutdownFlag::new();
        let other = flag.clone();
        other.request();
        assert!(flag.is_requested());
    }

    #[tokio::test]
    async fn test_wait_returns_after_earlier_request() {
        let flag = ShutdownFlag::new();
        flag.request();
        tokio::time::timeout(Duration::from_secs(1), flag.wait())
            .await
            .expect("wait should resolve immediately");
    }

    #[tokio::test]
    async fn test_wait_wakes_on_request() {
        let flag = ShutdownFlag::new();
        let waiter = flag.clone();
        let handle = tokio::spawn(async move { waiter.wait().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        flag.request();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[tokio::test]
    #[serial]
    async fn test_signal_sets_flag() {
        let flag = ShutdownFlag::new();
        let handles = install_for(&flag, &[SignalKind::user_defined1()]).unwrap();

        nix::sys::signal::raise(nix::sys::signal::Signal::SIGUSR1).unwrap();

        tokio::time::timeout(Duration::from_secs(2), flag.wait())
            .await
            .expect("signal should set the flag");
        assert!(flag.is_requested());

        for handle in handles {
            handle.abort();
        }
    }
}
