//! Named OS threads with a bounded join
//!
//! Every receiver, dispatch, accept and reader thread in the transport is
//! a [`Worker`]. Stopping one never blocks forever: [`Worker::join_timeout`]
//! waits at most the configured shutdown timeout and then detaches the
//! thread, reporting [`Error::ShutdownTimeout`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::common::{Error, Result};

/// Lock a mutex, recovering the data if a panicking thread poisoned it
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Stop request shared between a listener thread and whoever stops it
///
/// The token travels inside the synthetic close message, so a wake-up left
/// over from an earlier stop never ends a later listener.
#[derive(Debug)]
pub(crate) struct StopSignal {
    requested: AtomicBool,
    token: u64,
}

impl StopSignal {
    pub(crate) fn new() -> Self {
        Self {
            requested: AtomicBool::new(false),
            token: NEXT_TOKEN.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub(crate) fn token(&self) -> u64 {
        self.token
    }

    pub(crate) fn request(&self) {
        self.requested.store(true, Ordering::Release);
    }

    pub(crate) fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    /// A wake-up carrying `token` ends this listener
    pub(crate) fn matches(&self, token: u64) -> bool {
        self.is_requested() && token == self.token
    }
}

/// A running OS thread plus the signal it drops when it exits
pub struct Worker {
    name: String,
    handle: JoinHandle<()>,
    exited: mpsc::Receiver<()>,
}

impl Worker {
    /// Spawn `body` on a new thread named `name`
    pub fn spawn<F>(name: impl Into<String>, body: F) -> Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let name = name.into();
        let (exit_tx, exited) = mpsc::channel::<()>();

        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                // Dropped on return or unwind; the joiner sees a disconnect
                let _exit = exit_tx;
                body();
            })
            .map_err(|e| Error::Internal(format!("Failed to spawn thread '{}': {}", name, e)))?;

        tracing::trace!(thread = %name, "Worker started");
        Ok(Self {
            name,
            handle,
            exited,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// True when called from the worker's own thread
    pub fn is_current(&self) -> bool {
        self.handle.thread().id() == thread::current().id()
    }

    /// Wait up to `timeout` for the thread to exit
    ///
    /// Joining from inside the worker itself is rejected rather than
    /// deadlocking. On timeout the thread is detached.
    pub fn join_timeout(self, timeout: Duration) -> Result<()> {
        if self.is_current() {
            return Err(Error::Reentrant(self.name));
        }

        match self.exited.recv_timeout(timeout) {
            Err(mpsc::RecvTimeoutError::Timeout) => {
                tracing::warn!(
                    thread = %self.name,
                    timeout_ms = timeout.as_millis() as u64,
                    "Worker did not stop in time, detaching"
                );
                Err(Error::ShutdownTimeout {
                    thread: self.name,
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
            // The body never sends, so any other outcome means it exited
            _ => {
                if self.handle.join().is_err() {
                    tracing::error!(thread = %self.name, "Worker panicked");
                }
                tracing::trace!(thread = %self.name, "Worker joined");
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.name)
            .field("finished", &self.is_finished())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};

    #[test]
    fn test_join_finished_worker() {
        let worker = Worker::spawn("test-quick", || {}).unwrap();
        assert_eq!(worker.name(), "test-quick");
        worker.join_timeout(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn test_join_times_out_on_stuck_worker() {
        let gate = Arc::new(Barrier::new(2));
        let inner = gate.clone();
        let worker = Worker::spawn("test-stuck", move || {
            inner.wait();
        })
        .unwrap();

        let err = worker.join_timeout(Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, Error::ShutdownTimeout { .. }));

        // Release the detached thread so it does not outlive the test binary
        gate.wait();
    }

    #[test]
    fn test_panicking_worker_still_joins() {
        let worker = Worker::spawn("test-panic", || panic!("boom")).unwrap();
        worker.join_timeout(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn test_stop_signal_tokens_are_distinct() {
        let first = StopSignal::new();
        let second = StopSignal::new();
        assert_ne!(first.token(), second.token());

        assert!(!first.matches(first.token()));
        first.request();
        assert!(first.matches(first.token()));
        assert!(!first.matches(second.token()));
    }

    #[test]
    fn test_join_from_inside_is_rejected() {
        let (tx, rx) = mpsc::channel::<Worker>();
        let (result_tx, result_rx) = mpsc::channel();
        let worker = Worker::spawn("test-self", move || {
            let me = rx.recv().unwrap();
            let outcome = me.join_timeout(Duration::from_millis(10));
            result_tx.send(matches!(outcome, Err(Error::Reentrant(_)))).unwrap();
        })
        .unwrap();
        tx.send(worker).unwrap();
        assert!(result_rx.recv_timeout(Duration::from_secs(5)).unwrap());
    }
}
