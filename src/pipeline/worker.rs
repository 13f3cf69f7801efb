//! Named worker threads with cooperative stop

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use crate::error::{HalError, Result};
use crate::utils::{lock, wait_timeout};

/// Shared stop flag checked by a worker loop between waits.
#[derive(Debug, Clone, Default)]
pub struct StopToken(Arc<AtomicBool>);

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Raised when the thread body returns or unwinds.
#[derive(Default)]
struct ExitSignal {
    exited: Mutex<bool>,
    cv: Condvar,
}

struct ExitGuard(Arc<ExitSignal>);

impl Drop for ExitGuard {
    fn drop(&mut self) {
        *lock(&self.0.exited) = true;
        self.0.cv.notify_all();
    }
}

/// OS thread bound to one job. Dropping the worker stops and joins it.
pub struct Worker {
    name: String,
    stop: StopToken,
    exit: Arc<ExitSignal>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn spawn<F>(name: impl Into<String>, body: F) -> Result<Self>
    where
        F: FnOnce(StopToken) + Send + 'static,
    {
        let name = name.into();
        let stop = StopToken::new();
        let token = stop.clone();
        let exit = Arc::new(ExitSignal::default());
        let guard = ExitGuard(exit.clone());
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let _guard = guard;
                body(token)
            })
            .map_err(|e| HalError::fatal(format!("failed to spawn {name}: {e}")))?;
        debug!(worker = %name, "worker started");
        Ok(Self {
            name,
            stop,
            exit,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn token(&self) -> StopToken {
        self.stop.clone()
    }

    /// Ask the loop to exit. Callers blocked on a queue must also be woken.
    pub fn request_stop(&self) {
        self.stop.stop();
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Wait for the thread to exit. Later calls are no-ops.
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!(worker = %self.name, "worker panicked");
            } else {
                debug!(worker = %self.name, "worker joined");
            }
        }
    }

    /// Join, warning when the thread is still busy after `timeout`.
    ///
    /// The join always completes so a late stage cannot touch state that a
    /// later session reuses. Returns whether the thread exited in time.
    pub fn join_within(&mut self, timeout: Duration) -> bool {
        if self.handle.is_none() {
            return true;
        }
        let deadline = Instant::now() + timeout;
        let mut exited = lock(&self.exit.exited);
        while !*exited {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            exited = wait_timeout(&self.exit.cv, exited, deadline - now).0;
        }
        let in_time = *exited;
        drop(exited);
        if !in_time {
            warn!(worker = %self.name, ?timeout, "worker still busy after teardown timeout");
            metrics::counter!("camera3_slow_teardowns_total").increment(1);
        }
        self.join();
        in_time
    }

    pub fn stop_and_join(&mut self) {
        self.request_stop();
        self.join();
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}
