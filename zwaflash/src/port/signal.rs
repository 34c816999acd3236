//! One-shot disconnect notification.

use crate::error::{Error, Result};
use log::debug;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Granularity at which waiters re-check the interrupt flag.
const INTERRUPT_POLL: Duration = Duration::from_millis(100);

/// A disconnect notification that fires at most once.
///
/// Clones share state: the link keeps one to fire, waiters keep others.
#[derive(Debug, Clone, Default)]
pub struct DisconnectSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl DisconnectSignal {
    /// Create an unfired signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the signal. Returns `true` only for the call that fired it.
    pub fn fire(&self) -> bool {
        let (lock, cvar) = &*self.inner;
        let mut fired = lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if *fired {
            return false;
        }
        *fired = true;
        cvar.notify_all();
        debug!("Disconnect signal fired");
        true
    }

    /// Whether the signal has fired.
    pub fn is_fired(&self) -> bool {
        *self
            .inner
            .0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait up to `timeout` for the signal.
    ///
    /// Returns `Ok(false)` when the bound elapses without a disconnect.
    pub fn wait(&self, timeout: Duration) -> Result<bool> {
        let (lock, cvar) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let mut fired = lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        while !*fired {
            if crate::is_interrupted_requested() {
                return Err(Error::Interrupted);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            let slice = (deadline - now).min(INTERRUPT_POLL);
            fired = cvar
                .wait_timeout(fired, slice)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }

        Ok(true)
    }
}
