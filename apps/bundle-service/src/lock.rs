//! Single-holder session lock with bounded waits.
//!
//! Sends and closes contend for the same lock but react differently when the
//! wait runs out: a send gives up, a close carries on without the lock. A
//! caller-supplied cancellation token interrupts either wait, and an
//! interruption is always reported as such, never as a timeout.

use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

use crate::error::{EndpointError, EndpointResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquirePolicy {
    /// Fail with `AcquireTimeout` once the wait elapses.
    AbortOnTimeout(Duration),
    /// Continue without holding the lock once the wait elapses.
    ProceedOnTimeout(Duration),
}

impl AcquirePolicy {
    pub fn wait(self) -> Duration {
        match self {
            AcquirePolicy::AbortOnTimeout(wait) | AcquirePolicy::ProceedOnTimeout(wait) => wait,
        }
    }
}

/// Outcome of a successful acquisition. The lock is released on drop.
#[derive(Debug)]
pub enum Acquired<'a> {
    Held(MutexGuard<'a, ()>),
    /// The wait elapsed under `ProceedOnTimeout`; nothing is held.
    Forced,
}

impl Acquired<'_> {
    pub fn is_forced(&self) -> bool {
        matches!(self, Acquired::Forced)
    }
}

#[derive(Debug, Default)]
pub struct SessionLock {
    inner: Mutex<()>,
}

impl SessionLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(
        &self,
        policy: AcquirePolicy,
        interrupt: &CancellationToken,
    ) -> EndpointResult<Acquired<'_>> {
        if interrupt.is_cancelled() {
            return Err(EndpointError::Interrupted);
        }
        let wait = policy.wait();
        tokio::select! {
            biased;
            _ = interrupt.cancelled() => Err(EndpointError::Interrupted),
            outcome = tokio::time::timeout(wait, self.inner.lock()) => match outcome {
                Ok(guard) => Ok(Acquired::Held(guard)),
                Err(_) => match policy {
                    AcquirePolicy::AbortOnTimeout(_) => {
                        Err(EndpointError::AcquireTimeout { waited: wait })
                    }
                    AcquirePolicy::ProceedOnTimeout(_) => Ok(Acquired::Forced),
                },
            },
        }
    }

    pub fn is_held(&self) -> bool {
        self.inner.try_lock().is_err()
    }
}
