use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};

/// How long a caller is prepared to block for a resource that is not available right away.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum WaitPolicy {
    /// fail fast
    NoWait,
    Until(Instant),
    /// until the resource becomes available or the bridge dies
    Indefinitely,
}
impl WaitPolicy {
    pub fn timeout(timeout: Duration) -> WaitPolicy {
        WaitPolicy::Until(Instant::now() + timeout)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum WaitError {
    TimedOut,
    NotAlive,
}

/// Mutable state guarded by a lock, plus a broadcast wake-up for tasks waiting on a change to
///  the state. Waiters register for the wake-up before they inspect the state, so a change
///  that happens between the check and the wait is never missed.
pub struct Monitor<T> {
    state: Mutex<T>,
    changed: Notify,
}

impl<T> Monitor<T> {
    pub fn new(state: T) -> Monitor<T> {
        Monitor {
            state: Mutex::new(state),
            changed: Notify::new(),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.state.lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn notify_all(&self) {
        self.changed.notify_waiters();
    }

    /// modifies the state and wakes all waiters afterwards
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let result = f(&mut self.lock());
        self.notify_all();
        result
    }

    /// Calls `poll` on the state until it returns a value, waiting for a change between
    ///  attempts. Liveness is re-checked on every wake-up, before the state is looked at.
    pub async fn wait_for<R>(&self, wait: WaitPolicy, is_alive: impl Fn() -> bool, mut poll: impl FnMut(&mut T) -> Option<R>) -> Result<R, WaitError> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !is_alive() {
                return Err(WaitError::NotAlive);
            }

            let ready = {
                let mut state = self.lock();
                poll(&mut state)
            };
            if let Some(result) = ready {
                return Ok(result);
            }

            match wait {
                WaitPolicy::NoWait => return Err(WaitError::TimedOut),
                WaitPolicy::Indefinitely => notified.await,
                WaitPolicy::Until(deadline) => {
                    if timeout_at(deadline, notified).await.is_err() {
                        return Err(WaitError::TimedOut);
                    }
                }
            }
        }
    }
}
