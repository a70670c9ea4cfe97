//! Idle timer for a single session.
//!
//! The timer task sleeps until the current deadline. Renewing moves the
//! deadline forward without restarting the task. When a deadline passes the
//! expiry callback runs on its own task, and the timer keeps watching in
//! case the session is renewed before the callback gets to it.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub struct IdleTimer {
    deadline: watch::Sender<Instant>,
    timeout: Duration,
    task: JoinHandle<()>,
}

impl IdleTimer {
    /// Arm a timer that calls `on_expire` once `timeout` passes without a
    /// renewal.
    pub fn start<F, Fut>(timeout: Duration, on_expire: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (deadline, mut rx) = watch::channel(Instant::now() + timeout);

        let task = tokio::spawn(async move {
            loop {
                let at = *rx.borrow_and_update();
                tokio::select! {
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep_until(at) => {
                        tokio::spawn(on_expire());
                        // Wait for a renewal before sleeping again.
                        if rx.changed().await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Self {
            deadline,
            timeout,
            task,
        }
    }

    /// Push the deadline to `now + timeout`.
    pub fn renew(&self) {
        self.deadline.send_replace(Instant::now() + self.timeout);
    }

    /// Change the timeout and renew.
    pub fn rearm(&mut self, timeout: Duration) {
        self.timeout = timeout;
        self.renew();
    }

    /// When the session expires unless renewed.
    pub fn deadline(&self) -> Instant {
        *self.deadline.borrow()
    }

    /// Length of the inactivity window.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether the deadline has passed.
    pub fn is_expired(&self) -> bool {
        self.deadline() <= Instant::now()
    }

    /// Stop watching. The expiry callback will not run.
    pub fn cancel(&self) {
        self.task.abort();
    }
}

impl Drop for IdleTimer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl std::fmt::Debug for IdleTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdleTimer")
            .field("timeout", &self.timeout)
            .field("deadline", &self.deadline())
            .finish()
    }
}
