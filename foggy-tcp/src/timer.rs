//! Per-connection single-shot timers.
//!
//! Each connection owns its own [`Timer`]s; there is no global timer wheel.
//! A timer runs its callback on a tokio task after the armed duration.
//!
//! Every `arm` bumps the timer's epoch and hands the callback a
//! [`TimerToken`] for that epoch.  `cancel` aborts the pending task and bumps
//! the epoch again, so a callback that was already past its sleep when it was
//! cancelled (for instance, blocked on the connection lock) sees a stale token
//! and must do nothing.  Stale firings are therefore harmless no-ops.

use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Identifies one arming of a [`Timer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerToken {
    epoch: u64,
}

/// A cancellable, re-armable single-shot timer.
#[derive(Debug)]
pub struct Timer {
    runtime: Handle,
    epoch: u64,
    pending: Option<JoinHandle<()>>,
    deadline: Option<Instant>,
}

impl Timer {
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            epoch: 0,
            pending: None,
            deadline: None,
        }
    }

    /// Schedule `on_fire` to run once after `after`.
    ///
    /// Any earlier arming is cancelled first.
    pub fn arm<F>(&mut self, after: Duration, on_fire: F) -> TimerToken
    where
        F: FnOnce(TimerToken) + Send + 'static,
    {
        self.cancel();
        let token = TimerToken { epoch: self.epoch };
        let deadline = Instant::now() + after;
        self.deadline = Some(deadline);
        self.pending = Some(self.runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            on_fire(token);
        }));
        token
    }

    /// Idempotent; safe whether the timer fired, is pending, or was never armed.
    pub fn cancel(&mut self) {
        if let Some(task) = self.pending.take() {
            task.abort();
        }
        self.deadline = None;
        self.epoch = self.epoch.wrapping_add(1);
    }

    /// `true` when `token` belongs to the latest, not-yet-cancelled arming.
    ///
    /// Consumes the arming: a second check with the same token fails.
    pub fn fire(&mut self, token: TimerToken) -> bool {
        if token.epoch != self.epoch || self.deadline.is_none() {
            return false;
        }
        self.pending = None;
        self.deadline = None;
        true
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if let Some(task) = self.pending.take() {
            task.abort();
        }
    }
}
