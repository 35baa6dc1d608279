//! Timers that report back to the pool driver.
//!
//! A timer never touches state itself: when it fires it posts a [`Signal`]
//! carrying its token to the driver, and the driver acts only if the handle
//! it stored still has that token. Dropping a [`TimerHandle`] aborts the
//! timer task.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::pool::Signal;

#[derive(Debug, Clone)]
pub(crate) struct Scheduler {
    signals: mpsc::UnboundedSender<Signal>,
    next_token: Arc<AtomicU64>,
}

impl Scheduler {
    pub(crate) fn new(signals: mpsc::UnboundedSender<Signal>) -> Self {
        Self {
            signals,
            next_token: Arc::new(AtomicU64::new(1)),
        }
    }

    pub(crate) fn next_token(&self) -> u64 {
        self.next_token.fetch_add(1, Ordering::Relaxed)
    }

    /// Sender for tasks that report outside of a timer (connect attempts, frame pumps).
    pub(crate) fn signals(&self) -> mpsc::UnboundedSender<Signal> {
        self.signals.clone()
    }

    /// Post a signal to be handled after the current driver step.
    pub(crate) fn post(&self, signal: Signal) {
        let _ = self.signals.send(signal);
    }

    /// One-shot timer.
    pub(crate) fn after(&self, delay: Duration, make: impl FnOnce(u64) -> Signal) -> TimerHandle {
        let token = self.next_token();
        let signal = make(token);
        let signals = self.signals.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = signals.send(signal);
        });
        TimerHandle { token, task }
    }

    /// Periodic timer. The first tick happens one full period after arming.
    pub(crate) fn every(
        &self,
        period: Duration,
        make: impl Fn(u64) -> Signal + Send + 'static,
    ) -> TimerHandle {
        let token = self.next_token();
        let signals = self.signals.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                if signals.send(make(token)).is_err() {
                    break;
                }
            }
        });
        TimerHandle { token, task }
    }
}

/// Owned handle to an armed timer.
#[derive(Debug)]
pub(crate) struct TimerHandle {
    token: u64,
    task: JoinHandle<()>,
}

impl TimerHandle {
    pub(crate) fn matches(&self, token: u64) -> bool {
        self.token == token
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
