//! One-shot session timers
//!
//! A timer posts a single event to the controller queue when it expires.
//! Dropping the timer cancels it.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

use crate::events::SessionEvent;

#[derive(Debug)]
pub struct Timer {
    deadline: Instant,
    task: JoinHandle<()>,
}

impl Timer {
    pub fn start(
        duration: Duration,
        event_tx: mpsc::UnboundedSender<SessionEvent>,
        event: SessionEvent,
    ) -> Self {
        let deadline = Instant::now() + duration;
        let task = tokio::spawn(async move {
            sleep_until(deadline).await;
            let _ = event_tx.send(event);
        });
        Self { deadline, task }
    }

    #[cfg(test)]
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Stop the timer before it fires
    pub fn cancel(self) {
        let remaining = self.deadline.saturating_duration_since(Instant::now());
        debug!(remaining_ms = remaining.as_millis() as u64, "timer cancelled");
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.task.abort();
    }
}
