//! Per-request countdown ticks.
//!
//! Ticks are delivered as [`Message::Tick`] on the orchestrator's own queue,
//! so countdown handling is serialized with every other event.

use crate::domain::models::RequestId;
use crate::infrastructure::bluetooth::orchestrator::Message;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::trace;

/// Starts and stops the once-per-period tick for a request
pub trait TickSource: Send + 'static {
    fn start(&mut self, id: RequestId);
    fn stop(&mut self, id: RequestId);
}

/// One tokio task per running countdown. Holds only a weak sender, so a
/// running countdown never keeps the queue open.
pub struct TokioTicker {
    sender: mpsc::WeakUnboundedSender<Message>,
    period: Duration,
    tasks: HashMap<RequestId, JoinHandle<()>>,
}

impl TokioTicker {
    pub fn new(sender: mpsc::WeakUnboundedSender<Message>, period: Duration) -> Self {
        Self {
            sender,
            period,
            tasks: HashMap::new(),
        }
    }

    /// Number of countdown tasks still running
    pub fn active(&self) -> usize {
        self.tasks.values().filter(|t| !t.is_finished()).count()
    }
}

impl TickSource for TokioTicker {
    fn start(&mut self, id: RequestId) {
        let sender = self.sender.clone();
        let period = self.period;
        let task = tokio::spawn(async move {
            let mut interval = time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(sender) = sender.upgrade() else {
                    break;
                };
                if sender.send(Message::Tick(id)).is_err() {
                    break;
                }
            }
        });
        if let Some(previous) = self.tasks.insert(id, task) {
            previous.abort();
        }
    }

    fn stop(&mut self, id: RequestId) {
        if let Some(task) = self.tasks.remove(&id) {
            trace!("Stopping countdown for {}", id);
            task.abort();
        }
    }
}

impl Drop for TokioTicker {
    fn drop(&mut self) {
        for (_, task) in self.tasks.drain() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_ticks_until_stopped() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut ticker = TokioTicker::new(tx.downgrade(), Duration::from_secs(1));
        let id = RequestId::next();

        ticker.start(id);
        assert_eq!(ticker.active(), 1);

        for _ in 0..3 {
            match rx.recv().await {
                Some(Message::Tick(got)) => assert_eq!(got, id),
                _ => panic!("expected a tick"),
            }
        }

        ticker.stop(id);
        assert_eq!(ticker.active(), 0);
        time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_countdown_does_not_keep_queue_open() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut ticker = TokioTicker::new(tx.downgrade(), Duration::from_secs(1));
        ticker.start(RequestId::next());
        drop(tx);

        assert!(rx.recv().await.is_none());
        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(ticker.active(), 0);
    }
}
