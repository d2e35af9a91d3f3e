//! Retry scheduling.
//!
//! [`RetryScheduler`] is the seam through which retry groups leave a dispatch
//! pass. [`ChannelScheduler`] and [`RetryWorker`] provide an in-process
//! implementation: groups travel over an mpsc channel and are re-dispatched
//! on the tokio runtime once their delay elapses. Pending retries live only
//! in memory and are lost when the worker stops.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::attempt::DeliveryAttempt;
use crate::errors::{DispatchError, DispatchResult};
use crate::mailer::Mailer;

/// Accepts groups of attempts for a later dispatch pass.
#[async_trait]
pub trait RetryScheduler: Send + Sync + fmt::Debug {
    /// Arranges for `group` to be dispatched again after `delay`.
    async fn enqueue(&self, group: Vec<DeliveryAttempt>, delay: Duration) -> DispatchResult<()>;
}

/// A group waiting for its retry.
#[derive(Debug)]
pub struct ScheduledRetry {
    /// Delay before dispatch.
    pub delay: Duration,
    /// Attempts in the group.
    pub attempts: Vec<DeliveryAttempt>,
}

/// Scheduler backed by an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelScheduler {
    sender: mpsc::UnboundedSender<ScheduledRetry>,
}

/// Receiving side of a [`ChannelScheduler`].
#[derive(Debug)]
pub struct RetryQueue {
    receiver: mpsc::UnboundedReceiver<ScheduledRetry>,
}

impl ChannelScheduler {
    /// Creates a scheduler and the queue it feeds.
    pub fn channel() -> (Self, RetryQueue) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, RetryQueue { receiver })
    }
}

#[async_trait]
impl RetryScheduler for ChannelScheduler {
    async fn enqueue(&self, group: Vec<DeliveryAttempt>, delay: Duration) -> DispatchResult<()> {
        self.sender
            .send(ScheduledRetry {
                delay,
                attempts: group,
            })
            .map_err(|_| DispatchError::scheduling("Retry queue is closed"))
    }
}

impl RetryQueue {
    /// Waits for the next scheduled group.
    ///
    /// Returns `None` once every scheduler handle has been dropped.
    pub async fn next(&mut self) -> Option<ScheduledRetry> {
        self.receiver.recv().await
    }
}

/// Drains a [`RetryQueue`], re-dispatching each group after its delay.
#[derive(Debug)]
pub struct RetryWorker {
    queue: RetryQueue,
    mailer: Mailer,
}

impl RetryWorker {
    /// Creates a worker that re-dispatches through `mailer`.
    pub fn new(queue: RetryQueue, mailer: Mailer) -> Self {
        Self { queue, mailer }
    }

    /// Runs with no shutdown signal.
    ///
    /// The worker's own [`Mailer`] holds the scheduler that feeds the queue,
    /// so the queue never closes and this future never completes on its
    /// own. Use [`run_until`](Self::run_until) to stop the worker.
    pub async fn run(self) {
        self.run_until(std::future::pending()).await
    }

    /// Runs until the queue closes or `shutdown` completes.
    ///
    /// Retries still sleeping when the worker stops are dropped.
    pub async fn run_until<F>(mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut tasks = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!(pending = tasks.len(), "Retry worker shutting down");
                    break;
                }
                next = self.queue.next() => match next {
                    Some(retry) => {
                        debug!(
                            delay_ms = retry.delay.as_millis() as u64,
                            count = retry.attempts.len(),
                            "Retry group queued"
                        );
                        let mailer = self.mailer.clone();
                        tasks.spawn(async move {
                            tokio::time::sleep(retry.delay).await;
                            mailer.dispatch(retry.attempts).await;
                        });
                    }
                    None => {
                        debug!("Retry queue closed");
                        break;
                    }
                },
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }

        tasks.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::fixtures;

    #[tokio::test]
    async fn test_channel_scheduler_delivers_groups() {
        let (scheduler, mut queue) = ChannelScheduler::channel();
        let group = vec![
            fixtures::attempt(&["a@example.com"], 3),
            fixtures::attempt(&["b@example.com"], 3),
        ];

        scheduler.enqueue(group, Duration::from_secs(120)).await.unwrap();

        let retry = queue.next().await.unwrap();
        assert_eq!(retry.delay, Duration::from_secs(120));
        assert_eq!(retry.attempts.len(), 2);
    }

    #[tokio::test]
    async fn test_enqueue_after_queue_dropped() {
        let (scheduler, queue) = ChannelScheduler::channel();
        drop(queue);

        let err = scheduler
            .enqueue(vec![fixtures::attempt(&["a@example.com"], 3)], Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::errors::DispatchErrorKind::ScheduleFailed);
    }

    #[tokio::test]
    async fn test_queue_closes_with_last_scheduler() {
        let (scheduler, mut queue) = ChannelScheduler::channel();
        drop(scheduler);
        assert!(queue.next().await.is_none());
    }

    fn worker() -> RetryWorker {
        let (scheduler, queue) = ChannelScheduler::channel();
        let mailer = Mailer::builder()
            .connector(std::sync::Arc::new(crate::mocks::MockConnector::new()))
            .scheduler(std::sync::Arc::new(scheduler))
            .build()
            .unwrap();
        RetryWorker::new(queue, mailer)
    }

    #[tokio::test]
    async fn test_run_keeps_going_while_mailer_holds_scheduler() {
        let result = tokio::time::timeout(Duration::from_millis(50), worker().run()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_run_until_stops_on_shutdown() {
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            worker().run_until(tokio::time::sleep(Duration::from_millis(10))),
        )
        .await;
        assert!(result.is_ok());
    }
}
