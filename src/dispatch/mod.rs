//! Batch dispatch over a single relay connection.
//!
//! One pass validates the batch, opens one connection, submits each message
//! in input order and partitions the attempts into four disjoint sets:
//! succeeded, retry groups (keyed by backoff delay), exhausted, and rejected
//! (malformed, never retried).

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::attempt::DeliveryAttempt;
use crate::client::{RelayConnection, RelayConnector};
use crate::errors::{DispatchError, DispatchResult, ErrorCategory};
use crate::observability::DispatchMetrics;
use crate::types::DeliveryReceipt;

/// Classified result of one send.
#[derive(Debug)]
pub enum SendOutcome {
    /// The relay accepted the message.
    Delivered(DeliveryReceipt),
    /// The send failed; the attempt goes through the retry ceiling.
    Retriable(DispatchError),
    /// The message itself is malformed and is never sent again.
    Fatal(DispatchError),
}

impl SendOutcome {
    /// Classifies a delivery result.
    ///
    /// Only malformed-message errors are fatal. Every other failure counts
    /// against the attempt's retry limit.
    pub fn classify(result: DispatchResult<DeliveryReceipt>) -> Self {
        match result {
            Ok(receipt) => SendOutcome::Delivered(receipt),
            Err(e) if e.category() == ErrorCategory::MalformedMessage => SendOutcome::Fatal(e),
            Err(e) => SendOutcome::Retriable(e),
        }
    }
}

/// Attempts sharing one backoff delay.
#[derive(Debug, Clone)]
pub struct RetryGroup {
    /// Delay before the group is dispatched again.
    pub delay: Duration,
    /// Attempts in input order.
    pub attempts: Vec<DeliveryAttempt>,
}

/// A malformed attempt. Its retry state is left untouched.
#[derive(Debug)]
pub struct RejectedAttempt {
    /// The untouched attempt.
    pub attempt: DeliveryAttempt,
    /// Why it was refused.
    pub error: DispatchError,
}

/// Partition of one dispatch pass.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// Delivered attempts.
    pub succeeded: Vec<DeliveryAttempt>,
    /// Retryable attempts grouped by delay, ascending.
    pub retry_groups: Vec<RetryGroup>,
    /// Attempts past their retry limit.
    pub exhausted: Vec<DeliveryAttempt>,
    /// Malformed attempts.
    pub rejected: Vec<RejectedAttempt>,
    /// Why the connection could not be opened, if it could not.
    pub connection_error: Option<DispatchError>,
}

impl BatchOutcome {
    /// Number of attempts across all retry groups.
    pub fn retry_count(&self) -> usize {
        self.retry_groups.iter().map(|g| g.attempts.len()).sum()
    }
}

/// Drives one batch through one relay connection.
#[derive(Clone)]
pub struct BatchDispatcher {
    connector: Arc<dyn RelayConnector>,
    metrics: Arc<DispatchMetrics>,
}

impl fmt::Debug for BatchDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchDispatcher")
            .field("connector", &self.connector)
            .finish()
    }
}

impl BatchDispatcher {
    /// Creates a dispatcher.
    pub fn new(connector: Arc<dyn RelayConnector>, metrics: Arc<DispatchMetrics>) -> Self {
        Self { connector, metrics }
    }

    /// Runs one pass over `batch`.
    ///
    /// Never fails: every per-message and connection problem is captured on
    /// the attempts and reflected in the returned partition. Each message is
    /// sent at most once. The connection, if opened, is closed before
    /// returning.
    pub async fn run(&self, batch: Vec<DeliveryAttempt>) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();

        let mut pending = Vec::with_capacity(batch.len());
        for attempt in batch {
            match attempt.validate() {
                Ok(()) => pending.push(attempt),
                Err(error) => {
                    warn!(attempt_id = %attempt.id(), error = %error, "Rejecting malformed message");
                    outcome.rejected.push(RejectedAttempt { attempt, error });
                }
            }
        }
        self.metrics.record_rejected(outcome.rejected.len());

        if pending.is_empty() {
            return outcome;
        }

        let mut failed = Vec::new();

        match self.connector.open().await {
            Ok(mut connection) => {
                self.deliver_all(connection.as_mut(), pending, &mut outcome, &mut failed)
                    .await;
                connection.close().await;
            }
            Err(error) => {
                warn!(
                    error = %error,
                    batch = pending.len(),
                    "Could not open relay connection"
                );
                for mut attempt in pending {
                    attempt.record_failure(&error);
                    self.metrics.record_send_failure();
                    failed.push(attempt);
                }
                outcome.connection_error = Some(error);
            }
        }

        self.partition(failed, &mut outcome);
        outcome
    }

    async fn deliver_all(
        &self,
        connection: &mut dyn RelayConnection,
        pending: Vec<DeliveryAttempt>,
        outcome: &mut BatchOutcome,
        failed: &mut Vec<DeliveryAttempt>,
    ) {
        for mut attempt in pending {
            match SendOutcome::classify(connection.deliver(attempt.message()).await) {
                SendOutcome::Delivered(receipt) => {
                    debug!(
                        attempt_id = %attempt.id(),
                        server_id = receipt.server_id.as_deref().unwrap_or(""),
                        "Message delivered"
                    );
                    attempt.record_success();
                    self.metrics.record_delivered();
                    outcome.succeeded.push(attempt);
                }
                SendOutcome::Retriable(error) => {
                    warn!(attempt_id = %attempt.id(), error = %error, "Delivery failed");
                    attempt.record_failure(&error);
                    self.metrics.record_send_failure();
                    failed.push(attempt);
                }
                SendOutcome::Fatal(error) => {
                    warn!(attempt_id = %attempt.id(), error = %error, "Relay refused malformed message");
                    self.metrics.record_rejected(1);
                    outcome.rejected.push(RejectedAttempt { attempt, error });
                }
            }
        }
    }

    /// Splits failed attempts into exhausted and delay-keyed retry groups.
    fn partition(&self, failed: Vec<DeliveryAttempt>, outcome: &mut BatchOutcome) {
        let mut groups: BTreeMap<Duration, Vec<DeliveryAttempt>> = BTreeMap::new();

        for attempt in failed {
            if !attempt.is_retryable() {
                outcome.exhausted.push(attempt);
                continue;
            }
            let delay = attempt
                .next_delay()
                .unwrap_or_else(|| attempt.policy().backoff_step());
            groups.entry(delay).or_default().push(attempt);
        }

        outcome.retry_groups = groups
            .into_iter()
            .map(|(delay, attempts)| RetryGroup { delay, attempts })
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::DispatchErrorKind;
    use crate::mocks::{fixtures, MockConnector};

    fn dispatcher(connector: &MockConnector) -> BatchDispatcher {
        BatchDispatcher::new(Arc::new(connector.clone()), Arc::new(DispatchMetrics::new()))
    }

    #[tokio::test]
    async fn test_all_delivered() {
        let connector = MockConnector::new();
        let batch = vec![
            fixtures::attempt(&["a@example.com"], 5),
            fixtures::attempt(&["b@example.com"], 5),
        ];

        let outcome = dispatcher(&connector).run(batch).await;

        assert_eq!(outcome.succeeded.len(), 2);
        assert!(outcome.succeeded.iter().all(|a| a.is_delivered()));
        assert!(outcome.retry_groups.is_empty());
        assert!(outcome.exhausted.is_empty());
        assert_eq!(connector.open_count(), 1);
        assert_eq!(connector.close_count(), 1);
        assert_eq!(connector.deliver_calls(), 2);
    }

    #[tokio::test]
    async fn test_malformed_rejected_before_io() {
        let connector = MockConnector::new();
        let batch = vec![fixtures::attempt(&[], 5)];

        let outcome = dispatcher(&connector).run(batch).await;

        assert_eq!(outcome.rejected.len(), 1);
        assert_eq!(outcome.rejected[0].error.kind(), DispatchErrorKind::NoRecipients);
        assert_eq!(outcome.rejected[0].attempt.attempt_count(), 0);
        assert_eq!(connector.open_count(), 0);
        assert_eq!(connector.deliver_calls(), 0);
    }

    #[tokio::test]
    async fn test_malformed_does_not_block_rest_of_batch() {
        let connector = MockConnector::new();
        let batch = vec![
            fixtures::attempt(&[], 5),
            fixtures::attempt(&["a@example.com"], 5),
        ];

        let outcome = dispatcher(&connector).run(batch).await;

        assert_eq!(outcome.rejected.len(), 1);
        assert_eq!(outcome.succeeded.len(), 1);
        assert_eq!(connector.deliver_calls(), 1);
    }

    #[tokio::test]
    async fn test_open_failure_blames_whole_batch() {
        let connector = MockConnector::new().fail_open(DispatchErrorKind::ConnectionRefused);
        let batch = vec![
            fixtures::attempt(&["a@example.com"], 5),
            fixtures::attempt(&["b@example.com"], 5),
            fixtures::attempt(&["c@example.com"], 5),
        ];

        let outcome = dispatcher(&connector).run(batch).await;

        assert_eq!(connector.deliver_calls(), 0);
        assert_eq!(connector.close_count(), 0);
        assert_eq!(outcome.retry_groups.len(), 1);
        assert_eq!(outcome.retry_groups[0].delay, Duration::from_secs(30));
        assert_eq!(outcome.retry_count(), 3);
        assert!(outcome
            .retry_groups[0]
            .attempts
            .iter()
            .all(|a| a.attempt_count() == 1 && a.errors().len() == 1));
        assert_eq!(
            outcome.connection_error.as_ref().map(|e| e.kind()),
            Some(DispatchErrorKind::ConnectionRefused)
        );
    }

    #[tokio::test]
    async fn test_open_failure_exhausts_attempts_at_limit() {
        let connector = MockConnector::new().fail_open(DispatchErrorKind::ConnectTimeout);
        let mut tired = fixtures::attempt(&["a@example.com"], 1);
        tired.record_failure(&DispatchError::connection("earlier"));
        let fresh = fixtures::attempt(&["b@example.com"], 1);

        let outcome = dispatcher(&connector).run(vec![tired, fresh]).await;

        assert_eq!(outcome.exhausted.len(), 1);
        assert_eq!(outcome.exhausted[0].attempt_count(), 2);
        assert_eq!(outcome.retry_count(), 1);
    }

    #[tokio::test]
    async fn test_success_and_exhaustion_in_one_pass() {
        let connector = MockConnector::new()
            .fail_delivery_to("bad@example.com", DispatchErrorKind::DataRejected);
        let batch = vec![
            fixtures::attempt(&["good@example.com"], 0),
            fixtures::attempt(&["bad@example.com"], 0),
        ];

        let outcome = dispatcher(&connector).run(batch).await;

        assert_eq!(outcome.succeeded.len(), 1);
        assert_eq!(outcome.exhausted.len(), 1);
        assert!(outcome.retry_groups.is_empty());
    }

    #[tokio::test]
    async fn test_groups_ordered_by_delay_and_input() {
        let connector = MockConnector::new()
            .fail_delivery_to("fail@example.com", DispatchErrorKind::ReadTimeout);

        let mut second_try = fixtures::attempt(&["fail@example.com"], 5);
        second_try.record_failure(&DispatchError::connection("earlier"));
        let first_a = fixtures::attempt(&["fail@example.com"], 5);
        let first_b = fixtures::attempt(&["fail@example.com"], 5);
        let ids = (second_try.id(), first_a.id(), first_b.id());

        let outcome = dispatcher(&connector)
            .run(vec![second_try, first_a, first_b])
            .await;

        assert_eq!(outcome.retry_groups.len(), 2);
        assert_eq!(outcome.retry_groups[0].delay, Duration::from_secs(30));
        assert_eq!(outcome.retry_groups[1].delay, Duration::from_secs(120));

        let first: Vec<_> = outcome.retry_groups[0].attempts.iter().map(|a| a.id()).collect();
        assert_eq!(first, vec![ids.1, ids.2]);
        assert_eq!(outcome.retry_groups[1].attempts[0].id(), ids.0);
    }

    #[tokio::test]
    async fn test_open_configuration_error_is_retried() {
        let connector = MockConnector::new().fail_open(DispatchErrorKind::ConfigurationInvalid);
        let outcome = dispatcher(&connector)
            .run(vec![fixtures::attempt(&["a@example.com"], 5)])
            .await;

        assert!(outcome.exhausted.is_empty());
        assert_eq!(outcome.retry_groups.len(), 1);
        assert_eq!(outcome.retry_groups[0].delay, Duration::from_secs(30));
        assert_eq!(outcome.retry_groups[0].attempts[0].attempt_count(), 1);
    }

    #[tokio::test]
    async fn test_open_configuration_error_exhausts_at_limit() {
        let connector = MockConnector::new().fail_open(DispatchErrorKind::ConfigurationInvalid);
        let outcome = dispatcher(&connector)
            .run(vec![fixtures::attempt(&["a@example.com"], 0)])
            .await;

        assert_eq!(outcome.exhausted.len(), 1);
        assert!(outcome.retry_groups.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_delivery_rejected_without_retry_state() {
        let connector = MockConnector::new()
            .fail_delivery_to("bad@example.com", DispatchErrorKind::InvalidAddress);
        let outcome = dispatcher(&connector)
            .run(vec![
                fixtures::attempt(&["bad@example.com"], 5),
                fixtures::attempt(&["good@example.com"], 5),
            ])
            .await;

        assert_eq!(outcome.rejected.len(), 1);
        assert_eq!(outcome.rejected[0].error.kind(), DispatchErrorKind::InvalidAddress);
        assert_eq!(outcome.rejected[0].attempt.attempt_count(), 0);
        assert!(outcome.rejected[0].attempt.errors().is_empty());
        assert_eq!(outcome.succeeded.len(), 1);
        assert!(outcome.exhausted.is_empty());
        assert!(outcome.retry_groups.is_empty());
    }

    #[tokio::test]
    async fn test_non_malformed_delivery_error_is_retried() {
        let connector = MockConnector::new()
            .fail_delivery_to("a@example.com", DispatchErrorKind::ConfigurationInvalid);
        let outcome = dispatcher(&connector)
            .run(vec![fixtures::attempt(&["a@example.com"], 5)])
            .await;

        assert!(outcome.exhausted.is_empty());
        assert_eq!(outcome.retry_count(), 1);
        assert_eq!(outcome.retry_groups[0].attempts[0].attempt_count(), 1);
    }

    #[test]
    fn test_classify() {
        assert!(matches!(
            SendOutcome::classify(Ok(DeliveryReceipt::default())),
            SendOutcome::Delivered(_)
        ));
        assert!(matches!(
            SendOutcome::classify(Err(DispatchError::connection("x"))),
            SendOutcome::Retriable(_)
        ));
        assert!(matches!(
            SendOutcome::classify(Err(DispatchError::configuration("x"))),
            SendOutcome::Retriable(_)
        ));
        assert!(matches!(
            SendOutcome::classify(Err(DispatchError::new(DispatchErrorKind::NoRecipients, "x"))),
            SendOutcome::Fatal(_)
        ));
    }
}
