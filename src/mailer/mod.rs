//! Mail dispatch entry point.
//!
//! [`Mailer`] ties the pieces of a pass together: it serialises passes per
//! relay, runs the batch through a [`BatchDispatcher`], hands retry groups to
//! the [`RetryScheduler`] and exhausted attempts to the [`FailureReporter`].

use std::fmt;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{error, info};

use crate::attempt::{DeliveryAttempt, RetryPolicy};
use crate::client::{RelayConnector, SmtpConnector};
use crate::config::DispatchConfig;
use crate::dispatch::{BatchDispatcher, RejectedAttempt, RetryGroup};
use crate::errors::{DispatchError, DispatchResult};
use crate::observability::{DispatchMetrics, Timer};
use crate::report::{FailureReporter, TracingFailureReporter};
use crate::scheduler::RetryScheduler;
use crate::types::OutboundMessage;

/// Result of one [`Mailer::dispatch`] call.
#[derive(Debug, Default)]
pub struct DispatchReport {
    /// Attempts the relay accepted.
    pub delivered: Vec<DeliveryAttempt>,
    /// Groups accepted by the scheduler.
    pub scheduled: Vec<RetryGroup>,
    /// Retryable attempts the scheduler refused.
    pub unscheduled: Vec<DeliveryAttempt>,
    /// Attempts reported as permanently failed.
    pub exhausted: Vec<DeliveryAttempt>,
    /// Malformed attempts, never retried.
    pub rejected: Vec<RejectedAttempt>,
}

impl DispatchReport {
    /// Number of attempts across scheduled groups.
    pub fn scheduled_count(&self) -> usize {
        self.scheduled.iter().map(|g| g.attempts.len()).sum()
    }

    /// True if every attempt was delivered.
    pub fn all_delivered(&self) -> bool {
        self.scheduled.is_empty()
            && self.unscheduled.is_empty()
            && self.exhausted.is_empty()
            && self.rejected.is_empty()
    }
}

/// Fault-tolerant mail dispatcher for a single relay.
///
/// Clones share the relay lock, metrics, scheduler and reporter.
#[derive(Clone)]
pub struct Mailer {
    dispatcher: BatchDispatcher,
    scheduler: Arc<dyn RetryScheduler>,
    reporter: Arc<dyn FailureReporter>,
    policy: RetryPolicy,
    metrics: Arc<DispatchMetrics>,
    lock: Arc<Mutex<()>>,
}

impl fmt::Debug for Mailer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mailer")
            .field("dispatcher", &self.dispatcher)
            .field("scheduler", &self.scheduler)
            .field("reporter", &self.reporter)
            .field("policy", &self.policy)
            .finish()
    }
}

impl Mailer {
    /// Creates a mailer that talks SMTP to the relay in `config`.
    ///
    /// Fails on invalid configuration, including both TLS modes set.
    pub fn new(config: DispatchConfig, scheduler: Arc<dyn RetryScheduler>) -> DispatchResult<Self> {
        MailerBuilder::new().config(config).scheduler(scheduler).build()
    }

    /// Creates a builder.
    pub fn builder() -> MailerBuilder {
        MailerBuilder::new()
    }

    /// Retry policy applied to new messages.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Shared metrics.
    pub fn metrics(&self) -> &Arc<DispatchMetrics> {
        &self.metrics
    }

    /// Runs one dispatch pass over `batch`.
    ///
    /// Never fails. Passes against the same relay run one at a time; the
    /// lock is held from connection open until exhausted attempts have been
    /// reported.
    pub async fn dispatch(&self, batch: Vec<DeliveryAttempt>) -> DispatchReport {
        if batch.is_empty() {
            return DispatchReport::default();
        }

        let _guard = self.lock.lock().await;
        let timer = Timer::start("dispatch_pass");
        self.metrics.record_pass();

        let outcome = self.dispatcher.run(batch).await;

        let mut report = DispatchReport {
            delivered: outcome.succeeded,
            exhausted: outcome.exhausted,
            rejected: outcome.rejected,
            ..Default::default()
        };

        for group in outcome.retry_groups {
            let count = group.attempts.len();
            match self.scheduler.enqueue(group.attempts.clone(), group.delay).await {
                Ok(()) => {
                    info!(
                        delay_secs = group.delay.as_secs(),
                        count,
                        "Scheduled retry"
                    );
                    self.metrics.record_scheduled(count);
                    report.scheduled.push(group);
                }
                Err(e) => {
                    error!(
                        error = %e,
                        delay_secs = group.delay.as_secs(),
                        count,
                        "Could not schedule retry"
                    );
                    self.metrics.record_unscheduled(count);
                    report.unscheduled.extend(group.attempts);
                }
            }
        }

        if !report.exhausted.is_empty() {
            self.metrics.record_exhausted(report.exhausted.len());
            self.reporter.report_exhausted(&report.exhausted);
        }

        info!(
            delivered = report.delivered.len(),
            scheduled = report.scheduled_count(),
            unscheduled = report.unscheduled.len(),
            exhausted = report.exhausted.len(),
            rejected = report.rejected.len(),
            "Dispatch pass complete"
        );
        timer.stop();

        report
    }

    /// Wraps messages into fresh attempts and dispatches them.
    pub async fn send_messages(&self, messages: Vec<OutboundMessage>) -> DispatchReport {
        let batch = messages
            .into_iter()
            .map(|message| DeliveryAttempt::new(message, self.policy))
            .collect();
        self.dispatch(batch).await
    }

    /// Sends a short plain-text message from `from` to `to`.
    ///
    /// Useful for checking relay settings. Fails only if an address does
    /// not parse.
    pub async fn test_send(&self, from: &str, to: &str) -> DispatchResult<DispatchReport> {
        let message = OutboundMessage::builder()
            .from(from)?
            .to(to)?
            .subject("Mail dispatch test message")
            .text("This is a test message sent to verify relay settings.")
            .build()?;
        Ok(self.send_messages(vec![message]).await)
    }
}

/// Builder for [`Mailer`].
#[derive(Default)]
pub struct MailerBuilder {
    config: Option<DispatchConfig>,
    connector: Option<Arc<dyn RelayConnector>>,
    scheduler: Option<Arc<dyn RetryScheduler>>,
    reporter: Option<Arc<dyn FailureReporter>>,
    policy: Option<RetryPolicy>,
    metrics: Option<Arc<DispatchMetrics>>,
}

impl MailerBuilder {
    /// Creates a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Relay configuration. Also supplies the retry policy unless one is set.
    pub fn config(mut self, config: DispatchConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Uses `connector` instead of an SMTP connection built from config.
    pub fn connector(mut self, connector: Arc<dyn RelayConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Sets the retry scheduler. Required.
    pub fn scheduler(mut self, scheduler: Arc<dyn RetryScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Sets the failure reporter. Defaults to [`TracingFailureReporter`].
    pub fn reporter(mut self, reporter: Arc<dyn FailureReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Overrides the retry policy.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Shares an existing metrics collector.
    pub fn metrics(mut self, metrics: Arc<DispatchMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Builds the mailer.
    pub fn build(self) -> DispatchResult<Mailer> {
        let scheduler = self
            .scheduler
            .ok_or_else(|| DispatchError::configuration("A retry scheduler is required"))?;
        let metrics = self.metrics.unwrap_or_default();

        if let Some(config) = &self.config {
            config.validate()?;
        }

        let connector: Arc<dyn RelayConnector> = match (self.connector, &self.config) {
            (Some(connector), _) => connector,
            (None, Some(config)) => Arc::new(
                SmtpConnector::new(config.clone())?.with_metrics(Arc::clone(&metrics)),
            ),
            (None, None) => {
                return Err(DispatchError::configuration(
                    "Either a relay configuration or a connector is required",
                ))
            }
        };

        let policy = self
            .policy
            .or_else(|| self.config.as_ref().map(DispatchConfig::retry_policy))
            .unwrap_or_default();

        Ok(Mailer {
            dispatcher: BatchDispatcher::new(connector, Arc::clone(&metrics)),
            scheduler,
            reporter: self
                .reporter
                .unwrap_or_else(|| Arc::new(TracingFailureReporter::new())),
            policy,
            metrics,
            lock: Arc::new(Mutex::new(())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::DispatchErrorKind;
    use crate::mocks::{fixtures, MockConnector, RecordingReporter, RecordingScheduler};
    use std::time::Duration;

    fn mailer(
        connector: &MockConnector,
        scheduler: &RecordingScheduler,
        reporter: &RecordingReporter,
    ) -> Mailer {
        Mailer::builder()
            .connector(Arc::new(connector.clone()))
            .scheduler(Arc::new(scheduler.clone()))
            .reporter(Arc::new(reporter.clone()))
            .retry_policy(fixtures::policy(2))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_dispatch_delivers() {
        let connector = MockConnector::new();
        let scheduler = RecordingScheduler::new();
        let reporter = RecordingReporter::new();
        let mailer = mailer(&connector, &scheduler, &reporter);

        let report = mailer
            .send_messages(vec![fixtures::message(&["a@example.com"])])
            .await;

        assert!(report.all_delivered());
        assert_eq!(report.delivered.len(), 1);
        assert_eq!(scheduler.scheduled_count(), 0);
        assert!(reporter.reported().is_empty());
        assert_eq!(mailer.metrics().snapshot().dispatch_passes, 1);
    }

    #[tokio::test]
    async fn test_empty_batch_is_noop() {
        let connector = MockConnector::new();
        let mailer = mailer(&connector, &RecordingScheduler::new(), &RecordingReporter::new());

        let report = mailer.dispatch(Vec::new()).await;

        assert!(report.all_delivered());
        assert_eq!(connector.open_count(), 0);
    }

    #[tokio::test]
    async fn test_failures_are_scheduled() {
        let connector = MockConnector::new().fail_open(DispatchErrorKind::ConnectionRefused);
        let scheduler = RecordingScheduler::new();
        let reporter = RecordingReporter::new();
        let mailer = mailer(&connector, &scheduler, &reporter);

        let report = mailer
            .send_messages(vec![
                fixtures::message(&["a@example.com"]),
                fixtures::message(&["b@example.com"]),
            ])
            .await;

        assert_eq!(report.scheduled_count(), 2);
        let scheduled = scheduler.scheduled();
        assert_eq!(scheduled.len(), 1);
        assert_eq!(scheduled[0].0, Duration::from_secs(30));
        assert_eq!(scheduled[0].1.len(), 2);
        assert!(reporter.reported().is_empty());
    }

    #[tokio::test]
    async fn test_scheduler_failure_surfaces_unscheduled() {
        let connector = MockConnector::new().fail_open(DispatchErrorKind::ConnectionRefused);
        let reporter = RecordingReporter::new();
        let mailer = mailer(&connector, &RecordingScheduler::failing(), &reporter);

        let report = mailer
            .send_messages(vec![fixtures::message(&["a@example.com"])])
            .await;

        assert_eq!(report.unscheduled.len(), 1);
        assert!(report.scheduled.is_empty());
        assert_eq!(mailer.metrics().snapshot().messages_unscheduled, 1);
    }

    #[tokio::test]
    async fn test_exhausted_are_reported() {
        let connector = MockConnector::new()
            .fail_delivery_to("bad@example.com", DispatchErrorKind::ServerShutdown);
        let reporter = RecordingReporter::new();
        let mailer = mailer(&connector, &RecordingScheduler::new(), &reporter);

        let mut attempt = fixtures::attempt(&["bad@example.com"], 0);
        attempt.record_failure(&DispatchError::connection("earlier"));

        let report = mailer.dispatch(vec![attempt]).await;

        assert_eq!(report.exhausted.len(), 1);
        assert_eq!(reporter.reported().len(), 1);
        assert_eq!(reporter.reported()[0].errors().len(), 2);
    }

    #[tokio::test]
    async fn test_test_send() {
        let connector = MockConnector::new();
        let mailer = mailer(&connector, &RecordingScheduler::new(), &RecordingReporter::new());

        let report = mailer
            .test_send("ops@example.com", "oncall@example.com")
            .await
            .unwrap();
        assert!(report.all_delivered());

        let delivered = connector.delivered();
        assert_eq!(delivered[0].from.email, "ops@example.com");
        assert!(delivered[0].content_lossy().contains("Subject: Mail dispatch test message"));

        let err = mailer.test_send("not an address", "oncall@example.com").await.unwrap_err();
        assert_eq!(err.kind(), DispatchErrorKind::InvalidAddress);
    }

    #[test]
    fn test_builder_requires_scheduler() {
        let err = Mailer::builder()
            .connector(Arc::new(MockConnector::new()))
            .build()
            .unwrap_err();
        assert_eq!(err.kind(), DispatchErrorKind::ConfigurationInvalid);
    }

    #[test]
    fn test_conflicting_tls_rejected_at_construction() {
        let mut config = DispatchConfig::builder()
            .relay_host("relay.example.com")
            .build()
            .unwrap();
        config.use_implicit_tls = true;
        config.use_starttls = true;

        let err = Mailer::new(config, Arc::new(RecordingScheduler::new())).unwrap_err();
        assert_eq!(err.kind(), DispatchErrorKind::ConflictingTlsModes);
    }

    #[test]
    fn test_policy_from_config() {
        let config = DispatchConfig::builder()
            .relay_host("relay.example.com")
            .max_retries(7)
            .build()
            .unwrap();
        let mailer = Mailer::new(config, Arc::new(RecordingScheduler::new())).unwrap();
        assert_eq!(mailer.policy().retry_limit(), 7);
    }
}
