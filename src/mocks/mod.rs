//! Mock implementations for testing.
//!
//! Scripted transports, connectors, schedulers and reporters, plus message
//! fixtures. Everything here records what it was asked to do so tests can
//! assert on the interaction rather than on timing.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::attempt::DeliveryAttempt;
use crate::client::{RelayConnection, RelayConnector};
use crate::config::TlsConfig;
use crate::errors::{DispatchError, DispatchErrorKind, DispatchResult};
use crate::protocol::{EsmtpCapabilities, SmtpCommand, SmtpResponse, TransactionState};
use crate::report::FailureReporter;
use crate::scheduler::RetryScheduler;
use crate::transport::SmtpTransport;
use crate::types::{DeliveryReceipt, OutboundMessage};

/// One scripted reply: a response or an injected failure.
#[derive(Debug)]
enum Step {
    Reply(SmtpResponse),
    Fail(DispatchError),
}

/// Mock SMTP transport for testing.
///
/// Replies are consumed in order, one per `send_command` or
/// `read_response`. Once the script runs out every call answers `250 OK`.
#[derive(Debug)]
pub struct MockTransport {
    script: VecDeque<Step>,
    commands: Vec<SmtpCommand>,
    data_received: Vec<Vec<u8>>,
    state: TransactionState,
    capabilities: Option<EsmtpCapabilities>,
    tls_enabled: bool,
    aborted: bool,
}

impl MockTransport {
    /// Creates a mock transport with an empty script.
    pub fn new() -> Self {
        Self {
            script: VecDeque::new(),
            commands: Vec::new(),
            data_received: Vec::new(),
            state: TransactionState::Initial,
            capabilities: None,
            tls_enabled: false,
            aborted: false,
        }
    }

    /// Appends a single-line reply.
    ///
    /// The text is parsed the way the wire reader would, so a leading
    /// enhanced status code is picked up.
    pub fn with_response(mut self, code: u16, text: &str) -> Self {
        let response = SmtpResponse::parse(&[format!("{} {}", code, text)])
            .unwrap_or_else(|_| SmtpResponse::new(code, text));
        self.script.push_back(Step::Reply(response));
        self
    }

    /// Appends a multiline reply.
    pub fn with_multiline(mut self, code: u16, lines: &[&str]) -> Self {
        let last = lines.len().saturating_sub(1);
        let raw: Vec<String> = lines
            .iter()
            .enumerate()
            .map(|(i, line)| {
                let sep = if i == last { ' ' } else { '-' };
                format!("{}{}{}", code, sep, line)
            })
            .collect();
        let response = SmtpResponse::parse(&raw)
            .unwrap_or_else(|_| SmtpResponse::new(code, lines.join("\n")));
        self.script.push_back(Step::Reply(response));
        self
    }

    /// Appends a failure in place of the next reply.
    pub fn fail_next(mut self, error: DispatchError) -> Self {
        self.script.push_back(Step::Fail(error));
        self
    }

    /// Rendered commands, in send order.
    pub fn sent_commands(&self) -> Vec<String> {
        self.commands.iter().map(SmtpCommand::to_smtp_string).collect()
    }

    /// Raw payloads passed to `send_data`.
    pub fn sent_data(&self) -> Vec<Vec<u8>> {
        self.data_received.clone()
    }

    /// True once `abort` has been called.
    pub fn was_aborted(&self) -> bool {
        self.aborted
    }

    fn next_step(&mut self) -> DispatchResult<SmtpResponse> {
        match self.script.pop_front() {
            Some(Step::Reply(response)) => Ok(response),
            Some(Step::Fail(error)) => Err(error),
            None => Ok(SmtpResponse::new(250, "OK")),
        }
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SmtpTransport for MockTransport {
    async fn send_command(&mut self, command: &SmtpCommand) -> DispatchResult<SmtpResponse> {
        self.commands.push(command.clone());
        self.next_step()
    }

    async fn send_data(&mut self, data: &[u8]) -> DispatchResult<()> {
        self.data_received.push(data.to_vec());
        Ok(())
    }

    async fn read_response(&mut self) -> DispatchResult<SmtpResponse> {
        self.next_step()
    }

    async fn upgrade_tls(&mut self, _config: &TlsConfig, _server_name: &str) -> DispatchResult<()> {
        self.tls_enabled = true;
        Ok(())
    }

    fn is_tls(&self) -> bool {
        self.tls_enabled
    }

    async fn close(&mut self) -> DispatchResult<()> {
        let response = self.send_command(&SmtpCommand::Quit).await?;
        if !response.is_success() {
            return Err(response.to_error());
        }
        self.state = TransactionState::Closed;
        Ok(())
    }

    async fn abort(&mut self) {
        self.aborted = true;
        self.state = TransactionState::Closed;
    }

    fn state(&self) -> TransactionState {
        self.state
    }

    fn set_state(&mut self, state: TransactionState) {
        self.state = state;
    }

    fn capabilities(&self) -> Option<&EsmtpCapabilities> {
        self.capabilities.as_ref()
    }

    fn set_capabilities(&mut self, caps: EsmtpCapabilities) {
        self.capabilities = Some(caps);
    }
}

#[derive(Debug, Default)]
struct ConnectorState {
    open_failures: VecDeque<DispatchErrorKind>,
    persistent_open_failure: Option<DispatchErrorKind>,
    recipient_failures: HashMap<String, DispatchErrorKind>,
    open_count: usize,
    close_count: usize,
    deliver_calls: usize,
    delivered: Vec<OutboundMessage>,
    deliver_delay: Option<Duration>,
    open_sessions: usize,
    peak_open: usize,
}

/// Mock relay connector.
///
/// Clones share state, so a test can keep one handle while the pipeline
/// owns another.
#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<ConnectorState>>,
}

impl MockConnector {
    /// Creates a connector whose connections accept everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every `open` fail with `kind`.
    pub fn fail_open(self, kind: DispatchErrorKind) -> Self {
        self.state.lock().unwrap().persistent_open_failure = Some(kind);
        self
    }

    /// Makes the next `open` fail with `kind`.
    pub fn fail_open_once(self, kind: DispatchErrorKind) -> Self {
        self.state.lock().unwrap().open_failures.push_back(kind);
        self
    }

    /// Fails every delivery of a message addressed to `email`.
    pub fn fail_delivery_to(self, email: &str, kind: DispatchErrorKind) -> Self {
        self.state
            .lock()
            .unwrap()
            .recipient_failures
            .insert(email.to_string(), kind);
        self
    }

    /// Makes every `deliver` sleep for `delay` before answering.
    pub fn with_deliver_delay(self, delay: Duration) -> Self {
        self.state.lock().unwrap().deliver_delay = Some(delay);
        self
    }

    /// Removes every scripted failure.
    pub fn clear_failures(&self) {
        let mut state = self.state.lock().unwrap();
        state.open_failures.clear();
        state.persistent_open_failure = None;
        state.recipient_failures.clear();
    }

    /// Number of `open` calls.
    pub fn open_count(&self) -> usize {
        self.state.lock().unwrap().open_count
    }

    /// Number of connections closed.
    pub fn close_count(&self) -> usize {
        self.state.lock().unwrap().close_count
    }

    /// Number of `deliver` calls, successful or not.
    pub fn deliver_calls(&self) -> usize {
        self.state.lock().unwrap().deliver_calls
    }

    /// Largest number of connections open at the same time.
    pub fn peak_open(&self) -> usize {
        self.state.lock().unwrap().peak_open
    }

    /// Messages accepted so far, in delivery order.
    pub fn delivered(&self) -> Vec<OutboundMessage> {
        self.state.lock().unwrap().delivered.clone()
    }
}

#[async_trait]
impl RelayConnector for MockConnector {
    async fn open(&self) -> DispatchResult<Box<dyn RelayConnection>> {
        let mut state = self.state.lock().unwrap();
        state.open_count += 1;

        let failure = state
            .open_failures
            .pop_front()
            .or(state.persistent_open_failure);
        if let Some(kind) = failure {
            return Err(DispatchError::new(kind, "scripted connection failure"));
        }

        state.open_sessions += 1;
        state.peak_open = state.peak_open.max(state.open_sessions);

        Ok(Box::new(MockConnection {
            state: Arc::clone(&self.state),
            closed: false,
        }))
    }
}

/// Connection handed out by [`MockConnector`].
#[derive(Debug)]
pub struct MockConnection {
    state: Arc<Mutex<ConnectorState>>,
    closed: bool,
}

#[async_trait]
impl RelayConnection for MockConnection {
    async fn deliver(&mut self, message: &OutboundMessage) -> DispatchResult<DeliveryReceipt> {
        let delay = self.state.lock().unwrap().deliver_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().unwrap();
        state.deliver_calls += 1;

        if self.closed {
            return Err(DispatchError::new(
                DispatchErrorKind::ConnectionReset,
                "connection already closed",
            ));
        }

        let failure = message
            .recipients
            .iter()
            .find_map(|r| state.recipient_failures.get(&r.email).copied());
        if let Some(kind) = failure {
            return Err(DispatchError::new(
                kind,
                format!("scripted failure for {}", message.recipient_list()),
            ));
        }

        state.delivered.push(message.clone());
        Ok(DeliveryReceipt {
            server_id: Some(format!("MOCK{}", state.delivered.len())),
            accepted: message.recipients.clone(),
            rejected: Vec::new(),
            response: "250 OK".to_string(),
        })
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let mut state = self.state.lock().unwrap();
            state.close_count += 1;
            state.open_sessions -= 1;
        }
    }
}

/// Scheduler that records every group it is handed.
#[derive(Debug, Clone, Default)]
pub struct RecordingScheduler {
    scheduled: Arc<Mutex<Vec<(Duration, Vec<DeliveryAttempt>)>>>,
    failure: Option<DispatchErrorKind>,
}

impl RecordingScheduler {
    /// Creates a scheduler that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a scheduler that refuses every group.
    pub fn failing() -> Self {
        Self {
            scheduled: Arc::default(),
            failure: Some(DispatchErrorKind::ScheduleFailed),
        }
    }

    /// Accepted groups, in enqueue order.
    pub fn scheduled(&self) -> Vec<(Duration, Vec<DeliveryAttempt>)> {
        self.scheduled.lock().unwrap().clone()
    }

    /// Total attempts across accepted groups.
    pub fn scheduled_count(&self) -> usize {
        self.scheduled
            .lock()
            .unwrap()
            .iter()
            .map(|(_, group)| group.len())
            .sum()
    }
}

#[async_trait]
impl RetryScheduler for RecordingScheduler {
    async fn enqueue(&self, group: Vec<DeliveryAttempt>, delay: Duration) -> DispatchResult<()> {
        if let Some(kind) = self.failure {
            return Err(DispatchError::new(kind, "scheduler unavailable"));
        }
        self.scheduled.lock().unwrap().push((delay, group));
        Ok(())
    }
}

/// Reporter that keeps every exhausted attempt.
#[derive(Debug, Clone, Default)]
pub struct RecordingReporter {
    reported: Arc<Mutex<Vec<DeliveryAttempt>>>,
}

impl RecordingReporter {
    /// Creates an empty reporter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempts reported so far.
    pub fn reported(&self) -> Vec<DeliveryAttempt> {
        self.reported.lock().unwrap().clone()
    }
}

impl FailureReporter for RecordingReporter {
    fn report_exhausted(&self, attempts: &[DeliveryAttempt]) {
        self.reported.lock().unwrap().extend_from_slice(attempts);
    }
}

/// Message and attempt fixtures.
pub mod fixtures {
    use std::time::Duration;

    use crate::attempt::{DeliveryAttempt, RetryPolicy};
    use crate::types::{Address, OutboundMessage};

    /// Sender used by every fixture message.
    pub const SENDER: &str = "sender@example.com";

    /// A plain-text message from [`SENDER`] to `recipients`.
    pub fn message(recipients: &[&str]) -> OutboundMessage {
        let recipients = recipients
            .iter()
            .map(|r| Address::new(*r).unwrap())
            .collect();
        OutboundMessage::new(
            Address::new(SENDER).unwrap(),
            recipients,
            "Subject: fixture\r\nMessage-ID: <fixture@example.com>\r\n\r\nHello from the fixtures.\r\n",
        )
    }

    /// Policy with a 30s step, base 4 and the given retry limit.
    pub fn policy(retry_limit: u32) -> RetryPolicy {
        RetryPolicy::new(retry_limit, Duration::from_secs(30), 4.0)
    }

    /// A fresh attempt for [`message`].
    pub fn attempt(recipients: &[&str], retry_limit: u32) -> DeliveryAttempt {
        DeliveryAttempt::new(message(recipients), policy(retry_limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_transport_script() {
        let mut transport = MockTransport::new()
            .with_response(220, "ready")
            .fail_next(DispatchError::new(DispatchErrorKind::ReadTimeout, "slow"));

        assert_eq!(transport.read_response().await.unwrap().code, 220);
        let err = transport.send_command(&SmtpCommand::Noop).await.unwrap_err();
        assert_eq!(err.kind(), DispatchErrorKind::ReadTimeout);

        // Script exhausted.
        assert_eq!(transport.send_command(&SmtpCommand::Noop).await.unwrap().code, 250);
        assert_eq!(transport.sent_commands(), vec!["NOOP", "NOOP"]);
    }

    #[tokio::test]
    async fn test_mock_transport_enhanced_code() {
        let mut transport = MockTransport::new().with_response(550, "5.1.1 No such user");
        let response = transport.read_response().await.unwrap();
        assert!(response.enhanced_code.is_some());
    }

    #[tokio::test]
    async fn test_mock_connector_records() {
        let connector = MockConnector::new()
            .fail_open_once(DispatchErrorKind::ConnectTimeout)
            .fail_delivery_to("bad@example.com", DispatchErrorKind::DataRejected);

        assert!(connector.open().await.is_err());

        let mut connection = connector.open().await.unwrap();
        assert!(connection.deliver(&fixtures::message(&["a@example.com"])).await.is_ok());
        assert!(connection.deliver(&fixtures::message(&["bad@example.com"])).await.is_err());
        connection.close().await;
        connection.close().await;

        assert_eq!(connector.open_count(), 2);
        assert_eq!(connector.deliver_calls(), 2);
        assert_eq!(connector.delivered().len(), 1);
        assert_eq!(connector.close_count(), 1);
        assert_eq!(connector.peak_open(), 1);
    }

    #[tokio::test]
    async fn test_mock_connector_tracks_overlapping_sessions() {
        let connector = MockConnector::new().with_deliver_delay(Duration::from_millis(1));

        let mut first = connector.open().await.unwrap();
        let mut second = connector.open().await.unwrap();
        assert!(first.deliver(&fixtures::message(&["a@example.com"])).await.is_ok());
        first.close().await;
        second.close().await;

        let mut third = connector.open().await.unwrap();
        third.close().await;

        assert_eq!(connector.peak_open(), 2);
        assert_eq!(connector.close_count(), 3);
    }

    #[tokio::test]
    async fn test_recording_scheduler() {
        let scheduler = RecordingScheduler::new();
        let group = vec![fixtures::attempt(&["a@example.com"], 3)];
        scheduler.enqueue(group.clone(), Duration::from_secs(30)).await.unwrap();
        assert_eq!(scheduler.scheduled_count(), 1);

        let failing = RecordingScheduler::failing();
        let err = failing.enqueue(group, Duration::from_secs(30)).await.unwrap_err();
        assert_eq!(err.kind(), DispatchErrorKind::ScheduleFailed);
    }
}
