//! Delivery attempts: a message plus its retry bookkeeping.
//!
//! An attempt is created once per outbound message and carried across
//! dispatch passes (and, through serde, across process boundaries when an
//! out-of-process scheduler persists it). It becomes terminal once it is
//! delivered or its failure count exceeds the retry limit.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{DispatchError, DispatchErrorKind, DispatchResult};
use crate::types::OutboundMessage;

/// Retry ceiling and backoff parameters stamped on an attempt at creation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    retry_limit: u32,
    backoff_step: Duration,
    backoff_base: f64,
}

impl RetryPolicy {
    /// Creates a policy.
    pub fn new(retry_limit: u32, backoff_step: Duration, backoff_base: f64) -> Self {
        Self {
            retry_limit,
            backoff_step,
            backoff_base,
        }
    }

    /// Retries allowed after the first failure.
    pub fn retry_limit(&self) -> u32 {
        self.retry_limit
    }

    /// Delay before the first retry.
    pub fn backoff_step(&self) -> Duration {
        self.backoff_step
    }

    /// Multiplier per additional failure.
    pub fn backoff_base(&self) -> f64 {
        self.backoff_base
    }

    /// Delay after the `failures`-th failure: `step * base^(failures - 1)`.
    ///
    /// Returns `None` for zero failures. Saturates at `Duration::MAX`.
    pub fn delay_for(&self, failures: u32) -> Option<Duration> {
        if failures == 0 {
            return None;
        }

        let exponent = i32::try_from(failures - 1).unwrap_or(i32::MAX);
        let secs = self.backoff_step.as_secs_f64() * self.backoff_base.powi(exponent);

        if !secs.is_finite() || secs < 0.0 {
            return Some(Duration::MAX);
        }

        Some(Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            crate::config::DEFAULT_MAX_RETRIES,
            crate::config::DEFAULT_BACKOFF_STEP,
            crate::config::DEFAULT_BACKOFF_BASE,
        )
    }
}

/// One failed send, as recorded on an attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Error kind.
    pub kind: DispatchErrorKind,
    /// Rendered error.
    pub description: String,
    /// Relay reply code, if the failure came from a reply.
    pub smtp_code: Option<u16>,
    /// When the failure was recorded.
    pub at: DateTime<Utc>,
}

impl From<&DispatchError> for FailureRecord {
    fn from(error: &DispatchError) -> Self {
        Self {
            kind: error.kind(),
            description: error.to_string(),
            smtp_code: error.smtp_code(),
            at: Utc::now(),
        }
    }
}

impl fmt::Display for FailureRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description)
    }
}

/// A message together with its retry state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    id: Uuid,
    message: OutboundMessage,
    attempt_count: u32,
    errors: Vec<FailureRecord>,
    delivered: bool,
    policy: RetryPolicy,
    created_at: DateTime<Utc>,
}

impl DeliveryAttempt {
    /// Wraps a message in a fresh attempt.
    pub fn new(message: OutboundMessage, policy: RetryPolicy) -> Self {
        Self {
            id: Uuid::new_v4(),
            message,
            attempt_count: 0,
            errors: Vec::new(),
            delivered: false,
            policy,
            created_at: Utc::now(),
        }
    }

    /// Correlation id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The wrapped message.
    pub fn message(&self) -> &OutboundMessage {
        &self.message
    }

    /// Number of failed sends so far.
    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Failures in the order they happened.
    pub fn errors(&self) -> &[FailureRecord] {
        &self.errors
    }

    /// Most recent failure.
    pub fn last_error(&self) -> Option<&FailureRecord> {
        self.errors.last()
    }

    /// True once the relay has accepted the message.
    pub fn is_delivered(&self) -> bool {
        self.delivered
    }

    /// Retry policy captured at creation.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Creation time.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Records a failed send.
    pub fn record_failure(&mut self, error: &DispatchError) {
        self.errors.push(FailureRecord::from(error));
        self.attempt_count = self.attempt_count.saturating_add(1);
    }

    /// Marks the message delivered. Idempotent.
    pub fn record_success(&mut self) {
        self.delivered = true;
    }

    /// True if the message is undelivered and within its retry budget.
    pub fn is_retryable(&self) -> bool {
        !self.delivered && self.attempt_count <= self.policy.retry_limit
    }

    /// True once no further pass will touch this attempt.
    pub fn is_terminal(&self) -> bool {
        !self.is_retryable()
    }

    /// Backoff before the next pass, or `None` if nothing has failed yet.
    pub fn next_delay(&self) -> Option<Duration> {
        self.policy.delay_for(self.attempt_count)
    }

    /// Rejects messages that can never be delivered.
    ///
    /// Leaves the retry state untouched.
    pub fn validate(&self) -> DispatchResult<()> {
        if self.message.recipients.is_empty() {
            return Err(DispatchError::malformed(
                DispatchErrorKind::NoRecipients,
                format!("Message from '{}' has no recipients", self.message.from.email),
            ));
        }
        Ok(())
    }

    /// Content digest ignoring `Message-ID` and `Date`.
    ///
    /// Two renderings of the same message produced at different times share
    /// a fingerprint. Used for log correlation only.
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.message.content)
    }
}

impl fmt::Display for DeliveryAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<DeliveryAttempt: from '{}' to '{}' ({}), retried {}>",
            self.message.from.email,
            self.message.recipient_list(),
            self.fingerprint(),
            self.attempt_count
        )
    }
}

fn is_volatile_header(line: &[u8]) -> bool {
    let name = match line.iter().position(|b| *b == b':') {
        Some(idx) => &line[..idx],
        None => return false,
    };
    let name = String::from_utf8_lossy(name);
    let name = name.trim();
    name.eq_ignore_ascii_case("message-id") || name.eq_ignore_ascii_case("date")
}

fn fingerprint(content: &[u8]) -> String {
    let mut hasher = Md5::new();
    let mut in_headers = true;
    let mut skipping = false;

    for line in content.split_inclusive(|b| *b == b'\n') {
        if in_headers {
            if line == b"\r\n" || line == b"\n" {
                in_headers = false;
            } else if line.first().map_or(false, |b| *b == b' ' || *b == b'\t') {
                // Folded continuation of the previous field.
                if skipping {
                    continue;
                }
            } else {
                skipping = is_volatile_header(line);
                if skipping {
                    continue;
                }
            }
        }
        hasher.update(line);
    }

    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}
