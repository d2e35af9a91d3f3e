//! Reporting of attempts that ran out of retries.

use std::fmt;

use tracing::error;

use crate::attempt::DeliveryAttempt;

/// Receives attempts that will never be retried again.
///
/// Implementations must not fail and must not block the dispatch pass.
pub trait FailureReporter: Send + Sync + fmt::Debug {
    /// Emits one record per exhausted attempt.
    fn report_exhausted(&self, attempts: &[DeliveryAttempt]);
}

/// Renders the human-readable failure record for an attempt.
///
/// Lists every accumulated error in order, followed by the message content.
pub fn render_failure(attempt: &DeliveryAttempt) -> String {
    let errors = attempt
        .errors()
        .iter()
        .map(|record| record.description.as_str())
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "Could not send message because the following errors occurred:\n{}\nOriginal message was:\n{}\n\n",
        errors,
        attempt.message().content_lossy()
    )
}

/// Reporter that logs each exhausted attempt at error level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingFailureReporter;

impl TracingFailureReporter {
    /// Creates a new reporter.
    pub fn new() -> Self {
        Self
    }
}

impl FailureReporter for TracingFailureReporter {
    fn report_exhausted(&self, attempts: &[DeliveryAttempt]) {
        for attempt in attempts {
            error!(
                attempt_id = %attempt.id(),
                fingerprint = %attempt.fingerprint(),
                from = %attempt.message().from.email,
                recipients = %attempt.message().recipient_list(),
                attempts = attempt.attempt_count(),
                last_error = attempt.last_error().map(|e| e.description.as_str()).unwrap_or(""),
                "{}",
                render_failure(attempt)
            );
        }
    }
}
