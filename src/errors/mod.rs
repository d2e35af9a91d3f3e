//! Error types for the mail dispatch pipeline.
//!
//! Every failure carries a [`DispatchErrorKind`], and every kind belongs to
//! exactly one [`ErrorCategory`]. The category decides how the dispatcher
//! treats the failure: connection failures blame the whole batch, transport
//! failures blame one message, malformed messages are never retried and
//! configuration errors never reach the network.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for dispatch operations.
pub type DispatchResult<T> = Result<T, DispatchError>;

/// Coarse classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Invalid configuration, raised at construction time.
    Configuration,
    /// Could not open, secure or authenticate the relay session.
    Connection,
    /// A single delivery failed on an established session.
    Transport,
    /// The message itself cannot be delivered (e.g. no recipients).
    MalformedMessage,
    /// The retry scheduler refused a group.
    Scheduling,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Configuration => write!(f, "configuration"),
            ErrorCategory::Connection => write!(f, "connection"),
            ErrorCategory::Transport => write!(f, "transport"),
            ErrorCategory::MalformedMessage => write!(f, "malformed message"),
            ErrorCategory::Scheduling => write!(f, "scheduling"),
        }
    }
}

/// Dispatch error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchErrorKind {
    // Configuration errors
    /// Configuration is invalid.
    ConfigurationInvalid,
    /// Implicit TLS and STARTTLS were both requested.
    ConflictingTlsModes,

    // Connection errors
    /// Connection was refused.
    ConnectionRefused,
    /// Connect timed out.
    ConnectTimeout,
    /// Connection was reset or closed by the relay.
    ConnectionReset,
    /// TLS handshake failed.
    TlsHandshakeFailed,
    /// STARTTLS requested but not offered by the relay.
    StarttlsNotSupported,
    /// Relay greeting or EHLO was refused.
    GreetingRejected,
    /// Credentials were rejected.
    AuthenticationFailed,
    /// No usable authentication mechanism.
    AuthMethodNotSupported,

    // Transport errors
    /// MAIL FROM was refused.
    SenderRejected,
    /// Every RCPT TO was refused.
    RecipientsRejected,
    /// DATA or the message content was refused.
    DataRejected,
    /// Relay is shutting down (421).
    ServerShutdown,
    /// Read timed out.
    ReadTimeout,
    /// Write timed out.
    WriteTimeout,
    /// Malformed reply from the relay.
    InvalidResponse,
    /// Reply code not expected at this point of the dialogue.
    UnexpectedResponse,
    /// Low-level I/O failure on an open session.
    Io,

    // Message errors
    /// Message has no recipients.
    NoRecipients,
    /// Sender or recipient address is syntactically invalid.
    InvalidAddress,

    // Scheduling
    /// Retry scheduler rejected a group.
    ScheduleFailed,

    // Generic
    /// Unknown or internal error.
    Unknown,
}

impl DispatchErrorKind {
    /// Returns the category this kind belongs to.
    pub fn category(&self) -> ErrorCategory {
        match self {
            DispatchErrorKind::ConfigurationInvalid | DispatchErrorKind::ConflictingTlsModes => {
                ErrorCategory::Configuration
            }

            DispatchErrorKind::ConnectionRefused
            | DispatchErrorKind::ConnectTimeout
            | DispatchErrorKind::ConnectionReset
            | DispatchErrorKind::TlsHandshakeFailed
            | DispatchErrorKind::StarttlsNotSupported
            | DispatchErrorKind::GreetingRejected
            | DispatchErrorKind::AuthenticationFailed
            | DispatchErrorKind::AuthMethodNotSupported => ErrorCategory::Connection,

            DispatchErrorKind::NoRecipients | DispatchErrorKind::InvalidAddress => {
                ErrorCategory::MalformedMessage
            }

            DispatchErrorKind::ScheduleFailed => ErrorCategory::Scheduling,

            DispatchErrorKind::SenderRejected
            | DispatchErrorKind::RecipientsRejected
            | DispatchErrorKind::DataRejected
            | DispatchErrorKind::ServerShutdown
            | DispatchErrorKind::ReadTimeout
            | DispatchErrorKind::WriteTimeout
            | DispatchErrorKind::InvalidResponse
            | DispatchErrorKind::UnexpectedResponse
            | DispatchErrorKind::Io
            | DispatchErrorKind::Unknown => ErrorCategory::Transport,
        }
    }

    /// Returns true if a failure of this kind may succeed on a later pass.
    ///
    /// Connection and transport failures are always retried, subject to the
    /// per-attempt retry ceiling.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Connection | ErrorCategory::Transport
        )
    }
}

impl fmt::Display for DispatchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchErrorKind::ConfigurationInvalid => write!(f, "Invalid configuration"),
            DispatchErrorKind::ConflictingTlsModes => write!(f, "Conflicting TLS modes"),
            DispatchErrorKind::ConnectionRefused => write!(f, "Connection refused"),
            DispatchErrorKind::ConnectTimeout => write!(f, "Connect timeout"),
            DispatchErrorKind::ConnectionReset => write!(f, "Connection reset"),
            DispatchErrorKind::TlsHandshakeFailed => write!(f, "TLS handshake failed"),
            DispatchErrorKind::StarttlsNotSupported => write!(f, "STARTTLS not supported"),
            DispatchErrorKind::GreetingRejected => write!(f, "Greeting rejected"),
            DispatchErrorKind::AuthenticationFailed => write!(f, "Authentication failed"),
            DispatchErrorKind::AuthMethodNotSupported => write!(f, "Auth method not supported"),
            DispatchErrorKind::SenderRejected => write!(f, "Sender rejected"),
            DispatchErrorKind::RecipientsRejected => write!(f, "Recipients rejected"),
            DispatchErrorKind::DataRejected => write!(f, "Message data rejected"),
            DispatchErrorKind::ServerShutdown => write!(f, "Server shutting down"),
            DispatchErrorKind::ReadTimeout => write!(f, "Read timeout"),
            DispatchErrorKind::WriteTimeout => write!(f, "Write timeout"),
            DispatchErrorKind::InvalidResponse => write!(f, "Invalid server response"),
            DispatchErrorKind::UnexpectedResponse => write!(f, "Unexpected response"),
            DispatchErrorKind::Io => write!(f, "I/O error"),
            DispatchErrorKind::NoRecipients => write!(f, "No recipients"),
            DispatchErrorKind::InvalidAddress => write!(f, "Invalid address"),
            DispatchErrorKind::ScheduleFailed => write!(f, "Scheduling failed"),
            DispatchErrorKind::Unknown => write!(f, "Unknown error"),
        }
    }
}

/// Enhanced SMTP status code (RFC 3463).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnhancedStatusCode {
    /// Class (2=success, 4=temporary, 5=permanent).
    pub class: u8,
    /// Subject (e.g., 1=addressing, 2=mailbox, 3=mail system).
    pub subject: u16,
    /// Detail code.
    pub detail: u16,
}

impl EnhancedStatusCode {
    /// Creates a new enhanced status code.
    pub fn new(class: u8, subject: u16, detail: u16) -> Self {
        Self { class, subject, detail }
    }

    /// Parses an enhanced status code from a string (e.g., "5.1.1").
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.split('.');
        let class = parts.next()?.parse().ok()?;
        let subject = parts.next()?.parse().ok()?;
        let detail = parts.next()?.parse().ok()?;
        if parts.next().is_some() || !matches!(class, 2 | 4 | 5) {
            return None;
        }
        Some(Self { class, subject, detail })
    }

    /// Returns true if this is a temporary failure.
    pub fn is_temporary(&self) -> bool {
        self.class == 4
    }

    /// Returns true if this is a permanent failure.
    pub fn is_permanent(&self) -> bool {
        self.class == 5
    }
}

impl fmt::Display for EnhancedStatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.class, self.subject, self.detail)
    }
}

/// Dispatch error with detailed information.
#[derive(Error, Debug)]
pub struct DispatchError {
    /// Error kind.
    kind: DispatchErrorKind,
    /// Human-readable message.
    message: String,
    /// SMTP reply code if available.
    smtp_code: Option<u16>,
    /// Enhanced status code if available.
    enhanced_code: Option<EnhancedStatusCode>,
    /// Underlying cause.
    #[source]
    cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl DispatchError {
    /// Creates a new error.
    pub fn new(kind: DispatchErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            smtp_code: None,
            enhanced_code: None,
            cause: None,
        }
    }

    /// Sets the SMTP reply code.
    pub fn with_smtp_code(mut self, code: u16) -> Self {
        self.smtp_code = Some(code);
        self
    }

    /// Sets the enhanced status code.
    pub fn with_enhanced_code(mut self, code: EnhancedStatusCode) -> Self {
        self.enhanced_code = Some(code);
        self
    }

    /// Sets the underlying cause.
    pub fn with_cause<E: std::error::Error + Send + Sync + 'static>(mut self, cause: E) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Returns the error kind.
    pub fn kind(&self) -> DispatchErrorKind {
        self.kind
    }

    /// Returns the error category.
    pub fn category(&self) -> ErrorCategory {
        self.kind.category()
    }

    /// Returns the error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the SMTP reply code if available.
    pub fn smtp_code(&self) -> Option<u16> {
        self.smtp_code
    }

    /// Returns the enhanced status code if available.
    pub fn enhanced_code(&self) -> Option<&EnhancedStatusCode> {
        self.enhanced_code.as_ref()
    }

    /// Returns true if this error should count against the retry budget
    /// rather than terminate the attempt outright.
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    // Convenience constructors

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(DispatchErrorKind::ConfigurationInvalid, message)
    }

    /// Creates a connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(DispatchErrorKind::ConnectionRefused, message)
    }

    /// Creates a timeout error.
    pub fn timeout(kind: DispatchErrorKind, message: impl Into<String>) -> Self {
        Self::new(kind, message)
    }

    /// Creates a TLS error.
    pub fn tls(message: impl Into<String>) -> Self {
        Self::new(DispatchErrorKind::TlsHandshakeFailed, message)
    }

    /// Creates an authentication error.
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(DispatchErrorKind::AuthenticationFailed, message)
    }

    /// Creates a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(DispatchErrorKind::InvalidResponse, message)
    }

    /// Creates a malformed-message error.
    pub fn malformed(kind: DispatchErrorKind, message: impl Into<String>) -> Self {
        Self::new(kind, message)
    }

    /// Creates a scheduling error.
    pub fn scheduling(message: impl Into<String>) -> Self {
        Self::new(DispatchErrorKind::ScheduleFailed, message)
    }

    /// Creates an error from a relay reply.
    pub fn from_smtp_response(code: u16, message: impl Into<String>) -> Self {
        let kind = match code {
            421 => DispatchErrorKind::ServerShutdown,
            500..=504 => DispatchErrorKind::InvalidResponse,
            530 | 534 | 535 | 538 => DispatchErrorKind::AuthenticationFailed,
            552 | 554 => DispatchErrorKind::DataRejected,
            _ => DispatchErrorKind::UnexpectedResponse,
        };
        Self::new(kind, message).with_smtp_code(code)
    }

    /// Re-labels the error with a new kind, keeping code and cause.
    pub(crate) fn with_kind(mut self, kind: DispatchErrorKind) -> Self {
        self.kind = kind;
        self
    }
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(code) = self.smtp_code {
            write!(f, " (SMTP {})", code)?;
        }
        if let Some(enhanced) = &self.enhanced_code {
            write!(f, " [{}]", enhanced)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_categories() {
        assert_eq!(
            DispatchErrorKind::ConflictingTlsModes.category(),
            ErrorCategory::Configuration
        );
        assert_eq!(
            DispatchErrorKind::AuthenticationFailed.category(),
            ErrorCategory::Connection
        );
        assert_eq!(
            DispatchErrorKind::RecipientsRejected.category(),
            ErrorCategory::Transport
        );
        assert_eq!(
            DispatchErrorKind::NoRecipients.category(),
            ErrorCategory::MalformedMessage
        );
    }

    #[test]
    fn test_kind_retryable() {
        assert!(DispatchErrorKind::ConnectTimeout.is_retryable());
        assert!(DispatchErrorKind::DataRejected.is_retryable());
        assert!(!DispatchErrorKind::NoRecipients.is_retryable());
        assert!(!DispatchErrorKind::ConflictingTlsModes.is_retryable());
    }

    #[test]
    fn test_enhanced_status_code_parse() {
        let code = EnhancedStatusCode::parse("5.1.1").unwrap();
        assert_eq!(code.class, 5);
        assert_eq!(code.subject, 1);
        assert_eq!(code.detail, 1);
        assert!(code.is_permanent());
        assert!(!code.is_temporary());

        assert!(EnhancedStatusCode::parse("Hello").is_none());
        assert!(EnhancedStatusCode::parse("3.1.1").is_none());
        assert!(EnhancedStatusCode::parse("4.1.1.1").is_none());
    }

    #[test]
    fn test_error_from_response() {
        let err = DispatchError::from_smtp_response(535, "Authentication failed");
        assert_eq!(err.kind(), DispatchErrorKind::AuthenticationFailed);
        assert_eq!(err.smtp_code(), Some(535));

        let err = DispatchError::from_smtp_response(421, "Service unavailable");
        assert_eq!(err.kind(), DispatchErrorKind::ServerShutdown);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = DispatchError::from_smtp_response(552, "Too big")
            .with_enhanced_code(EnhancedStatusCode::new(5, 3, 4));
        assert_eq!(err.to_string(), "Message data rejected: Too big (SMTP 552) [5.3.4]");
    }
}
