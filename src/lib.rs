//! # Mail Dispatch Library
//!
//! Fault-tolerant delivery of outbound mail through a single SMTP relay:
//! - One connection per batch, messages submitted in input order
//! - Per-message retry state with exponential backoff
//! - Retry groups keyed by delay, handed to a pluggable scheduler
//! - Exhausted messages reported with their full error history
//! - Transport security (STARTTLS, implicit TLS) and PLAIN, LOGIN, CRAM-MD5 auth
//! - Structured logging and dispatch metrics
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use integrations_mail_dispatch::{
//!     ChannelScheduler, DispatchConfig, Mailer, OutboundMessage, RetryWorker,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = DispatchConfig::builder()
//!         .relay_host("smtp.example.com")
//!         .relay_port(587)
//!         .starttls(true)
//!         .credentials("user@example.com", "password")
//!         .build()?;
//!
//!     let (scheduler, queue) = ChannelScheduler::channel();
//!     let mailer = Mailer::new(config, Arc::new(scheduler))?;
//!     tokio::spawn(RetryWorker::new(queue, mailer.clone()).run());
//!
//!     let message = OutboundMessage::builder()
//!         .from("sender@example.com")?
//!         .to("recipient@example.com")?
//!         .subject("Hello from Rust!")
//!         .text("This is a test message.")
//!         .build()?;
//!
//!     let report = mailer.send_messages(vec![message]).await;
//!     println!("delivered: {}", report.delivered.len());
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

// Core modules
pub mod config;
pub mod errors;
pub mod types;

// Retry state
pub mod attempt;

// Protocol layer
pub mod protocol;

// Transport layer
pub mod transport;

// Authentication
pub mod auth;

// Relay sessions
pub mod client;

// Dispatch pipeline
pub mod dispatch;
pub mod mailer;
pub mod report;
pub mod scheduler;

// Observability
pub mod observability;

// Mocks for testing
pub mod mocks;

// Re-exports for convenience
pub use attempt::{DeliveryAttempt, FailureRecord, RetryPolicy};
pub use client::{RelayConnection, RelayConnector, RelaySession, SmtpConnector};
pub use config::{DispatchConfig, DispatchConfigBuilder, RetryConfig, TlsConfig, TlsMode};
pub use dispatch::{BatchDispatcher, BatchOutcome, RejectedAttempt, RetryGroup, SendOutcome};
pub use errors::{DispatchError, DispatchErrorKind, DispatchResult, ErrorCategory};
pub use mailer::{DispatchReport, Mailer, MailerBuilder};
pub use observability::{DispatchMetrics, LogFormat, LogLevel, LoggingConfig, MetricsSnapshot};
pub use report::{FailureReporter, TracingFailureReporter};
pub use scheduler::{ChannelScheduler, RetryQueue, RetryScheduler, RetryWorker, ScheduledRetry};
pub use types::{Address, DeliveryReceipt, OutboundMessage, OutboundMessageBuilder, RejectedRecipient};
pub use auth::{AuthMethod, Credentials};
pub use protocol::{EsmtpCapabilities, SmtpCommand, SmtpResponse};
pub use transport::{SmtpTransport, TcpTransport, TlsClient};
