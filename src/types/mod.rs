//! Core types for the mail dispatcher.
//!
//! This module provides:
//! - Address types with validation
//! - Outbound message envelope and builder
//! - Delivery receipt types

use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{DispatchError, DispatchErrorKind, DispatchResult};

/// Email address with optional display name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    /// Display name (e.g., "John Doe").
    pub name: Option<String>,
    /// Email address (e.g., "john@example.com").
    pub email: String,
}

impl Address {
    /// Creates a new address with just an email.
    pub fn new(email: impl Into<String>) -> DispatchResult<Self> {
        let email = email.into();
        Self::validate_email(&email)?;
        Ok(Self { name: None, email })
    }

    /// Creates a new address with display name and email.
    pub fn with_name(name: impl Into<String>, email: impl Into<String>) -> DispatchResult<Self> {
        let email = email.into();
        Self::validate_email(&email)?;
        Ok(Self {
            name: Some(name.into()),
            email,
        })
    }

    /// Parses an address from a string (e.g., "John Doe <john@example.com>").
    pub fn parse(s: &str) -> DispatchResult<Self> {
        let s = s.trim();

        if let (Some(start), Some(end)) = (s.find('<'), s.rfind('>')) {
            if start < end {
                let name = s[..start].trim().trim_matches('"');
                let email = s[start + 1..end].trim();
                if name.is_empty() {
                    return Self::new(email);
                }
                return Self::with_name(name, email);
            }
        }

        Self::new(s)
    }

    fn validate_email(email: &str) -> DispatchResult<()> {
        let invalid = |msg: &str| {
            Err(DispatchError::malformed(
                DispatchErrorKind::InvalidAddress,
                format!("{}: '{}'", msg, email),
            ))
        };

        if email.is_empty() {
            return invalid("Email address cannot be empty");
        }

        if email.len() > 254 {
            return invalid("Email address too long (max 254 characters)");
        }

        let Some((local, domain)) = email.split_once('@') else {
            return invalid("Email address must contain exactly one @");
        };

        if domain.contains('@') {
            return invalid("Email address must contain exactly one @");
        }

        if local.is_empty() || local.len() > 64 {
            return invalid("Local part must be 1-64 characters");
        }

        if domain.is_empty() {
            return invalid("Domain cannot be empty");
        }

        // CR/LF would let an address smuggle extra SMTP commands.
        if email.chars().any(|c| c.is_control() || c == '<' || c == '>') {
            return invalid("Email address contains forbidden characters");
        }

        Ok(())
    }

    /// Returns the email part only.
    pub fn email(&self) -> &str {
        &self.email
    }

    /// Returns the display name if present.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Formats the address for SMTP MAIL FROM/RCPT TO commands.
    pub fn to_smtp(&self) -> String {
        format!("<{}>", self.email)
    }

    /// Formats the address for email headers.
    pub fn to_header(&self) -> String {
        match &self.name {
            Some(name) => {
                if name.contains(|c: char| !c.is_alphanumeric() && c != ' ') {
                    format!("\"{}\" <{}>", name, self.email)
                } else {
                    format!("{} <{}>", name, self.email)
                }
            }
            None => self.email.clone(),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_header())
    }
}

impl TryFrom<&str> for Address {
    type Error = DispatchError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Address::parse(s)
    }
}

impl TryFrom<String> for Address {
    type Error = DispatchError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Address::parse(&s)
    }
}

/// A message ready for relay submission.
///
/// `content` is the already-serialized RFC 5322 message (header block, blank
/// line, body); the dispatcher never looks inside it except to fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Envelope sender.
    pub from: Address,
    /// Envelope recipients.
    pub recipients: Vec<Address>,
    /// Serialized message.
    pub content: Vec<u8>,
}

impl OutboundMessage {
    /// Creates a message from an envelope and serialized content.
    pub fn new(from: Address, recipients: Vec<Address>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            from,
            recipients,
            content: content.into(),
        }
    }

    /// Creates a new message builder.
    pub fn builder() -> OutboundMessageBuilder {
        OutboundMessageBuilder::default()
    }

    /// Returns the content as text, replacing invalid UTF-8.
    pub fn content_lossy(&self) -> String {
        String::from_utf8_lossy(&self.content).into_owned()
    }

    /// Comma-separated recipient list.
    pub fn recipient_list(&self) -> String {
        self.recipients
            .iter()
            .map(|r| r.email.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Builder for outbound messages.
///
/// Either supply pre-serialized content with [`content`](Self::content), or
/// a subject and text body which are composed into a minimal RFC 5322
/// message at build time.
#[derive(Debug, Default)]
pub struct OutboundMessageBuilder {
    from: Option<Address>,
    recipients: Vec<Address>,
    content: Option<Vec<u8>>,
    subject: Option<String>,
    body: Option<String>,
    headers: Vec<(String, String)>,
}

impl OutboundMessageBuilder {
    /// Sets the sender address.
    pub fn from(mut self, address: impl TryInto<Address, Error = DispatchError>) -> DispatchResult<Self> {
        self.from = Some(address.try_into()?);
        Ok(self)
    }

    /// Adds a recipient.
    pub fn to(mut self, address: impl TryInto<Address, Error = DispatchError>) -> DispatchResult<Self> {
        self.recipients.push(address.try_into()?);
        Ok(self)
    }

    /// Adds multiple recipients.
    pub fn to_many<I, A>(mut self, addresses: I) -> DispatchResult<Self>
    where
        I: IntoIterator<Item = A>,
        A: TryInto<Address, Error = DispatchError>,
    {
        for addr in addresses {
            self.recipients.push(addr.try_into()?);
        }
        Ok(self)
    }

    /// Sets pre-serialized content. Overrides subject, body and headers.
    pub fn content(mut self, content: impl Into<Vec<u8>>) -> Self {
        self.content = Some(content.into());
        self
    }

    /// Sets the subject.
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Sets the plain text body.
    pub fn text(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Adds a custom header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Builds the message.
    ///
    /// An empty recipient list is accepted here; such a message is rejected
    /// by the dispatcher before any network I/O.
    pub fn build(self) -> DispatchResult<OutboundMessage> {
        let from = self.from.ok_or_else(|| {
            DispatchError::malformed(DispatchErrorKind::InvalidAddress, "From address is required")
        })?;

        let content = match self.content {
            Some(content) => content,
            None => compose(&from, &self.recipients, self.subject.as_deref(), &self.headers, self.body.as_deref()),
        };

        Ok(OutboundMessage {
            from,
            recipients: self.recipients,
            content,
        })
    }
}

fn compose(
    from: &Address,
    recipients: &[Address],
    subject: Option<&str>,
    headers: &[(String, String)],
    body: Option<&str>,
) -> Vec<u8> {
    let domain = from.email.split_once('@').map(|(_, d)| d).unwrap_or("localhost");

    let mut out = String::new();
    out.push_str(&format!("From: {}\r\n", from.to_header()));
    if !recipients.is_empty() {
        let to = recipients
            .iter()
            .map(Address::to_header)
            .collect::<Vec<_>>()
            .join(", ");
        out.push_str(&format!("To: {}\r\n", to));
    }
    out.push_str(&format!("Subject: {}\r\n", subject.unwrap_or("")));
    out.push_str(&format!("Date: {}\r\n", Utc::now().to_rfc2822()));
    out.push_str(&format!("Message-ID: <{}@{}>\r\n", Uuid::new_v4(), domain));
    for (name, value) in headers {
        out.push_str(&format!("{}: {}\r\n", name, value));
    }
    out.push_str("MIME-Version: 1.0\r\n");
    out.push_str("Content-Type: text/plain; charset=utf-8\r\n");
    out.push_str("\r\n");

    let body = body.unwrap_or("");
    for line in body.lines() {
        out.push_str(line);
        out.push_str("\r\n");
    }

    out.into_bytes()
}

/// Relay acknowledgement of a delivered message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    /// Server-assigned queue ID (if the final reply carried one).
    pub server_id: Option<String>,
    /// Recipients the relay accepted.
    pub accepted: Vec<Address>,
    /// Recipients the relay refused.
    pub rejected: Vec<RejectedRecipient>,
    /// Final reply text.
    pub response: String,
}

impl DeliveryReceipt {
    /// Returns true if every recipient was accepted.
    pub fn is_complete(&self) -> bool {
        self.rejected.is_empty()
    }
}

/// A recipient that was refused by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedRecipient {
    /// The refused address.
    pub address: Address,
    /// SMTP reply code.
    pub code: u16,
    /// Reply text.
    pub message: String,
}
