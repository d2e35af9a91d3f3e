//! SMTP protocol implementation.
//!
//! Implements the subset of RFC 5321 commands and replies the relay session
//! needs, plus ESMTP capability parsing and DATA payload preparation.

use std::collections::HashSet;
use std::fmt;

use crate::auth::AuthMethod;
use crate::errors::{DispatchError, EnhancedStatusCode, DispatchResult};

/// SMTP commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmtpCommand {
    /// Extended HELLO with client identity.
    Ehlo(String),
    /// Basic HELLO.
    Helo(String),
    /// Start TLS negotiation.
    StartTls,
    /// Authenticate.
    Auth {
        /// Authentication mechanism.
        mechanism: String,
        /// Initial response (optional).
        initial_response: Option<String>,
    },
    /// MAIL FROM command.
    MailFrom {
        /// Sender address.
        address: String,
        /// SIZE parameter (optional).
        size: Option<usize>,
        /// 8BITMIME parameter.
        body_8bit: bool,
    },
    /// RCPT TO command.
    RcptTo {
        /// Recipient address.
        address: String,
    },
    /// DATA command.
    Data,
    /// Reset transaction.
    Rset,
    /// No operation (keepalive).
    Noop,
    /// Quit connection.
    Quit,
}

impl SmtpCommand {
    /// Formats the command for sending.
    pub fn to_smtp_string(&self) -> String {
        match self {
            SmtpCommand::Ehlo(domain) => format!("EHLO {}", domain),
            SmtpCommand::Helo(domain) => format!("HELO {}", domain),
            SmtpCommand::StartTls => "STARTTLS".to_string(),
            SmtpCommand::Auth {
                mechanism,
                initial_response,
            } => {
                if let Some(response) = initial_response {
                    format!("AUTH {} {}", mechanism, response)
                } else {
                    format!("AUTH {}", mechanism)
                }
            }
            SmtpCommand::MailFrom {
                address,
                size,
                body_8bit,
            } => {
                let mut cmd = format!("MAIL FROM:{}", address);
                if let Some(s) = size {
                    cmd.push_str(&format!(" SIZE={}", s));
                }
                if *body_8bit {
                    cmd.push_str(" BODY=8BITMIME");
                }
                cmd
            }
            SmtpCommand::RcptTo { address } => format!("RCPT TO:{}", address),
            SmtpCommand::Data => "DATA".to_string(),
            SmtpCommand::Rset => "RSET".to_string(),
            SmtpCommand::Noop => "NOOP".to_string(),
            SmtpCommand::Quit => "QUIT".to_string(),
        }
    }

    /// Rendering safe for logs (AUTH payloads elided).
    pub fn redacted(&self) -> String {
        match self {
            SmtpCommand::Auth { mechanism, .. } => format!("AUTH {} ***", mechanism),
            other => other.to_smtp_string(),
        }
    }
}

impl fmt::Display for SmtpCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.redacted())
    }
}

/// SMTP response from server.
#[derive(Debug, Clone)]
pub struct SmtpResponse {
    /// Status code (e.g., 250, 354, 550).
    pub code: u16,
    /// Enhanced status code (optional).
    pub enhanced_code: Option<EnhancedStatusCode>,
    /// Response message lines.
    pub message: Vec<String>,
    /// Whether this is a multiline response.
    pub is_multiline: bool,
}

impl SmtpResponse {
    /// Creates a new response.
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            enhanced_code: None,
            message: vec![message.into()],
            is_multiline: false,
        }
    }

    /// Parses a response from raw lines.
    pub fn parse(lines: &[String]) -> DispatchResult<Self> {
        if lines.is_empty() {
            return Err(DispatchError::protocol("Empty response"));
        }

        let mut messages = Vec::new();
        let mut code = 0u16;
        let mut enhanced_code = None;

        for (i, line) in lines.iter().enumerate() {
            let parsed_code: u16 = line
                .get(..3)
                .and_then(|c| c.parse().ok())
                .ok_or_else(|| DispatchError::protocol(format!("Invalid status code: {}", line)))?;

            if i == 0 {
                code = parsed_code;
            } else if parsed_code != code {
                return Err(DispatchError::protocol(
                    "Inconsistent status codes in multiline response",
                ));
            }

            let message = match line.get(4..) {
                Some(msg) if i == 0 => match Self::parse_enhanced_code(msg) {
                    Some((esc, rest)) => {
                        enhanced_code = Some(esc);
                        rest.trim().to_string()
                    }
                    None => msg.to_string(),
                },
                Some(msg) => msg.to_string(),
                None => String::new(),
            };

            messages.push(message);
        }

        Ok(Self {
            code,
            enhanced_code,
            message: messages,
            is_multiline: lines.len() > 1,
        })
    }

    fn parse_enhanced_code(msg: &str) -> Option<(EnhancedStatusCode, &str)> {
        // Format: X.Y.Z rest
        let (head, rest) = match msg.split_once(' ') {
            Some((head, rest)) => (head, rest),
            None => (msg, ""),
        };
        let code = EnhancedStatusCode::parse(head)?;
        Some((code, rest))
    }

    /// Returns true if this is a success response (2xx).
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// Returns true if this is a positive intermediate response (3xx).
    pub fn is_intermediate(&self) -> bool {
        (300..400).contains(&self.code)
    }

    /// Returns true if this is a temporary failure (4xx).
    pub fn is_temporary_failure(&self) -> bool {
        (400..500).contains(&self.code)
    }

    /// Returns true if this is a permanent failure (5xx).
    pub fn is_permanent_failure(&self) -> bool {
        (500..600).contains(&self.code)
    }

    /// Returns the first message line.
    pub fn first_message(&self) -> &str {
        self.message.first().map(|s| s.as_str()).unwrap_or("")
    }

    /// Returns all message lines joined.
    pub fn full_message(&self) -> String {
        self.message.join("\n")
    }

    /// Best-effort queue id from a final DATA reply (e.g. `250 2.0.0 Ok: queued as 4F2A`).
    pub fn queue_id(&self) -> Option<String> {
        let text = self.first_message();
        if let Some(idx) = text.find("queued as ") {
            return text[idx + "queued as ".len()..]
                .split_whitespace()
                .next()
                .map(|id| id.trim_end_matches(|c: char| !c.is_alphanumeric()).to_string())
                .filter(|id| !id.is_empty());
        }
        None
    }

    /// Converts to an error if not successful.
    pub fn to_error(&self) -> DispatchError {
        let mut err = DispatchError::from_smtp_response(self.code, self.full_message());
        if let Some(enhanced) = &self.enhanced_code {
            err = err.with_enhanced_code(enhanced.clone());
        }
        err
    }
}

impl fmt::Display for SmtpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.first_message())
    }
}

/// ESMTP server capabilities.
#[derive(Debug, Clone, Default)]
pub struct EsmtpCapabilities {
    /// Maximum message size.
    pub size: Option<usize>,
    /// Supported authentication mechanisms.
    pub auth_mechanisms: HashSet<AuthMethod>,
    /// STARTTLS supported.
    pub starttls: bool,
    /// 8BITMIME supported.
    pub eight_bit_mime: bool,
    /// PIPELINING supported.
    pub pipelining: bool,
    /// Enhanced status codes supported.
    pub enhanced_status_codes: bool,
    /// Raw capability strings.
    pub raw: Vec<String>,
}

impl EsmtpCapabilities {
    /// Parses capabilities from EHLO response.
    ///
    /// The first line is the server greeting and carries no capability.
    pub fn from_ehlo_response(response: &SmtpResponse) -> Self {
        let mut caps = Self::default();

        for line in response.message.iter().skip(1) {
            let line = line.trim().to_uppercase();
            caps.raw.push(line.clone());

            let (capability, params) = match line.split_once(|c| c == ' ' || c == '=') {
                Some((cap, params)) => (cap, params),
                None => (line.as_str(), ""),
            };

            match capability {
                "SIZE" => {
                    caps.size = params.trim().parse().ok().filter(|s| *s > 0);
                }
                "AUTH" => {
                    for mech in params.split_whitespace() {
                        if let Some(method) = AuthMethod::from_capability(mech) {
                            caps.auth_mechanisms.insert(method);
                        }
                    }
                }
                "STARTTLS" => caps.starttls = true,
                "8BITMIME" => caps.eight_bit_mime = true,
                "PIPELINING" => caps.pipelining = true,
                "ENHANCEDSTATUSCODES" => caps.enhanced_status_codes = true,
                _ => {}
            }
        }

        caps
    }

    /// Returns true if authentication is available.
    pub fn has_auth(&self) -> bool {
        !self.auth_mechanisms.is_empty()
    }

    /// Checks if a specific capability is supported.
    pub fn has_capability(&self, name: &str) -> bool {
        let upper = name.to_uppercase();
        self.raw.iter().any(|c| c.starts_with(&upper))
    }
}

/// Relay session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Socket open, greeting not yet read.
    Initial,
    /// Connected, received server greeting.
    Connected,
    /// EHLO/HELO accepted.
    Greeted,
    /// Authenticated.
    Authenticated,
    /// In mail transaction (after MAIL FROM).
    InTransaction,
    /// Recipients added (after RCPT TO).
    RecipientsAdded,
    /// Sending data (after DATA).
    SendingData,
    /// Transaction complete.
    Complete,
    /// Connection closed.
    Closed,
}

impl TransactionState {
    /// Returns true if MAIL FROM is allowed in this state.
    pub fn can_start_mail(&self) -> bool {
        matches!(
            self,
            TransactionState::Greeted | TransactionState::Authenticated | TransactionState::Complete
        )
    }

    /// Returns true if the session is usable at all.
    pub fn is_open(&self) -> bool {
        !matches!(self, TransactionState::Closed)
    }
}

/// Prepares message content for the DATA phase.
///
/// Normalizes bare LF line endings to CRLF, doubles any leading dot, and
/// appends the `<CRLF>.<CRLF>` terminator.
pub fn prepare_data_content(content: &[u8]) -> Vec<u8> {
    let mut output = Vec::with_capacity(content.len() + 64);
    let mut at_line_start = true;
    let mut prev = 0u8;

    for &byte in content {
        if at_line_start && byte == b'.' {
            output.push(b'.');
        }

        if byte == b'\n' && prev != b'\r' {
            output.push(b'\r');
        }

        output.push(byte);
        at_line_start = byte == b'\n';
        prev = byte;
    }

    if !output.is_empty() && !output.ends_with(b"\r\n") {
        output.extend_from_slice(b"\r\n");
    }

    output.extend_from_slice(b".\r\n");
    output
}

/// Response codes for common SMTP operations.
pub mod codes {
    /// Service ready.
    pub const SERVICE_READY: u16 = 220;
    /// Service closing.
    pub const SERVICE_CLOSING: u16 = 221;
    /// Authentication successful.
    pub const AUTH_SUCCESS: u16 = 235;
    /// OK.
    pub const OK: u16 = 250;
    /// User not local; will forward.
    pub const WILL_FORWARD: u16 = 251;
    /// Continue (AUTH).
    pub const AUTH_CONTINUE: u16 = 334;
    /// Start mail input.
    pub const START_MAIL_INPUT: u16 = 354;
    /// Service unavailable.
    pub const SERVICE_UNAVAILABLE: u16 = 421;
    /// Syntax error.
    pub const SYNTAX_ERROR: u16 = 500;
    /// Command not implemented.
    pub const NOT_IMPLEMENTED: u16 = 502;
    /// Authentication failed.
    pub const AUTH_FAILED: u16 = 535;
    /// Mailbox unavailable (permanent).
    pub const MAILBOX_UNAVAILABLE: u16 = 550;
}
