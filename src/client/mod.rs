//! Relay connections.
//!
//! A [`RelayConnector`] opens one authenticated session to the configured
//! relay; the resulting [`RelayConnection`] delivers messages one at a time
//! until it is closed. [`SmtpConnector`] is the production implementation,
//! driving a [`RelaySession`] over a [`TcpTransport`]:
//! - Implicit TLS or STARTTLS negotiation
//! - EHLO with HELO fallback
//! - CRAM-MD5, PLAIN and LOGIN authentication
//! - Per-message MAIL/RCPT/DATA transactions with RSET recovery

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::auth::{AuthMethod, Authenticator, Credentials};
use crate::config::{DispatchConfig, TlsMode};
use crate::errors::{DispatchError, DispatchErrorKind, DispatchResult};
use crate::observability::{DispatchMetrics, Timer};
use crate::protocol::{codes, prepare_data_content, EsmtpCapabilities, SmtpCommand, SmtpResponse, TransactionState};
use crate::transport::{SmtpTransport, TcpTransport, TlsClient};
use crate::types::{DeliveryReceipt, OutboundMessage, RejectedRecipient};

/// A live, ready-to-send relay session.
#[async_trait]
pub trait RelayConnection: Send + fmt::Debug {
    /// Submits one message.
    ///
    /// Failures are returned, never raised past the caller; the session stays
    /// usable for the next message when the relay allows it.
    async fn deliver(&mut self, message: &OutboundMessage) -> DispatchResult<DeliveryReceipt>;

    /// Ends the session. Never fails; teardown problems are logged.
    async fn close(&mut self);
}

/// Opens relay sessions.
#[async_trait]
pub trait RelayConnector: Send + Sync + fmt::Debug {
    /// Connects, negotiates transport security and authenticates.
    async fn open(&self) -> DispatchResult<Box<dyn RelayConnection>>;
}

/// Connector for a real SMTP relay over TCP.
#[derive(Debug, Clone)]
pub struct SmtpConnector {
    config: Arc<DispatchConfig>,
    tls: Option<TlsClient>,
    metrics: Arc<DispatchMetrics>,
}

impl SmtpConnector {
    /// Creates a connector.
    ///
    /// Fails on an invalid configuration (including both TLS modes enabled)
    /// before any network activity. When TLS is configured, the CA and client
    /// identity files are loaded here.
    pub fn new(config: DispatchConfig) -> DispatchResult<Self> {
        config.validate()?;
        let tls = if config.tls_mode()?.is_encrypted() {
            Some(TlsClient::load(&config.tls)?)
        } else {
            None
        };
        Ok(Self {
            config: Arc::new(config),
            tls,
            metrics: Arc::new(DispatchMetrics::new()),
        })
    }

    /// Shares a metrics collector with other components.
    pub fn with_metrics(mut self, metrics: Arc<DispatchMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Returns the configuration.
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }
}

#[async_trait]
impl RelayConnector for SmtpConnector {
    async fn open(&self) -> DispatchResult<Box<dyn RelayConnection>> {
        let timer = Timer::start("relay_open");

        let transport = match TcpTransport::connect_with(&self.config, self.tls.clone()).await {
            Ok(transport) => transport,
            Err(e) => {
                self.metrics.record_connection_attempt(false);
                return Err(e);
            }
        };

        let session =
            RelaySession::establish(transport, self.config.clone(), self.metrics.clone()).await;
        self.metrics.record_connection_attempt(session.is_ok());

        let session = session?;
        debug!(
            relay = %self.config.address(),
            tls = session.transport().is_tls(),
            elapsed_ms = timer.stop().as_millis() as u64,
            "Relay session ready"
        );
        Ok(Box::new(session))
    }
}

/// SMTP session state machine over any transport.
pub struct RelaySession<T: SmtpTransport> {
    transport: T,
    config: Arc<DispatchConfig>,
    metrics: Arc<DispatchMetrics>,
}

impl<T: SmtpTransport> fmt::Debug for RelaySession<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelaySession")
            .field("relay", &self.config.address())
            .field("transport", &self.transport)
            .finish()
    }
}

impl<T: SmtpTransport> RelaySession<T> {
    /// Runs the opening handshake on a freshly connected transport.
    ///
    /// Reads the greeting, identifies, upgrades with STARTTLS when configured
    /// and authenticates when credentials are present. On failure the
    /// transport is aborted and the error returned.
    pub async fn establish(
        transport: T,
        config: Arc<DispatchConfig>,
        metrics: Arc<DispatchMetrics>,
    ) -> DispatchResult<Self> {
        let mut session = Self {
            transport,
            config,
            metrics,
        };

        if let Err(e) = session.handshake().await {
            debug!(error = %e, "Relay handshake failed");
            session.transport.abort().await;
            return Err(e);
        }

        Ok(session)
    }

    /// Returns the underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    async fn handshake(&mut self) -> DispatchResult<()> {
        let tls_mode = self.config.tls_mode()?;

        let greeting = self.transport.read_response().await?;
        if greeting.code != codes::SERVICE_READY {
            return Err(greeting.to_error().with_kind(DispatchErrorKind::GreetingRejected));
        }
        self.transport.set_state(TransactionState::Connected);

        self.identify().await?;

        if tls_mode == TlsMode::StartTls && !self.transport.is_tls() {
            self.starttls().await?;
        }

        if let Some(credentials) = Credentials::from_config(&self.config) {
            let result = self.authenticate(&credentials).await;
            self.metrics.record_auth_attempt(result.is_ok());
            result?;
        }

        Ok(())
    }

    async fn identify(&mut self) -> DispatchResult<()> {
        let client_id = self.config.client_id().to_string();

        let response = self
            .transport
            .send_command(&SmtpCommand::Ehlo(client_id.clone()))
            .await?;

        let capabilities = if response.is_success() {
            EsmtpCapabilities::from_ehlo_response(&response)
        } else {
            debug!(code = response.code, "EHLO refused, falling back to HELO");
            let response = self.transport.send_command(&SmtpCommand::Helo(client_id)).await?;
            if !response.is_success() {
                return Err(response.to_error().with_kind(DispatchErrorKind::GreetingRejected));
            }
            EsmtpCapabilities::default()
        };

        self.transport.set_capabilities(capabilities);
        self.transport.set_state(TransactionState::Greeted);
        Ok(())
    }

    async fn starttls(&mut self) -> DispatchResult<()> {
        let advertised = self.transport.capabilities().map_or(false, |c| c.starttls);
        if !advertised {
            return Err(DispatchError::new(
                DispatchErrorKind::StarttlsNotSupported,
                format!("Relay {} does not advertise STARTTLS", self.config.address()),
            ));
        }

        let response = self.transport.send_command(&SmtpCommand::StartTls).await?;
        if !response.is_success() {
            return Err(response.to_error().with_kind(DispatchErrorKind::StarttlsNotSupported));
        }

        self.transport
            .upgrade_tls(&self.config.tls, self.config.tls_server_name())
            .await?;
        self.metrics.record_tls_upgrade();

        // Capabilities learned before the upgrade are void.
        self.identify().await
    }

    async fn authenticate(&mut self, credentials: &Credentials) -> DispatchResult<()> {
        let available: Vec<AuthMethod> = self
            .transport
            .capabilities()
            .map(|c| c.auth_mechanisms.iter().copied().collect())
            .unwrap_or_default();

        if available.is_empty() {
            return Err(DispatchError::new(
                DispatchErrorKind::AuthMethodNotSupported,
                "Relay does not advertise any AUTH mechanism",
            ));
        }

        let method = Authenticator::select_best_method(
            &available,
            self.transport.is_tls(),
            self.config.allow_plaintext_auth,
        )?;

        debug!(method = %method, username = credentials.username(), "Authenticating");

        match method {
            AuthMethod::Plain => self.auth_plain(credentials).await?,
            AuthMethod::Login => self.auth_login(credentials).await?,
            AuthMethod::CramMd5 => self.auth_cram_md5(credentials).await?,
        }

        self.transport.set_state(TransactionState::Authenticated);
        Ok(())
    }

    async fn auth_plain(&mut self, credentials: &Credentials) -> DispatchResult<()> {
        let initial_response =
            Authenticator::plain_initial_response(credentials.username(), credentials.password());
        let command = SmtpCommand::Auth {
            mechanism: AuthMethod::Plain.mechanism_name().to_string(),
            initial_response: Some(initial_response),
        };

        let response = self.transport.send_command(&command).await?;
        expect_auth_success(&response)
    }

    async fn auth_login(&mut self, credentials: &Credentials) -> DispatchResult<()> {
        let command = SmtpCommand::Auth {
            mechanism: AuthMethod::Login.mechanism_name().to_string(),
            initial_response: None,
        };

        let response = self.transport.send_command(&command).await?;
        expect_auth_continue(&response)?;

        let username = Authenticator::login_username(credentials.username());
        self.transport.send_data(format!("{}\r\n", username).as_bytes()).await?;
        let response = self.transport.read_response().await?;
        expect_auth_continue(&response)?;

        let password = Authenticator::login_password(credentials.password());
        self.transport.send_data(format!("{}\r\n", password).as_bytes()).await?;
        let response = self.transport.read_response().await?;
        expect_auth_success(&response)
    }

    async fn auth_cram_md5(&mut self, credentials: &Credentials) -> DispatchResult<()> {
        let command = SmtpCommand::Auth {
            mechanism: AuthMethod::CramMd5.mechanism_name().to_string(),
            initial_response: None,
        };

        let response = self.transport.send_command(&command).await?;
        expect_auth_continue(&response)?;

        let answer = Authenticator::cram_md5_response(
            response.first_message(),
            credentials.username(),
            credentials.password(),
        )?;
        self.transport.send_data(format!("{}\r\n", answer).as_bytes()).await?;

        let response = self.transport.read_response().await?;
        expect_auth_success(&response)
    }

    async fn transaction(&mut self, message: &OutboundMessage) -> DispatchResult<DeliveryReceipt> {
        if !self.transport.state().can_start_mail() {
            return Err(DispatchError::new(
                DispatchErrorKind::ConnectionReset,
                format!("Relay session not ready ({:?})", self.transport.state()),
            ));
        }

        let data = prepare_data_content(&message.content);
        let (size_limit, eight_bit) = self
            .transport
            .capabilities()
            .map(|c| (c.size, c.eight_bit_mime))
            .unwrap_or((None, false));

        if let Some(limit) = size_limit {
            if data.len() > limit {
                return Err(DispatchError::new(
                    DispatchErrorKind::DataRejected,
                    format!("Message of {} bytes exceeds relay limit of {}", data.len(), limit),
                ));
            }
        }

        let mail_from = SmtpCommand::MailFrom {
            address: message.from.to_smtp(),
            size: size_limit.map(|_| data.len()),
            body_8bit: eight_bit && !message.content.is_ascii(),
        };

        let response = self.transport.send_command(&mail_from).await?;
        if !response.is_success() {
            return Err(relabel(response.to_error(), DispatchErrorKind::SenderRejected));
        }
        self.transport.set_state(TransactionState::InTransaction);

        let mut accepted = Vec::new();
        let mut rejected = Vec::new();

        for recipient in &message.recipients {
            let rcpt_to = SmtpCommand::RcptTo {
                address: recipient.to_smtp(),
            };

            let response = self.transport.send_command(&rcpt_to).await?;
            if response.is_success() {
                accepted.push(recipient.clone());
            } else if response.code == codes::SERVICE_UNAVAILABLE {
                return Err(response.to_error());
            } else {
                rejected.push(RejectedRecipient {
                    address: recipient.clone(),
                    code: response.code,
                    message: response.full_message(),
                });
            }
        }

        if accepted.is_empty() {
            let summary = rejected
                .iter()
                .map(|r| format!("{} ({} {})", r.address.email, r.code, r.message))
                .collect::<Vec<_>>()
                .join("; ");
            let mut err = DispatchError::new(
                DispatchErrorKind::RecipientsRejected,
                format!("All recipients were refused: {}", summary),
            );
            if let Some(last) = rejected.last() {
                err = err.with_smtp_code(last.code);
            }
            return Err(err);
        }
        self.transport.set_state(TransactionState::RecipientsAdded);

        let response = self.transport.send_command(&SmtpCommand::Data).await?;
        if response.code != codes::START_MAIL_INPUT {
            return Err(relabel(response.to_error(), DispatchErrorKind::DataRejected));
        }
        self.transport.set_state(TransactionState::SendingData);

        self.transport.send_data(&data).await?;

        let response = self.transport.read_response().await?;
        self.transport.set_state(TransactionState::Complete);

        if !response.is_success() {
            return Err(relabel(response.to_error(), DispatchErrorKind::DataRejected));
        }

        if !rejected.is_empty() {
            warn!(
                from = %message.from.email,
                accepted = accepted.len(),
                refused = rejected.len(),
                "Relay refused some recipients"
            );
        }

        Ok(DeliveryReceipt {
            server_id: response.queue_id(),
            accepted,
            rejected,
            response: response.full_message(),
        })
    }

    async fn recover(&mut self, error: &DispatchError) {
        if !self.transport.state().is_open() {
            return;
        }

        if session_is_broken(error) {
            debug!(error = %error, "Relay session unusable, dropping it");
            self.transport.abort().await;
            return;
        }

        match self.transport.send_command(&SmtpCommand::Rset).await {
            Ok(response) if response.is_success() => {
                self.transport.set_state(TransactionState::Complete);
            }
            Ok(response) => {
                debug!(code = response.code, "RSET refused");
                self.transport.set_state(TransactionState::Complete);
            }
            Err(e) => {
                debug!(error = %e, "RSET failed, dropping session");
                self.transport.abort().await;
            }
        }
    }
}

#[async_trait]
impl<T: SmtpTransport + 'static> RelayConnection for RelaySession<T> {
    async fn deliver(&mut self, message: &OutboundMessage) -> DispatchResult<DeliveryReceipt> {
        match self.transaction(message).await {
            Ok(receipt) => Ok(receipt),
            Err(e) => {
                self.recover(&e).await;
                Err(e)
            }
        }
    }

    async fn close(&mut self) {
        if !self.transport.state().is_open() {
            return;
        }

        if let Err(e) = self.transport.close().await {
            debug!(error = %e, "QUIT failed, forcing connection shutdown");
            self.transport.abort().await;
        }
    }
}

/// Keeps specific relay-reply kinds, otherwise assigns `kind`.
fn relabel(error: DispatchError, kind: DispatchErrorKind) -> DispatchError {
    match error.kind() {
        DispatchErrorKind::UnexpectedResponse | DispatchErrorKind::InvalidResponse => error.with_kind(kind),
        _ => error,
    }
}

fn session_is_broken(error: &DispatchError) -> bool {
    matches!(
        error.kind(),
        DispatchErrorKind::ConnectionReset
            | DispatchErrorKind::ReadTimeout
            | DispatchErrorKind::WriteTimeout
            | DispatchErrorKind::Io
            | DispatchErrorKind::ServerShutdown
    )
}

fn expect_auth_continue(response: &SmtpResponse) -> DispatchResult<()> {
    if response.code == codes::AUTH_CONTINUE {
        Ok(())
    } else {
        Err(response.to_error().with_kind(DispatchErrorKind::AuthenticationFailed))
    }
}

fn expect_auth_success(response: &SmtpResponse) -> DispatchResult<()> {
    if response.code == codes::AUTH_SUCCESS {
        Ok(())
    } else {
        Err(response.to_error().with_kind(DispatchErrorKind::AuthenticationFailed))
    }
}
