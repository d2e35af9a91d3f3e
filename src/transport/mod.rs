//! Transport layer for relay connections.
//!
//! Provides an abstraction over a TCP stream with optional TLS, so the relay
//! session can be driven against a scripted transport in tests.

use async_trait::async_trait;
use std::fmt;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::config::{DispatchConfig, TlsConfig, TlsMode};
use crate::errors::{DispatchError, DispatchErrorKind, DispatchResult};
use crate::protocol::{EsmtpCapabilities, SmtpCommand, SmtpResponse, TransactionState};

/// Trait for SMTP transport abstraction.
#[async_trait]
pub trait SmtpTransport: Send + Sync + fmt::Debug {
    /// Sends a command and receives a response.
    async fn send_command(&mut self, command: &SmtpCommand) -> DispatchResult<SmtpResponse>;

    /// Sends raw data (for DATA command body).
    async fn send_data(&mut self, data: &[u8]) -> DispatchResult<()>;

    /// Reads a response from the server.
    async fn read_response(&mut self) -> DispatchResult<SmtpResponse>;

    /// Upgrades the connection to TLS.
    async fn upgrade_tls(&mut self, config: &TlsConfig, server_name: &str) -> DispatchResult<()>;

    /// Returns true if TLS is enabled.
    fn is_tls(&self) -> bool;

    /// Sends QUIT and expects the closing reply.
    async fn close(&mut self) -> DispatchResult<()>;

    /// Drops the stream without a protocol goodbye.
    async fn abort(&mut self);

    /// Returns the current transaction state.
    fn state(&self) -> TransactionState;

    /// Sets the transaction state.
    fn set_state(&mut self, state: TransactionState);

    /// Returns the server capabilities.
    fn capabilities(&self) -> Option<&EsmtpCapabilities>;

    /// Sets the server capabilities.
    fn set_capabilities(&mut self, caps: EsmtpCapabilities);
}

/// TLS client settings loaded from a [`TlsConfig`].
///
/// Loading reads the configured CA and client identity files, so a bad path
/// is reported once, before any connection is attempted.
#[derive(Clone)]
pub struct TlsClient {
    #[cfg(feature = "rustls-tls")]
    inner: std::sync::Arc<rustls::ClientConfig>,
}

impl TlsClient {
    /// Builds the client settings.
    pub fn load(config: &TlsConfig) -> DispatchResult<Self> {
        #[cfg(feature = "rustls-tls")]
        {
            Ok(Self {
                inner: std::sync::Arc::new(tls::client_config(config)?),
            })
        }

        #[cfg(not(feature = "rustls-tls"))]
        {
            let _ = config;
            Err(DispatchError::configuration("No TLS implementation available"))
        }
    }
}

impl fmt::Debug for TlsClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsClient").finish_non_exhaustive()
    }
}

/// TCP connection with optional TLS.
pub struct TcpTransport {
    stream: TransportStream,
    tls_client: Option<TlsClient>,
    command_timeout: Duration,
    handshake_timeout: Duration,
    state: TransactionState,
    capabilities: Option<EsmtpCapabilities>,
    tls_enabled: bool,
    host: String,
}

/// Stream type that can be plain TCP or TLS.
enum TransportStream {
    Closed,
    Plain(BufReader<TcpStream>),
    #[cfg(feature = "rustls-tls")]
    Tls(BufReader<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpTransport")
            .field("host", &self.host)
            .field("tls_enabled", &self.tls_enabled)
            .field("state", &self.state)
            .finish()
    }
}

impl TcpTransport {
    /// Opens a TCP connection to the relay.
    ///
    /// With implicit TLS the handshake completes here, before the greeting
    /// is read. The greeting itself is left for the session to consume.
    pub async fn connect(config: &DispatchConfig) -> DispatchResult<Self> {
        Self::connect_with(config, None).await
    }

    /// Like [`connect`](Self::connect), reusing already loaded TLS settings
    /// for the implicit TLS handshake and any later STARTTLS upgrade.
    pub async fn connect_with(
        config: &DispatchConfig,
        tls_client: Option<TlsClient>,
    ) -> DispatchResult<Self> {
        let address = config.address();

        let stream = timeout(config.connect_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| {
                DispatchError::timeout(
                    DispatchErrorKind::ConnectTimeout,
                    format!("Connect to {} timed out", address),
                )
            })?
            .map_err(|e| Self::map_io_error(e, &address))?;

        stream.set_nodelay(true).ok();

        debug!(address = %address, "Relay TCP connection established");

        let mut transport = Self {
            stream: TransportStream::Plain(BufReader::new(stream)),
            tls_client,
            command_timeout: config.command_timeout,
            handshake_timeout: config.connect_timeout,
            state: TransactionState::Initial,
            capabilities: None,
            tls_enabled: false,
            host: config.relay_host.clone(),
        };

        if config.tls_mode()? == TlsMode::Implicit {
            transport
                .upgrade_tls(&config.tls, config.tls_server_name())
                .await?;
        }

        Ok(transport)
    }

    fn map_io_error(error: io::Error, address: &str) -> DispatchError {
        let kind = match error.kind() {
            io::ErrorKind::ConnectionRefused => DispatchErrorKind::ConnectionRefused,
            io::ErrorKind::TimedOut => DispatchErrorKind::ConnectTimeout,
            io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => {
                DispatchErrorKind::ConnectionReset
            }
            _ => DispatchErrorKind::ConnectionRefused,
        };
        DispatchError::new(kind, format!("Cannot connect to {}: {}", address, error)).with_cause(error)
    }

    fn map_stream_error(error: io::Error, what: &str) -> DispatchError {
        let kind = match error.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => DispatchErrorKind::ConnectionReset,
            io::ErrorKind::InvalidData => DispatchErrorKind::InvalidResponse,
            _ => DispatchErrorKind::Io,
        };
        DispatchError::new(kind, format!("{} error: {}", what, error)).with_cause(error)
    }

    fn closed_error() -> DispatchError {
        DispatchError::new(DispatchErrorKind::ConnectionReset, "Connection already closed")
    }

    /// Reads lines until we have a complete response.
    async fn read_response_inner<R: AsyncBufReadExt + Unpin>(
        reader: &mut R,
        timeout_duration: Duration,
    ) -> DispatchResult<SmtpResponse> {
        let mut lines = Vec::new();

        loop {
            let mut line = String::new();

            let read = timeout(timeout_duration, reader.read_line(&mut line))
                .await
                .map_err(|_| DispatchError::timeout(DispatchErrorKind::ReadTimeout, "Read timed out"))?
                .map_err(|e| Self::map_stream_error(e, "Read"))?;

            if read == 0 {
                return Err(DispatchError::new(
                    DispatchErrorKind::ConnectionReset,
                    "Server closed connection",
                ));
            }

            let line = line.trim_end().to_string();

            // Continuation lines carry a hyphen after the code.
            let is_continuation = line.as_bytes().get(3) == Some(&b'-');
            lines.push(line);

            if !is_continuation {
                break;
            }
        }

        SmtpResponse::parse(&lines)
    }

    async fn write_all<W: AsyncWrite + Unpin>(
        writer: &mut W,
        data: &[u8],
        timeout_duration: Duration,
    ) -> DispatchResult<()> {
        timeout(timeout_duration, writer.write_all(data))
            .await
            .map_err(|_| DispatchError::timeout(DispatchErrorKind::WriteTimeout, "Write timed out"))?
            .map_err(|e| Self::map_stream_error(e, "Write"))?;

        timeout(timeout_duration, writer.flush())
            .await
            .map_err(|_| DispatchError::timeout(DispatchErrorKind::WriteTimeout, "Flush timed out"))?
            .map_err(|e| Self::map_stream_error(e, "Flush"))?;

        Ok(())
    }
}

#[async_trait]
impl SmtpTransport for TcpTransport {
    async fn send_command(&mut self, command: &SmtpCommand) -> DispatchResult<SmtpResponse> {
        let cmd_str = format!("{}\r\n", command.to_smtp_string());

        debug!(command = %command, "Sending SMTP command");

        self.send_data(cmd_str.as_bytes()).await?;
        self.read_response().await
    }

    async fn send_data(&mut self, data: &[u8]) -> DispatchResult<()> {
        match &mut self.stream {
            TransportStream::Closed => return Err(Self::closed_error()),
            TransportStream::Plain(stream) => {
                Self::write_all(stream.get_mut(), data, self.command_timeout).await?;
            }
            #[cfg(feature = "rustls-tls")]
            TransportStream::Tls(stream) => {
                Self::write_all(stream.get_mut(), data, self.command_timeout).await?;
            }
        }
        Ok(())
    }

    async fn read_response(&mut self) -> DispatchResult<SmtpResponse> {
        let response = match &mut self.stream {
            TransportStream::Closed => return Err(Self::closed_error()),
            TransportStream::Plain(stream) => {
                Self::read_response_inner(stream, self.command_timeout).await?
            }
            #[cfg(feature = "rustls-tls")]
            TransportStream::Tls(stream) => {
                Self::read_response_inner(stream, self.command_timeout).await?
            }
        };

        debug!(code = response.code, message = %response.first_message(), "Received SMTP response");

        Ok(response)
    }

    async fn upgrade_tls(&mut self, config: &TlsConfig, server_name: &str) -> DispatchResult<()> {
        if self.tls_enabled {
            return Ok(());
        }

        #[cfg(feature = "rustls-tls")]
        {
            use rustls::pki_types::ServerName;

            let client = match &self.tls_client {
                Some(client) => client.clone(),
                None => TlsClient::load(config)?,
            };
            let connector = tokio_rustls::TlsConnector::from(client.inner);
            let name = ServerName::try_from(server_name.to_string())
                .map_err(|_| DispatchError::tls(format!("Invalid server name: {}", server_name)))?;

            let tcp_stream = match std::mem::replace(&mut self.stream, TransportStream::Closed) {
                TransportStream::Plain(reader) => reader.into_inner(),
                TransportStream::Closed => return Err(Self::closed_error()),
                other => {
                    self.stream = other;
                    return Err(DispatchError::tls("Already using TLS"));
                }
            };

            let tls_stream = timeout(self.handshake_timeout, connector.connect(name, tcp_stream))
                .await
                .map_err(|_| {
                    DispatchError::timeout(DispatchErrorKind::ConnectTimeout, "TLS handshake timed out")
                })?
                .map_err(|e| DispatchError::tls(format!("TLS handshake failed: {}", e)).with_cause(e))?;

            self.stream = TransportStream::Tls(BufReader::new(tls_stream));
            self.tls_enabled = true;

            debug!(host = %self.host, "TLS established");

            Ok(())
        }

        #[cfg(not(feature = "rustls-tls"))]
        {
            let _ = (&self.tls_client, config, server_name);
            Err(DispatchError::configuration("No TLS implementation available"))
        }
    }

    fn is_tls(&self) -> bool {
        self.tls_enabled
    }

    async fn close(&mut self) -> DispatchResult<()> {
        if self.state == TransactionState::Closed {
            return Ok(());
        }

        let response = self.send_command(&SmtpCommand::Quit).await?;
        if !response.is_success() {
            return Err(response.to_error());
        }

        self.stream = TransportStream::Closed;
        self.state = TransactionState::Closed;
        Ok(())
    }

    async fn abort(&mut self) {
        match std::mem::replace(&mut self.stream, TransportStream::Closed) {
            TransportStream::Closed => {}
            TransportStream::Plain(mut stream) => {
                let _ = stream.get_mut().shutdown().await;
            }
            #[cfg(feature = "rustls-tls")]
            TransportStream::Tls(mut stream) => {
                // Skip the TLS close_notify; only the socket matters here.
                let _ = stream.get_mut().get_mut().0.shutdown().await;
            }
        }
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

#[cfg(feature = "rustls-tls")]
mod tls {
    use std::fs::File;
    use std::io::BufReader;
    use std::path::Path;

    use rustls::pki_types::{CertificateDer, PrivateKeyDer};

    use crate::config::TlsConfig;
    use crate::errors::{DispatchError, DispatchResult};

    /// Builds the rustls client configuration.
    ///
    /// Trust is the bundled webpki roots plus any configured CA file; a client
    /// identity is presented when both certificate and key are configured.
    pub(super) fn client_config(config: &TlsConfig) -> DispatchResult<rustls::ClientConfig> {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        if let Some(path) = &config.ca_cert_path {
            for cert in load_certs(path)? {
                root_store.add(cert).map_err(|e| {
                    DispatchError::configuration(format!("Invalid CA certificate in {}: {}", path.display(), e))
                })?;
            }
        }

        let builder = rustls::ClientConfig::builder().with_root_certificates(root_store);

        match (&config.client_cert_path, &config.client_key_path) {
            (Some(cert_path), Some(key_path)) => {
                let certs = load_certs(cert_path)?;
                let key = load_key(key_path)?;
                builder.with_client_auth_cert(certs, key).map_err(|e| {
                    DispatchError::configuration(format!("Invalid client identity: {}", e))
                })
            }
            _ => Ok(builder.with_no_client_auth()),
        }
    }

    fn open(path: &Path) -> DispatchResult<BufReader<File>> {
        let file = File::open(path).map_err(|e| {
            DispatchError::configuration(format!("Cannot open {}: {}", path.display(), e)).with_cause(e)
        })?;
        Ok(BufReader::new(file))
    }

    fn load_certs(path: &Path) -> DispatchResult<Vec<CertificateDer<'static>>> {
        let mut reader = open(path)?;
        let certs = rustls_pemfile::certs(&mut reader)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| {
                DispatchError::configuration(format!("Invalid PEM in {}: {}", path.display(), e))
            })?;

        if certs.is_empty() {
            return Err(DispatchError::configuration(format!(
                "No certificates found in {}",
                path.display()
            )));
        }
        Ok(certs)
    }

    fn load_key(path: &Path) -> DispatchResult<PrivateKeyDer<'static>> {
        let mut reader = open(path)?;
        rustls_pemfile::private_key(&mut reader)
            .map_err(|e| {
                DispatchError::configuration(format!("Invalid PEM in {}: {}", path.display(), e))
            })?
            .ok_or_else(|| {
                DispatchError::configuration(format!("No private key found in {}", path.display()))
            })
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_default_client_config() {
            assert!(client_config(&TlsConfig::default()).is_ok());
        }

        #[test]
        fn test_missing_ca_file() {
            let config = TlsConfig {
                ca_cert_path: Some("/nonexistent/ca.pem".into()),
                ..Default::default()
            };
            let err = client_config(&config).unwrap_err();
            assert!(err.message().contains("/nonexistent/ca.pem"));
        }

        #[test]
        fn test_tls_client_load_reports_missing_identity() {
            let config = TlsConfig {
                client_cert_path: Some("/nonexistent/client.pem".into()),
                client_key_path: Some("/nonexistent/client.key".into()),
                ..Default::default()
            };
            let err = crate::transport::TlsClient::load(&config).unwrap_err();
            assert_eq!(err.kind(), crate::errors::DispatchErrorKind::ConfigurationInvalid);
            assert!(!err.is_retryable());
        }
    }
}
