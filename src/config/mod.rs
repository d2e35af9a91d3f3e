//! Configuration types for the mail dispatcher.
//!
//! Provides configuration with builder pattern for:
//! - Relay connection settings
//! - Transport security (implicit TLS or STARTTLS, never both)
//! - Authentication credentials
//! - Retry ceiling and backoff tuning

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::attempt::RetryPolicy;
use crate::errors::{DispatchError, DispatchErrorKind, DispatchResult};

/// Default relay port (plain SMTP).
pub const DEFAULT_PORT: u16 = 25;

/// Default timeout for connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default timeout for commands.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Default number of retries after the first failed send.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Default delay before the first retry.
pub const DEFAULT_BACKOFF_STEP: Duration = Duration::from_secs(30);

/// Default multiplier between successive retry delays.
pub const DEFAULT_BACKOFF_BASE: f64 = 4.0;

/// Prefix of the environment variables read by [`DispatchConfig::from_env`].
pub const ENV_PREFIX: &str = "MAIL_RELAY_";

/// Transport security negotiated when opening a relay session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsMode {
    /// Plaintext session.
    None,
    /// Plaintext greeting, then STARTTLS upgrade and a second EHLO.
    StartTls,
    /// TLS from the first byte.
    Implicit,
}

impl TlsMode {
    /// Returns true if the session ends up encrypted.
    pub fn is_encrypted(&self) -> bool {
        !matches!(self, TlsMode::None)
    }
}

/// TLS material beyond the system trust store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Extra CA certificate bundle (PEM).
    #[serde(default)]
    pub ca_cert_path: Option<PathBuf>,
    /// Client certificate chain (PEM).
    #[serde(default)]
    pub client_cert_path: Option<PathBuf>,
    /// Client private key (PEM).
    #[serde(default)]
    pub client_key_path: Option<PathBuf>,
    /// Server Name Indication override.
    #[serde(default)]
    pub sni_override: Option<String>,
}

impl TlsConfig {
    /// Validates the TLS configuration.
    pub fn validate(&self) -> DispatchResult<()> {
        if self.client_cert_path.is_some() != self.client_key_path.is_some() {
            return Err(DispatchError::configuration(
                "client_cert_path and client_key_path must be set together",
            ));
        }
        Ok(())
    }
}

/// Retry ceiling and backoff tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries allowed after the first failed send.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry.
    #[serde(default = "default_backoff_step", with = "humantime_serde")]
    pub backoff_step: Duration,
    /// Multiplier applied per additional failure.
    #[serde(default = "default_backoff_base")]
    pub backoff_base: f64,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_backoff_step() -> Duration {
    DEFAULT_BACKOFF_STEP
}

fn default_backoff_base() -> f64 {
    DEFAULT_BACKOFF_BASE
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_step: default_backoff_step(),
            backoff_base: default_backoff_base(),
        }
    }
}

impl RetryConfig {
    /// Validates the retry configuration.
    pub fn validate(&self) -> DispatchResult<()> {
        if !self.backoff_base.is_finite() || self.backoff_base <= 0.0 {
            return Err(DispatchError::configuration(
                "backoff_base must be a positive finite number",
            ));
        }
        Ok(())
    }
}

/// Mail dispatcher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Relay hostname.
    pub relay_host: String,
    /// Relay port.
    #[serde(default = "default_port")]
    pub relay_port: u16,
    /// Authentication username.
    #[serde(default)]
    pub username: Option<String>,
    /// Authentication password (never serialized).
    #[serde(default, skip_serializing)]
    pub password: Option<SecretString>,
    /// Encrypt from the first byte.
    #[serde(default)]
    pub use_implicit_tls: bool,
    /// Upgrade a plaintext session with STARTTLS.
    #[serde(default)]
    pub use_starttls: bool,
    /// Extra TLS material.
    #[serde(default)]
    pub tls: TlsConfig,
    /// Allow PLAIN/LOGIN authentication over an unencrypted session.
    #[serde(default)]
    pub allow_plaintext_auth: bool,
    /// Connect timeout.
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Command timeout.
    #[serde(default = "default_command_timeout", with = "humantime_serde")]
    pub command_timeout: Duration,
    /// Client identifier for EHLO.
    #[serde(default)]
    pub client_id: Option<String>,
    /// Retry configuration.
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_connect_timeout() -> Duration {
    DEFAULT_CONNECT_TIMEOUT
}

fn default_command_timeout() -> Duration {
    DEFAULT_COMMAND_TIMEOUT
}

impl DispatchConfig {
    /// Creates a new configuration builder.
    pub fn builder() -> DispatchConfigBuilder {
        DispatchConfigBuilder::default()
    }

    /// Builds a configuration from `MAIL_RELAY_*` environment variables.
    ///
    /// `MAIL_RELAY_HOST` is required. Recognized optional variables are
    /// `PORT`, `USERNAME`, `PASSWORD`, `USE_SSL`, `USE_TLS`, `MAX_RETRIES`,
    /// `RETRY_STEP` (humantime, e.g. `30s`) and `RETRY_BASE`.
    pub fn from_env() -> DispatchResult<Self> {
        let host = env_var("HOST").ok_or_else(|| {
            DispatchError::configuration(format!("{}HOST must be set", ENV_PREFIX))
        })?;

        let mut builder = Self::builder().relay_host(host);

        if let Some(port) = env_parse::<u16>("PORT")? {
            builder = builder.relay_port(port);
        }
        if let Some(username) = env_var("USERNAME") {
            builder = builder.username(username);
        }
        if let Some(password) = env_var("PASSWORD") {
            builder = builder.password(password);
        }
        if let Some(flag) = env_var("USE_SSL") {
            builder = builder.implicit_tls(parse_flag(&flag));
        }
        if let Some(flag) = env_var("USE_TLS") {
            builder = builder.starttls(parse_flag(&flag));
        }
        if let Some(max_retries) = env_parse::<u32>("MAX_RETRIES")? {
            builder = builder.max_retries(max_retries);
        }
        if let Some(step) = env_var("RETRY_STEP") {
            let step = humantime::parse_duration(&step).map_err(|e| {
                DispatchError::configuration(format!("{}RETRY_STEP: {}", ENV_PREFIX, e))
            })?;
            builder = builder.backoff_step(step);
        }
        if let Some(base) = env_parse::<f64>("RETRY_BASE")? {
            builder = builder.backoff_base(base);
        }

        builder.build()
    }

    /// Validates the configuration.
    pub fn validate(&self) -> DispatchResult<()> {
        if self.relay_host.is_empty() {
            return Err(DispatchError::configuration("Relay host is required"));
        }

        if self.relay_port == 0 {
            return Err(DispatchError::configuration("Relay port must be non-zero"));
        }

        self.tls_mode()?;
        self.tls.validate()?;
        self.retry.validate()?;

        Ok(())
    }

    /// Resolves the transport security mode.
    ///
    /// Fails with [`DispatchErrorKind::ConflictingTlsModes`] when both
    /// implicit TLS and STARTTLS are enabled.
    pub fn tls_mode(&self) -> DispatchResult<TlsMode> {
        match (self.use_implicit_tls, self.use_starttls) {
            (true, true) => Err(DispatchError::new(
                DispatchErrorKind::ConflictingTlsModes,
                "Set either use_implicit_tls or use_starttls, not both",
            )),
            (true, false) => Ok(TlsMode::Implicit),
            (false, true) => Ok(TlsMode::StartTls),
            (false, false) => Ok(TlsMode::None),
        }
    }

    /// Returns the full relay address.
    pub fn address(&self) -> String {
        format!("{}:{}", self.relay_host, self.relay_port)
    }

    /// Returns true if both username and password are configured and non-empty.
    pub fn has_auth(&self) -> bool {
        let username = self.username.as_deref().map_or(false, |u| !u.is_empty());
        let password = self
            .password
            .as_ref()
            .map_or(false, |p| !p.expose_secret().is_empty());
        username && password
    }

    /// Returns the client identifier for EHLO.
    pub fn client_id(&self) -> &str {
        self.client_id.as_deref().unwrap_or("localhost")
    }

    /// Returns the name presented for TLS server verification.
    pub fn tls_server_name(&self) -> &str {
        self.tls.sni_override.as_deref().unwrap_or(&self.relay_host)
    }

    /// Snapshot of the retry settings to stamp on new attempts.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry.max_retries,
            self.retry.backoff_step,
            self.retry.backoff_base,
        )
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(format!("{}{}", ENV_PREFIX, name))
        .ok()
        .filter(|v| !v.is_empty())
}

fn env_parse<T>(name: &str) -> DispatchResult<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    env_var(name)
        .map(|raw| {
            raw.parse::<T>().map_err(|e| {
                DispatchError::configuration(format!("{}{}: {}", ENV_PREFIX, name, e))
            })
        })
        .transpose()
}

fn parse_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Builder for dispatcher configuration.
#[derive(Debug, Default)]
pub struct DispatchConfigBuilder {
    relay_host: Option<String>,
    relay_port: u16,
    username: Option<String>,
    password: Option<SecretString>,
    use_implicit_tls: bool,
    use_starttls: bool,
    tls: TlsConfig,
    allow_plaintext_auth: bool,
    connect_timeout: Duration,
    command_timeout: Duration,
    client_id: Option<String>,
    retry: RetryConfig,
}

impl DispatchConfigBuilder {
    /// Sets the relay host.
    pub fn relay_host(mut self, host: impl Into<String>) -> Self {
        self.relay_host = Some(host.into());
        self
    }

    /// Sets the relay port.
    pub fn relay_port(mut self, port: u16) -> Self {
        self.relay_port = port;
        self
    }

    /// Sets username and password.
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(SecretString::new(password.into()));
        self
    }

    /// Sets the username.
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Sets the password.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(SecretString::new(password.into()));
        self
    }

    /// Enables or disables implicit TLS.
    pub fn implicit_tls(mut self, enabled: bool) -> Self {
        self.use_implicit_tls = enabled;
        self
    }

    /// Enables or disables STARTTLS.
    pub fn starttls(mut self, enabled: bool) -> Self {
        self.use_starttls = enabled;
        self
    }

    /// Sets the TLS material.
    pub fn tls(mut self, config: TlsConfig) -> Self {
        self.tls = config;
        self
    }

    /// Allows PLAIN/LOGIN authentication without TLS.
    pub fn allow_plaintext_auth(mut self, allow: bool) -> Self {
        self.allow_plaintext_auth = allow;
        self
    }

    /// Sets connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets command timeout.
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Sets the client identifier for EHLO.
    pub fn client_id(mut self, id: impl Into<String>) -> Self {
        self.client_id = Some(id.into());
        self
    }

    /// Sets the retry configuration.
    pub fn retry(mut self, config: RetryConfig) -> Self {
        self.retry = config;
        self
    }

    /// Sets the retry ceiling.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.retry.max_retries = max_retries;
        self
    }

    /// Sets the delay before the first retry.
    pub fn backoff_step(mut self, step: Duration) -> Self {
        self.retry.backoff_step = step;
        self
    }

    /// Sets the backoff multiplier.
    pub fn backoff_base(mut self, base: f64) -> Self {
        self.retry.backoff_base = base;
        self
    }

    /// Builds the configuration.
    pub fn build(self) -> DispatchResult<DispatchConfig> {
        let config = DispatchConfig {
            relay_host: self
                .relay_host
                .ok_or_else(|| DispatchError::configuration("Relay host is required"))?,
            relay_port: if self.relay_port == 0 { DEFAULT_PORT } else { self.relay_port },
            username: self.username,
            password: self.password,
            use_implicit_tls: self.use_implicit_tls,
            use_starttls: self.use_starttls,
            tls: self.tls,
            allow_plaintext_auth: self.allow_plaintext_auth,
            connect_timeout: if self.connect_timeout == Duration::ZERO {
                DEFAULT_CONNECT_TIMEOUT
            } else {
                self.connect_timeout
            },
            command_timeout: if self.command_timeout == Duration::ZERO {
                DEFAULT_COMMAND_TIMEOUT
            } else {
                self.command_timeout
            },
            client_id: self.client_id,
            retry: self.retry,
        };

        config.validate()?;
        Ok(config)
    }
}

// Humantime serde support
mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = DispatchConfig::builder()
            .relay_host("smtp.example.com")
            .relay_port(587)
            .starttls(true)
            .credentials("user", "pass")
            .build()
            .unwrap();

        assert_eq!(config.relay_host, "smtp.example.com");
        assert_eq!(config.relay_port, 587);
        assert_eq!(config.tls_mode().unwrap(), TlsMode::StartTls);
        assert!(config.has_auth());
    }

    #[test]
    fn test_config_defaults() {
        let config = DispatchConfig::builder()
            .relay_host("smtp.example.com")
            .build()
            .unwrap();

        assert_eq!(config.relay_port, DEFAULT_PORT);
        assert_eq!(config.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(config.tls_mode().unwrap(), TlsMode::None);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.backoff_step, Duration::from_secs(30));
        assert_eq!(config.retry.backoff_base, 4.0);
        assert!(!config.has_auth());
    }

    #[test]
    fn test_conflicting_tls_modes_rejected() {
        let err = DispatchConfig::builder()
            .relay_host("smtp.example.com")
            .implicit_tls(true)
            .starttls(true)
            .build()
            .unwrap_err();

        assert_eq!(err.kind(), DispatchErrorKind::ConflictingTlsModes);
    }

    #[test]
    fn test_empty_credentials_do_not_enable_auth() {
        let config = DispatchConfig::builder()
            .relay_host("smtp.example.com")
            .credentials("", "")
            .build()
            .unwrap();
        assert!(!config.has_auth());

        let config = DispatchConfig::builder()
            .relay_host("smtp.example.com")
            .username("user")
            .build()
            .unwrap();
        assert!(!config.has_auth());
    }

    #[test]
    fn test_config_validation() {
        assert!(DispatchConfig::builder().build().is_err());

        let result = DispatchConfig::builder()
            .relay_host("smtp.example.com")
            .backoff_base(f64::NAN)
            .build();
        assert!(result.is_err());

        let result = DispatchConfig::builder()
            .relay_host("smtp.example.com")
            .tls(TlsConfig {
                client_cert_path: Some("cert.pem".into()),
                ..Default::default()
            })
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_config_deserialize() {
        let config: DispatchConfig = serde_json::from_str(
            r#"{
                "relay_host": "mail.example.com",
                "use_implicit_tls": true,
                "relay_port": 465,
                "password": "secret",
                "username": "mailer",
                "command_timeout": "10s",
                "retry": { "max_retries": 2, "backoff_step": "1m" }
            }"#,
        )
        .unwrap();

        assert_eq!(config.tls_mode().unwrap(), TlsMode::Implicit);
        assert_eq!(config.command_timeout, Duration::from_secs(10));
        assert_eq!(config.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(config.retry.backoff_step, Duration::from_secs(60));
        assert_eq!(config.retry.backoff_base, DEFAULT_BACKOFF_BASE);
        assert!(config.has_auth());

        let policy = config.retry_policy();
        assert_eq!(policy.retry_limit(), 2);
    }

    #[test]
    fn test_parse_flag() {
        assert!(parse_flag("true"));
        assert!(parse_flag(" 1 "));
        assert!(parse_flag("Yes"));
        assert!(!parse_flag("false"));
        assert!(!parse_flag("0"));
    }
}
