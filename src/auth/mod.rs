//! Relay authentication.
//!
//! Supports the SASL mechanisms mail relays commonly advertise:
//! - CRAM-MD5 (RFC 2195)
//! - PLAIN (RFC 4616)
//! - LOGIN (obsolete but widely used)

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use md5::Md5;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::DispatchConfig;
use crate::errors::{DispatchError, DispatchErrorKind, DispatchResult};

/// Authentication methods supported by the relay session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    /// PLAIN authentication (RFC 4616).
    Plain,
    /// LOGIN authentication (obsolete).
    Login,
    /// CRAM-MD5 challenge-response.
    CramMd5,
}

impl AuthMethod {
    /// Returns the SMTP AUTH mechanism name.
    pub fn mechanism_name(&self) -> &'static str {
        match self {
            AuthMethod::Plain => "PLAIN",
            AuthMethod::Login => "LOGIN",
            AuthMethod::CramMd5 => "CRAM-MD5",
        }
    }

    /// Returns the priority for auto-selection (higher is better).
    pub fn priority(&self) -> u8 {
        match self {
            AuthMethod::CramMd5 => 3,
            AuthMethod::Plain => 2,
            AuthMethod::Login => 1,
        }
    }

    /// Parses from SMTP capability string.
    pub fn from_capability(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "PLAIN" => Some(AuthMethod::Plain),
            "LOGIN" => Some(AuthMethod::Login),
            "CRAM-MD5" => Some(AuthMethod::CramMd5),
            _ => None,
        }
    }

    /// Returns true if this method sends the password recoverably.
    pub fn requires_tls(&self) -> bool {
        matches!(self, AuthMethod::Plain | AuthMethod::Login)
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mechanism_name())
    }
}

/// Username and password for relay login.
#[derive(Clone)]
pub struct Credentials {
    username: String,
    password: SecretString,
}

impl Credentials {
    /// Creates credentials.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: SecretString::new(password.into()),
        }
    }

    /// Extracts credentials from configuration.
    ///
    /// Returns `None` unless both username and password are non-empty.
    pub fn from_config(config: &DispatchConfig) -> Option<Self> {
        if !config.has_auth() {
            return None;
        }
        Some(Self {
            username: config.username.clone()?,
            password: config.password.clone()?,
        })
    }

    /// Returns the username.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Returns the password.
    pub fn password(&self) -> &SecretString {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Authentication mechanism implementation.
pub struct Authenticator;

impl Authenticator {
    /// Generates the initial response for PLAIN authentication.
    pub fn plain_initial_response(username: &str, password: &SecretString) -> String {
        // Format: \0username\0password
        let response = format!("\0{}\0{}", username, password.expose_secret());
        BASE64.encode(response)
    }

    /// Generates LOGIN username response.
    pub fn login_username(username: &str) -> String {
        BASE64.encode(username)
    }

    /// Generates LOGIN password response.
    pub fn login_password(password: &SecretString) -> String {
        BASE64.encode(password.expose_secret())
    }

    /// Generates CRAM-MD5 response.
    pub fn cram_md5_response(
        challenge: &str,
        username: &str,
        password: &SecretString,
    ) -> DispatchResult<String> {
        let challenge_bytes = BASE64.decode(challenge.trim()).map_err(|e| {
            DispatchError::authentication(format!("Invalid CRAM-MD5 challenge: {}", e))
        })?;

        type HmacMd5 = Hmac<Md5>;
        let mut mac = HmacMd5::new_from_slice(password.expose_secret().as_bytes())
            .map_err(|e| DispatchError::authentication(format!("HMAC error: {}", e)))?;
        mac.update(&challenge_bytes);
        let digest = mac.finalize().into_bytes();

        // Format: username space hex-digest
        let hex_digest: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        let response = format!("{} {}", username, hex_digest);
        Ok(BASE64.encode(response))
    }

    /// Selects the best authentication method from those the relay offers.
    ///
    /// PLAIN and LOGIN are only eligible over TLS unless `allow_plaintext`
    /// is set.
    pub fn select_best_method(
        available: &[AuthMethod],
        tls_enabled: bool,
        allow_plaintext: bool,
    ) -> DispatchResult<AuthMethod> {
        available
            .iter()
            .filter(|m| !m.requires_tls() || tls_enabled || allow_plaintext)
            .max_by_key(|m| m.priority())
            .copied()
            .ok_or_else(|| {
                DispatchError::new(
                    DispatchErrorKind::AuthMethodNotSupported,
                    "No compatible authentication method available",
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_method_from_capability() {
        assert_eq!(AuthMethod::from_capability("PLAIN"), Some(AuthMethod::Plain));
        assert_eq!(AuthMethod::from_capability("login"), Some(AuthMethod::Login));
        assert_eq!(
            AuthMethod::from_capability("CRAM-MD5"),
            Some(AuthMethod::CramMd5)
        );
        assert_eq!(AuthMethod::from_capability("XOAUTH2"), None);
    }

    #[test]
    fn test_plain_initial_response() {
        let password = SecretString::new("password".to_string());
        let response = Authenticator::plain_initial_response("user", &password);
        let decoded = BASE64.decode(&response).unwrap();
        assert_eq!(decoded, b"\0user\0password");
    }

    #[test]
    fn test_login_responses() {
        let password = SecretString::new("pass".to_string());
        assert_eq!(Authenticator::login_username("user"), "dXNlcg==");
        assert_eq!(Authenticator::login_password(&password), "cGFzcw==");
    }

    #[test]
    fn test_cram_md5_response() {
        // RFC 2195 example.
        let challenge = BASE64.encode("<1896.697170952@postoffice.reston.mci.net>");
        let password = SecretString::new("tanstaaftanstaaf".to_string());
        let response = Authenticator::cram_md5_response(&challenge, "tim", &password).unwrap();
        let decoded = String::from_utf8(BASE64.decode(response).unwrap()).unwrap();
        assert_eq!(decoded, "tim b913a602c7eda7a495b4e6e7334d3890");

        assert!(Authenticator::cram_md5_response("!!!", "tim", &password).is_err());
    }

    #[test]
    fn test_select_best_method() {
        let available = vec![AuthMethod::Plain, AuthMethod::Login, AuthMethod::CramMd5];

        let method = Authenticator::select_best_method(&available, true, false).unwrap();
        assert_eq!(method, AuthMethod::CramMd5);

        let method = Authenticator::select_best_method(&available, false, false).unwrap();
        assert_eq!(method, AuthMethod::CramMd5);

        let plain_only = vec![AuthMethod::Plain, AuthMethod::Login];
        let method = Authenticator::select_best_method(&plain_only, true, false).unwrap();
        assert_eq!(method, AuthMethod::Plain);

        let err = Authenticator::select_best_method(&plain_only, false, false).unwrap_err();
        assert_eq!(err.kind(), DispatchErrorKind::AuthMethodNotSupported);

        let method = Authenticator::select_best_method(&plain_only, false, true).unwrap();
        assert_eq!(method, AuthMethod::Plain);
    }

    #[test]
    fn test_credentials_from_config() {
        let config = DispatchConfig::builder()
            .relay_host("smtp.example.com")
            .credentials("user", "secret_password")
            .build()
            .unwrap();
        let creds = Credentials::from_config(&config).unwrap();
        assert_eq!(creds.username(), "user");

        let config = DispatchConfig::builder()
            .relay_host("smtp.example.com")
            .credentials("user", "")
            .build()
            .unwrap();
        assert!(Credentials::from_config(&config).is_none());
    }

    #[test]
    fn test_credentials_debug() {
        let creds = Credentials::new("user", "secret_password");
        let debug_str = format!("{:?}", creds);
        assert!(debug_str.contains("[REDACTED]"));
        assert!(!debug_str.contains("secret_password"));
    }
}
