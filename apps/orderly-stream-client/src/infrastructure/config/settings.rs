//! Stream Client Settings
//!
//! Configuration for the Orderly stream client, loaded from environment
//! variables.

use std::time::Duration;

use crate::domain::connection::Channel;
use crate::infrastructure::orderly::auth::{AuthError, Credential};
use crate::infrastructure::orderly::reconnect::{
    DEFAULT_MAX_BACKOFF, DEFAULT_MAX_RECONNECTS, ReconnectConfig,
};

/// Orderly network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    /// Production network.
    Mainnet,
    /// Test network.
    #[default]
    Testnet,
}

impl Environment {
    /// Parse environment from string.
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "mainnet" => Self::Mainnet,
            _ => Self::Testnet,
        }
    }

    /// Get the environment name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Mainnet => "mainnet",
            Self::Testnet => "testnet",
        }
    }

    /// Default public endpoint (account id is appended).
    #[must_use]
    pub const fn public_endpoint(&self) -> &'static str {
        match self {
            Self::Mainnet => "wss://ws-evm.orderly.org/ws/stream/",
            Self::Testnet => "wss://testnet-ws-evm.orderly.org/ws/stream/",
        }
    }

    /// Default private endpoint (account id is appended).
    #[must_use]
    pub const fn private_endpoint(&self) -> &'static str {
        match self {
            Self::Mainnet => "wss://ws-private-evm.orderly.org/v2/ws/private/stream/",
            Self::Testnet => "wss://testnet-ws-private-evm.orderly.org/v2/ws/private/stream/",
        }
    }
}

/// Orderly key material.
#[derive(Clone)]
pub struct KeyPair {
    orderly_key: String,
    orderly_secret: String,
}

impl KeyPair {
    /// Create a key pair.
    #[must_use]
    pub const fn new(orderly_key: String, orderly_secret: String) -> Self {
        Self {
            orderly_key,
            orderly_secret,
        }
    }

    /// Get the public key identifier.
    #[must_use]
    pub fn orderly_key(&self) -> &str {
        &self.orderly_key
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("orderly_key", &self.orderly_key)
            .field("orderly_secret", &"[REDACTED]")
            .finish()
    }
}

/// Complete stream client configuration.
#[derive(Debug, Clone)]
pub struct StreamSettings {
    /// Network the default endpoints point at.
    pub environment: Environment,
    /// Orderly account id, appended to both endpoints.
    pub account_id: String,
    /// Public endpoint prefix.
    pub public_endpoint: String,
    /// Private endpoint prefix.
    pub private_endpoint: String,
    /// Key material for the private channel.
    pub keys: Option<KeyPair>,
    /// Longest silence tolerated before reconnecting.
    pub read_timeout: Duration,
    /// Window `recv` waits before logging progress.
    pub queue_timeout: Duration,
    /// Consecutive retries before giving up.
    pub max_reconnects: u32,
    /// Cap on the exponential backoff term.
    pub max_backoff: Duration,
    /// Pending messages kept per topic.
    pub queue_capacity: usize,
    /// Prometheus metrics port (0 = disabled).
    pub metrics_port: u16,
}

impl StreamSettings {
    /// Settings for `account_id` on `environment` with default tuning.
    #[must_use]
    pub fn new(environment: Environment, account_id: impl Into<String>) -> Self {
        Self {
            environment,
            account_id: account_id.into(),
            public_endpoint: environment.public_endpoint().to_owned(),
            private_endpoint: environment.private_endpoint().to_owned(),
            keys: None,
            read_timeout: Duration::from_secs(60),
            queue_timeout: Duration::from_secs(10),
            max_reconnects: DEFAULT_MAX_RECONNECTS,
            max_backoff: DEFAULT_MAX_BACKOFF,
            queue_capacity: 100,
            metrics_port: 0,
        }
    }

    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if `ORDERLY_ACCOUNT_ID` is missing or empty, if only
    /// one of `ORDERLY_KEY`/`ORDERLY_SECRET` is set, or if a numeric value
    /// does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        let account_id = std::env::var("ORDERLY_ACCOUNT_ID")
            .map_err(|_| ConfigError::MissingEnvVar("ORDERLY_ACCOUNT_ID".to_string()))?;
        if account_id.trim().is_empty() {
            return Err(ConfigError::EmptyValue("ORDERLY_ACCOUNT_ID".to_string()));
        }

        let environment = std::env::var("ORDERLY_ENV")
            .map(|s| Environment::from_str_case_insensitive(&s))
            .unwrap_or_default();
        let defaults = Self::new(environment, account_id);

        let keys = match (non_empty_env("ORDERLY_KEY"), non_empty_env("ORDERLY_SECRET")) {
            (Some(key), Some(secret)) => Some(KeyPair::new(key, secret)),
            (None, None) => None,
            (Some(_), None) => return Err(ConfigError::MissingEnvVar("ORDERLY_SECRET".to_string())),
            (None, Some(_)) => return Err(ConfigError::MissingEnvVar("ORDERLY_KEY".to_string())),
        };

        Ok(Self {
            public_endpoint: non_empty_env("ORDERLY_WS_PUBLIC_ENDPOINT")
                .unwrap_or(defaults.public_endpoint),
            private_endpoint: non_empty_env("ORDERLY_WS_PRIVATE_ENDPOINT")
                .unwrap_or(defaults.private_endpoint),
            keys,
            read_timeout: parse_env_duration_secs(
                "ORDERLY_STREAM_READ_TIMEOUT_SECS",
                defaults.read_timeout,
            )?,
            queue_timeout: parse_env_duration_secs(
                "ORDERLY_STREAM_QUEUE_TIMEOUT_SECS",
                defaults.queue_timeout,
            )?,
            max_reconnects: parse_env("ORDERLY_STREAM_MAX_RECONNECTS", defaults.max_reconnects)?,
            max_backoff: parse_env_duration_secs(
                "ORDERLY_STREAM_MAX_BACKOFF_SECS",
                defaults.max_backoff,
            )?,
            queue_capacity: parse_env("ORDERLY_STREAM_QUEUE_CAPACITY", defaults.queue_capacity)?,
            metrics_port: parse_env("ORDERLY_STREAM_METRICS_PORT", defaults.metrics_port)?,
            ..defaults
        })
    }

    /// Socket URL for `channel`: endpoint followed by the account id.
    #[must_use]
    pub fn url_for(&self, channel: Channel) -> String {
        let endpoint = match channel {
            Channel::Public => &self.public_endpoint,
            Channel::Private => &self.private_endpoint,
        };
        format!("{endpoint}{}", self.account_id)
    }

    /// Backoff settings with a one-second unit.
    #[must_use]
    pub fn reconnect_config(&self) -> ReconnectConfig {
        ReconnectConfig::new(self.max_backoff, Duration::from_secs(1), self.max_reconnects)
    }

    /// Check whether key material is configured.
    #[must_use]
    pub const fn has_keys(&self) -> bool {
        self.keys.is_some()
    }

    /// Build the signing credential for the private channel.
    ///
    /// # Errors
    ///
    /// Returns an error if no key material is configured or the secret is
    /// not a valid base58 ed25519 key.
    pub fn credential(&self) -> Result<Credential, AuthError> {
        let keys = self.keys.as_ref().ok_or(AuthError::EmptyValue("orderly key"))?;
        Credential::new(
            self.account_id.clone(),
            keys.orderly_key.clone(),
            &keys.orderly_secret,
        )
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable does not parse.
    #[error("environment variable {key} has invalid value {value:?}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// Raw value.
        value: String,
    },
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match non_empty_env(key) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value,
        }),
    }
}

fn parse_env_duration_secs(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    parse_env(key, default.as_secs()).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_parsing() {
        assert_eq!(
            Environment::from_str_case_insensitive("mainnet"),
            Environment::Mainnet
        );
        assert_eq!(
            Environment::from_str_case_insensitive("MAINNET"),
            Environment::Mainnet
        );
        assert_eq!(
            Environment::from_str_case_insensitive("testnet"),
            Environment::Testnet
        );
        assert_eq!(
            Environment::from_str_case_insensitive("unknown"),
            Environment::Testnet
        );
    }

    #[test]
    fn url_appends_account_id() {
        let settings = StreamSettings::new(Environment::Mainnet, "0xabc");
        assert_eq!(
            settings.url_for(Channel::Public),
            "wss://ws-evm.orderly.org/ws/stream/0xabc"
        );
        assert_eq!(
            settings.url_for(Channel::Private),
            "wss://ws-private-evm.orderly.org/v2/ws/private/stream/0xabc"
        );
    }

    #[test]
    fn defaults() {
        let settings = StreamSettings::new(Environment::Testnet, "0xabc");
        assert_eq!(settings.read_timeout, Duration::from_secs(60));
        assert_eq!(settings.queue_timeout, Duration::from_secs(10));
        assert_eq!(settings.queue_capacity, 100);
        assert_eq!(settings.metrics_port, 0);
        assert_eq!(settings.reconnect_config(), ReconnectConfig::default());
        assert!(settings.public_endpoint.starts_with("wss://testnet-"));
    }

    #[test]
    fn credential_requires_keys() {
        let settings = StreamSettings::new(Environment::Testnet, "0xabc");
        assert!(!settings.has_keys());
        assert!(matches!(
            settings.credential(),
            Err(AuthError::EmptyValue(_))
        ));
    }

    #[test]
    fn credential_from_keys() {
        let mut settings = StreamSettings::new(Environment::Testnet, "0xabc");
        let secret = bs58::encode([9_u8; 32]).into_string();
        settings.keys = Some(KeyPair::new("ed25519:abc".to_string(), secret));
        let credential = settings.credential().unwrap();
        assert_eq!(credential.account_id(), "0xabc");
        assert_eq!(credential.orderly_key(), "abc");
    }

    #[test]
    fn key_pair_redacted_debug() {
        let keys = KeyPair::new("key123".to_string(), "secret456".to_string());
        let debug = format!("{keys:?}");
        assert!(!debug.contains("secret456"));
        assert!(debug.contains("[REDACTED]"));
    }
}
