//! Broker connection configuration.
//!
//! All fields are deserializable from the `[transport]` table of the
//! application's TOML file and validated with the `validator` crate, so an
//! invalid broker setup fails at load time rather than at connect time.
//!
//! # Examples
//!
//! ```ignore
//! let config = Config {
//!     host: "mqtt.home.local".into(),
//!     username: Some("speedbee".into()),
//!     password: Some("secret".into()),
//!     ..Default::default()
//! };
//! config.validate()?;
//! ```

use serde::{Deserialize, Serialize};
use validator::Validate;

/// Main MQTT connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Broker hostname or IP address.
    ///
    /// DNS resolution happens at connection time, not validation time.
    #[validate(length(
        min = 1,
        max = 255,
        message = "Host must be between 1 and 255 characters"
    ))]
    pub host: String,

    /// Broker port number (1883 plain, 8883 TLS-terminated proxies, ...).
    #[validate(range(min = 1, max = 65535, message = "Port must be between 1 and 65535"))]
    pub port: u16,

    /// Optional username passed through in the CONNECT packet.
    pub username: Option<String>,

    /// Optional password, only sent together with `username`.
    pub password: Option<String>,

    /// Client identifier. An empty string is replaced with a random UUID
    /// when the client is built.
    #[validate(length(max = 36, message = "Client ID must not exceed 36 characters"))]
    pub client_id: String,

    /// How long to wait for TCP connect plus CONNACK, in seconds.
    ///
    /// Exceeding it is reported as a connect failure; the next trigger
    /// tries again.
    #[validate(range(
        min = 1,
        max = 300,
        message = "Connection timeout must be between 1 and 300 seconds"
    ))]
    pub connection_timeout: u64,

    /// Whether to request a clean session from the broker.
    pub clean_session: bool,

    /// Keep-alive interval in seconds.
    #[validate(range(
        min = 5,
        max = 3600,
        message = "Keep alive must be between 5 and 3600 seconds"
    ))]
    pub keep_alive: u64,

    /// Maximum number of QoS 1/2 messages in flight simultaneously.
    #[validate(range(
        min = 1,
        max = 1000,
        message = "Max inflight must be between 1 and 1000"
    ))]
    pub max_inflight: u16,

    /// Maximum MQTT packet size in bytes, applied to both directions.
    ///
    /// The result image is published as a single packet, so this must
    /// leave room for a PNG of a few dozen kilobytes.
    #[validate(range(
        min = 1024,
        max = 16777216,
        message = "Max packet size must be between 1KiB and 16MiB"
    ))]
    pub max_packet_size: Option<u32>,

    /// Capacity of the client's request channel (queued publishes).
    #[validate(range(
        min = 1,
        max = 1024,
        message = "Request channel capacity must be between 1 and 1024"
    ))]
    pub request_channel_capacity: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            client_id: String::new(),
            connection_timeout: 30,
            clean_session: true,
            keep_alive: 60,
            max_inflight: 10,
            max_packet_size: Some(256 * 1024),
            request_channel_capacity: Some(64),
        }
    }
}

impl Config {
    /// Returns the credentials pair when a username is configured.
    ///
    /// A missing password is sent as an empty string, which is what most
    /// brokers expect for username-only authentication.
    pub fn credentials(&self) -> Option<(String, String)> {
        self.username
            .as_ref()
            .filter(|u| !u.is_empty())
            .map(|u| (u.clone(), self.password.clone().unwrap_or_default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 1883);
    }

    #[test]
    fn empty_host_is_rejected() {
        let config = Config {
            host: String::new(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn tiny_packet_size_is_rejected() {
        let config = Config {
            max_packet_size: Some(64),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_packet_size"));
    }

    #[test]
    fn credentials_require_username() {
        let mut config = Config::default();
        assert!(config.credentials().is_none());

        config.password = Some("secret".into());
        assert!(config.credentials().is_none());

        config.username = Some("speedbee".into());
        assert_eq!(
            config.credentials(),
            Some(("speedbee".to_string(), "secret".to_string()))
        );
    }

    #[test]
    fn deserializes_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            host = "broker.lan"
            username = "ha"
            "#,
        )
        .unwrap();
        assert_eq!(config.host, "broker.lan");
        assert_eq!(config.port, 1883);
        assert_eq!(config.username.as_deref(), Some("ha"));
    }
}
