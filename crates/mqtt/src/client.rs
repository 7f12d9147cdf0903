//! MQTT client builder.
//!
//! `ClientBuilder` hides the setup of rumqttc's `AsyncClient` and
//! `EventLoop`: client id generation, keep-alive, packet limits,
//! pass-through credentials and the availability last will.
//!
//! # Examples
//!
//! ```ignore
//! let (client, event_loop) = ClientBuilder::from_config(&config)?
//!     .availability("home/internet/speedtest/status")
//!     .build();
//! ```

use std::time::Duration;

use rumqttc::{AsyncClient, EventLoop, LastWill, MqttOptions, QoS};
use validator::Validate;

use super::{config::Config, error::TransferError};

/// Payload published (retained) on the availability topic while connected.
pub const AVAILABILITY_ONLINE: &str = "online";

/// Payload the broker publishes on our behalf when we vanish.
pub const AVAILABILITY_OFFLINE: &str = "offline";

/// Builder for constructing MQTT clients with a fluent API.
///
/// The builder is consumed by `build()`, which returns the client (cheap to
/// clone, used to send requests) and the event loop (drives the network and
/// must be polled on exactly one task).
pub struct ClientBuilder {
    /// MQTT protocol options (host, port, keep-alive, credentials, ...)
    opts: MqttOptions,

    /// Capacity of the request channel between client and event loop.
    cap: usize,
}

impl ClientBuilder {
    /// Creates a builder with minimal configuration.
    pub fn new(
        client_id: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        cap: usize,
    ) -> Self {
        Self {
            opts: MqttOptions::new(client_id, host, port),
            cap,
        }
    }

    /// Creates a builder from a validated `Config`.
    ///
    /// # Errors
    ///
    /// Returns `TransferError::ConfigError` if the configuration does not
    /// pass validation.
    pub fn from_config(config: &Config) -> Result<Self, TransferError> {
        config.validate()?;

        let client_id = if config.client_id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            config.client_id.clone()
        };

        let mut builder = Self::new(
            client_id,
            config.host.clone(),
            config.port,
            config.request_channel_capacity.unwrap_or(64) as usize,
        )
        .keep_alive(config.keep_alive)
        .clean_session(config.clean_session)
        .max_inflight(config.max_inflight);

        if let Some(size) = config.max_packet_size {
            builder = builder.max_packet_size(size as usize, size as usize);
        }

        if let Some((username, password)) = config.credentials() {
            builder = builder.credentials(username, password);
        }

        Ok(builder)
    }

    /// Sets the keep-alive interval (in seconds).
    pub fn keep_alive(mut self, secs: u64) -> Self {
        self.opts.set_keep_alive(Duration::from_secs(secs));
        self
    }

    /// Sets the maximum packet size for incoming and outgoing messages.
    pub fn max_packet_size(mut self, incoming: usize, outgoing: usize) -> Self {
        self.opts.set_max_packet_size(incoming, outgoing);
        self
    }

    /// Configures whether to use a clean session.
    pub fn clean_session(mut self, clean: bool) -> Self {
        self.opts.set_clean_session(clean);
        self
    }

    /// Sets MQTT authentication credentials.
    ///
    /// They travel in clear text unless the broker sits behind TLS.
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.opts.set_credentials(username, password);
        self
    }

    /// Sets the maximum number of inflight QoS 1/2 publishes.
    pub fn max_inflight(mut self, max: u16) -> Self {
        self.opts.set_inflight(max);
        self
    }

    /// Registers a retained `offline` last will on `topic`.
    ///
    /// Paired with the retained `online` message the connection kernel
    /// publishes after every CONNACK, this lets subscribers see whether
    /// the device is alive.
    pub fn availability(mut self, topic: &str) -> Self {
        let last_will = LastWill::new(
            topic,
            AVAILABILITY_OFFLINE.as_bytes().to_vec(),
            QoS::AtLeastOnce,
            true,
        );
        self.opts.set_last_will(last_will);
        self
    }

    /// Constructs the MQTT client and event loop.
    pub fn build(self) -> (AsyncClient, EventLoop) {
        AsyncClient::new(self.opts, self.cap)
    }
}
