//! # speedbee_mqtt
//!
//! Single-session MQTT plumbing on top of `rumqttc`.
//!
//! This crate provides the broker side of speedbee:
//!
//! - [`ClientBuilder`] turns a [`Config`] into a rumqttc client and event
//!   loop, with pass-through credentials and an availability last will.
//! - [`ConnectionKernel`] runs the event loop on its own task, re-applies
//!   subscriptions after each CONNACK and hands inbound publishes to an
//!   `mpsc` channel without blocking.
//! - [`MqttManager`] connects and waits for CONNACK; the resulting
//!   [`MqttInstance`] publishes and shuts down idempotently.
//!
//! There is no reconnect loop. A connection that fails stays failed and
//! reports `Disconnected`; the owner builds a new one when it needs to.

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod manager;
pub mod state;

pub use client::{ClientBuilder, AVAILABILITY_OFFLINE, AVAILABILITY_ONLINE};
pub use config::Config;
pub use connection::{ConnectionKernel, InboundMessage, SessionOptions};
pub use error::TransferError;
pub use manager::{MqttInstance, MqttManager};
pub use state::ConnectionState;
