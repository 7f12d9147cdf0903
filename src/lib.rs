//! speedbee: internet speed measurements for Home Assistant.
//!
//! Runs the Ookla `speedtest` CLI on a fixed schedule and whenever a run
//! command arrives over MQTT, then publishes the results as Home Assistant
//! discovery entities, plain-text state values and the result image.
//!
//! ## Modules
//!
//! * `config`: TOML file plus flat environment overrides, validated with
//!   `validator`.
//! * `core`: the rate-limited measurement runner, the shared broker
//!   session, the publish pipeline and the two triggers (schedule and
//!   command) that drive them.
//! * `logger`: `tracing` subscriber setup with console and journald outputs.
//!
//! Broker plumbing lives in the `speedbee_mqtt` workspace crate.

pub mod config;
pub mod core;
pub mod logger;
