//! Home Assistant discovery and topic layout.
//!
//! All broker topics the service touches are derived from this section, so
//! the helpers below are the single place topic strings are assembled.

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
#[serde(default)]
pub struct HomeAssistantConfig {
    /// Root of Home Assistant's MQTT discovery tree.
    #[validate(custom(function = "validate_topic"))]
    pub discovery_prefix: String,

    /// Root under which state values, the image and availability are published.
    #[validate(custom(function = "validate_topic"))]
    pub sensor_prefix: String,

    /// Topic on which on-demand run commands are accepted.
    #[validate(custom(function = "validate_topic"))]
    pub command_topic: String,

    /// Device identifier. Also the prefix of every entity's unique id.
    #[validate(custom(function = "validate_segment"))]
    pub device_name: String,

    #[validate(length(min = 1))]
    pub manufacturer: String,

    #[validate(length(min = 1))]
    pub model: String,
}

impl Default for HomeAssistantConfig {
    fn default() -> Self {
        Self {
            discovery_prefix: "homeassistant".to_string(),
            sensor_prefix: "home/internet/speedtest".to_string(),
            command_topic: "home/internet/speedtest/command".to_string(),
            device_name: "speedtest_sensor".to_string(),
            manufacturer: "Ookla + MQTT".to_string(),
            model: "Speedtest CLI".to_string(),
        }
    }
}

/// Publish topics must be non-empty and free of wildcards.
fn validate_topic(topic: &str) -> Result<(), ValidationError> {
    if topic.is_empty() || topic.contains(['+', '#']) {
        let mut err = ValidationError::new("invalid_topic");
        err.message = Some(format!("Invalid MQTT topic: '{}'", topic).into());
        return Err(err);
    }
    Ok(())
}

fn validate_segment(segment: &str) -> Result<(), ValidationError> {
    if segment.is_empty() || segment.contains(['/', '+', '#']) {
        let mut err = ValidationError::new("invalid_device_name");
        err.message = Some(format!("Invalid device name: '{}'", segment).into());
        return Err(err);
    }
    Ok(())
}

impl HomeAssistantConfig {
    /// `<discovery_prefix>/sensor/<device>/<field>/config`
    pub fn sensor_config_topic(&self, field: &str) -> String {
        format!(
            "{}/sensor/{}/{}/config",
            self.discovery_prefix, self.device_name, field
        )
    }

    /// `<discovery_prefix>/camera/<device>/result/config`
    pub fn camera_config_topic(&self) -> String {
        format!(
            "{}/camera/{}/result/config",
            self.discovery_prefix, self.device_name
        )
    }

    pub fn state_topic(&self, field: &str) -> String {
        format!("{}/{}", self.sensor_prefix, field)
    }

    pub fn image_topic(&self) -> String {
        self.state_topic("image")
    }

    /// Retained online/offline marker, also registered as the last will.
    pub fn availability_topic(&self) -> String {
        self.state_topic("status")
    }

    /// Human-readable device name: underscores become spaces, words are
    /// title-cased (`speedtest_sensor` -> `Speedtest Sensor`).
    pub fn device_display_name(&self) -> String {
        self.device_name
            .replace('_', " ")
            .split(' ')
            .map(title_case)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn title_case(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first
            .to_uppercase()
            .chain(chars.flat_map(char::to_lowercase))
            .collect(),
        None => String::new(),
    }
}
