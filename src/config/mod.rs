//! Application configuration loading, validation, and management.
//!
//! Configuration comes from three layers, later ones winning:
//!
//! 1. Built-in defaults
//! 2. An optional TOML file (`SPEEDBEE_CONFIG`, else `/etc/speedbee/config.toml`)
//! 3. Flat environment variables (`MQTT_BROKER_HOST`, `SENSOR_PREFIX`, ...)
//!
//! Validation runs once, after all layers are applied. The result is
//! immutable for the lifetime of the process.

use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use serde::{Deserialize, Serialize};
use validator::Validate;

use self::{
    homeassistant::HomeAssistantConfig,
    logger::LoggerConfig,
    speedtest::{ScheduleConfig, SpeedtestConfig},
};

pub mod homeassistant;
pub mod logger;
pub mod speedtest;

#[doc(hidden)]
#[macro_export]
macro_rules! __print_line {
    ($level:expr, $($arg:tt)*) => {
        println!("{}  {} {}",
            console::style(
                time::OffsetDateTime::now_utc()
                    .format(&time::format_description::well_known::Rfc3339)
                    .unwrap_or_default()
            ).dim(),
            $level,
            format_args!($($arg)*)
        )
    };
}

/// Timestamped console output for use before the tracing subscriber exists.
#[macro_export]
macro_rules! print_info {
    ($($arg:tt)*) => {
        $crate::__print_line!(console::style("INFO").green(), $($arg)*)
    };
}

#[macro_export]
macro_rules! print_warn {
    ($($arg:tt)*) => {
        $crate::__print_line!(console::style("WARN").yellow(), $($arg)*)
    };
}

#[macro_export]
macro_rules! print_error {
    ($($arg:tt)*) => {
        $crate::__print_line!(console::style("ERROR").red(), $($arg)*)
    };
}

/// Environment variable naming an explicit configuration file.
pub const CONFIG_ENV: &str = "SPEEDBEE_CONFIG";

/// Configuration file used when `SPEEDBEE_CONFIG` is not set.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/speedbee/config.toml";

/// Errors that can occur during configuration loading, parsing or validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error while reading configuration: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Parse error while reading configuration: {0}")]
    ParseError(String),

    /// An environment override that could not be converted to its field type.
    #[error("Invalid value '{value}' for environment variable {name}")]
    EnvError { name: &'static str, value: String },

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Top-level application configuration.
#[derive(Serialize, Deserialize, Debug, Validate, Clone, Default)]
#[serde(default)]
pub struct Config {
    #[validate(nested)]
    pub logger: LoggerConfig,

    #[validate(nested)]
    pub speedtest: SpeedtestConfig,

    #[validate(nested)]
    pub schedule: ScheduleConfig,

    #[validate(nested)]
    pub homeassistant: HomeAssistantConfig,

    #[validate(nested)]
    pub transport: TransportConfig,
}

pub type TransportConfig = speedbee_mqtt::Config;

impl Config {
    /// Builds the process configuration from defaults, the optional file and
    /// the process environment.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if an explicitly named file is missing, a file
    /// cannot be parsed, an override is malformed or validation fails.
    pub fn new() -> Result<Self, ConfigError> {
        let path = Self::get_config_path()?;
        Self::load(path.as_deref(), |name| std::env::var(name).ok())
    }

    /// Determines the configuration file path.
    ///
    /// An explicit `SPEEDBEE_CONFIG` must exist. The fallback path is
    /// optional.
    fn get_config_path() -> Result<Option<PathBuf>, ConfigError> {
        if let Ok(config_path) = std::env::var(CONFIG_ENV) {
            let path = PathBuf::from(config_path);
            if !path.exists() {
                return Err(ConfigError::Config(format!(
                    "{} points to a missing file: {}",
                    CONFIG_ENV,
                    path.display()
                )));
            }
            print_info!("Using config from {}: {}", CONFIG_ENV, path.display());
            return Ok(Some(path));
        }

        let fallback = Path::new(DEFAULT_CONFIG_PATH);
        if fallback.exists() {
            print_info!("Using default config path: {}", fallback.display());
            return Ok(Some(fallback.to_path_buf()));
        }

        Ok(None)
    }

    /// Reads `path` (defaults when `None`), applies the overrides `lookup`
    /// returns and validates the result.
    pub fn load<F>(path: Option<&Path>, lookup: F) -> Result<Config, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match path {
            Some(path) => {
                let config = Self::parse(path)?;
                print_info!("Successfully loaded config from: {}", path.display());
                config
            }
            None => {
                print_info!("No configuration file found, using defaults");
                Config::default()
            }
        };

        config.apply_env(lookup)?;
        config.check()?;
        Ok(config)
    }

    fn parse(path: &Path) -> Result<Config, ConfigError> {
        print_info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(ConfigError::Config(path.to_string_lossy().to_string()));
        }

        let config_str = fs::read_to_string(path)?;
        toml::from_str(&config_str).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    fn check(&self) -> Result<(), ConfigError> {
        self.validate()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))
    }

    /// Applies flat environment overrides on top of the current values.
    ///
    /// `lookup` returns the raw value of a variable, or `None` when unset.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let transport = &mut self.transport;
        if let Some(host) = lookup("MQTT_BROKER_HOST") {
            transport.host = host;
        }
        if let Some(port) = parse_env(&lookup, "MQTT_BROKER_PORT")? {
            transport.port = port;
        }
        if let Some(username) = lookup("MQTT_USERNAME") {
            transport.username = Some(username);
        }
        if let Some(password) = lookup("MQTT_PASSWORD") {
            transport.password = Some(password);
        }

        let ha = &mut self.homeassistant;
        for (name, field) in [
            ("DISCOVERY_PREFIX", &mut ha.discovery_prefix),
            ("SENSOR_PREFIX", &mut ha.sensor_prefix),
            ("COMMAND_TOPIC", &mut ha.command_topic),
            ("DEVICE_MANUFACTURER", &mut ha.manufacturer),
            ("DEVICE_MODEL", &mut ha.model),
            ("DEVICE_NAME", &mut ha.device_name),
        ] {
            if let Some(value) = lookup(name) {
                *field = value;
            }
        }

        if let Some(interval) = parse_env(&lookup, "SAMPLE_INTERVAL_SECONDS")? {
            self.schedule.interval = interval;
        }
        if let Some(flag) = lookup("TEST_MODE") {
            self.schedule.test_mode = flag.trim() == "1";
        }

        if let Some(binary) = lookup("SPEEDTEST_BIN") {
            self.speedtest.binary = binary;
        }
        if let Some(server_id) = parse_env(&lookup, "SPEEDTEST_SERVER_ID")? {
            self.speedtest.server_id = Some(server_id);
        }

        Ok(())
    }
}

fn parse_env<F, T>(lookup: &F, name: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(name) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::EnvError { name, value }),
    }
}
