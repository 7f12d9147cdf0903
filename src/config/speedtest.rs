//! Measurement and scheduling configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::Validate;

/// How the external speed test tool is invoked and rate limited.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
#[serde(default)]
pub struct SpeedtestConfig {
    /// Path or name of the Ookla `speedtest` binary.
    #[validate(length(min = 1, message = "Speedtest binary must not be empty"))]
    pub binary: String,

    /// Pin the test to one Ookla server instead of letting the tool pick.
    pub server_id: Option<u32>,

    /// Seconds after which a running test is killed and reported as failed.
    #[validate(range(
        min = 10,
        max = 3600,
        message = "Speedtest timeout must be between 10 and 3600 seconds"
    ))]
    pub timeout: u64,

    /// Minimum number of seconds between the starts of two test runs,
    /// whichever trigger asked for them.
    pub min_spacing: u64,
}

impl Default for SpeedtestConfig {
    fn default() -> Self {
        Self {
            binary: "speedtest".to_string(),
            server_id: None,
            timeout: 180,
            min_spacing: 30,
        }
    }
}

impl SpeedtestConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn min_spacing(&self) -> Duration {
        Duration::from_secs(self.min_spacing)
    }
}

/// Periodic trigger configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Seconds between scheduled runs. The first run happens at start-up.
    #[validate(range(min = 1, message = "Schedule interval must be at least 1 second"))]
    pub interval: u64,

    /// Run one measurement cycle, close the broker session and exit.
    pub test_mode: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval: 10_800,
            test_mode: false,
        }
    }
}

impl ScheduleConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval)
    }
}
