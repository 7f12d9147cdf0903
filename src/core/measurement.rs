//! Speed test invocation, rate limiting and result parsing.
//!
//! [`MeasurementRunner::attempt`] is the only way a test gets run. It passes
//! through a [`RateGate`] first, so at most one tool process exists at a time
//! and two runs never start closer together than the configured spacing,
//! no matter which trigger asked.

use std::{fmt, process::Stdio, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Local, TimeZone};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    process::Command,
    sync::{Mutex, MutexGuard},
    time::Instant,
};
use tracing::{debug, info};

use crate::config::speedtest::SpeedtestConfig;

/// Format of the `timestamp` field, in the local timezone.
pub const TIMESTAMP_FORMAT: &str = "%d/%m/%Y %H:%M:%S %Z";

/// Rounds to two fractional digits, half away from zero.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Converts a byte rate (bytes/s) to megabits per second, rounded to two digits.
pub fn bytes_to_mbps(bytes_per_sec: f64) -> f64 {
    round2(bytes_per_sec * 8.0 / 1_000_000.0)
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Invalid speedtest JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid speedtest timestamp '{value}': {source}")]
    Timestamp {
        value: String,
        #[source]
        source: chrono::ParseError,
    },
}

#[derive(Debug, Error)]
pub enum ToolFailure {
    #[error("Failed to start '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{command}' did not finish within {seconds}s and was killed")]
    Timeout { command: String, seconds: u64 },

    #[error("Speedtest exited with {}", exit_code(.code))]
    NonZeroExit {
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("Speedtest produced unusable output: {0}")]
    InvalidOutput(#[from] ParseError),
}

fn exit_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {}", code),
        None => "no status (terminated by signal)".to_string(),
    }
}

impl ToolFailure {
    /// Captured process output, when the process ran to completion.
    pub fn captured_output(&self) -> Option<(&str, &str)> {
        match self {
            ToolFailure::NonZeroExit { stdout, stderr, .. } => Some((stdout, stderr)),
            _ => None,
        }
    }
}

/// What a finished tool process left behind.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl From<std::process::Output> for ToolOutput {
    fn from(output: std::process::Output) -> Self {
        Self {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }
}

/// An external speed test tool.
///
/// Implementations report spawn failures and timeouts as errors; a process
/// that ran, successfully or not, is an `Ok(ToolOutput)`.
#[async_trait]
pub trait SpeedTool: Send + Sync {
    async fn run(&self) -> Result<ToolOutput, ToolFailure>;

    /// Command line for logs.
    fn describe(&self) -> String;
}

/// The Ookla `speedtest` CLI.
#[derive(Debug, Clone)]
pub struct SpeedtestCli {
    binary: String,
    args: Vec<String>,
    timeout: Duration,
}

impl SpeedtestCli {
    pub fn from_config(config: &SpeedtestConfig) -> Self {
        let mut args = vec![
            "--format=json".to_string(),
            "--accept-license".to_string(),
            "--accept-gdpr".to_string(),
        ];
        if let Some(id) = config.server_id {
            args.push(format!("--server-id={}", id));
        }
        Self {
            binary: config.binary.clone(),
            args,
            timeout: config.timeout(),
        }
    }
}

#[async_trait]
impl SpeedTool for SpeedtestCli {
    async fn run(&self) -> Result<ToolOutput, ToolFailure> {
        let mut command = Command::new(&self.binary);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Dropping the `output()` future on timeout kills the child.
        match tokio::time::timeout(self.timeout, command.output()).await {
            Ok(Ok(output)) => Ok(output.into()),
            Ok(Err(source)) => Err(ToolFailure::Spawn {
                command: self.describe(),
                source,
            }),
            Err(_) => Err(ToolFailure::Timeout {
                command: self.describe(),
                seconds: self.timeout.as_secs(),
            }),
        }
    }

    fn describe(&self) -> String {
        format!("{} {}", self.binary, self.args.join(" "))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawResult {
    ping: RawPing,
    download: RawBandwidth,
    upload: RawBandwidth,
    #[serde(default)]
    packet_loss: f64,
    interface: RawInterface,
    isp: String,
    server: RawServer,
    result: RawLink,
    timestamp: String,
}

#[derive(Debug, Deserialize)]
struct RawPing {
    latency: f64,
    jitter: f64,
}

#[derive(Debug, Deserialize)]
struct RawBandwidth {
    bandwidth: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawInterface {
    external_ip: String,
}

#[derive(Debug, Deserialize)]
struct RawServer {
    name: String,
}

#[derive(Debug, Deserialize)]
struct RawLink {
    url: String,
}

/// One successful measurement, ready to publish.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeasurementSummary {
    pub ping_ms: f64,
    pub jitter_ms: f64,
    pub download_mbps: f64,
    pub upload_mbps: f64,
    pub packet_loss: f64,
    pub external_ip: String,
    pub isp: String,
    pub server: String,
    pub result_url: String,
    pub image_url: String,
    pub timestamp: String,
}

impl MeasurementSummary {
    /// Parses the tool's JSON, rendering the timestamp in the local timezone.
    pub fn from_json(stdout: &str) -> Result<Self, ParseError> {
        Self::from_json_in(stdout, &Local)
    }

    /// Parses the tool's JSON, rendering the timestamp in `tz`.
    pub fn from_json_in<Tz>(stdout: &str, tz: &Tz) -> Result<Self, ParseError>
    where
        Tz: TimeZone,
        Tz::Offset: fmt::Display,
    {
        let raw: RawResult = serde_json::from_str(stdout)?;

        let instant = DateTime::parse_from_rfc3339(&raw.timestamp).map_err(|source| {
            ParseError::Timestamp {
                value: raw.timestamp.clone(),
                source,
            }
        })?;
        let timestamp = instant
            .with_timezone(tz)
            .format(TIMESTAMP_FORMAT)
            .to_string();

        let image_url = format!("{}.png", raw.result.url);
        Ok(Self {
            ping_ms: round2(raw.ping.latency),
            jitter_ms: round2(raw.ping.jitter),
            download_mbps: bytes_to_mbps(raw.download.bandwidth),
            upload_mbps: bytes_to_mbps(raw.upload.bandwidth),
            packet_loss: raw.packet_loss,
            external_ip: raw.interface.external_ip,
            isp: raw.isp,
            server: raw.server.name,
            result_url: raw.result.url,
            image_url,
            timestamp,
        })
    }

    /// Every scalar field as `(field name, plain-text value)`, in a fixed order.
    pub fn fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("ping_ms", self.ping_ms.to_string()),
            ("jitter_ms", self.jitter_ms.to_string()),
            ("download_mbps", self.download_mbps.to_string()),
            ("upload_mbps", self.upload_mbps.to_string()),
            ("packet_loss", self.packet_loss.to_string()),
            ("external_ip", self.external_ip.clone()),
            ("isp", self.isp.clone()),
            ("server", self.server.clone()),
            ("result_url", self.result_url.clone()),
            ("image_url", self.image_url.clone()),
            ("timestamp", self.timestamp.clone()),
        ]
    }
}

/// Why the gate turned a run away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Another run holds the gate.
    InFlight,
    /// The previous run started less than the minimum spacing ago.
    TooSoon { retry_in: Duration },
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::InFlight => write!(f, "a speed test is already running"),
            Rejection::TooSoon { retry_in } => {
                write!(f, "last speed test was too recent, retry in {:?}", retry_in)
            }
        }
    }
}

/// Last-run instant behind an async mutex.
///
/// The permit returned by `try_acquire` keeps the mutex locked, so holding it
/// across the tool invocation makes concurrent attempts see `InFlight`.
#[derive(Debug)]
pub struct RateGate {
    min_spacing: Duration,
    last_run: Mutex<Option<Instant>>,
}

pub struct GatePermit<'a> {
    _guard: MutexGuard<'a, Option<Instant>>,
}

impl RateGate {
    pub fn new(min_spacing: Duration) -> Self {
        Self {
            min_spacing,
            last_run: Mutex::new(None),
        }
    }

    /// Checks the spacing and, when allowed, records now as the last run
    /// before handing out the permit.
    pub fn try_acquire(&self) -> Result<GatePermit<'_>, Rejection> {
        let mut last_run = self.last_run.try_lock().map_err(|_| Rejection::InFlight)?;
        let now = Instant::now();

        if let Some(last) = *last_run {
            let elapsed = now.duration_since(last);
            if elapsed < self.min_spacing {
                return Err(Rejection::TooSoon {
                    retry_in: self.min_spacing - elapsed,
                });
            }
        }

        *last_run = Some(now);
        Ok(GatePermit { _guard: last_run })
    }
}

#[derive(Debug)]
pub enum MeasurementOutcome {
    Measured(MeasurementSummary),
    RateLimited(Rejection),
    Failed(ToolFailure),
}

/// Runs the speed test tool behind the rate gate.
pub struct MeasurementRunner {
    gate: RateGate,
    tool: Arc<dyn SpeedTool>,
}

impl MeasurementRunner {
    pub fn new(tool: Arc<dyn SpeedTool>, min_spacing: Duration) -> Self {
        Self {
            gate: RateGate::new(min_spacing),
            tool,
        }
    }

    pub async fn attempt(&self) -> MeasurementOutcome {
        let _permit = match self.gate.try_acquire() {
            Ok(permit) => permit,
            Err(rejection) => return MeasurementOutcome::RateLimited(rejection),
        };

        info!("Running speed test: {}", self.tool.describe());
        let started = Instant::now();

        let output = match self.tool.run().await {
            Ok(output) => output,
            Err(failure) => return MeasurementOutcome::Failed(failure),
        };
        debug!("Speed test finished in {:?}", started.elapsed());

        if !output.success {
            return MeasurementOutcome::Failed(ToolFailure::NonZeroExit {
                code: output.code,
                stdout: output.stdout,
                stderr: output.stderr,
            });
        }

        match MeasurementSummary::from_json(&output.stdout) {
            Ok(summary) => {
                info!(
                    "Speed test result: ping {} ms, down {} Mbps, up {} Mbps via {}",
                    summary.ping_ms, summary.download_mbps, summary.upload_mbps, summary.server
                );
                MeasurementOutcome::Measured(summary)
            }
            Err(e) => MeasurementOutcome::Failed(e.into()),
        }
    }
}
