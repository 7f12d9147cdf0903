//! Hand-written doubles shared by the core test suites.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use speedbee_mqtt::{SessionOptions, TransferError};
use tokio::sync::{Notify, Semaphore};

use super::{
    cycle::Cycle,
    measurement::{MeasurementRunner, SpeedTool, ToolFailure, ToolOutput},
    pipeline::{ImageFetchError, ImageFetcher, PublishPipeline},
    session::{BrokerSession, Connector, LiveSession, Publisher},
};
use crate::config::homeassistant::HomeAssistantConfig;

/// Trimmed real-world `speedtest --format=json` output.
pub const SAMPLE_OUTPUT: &str = r#"{
    "type": "result",
    "timestamp": "2024-06-01T08:30:15Z",
    "ping": { "jitter": 1.234, "latency": 12.345, "low": 11.9, "high": 14.2 },
    "download": { "bandwidth": 12500000, "bytes": 150000000, "elapsed": 12000 },
    "upload": { "bandwidth": 1250000, "bytes": 15000000, "elapsed": 12000 },
    "isp": "Example ISP",
    "interface": {
        "internalIp": "192.168.1.20",
        "name": "eth0",
        "isVpn": false,
        "externalIp": "203.0.113.7"
    },
    "server": { "id": 4242, "name": "Example Server", "location": "Springfield" },
    "result": { "id": "1", "url": "https://example/r/1", "persisted": true }
}"#;

/// The smallest output the summary accepts: required keys only.
pub const MINIMAL_OUTPUT: &str = r#"{
    "ping": { "latency": 12.345, "jitter": 1.2 },
    "download": { "bandwidth": 12500000 },
    "upload": { "bandwidth": 1250000 },
    "interface": { "externalIp": "1.2.3.4" },
    "isp": "ExampleISP",
    "server": { "name": "SrvA" },
    "result": { "url": "https://example/r/1" },
    "timestamp": "2024-01-01T00:00:00Z"
}"#;

struct Hold {
    started: Notify,
    release: Semaphore,
}

pub struct MockTool {
    outcome: fn() -> Result<ToolOutput, ToolFailure>,
    output: ToolOutput,
    invocations: AtomicUsize,
    hold: Option<Hold>,
}

impl MockTool {
    pub fn succeeding() -> Self {
        Self::printing(SAMPLE_OUTPUT)
    }

    pub fn printing(stdout: &str) -> Self {
        Self::with_output(ToolOutput {
            success: true,
            code: Some(0),
            stdout: stdout.to_string(),
            stderr: String::new(),
        })
    }

    pub fn exiting(code: i32, stdout: &str, stderr: &str) -> Self {
        Self::with_output(ToolOutput {
            success: false,
            code: Some(code),
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        })
    }

    pub fn timing_out() -> Self {
        Self {
            outcome: || {
                Err(ToolFailure::Timeout {
                    command: "speedtest".into(),
                    seconds: 180,
                })
            },
            ..Self::succeeding()
        }
    }

    fn with_output(output: ToolOutput) -> Self {
        Self {
            outcome: || Ok(ToolOutput::default()),
            output,
            invocations: AtomicUsize::new(0),
            hold: None,
        }
    }

    /// Makes every run block until `release` is called.
    pub fn held(mut self) -> Self {
        self.hold = Some(Hold {
            started: Notify::new(),
            release: Semaphore::new(0),
        });
        self
    }

    pub async fn wait_started(&self) {
        if let Some(hold) = &self.hold {
            hold.started.notified().await;
        }
    }

    pub fn release(&self) {
        if let Some(hold) = &self.hold {
            hold.release.add_permits(1);
        }
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SpeedTool for MockTool {
    async fn run(&self) -> Result<ToolOutput, ToolFailure> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        if let Some(hold) = &self.hold {
            hold.started.notify_one();
            hold.release.acquire().await.unwrap().forget();
        }
        (self.outcome)().map(|_| self.output.clone())
    }

    fn describe(&self) -> String {
        "mock speedtest".to_string()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

impl Published {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

pub struct MockSession {
    connected: AtomicBool,
    closes: AtomicUsize,
    published: Mutex<Vec<Published>>,
    failing_topics: Mutex<Vec<String>>,
}

impl Default for MockSession {
    fn default() -> Self {
        Self {
            connected: AtomicBool::new(true),
            closes: AtomicUsize::new(0),
            published: Mutex::new(Vec::new()),
            failing_topics: Mutex::new(Vec::new()),
        }
    }
}

impl MockSession {
    pub fn published(&self) -> Vec<Published> {
        self.published.lock().unwrap().clone()
    }

    pub fn topics(&self) -> Vec<String> {
        self.published().into_iter().map(|p| p.topic).collect()
    }

    pub fn find(&self, topic: &str) -> Option<Published> {
        self.published().into_iter().find(|p| p.topic == topic)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Simulates the broker dropping the connection.
    pub fn drop_connection(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn fail_topic(&self, topic: &str) {
        self.failing_topics.lock().unwrap().push(topic.to_string());
    }
}

#[async_trait]
impl Publisher for MockSession {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
    ) -> Result<(), TransferError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransferError::NotConnected);
        }
        if self.failing_topics.lock().unwrap().iter().any(|t| t == topic) {
            return Err(TransferError::NotConnected);
        }
        self.published.lock().unwrap().push(Published {
            topic: topic.to_string(),
            payload,
            retain,
        });
        Ok(())
    }
}

#[async_trait]
impl LiveSession for MockSession {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct MockConnector {
    sessions: Mutex<Vec<Arc<MockSession>>>,
    options: Mutex<Vec<SessionOptions>>,
    fail_next: AtomicUsize,
}

impl MockConnector {
    /// Successful connections so far.
    pub fn connects(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn sessions(&self) -> Vec<Arc<MockSession>> {
        self.sessions.lock().unwrap().clone()
    }

    pub fn last_session(&self) -> Option<Arc<MockSession>> {
        self.sessions.lock().unwrap().last().cloned()
    }

    pub fn last_options(&self) -> Option<SessionOptions> {
        self.options.lock().unwrap().last().cloned()
    }

    /// The next `n` connection attempts fail.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        options: SessionOptions,
    ) -> Result<Arc<dyn LiveSession>, TransferError> {
        self.options.lock().unwrap().push(options);
        let failing = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TransferError::ConnectTimeout(1));
        }

        let session = Arc::new(MockSession::default());
        self.sessions.lock().unwrap().push(session.clone());
        Ok(session)
    }
}

pub struct MockFetcher {
    image: Option<Bytes>,
    requests: Mutex<Vec<String>>,
}

impl MockFetcher {
    pub fn serving(image: &'static [u8]) -> Self {
        Self {
            image: Some(Bytes::from_static(image)),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            image: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ImageFetcher for MockFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes, ImageFetchError> {
        self.requests.lock().unwrap().push(url.to_string());
        self.image.clone().ok_or_else(|| ImageFetchError::Status {
            url: url.to_string(),
            status: 404,
        })
    }
}

/// A cycle wired to mocks with the default topic layout and 30 s spacing.
pub struct Harness {
    pub tool: Arc<MockTool>,
    pub connector: Arc<MockConnector>,
    pub cycle: Arc<Cycle>,
}

impl Harness {
    pub fn new(tool: MockTool) -> Self {
        let tool = Arc::new(tool);
        let connector = Arc::new(MockConnector::default());
        let fetcher = Arc::new(MockFetcher::serving(b"png"));

        let runner = MeasurementRunner::new(tool.clone(), Duration::from_secs(30));
        let session = Arc::new(BrokerSession::new(
            connector.clone(),
            SessionOptions::default(),
        ));
        let pipeline = PublishPipeline::new(HomeAssistantConfig::default(), fetcher);

        Self {
            tool,
            connector,
            cycle: Arc::new(Cycle::new(runner, session, pipeline)),
        }
    }
}
