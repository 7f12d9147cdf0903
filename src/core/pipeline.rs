//! Home Assistant discovery, state values and the result image.
//!
//! A full publish goes: sensor discovery, values, camera discovery, image.
//! Individual publish failures are logged and the sequence carries on; the
//! caller gets back how many messages actually went out.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::{measurement::MeasurementSummary, session::LiveSession};
use crate::config::homeassistant::HomeAssistantConfig;

/// Static metadata for one Home Assistant sensor entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorDescriptor {
    /// Summary field the sensor reads; also the last topic segment.
    pub id: &'static str,
    pub name: &'static str,
    pub unit: Option<&'static str>,
    pub icon: &'static str,
    pub value_template: &'static str,
}

const fn sensor(
    id: &'static str,
    name: &'static str,
    unit: Option<&'static str>,
    icon: &'static str,
) -> SensorDescriptor {
    SensorDescriptor {
        id,
        name,
        unit,
        icon,
        value_template: "{{ value }}",
    }
}

pub const SENSORS: [SensorDescriptor; 9] = [
    sensor("ping_ms", "Ping", Some("ms"), "mdi:speedometer"),
    sensor("jitter_ms", "Jitter", Some("ms"), "mdi:chart-bell-curve"),
    sensor("download_mbps", "Download", Some("Mbps"), "mdi:download-network"),
    sensor("upload_mbps", "Upload", Some("Mbps"), "mdi:upload-network"),
    sensor("packet_loss", "Packet Loss", Some("%"), "mdi:percent"),
    sensor("external_ip", "External IP", None, "mdi:ip-network"),
    sensor("isp", "ISP", None, "mdi:web"),
    sensor("server", "Server", None, "mdi:server-network"),
    sensor("timestamp", "Last Run", None, "mdi:clock-outline"),
];

#[derive(Debug, Error)]
pub enum ImageFetchError {
    #[error("Failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("Request for {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Request for {url} returned HTTP {status}")]
    Status { url: String, status: u16 },
}

#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Bytes, ImageFetchError>;
}

/// Plain HTTP GET with a bounded timeout.
#[derive(Debug, Clone)]
pub struct HttpImageFetcher {
    client: reqwest::Client,
}

impl HttpImageFetcher {
    pub fn new(timeout: Duration) -> Result<Self, ImageFetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("speedbee/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(ImageFetchError::Client)?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ImageFetcher for HttpImageFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes, ImageFetchError> {
        let request_error = |source| ImageFetchError::Request {
            url: url.to_string(),
            source,
        };

        let response = self.client.get(url).send().await.map_err(request_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(ImageFetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        response.bytes().await.map_err(request_error)
    }
}

#[derive(Debug, Clone, Serialize)]
struct DeviceBlock {
    identifiers: Vec<String>,
    name: String,
    manufacturer: String,
    model: String,
}

#[derive(Debug, Serialize)]
struct SensorDiscovery<'a> {
    name: String,
    object_id: String,
    unique_id: String,
    state_topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    unit_of_measurement: Option<&'a str>,
    value_template: &'a str,
    icon: &'a str,
    availability_topic: &'a str,
    device: &'a DeviceBlock,
}

#[derive(Debug, Serialize)]
struct CameraDiscovery<'a> {
    name: &'a str,
    unique_id: String,
    topic: String,
    availability_topic: &'a str,
    device: &'a DeviceBlock,
}

pub struct PublishPipeline {
    ha: HomeAssistantConfig,
    device: DeviceBlock,
    availability_topic: String,
    fetcher: Arc<dyn ImageFetcher>,
}

impl PublishPipeline {
    pub fn new(ha: HomeAssistantConfig, fetcher: Arc<dyn ImageFetcher>) -> Self {
        let device = DeviceBlock {
            identifiers: vec![ha.device_name.clone()],
            name: ha.device_display_name(),
            manufacturer: ha.manufacturer.clone(),
            model: ha.model.clone(),
        };
        let availability_topic = ha.availability_topic();
        Self {
            ha,
            device,
            availability_topic,
            fetcher,
        }
    }

    /// Runs the whole sequence for one summary. Returns the number of
    /// messages handed to the broker.
    pub async fn publish_all(
        &self,
        session: &dyn LiveSession,
        summary: &MeasurementSummary,
    ) -> usize {
        let mut sent = self.publish_discovery_for_all_sensors(session).await;
        sent += self.publish_values(session, summary).await;
        sent += usize::from(self.publish_camera_discovery(session).await);
        sent += usize::from(self.publish_image(session, &summary.image_url).await);
        sent
    }

    pub async fn publish_discovery_for_all_sensors(&self, session: &dyn LiveSession) -> usize {
        let mut sent = 0;
        for sensor in &SENSORS {
            let payload = SensorDiscovery {
                name: format!("Speedtest {}", sensor.name),
                object_id: format!("speedtest_{}", sensor.id),
                unique_id: format!("{}_{}", self.ha.device_name, sensor.id),
                state_topic: self.ha.state_topic(sensor.id),
                unit_of_measurement: sensor.unit,
                value_template: sensor.value_template,
                icon: sensor.icon,
                availability_topic: &self.availability_topic,
                device: &self.device,
            };
            let topic = self.ha.sensor_config_topic(sensor.id);
            sent += usize::from(self.send_json(session, &topic, &payload).await);
        }
        debug!("Published discovery for {}/{} sensors", sent, SENSORS.len());
        sent
    }

    pub async fn publish_camera_discovery(&self, session: &dyn LiveSession) -> bool {
        let payload = CameraDiscovery {
            name: "Speedtest Result Image",
            unique_id: format!("{}_camera", self.ha.device_name),
            topic: self.ha.image_topic(),
            availability_topic: &self.availability_topic,
            device: &self.device,
        };
        self.send_json(session, &self.ha.camera_config_topic(), &payload)
            .await
    }

    /// One retained plain-text message per summary field.
    pub async fn publish_values(
        &self,
        session: &dyn LiveSession,
        summary: &MeasurementSummary,
    ) -> usize {
        let mut sent = 0;
        for (field, value) in summary.fields() {
            let topic = self.ha.state_topic(field);
            sent += usize::from(self.send(session, &topic, value.into_bytes(), true).await);
        }
        info!("Published {} measurement values", sent);
        sent
    }

    /// Downloads the result image and publishes it, not retained.
    pub async fn publish_image(&self, session: &dyn LiveSession, image_url: &str) -> bool {
        let image = match self.fetcher.fetch(image_url).await {
            Ok(image) => image,
            Err(e) => {
                warn!("Skipping result image: {}", e);
                return false;
            }
        };
        debug!("Fetched result image ({} bytes)", image.len());
        self.send(session, &self.ha.image_topic(), image.to_vec(), false)
            .await
    }

    async fn send_json<T: Serialize + Sync>(
        &self,
        session: &dyn LiveSession,
        topic: &str,
        payload: &T,
    ) -> bool {
        match serde_json::to_vec(payload) {
            Ok(bytes) => self.send(session, topic, bytes, true).await,
            Err(e) => {
                warn!("Failed to serialize payload for {}: {}", topic, e);
                false
            }
        }
    }

    async fn send(
        &self,
        session: &dyn LiveSession,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
    ) -> bool {
        match session.publish(topic, payload, retain).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to publish to {}: {}", topic, e);
                false
            }
        }
    }
}
