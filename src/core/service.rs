//! Wires the runner, session, pipeline and both triggers together.

use std::{sync::Arc, time::Duration};

use speedbee_mqtt::{InboundMessage, MqttManager, SessionOptions, TransferError};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{
    command::CommandListener,
    cycle::{Cycle, CycleOutcome, Trigger},
    measurement::{MeasurementRunner, SpeedTool, SpeedtestCli},
    pipeline::{HttpImageFetcher, ImageFetchError, ImageFetcher, PublishPipeline},
    schedule::ScheduleLoop,
    session::{BrokerSession, Connector},
};
use crate::config::Config;

/// Upper bound on downloading the result image.
pub const IMAGE_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Commands buffered between the connection kernel and the listener.
pub const INBOUND_CAPACITY: usize = 16;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Invalid transport configuration: {0}")]
    Transport(#[from] TransferError),

    #[error(transparent)]
    ImageFetcher(#[from] ImageFetchError),
}

pub struct Service {
    cycle: Arc<Cycle>,
    session: Arc<BrokerSession>,
    inbound: mpsc::Receiver<InboundMessage>,
    command_topic: String,
    interval: Duration,
    cancel: CancellationToken,
}

impl Service {
    /// Builds the production service: Ookla CLI, rumqttc session, HTTP image fetch.
    pub fn from_config(config: &Config) -> Result<Self, ServiceError> {
        let connector = MqttManager::from_config(config.transport.clone())?;
        let tool = SpeedtestCli::from_config(&config.speedtest);
        let fetcher = HttpImageFetcher::new(IMAGE_FETCH_TIMEOUT)?;

        Ok(Self::with_parts(
            config,
            Arc::new(tool),
            Arc::new(connector),
            Arc::new(fetcher),
        ))
    }

    pub fn with_parts(
        config: &Config,
        tool: Arc<dyn SpeedTool>,
        connector: Arc<dyn Connector>,
        fetcher: Arc<dyn ImageFetcher>,
    ) -> Self {
        let ha = &config.homeassistant;
        let (inbound_tx, inbound) = mpsc::channel(INBOUND_CAPACITY);

        let options = SessionOptions {
            subscriptions: vec![ha.command_topic.clone()],
            availability_topic: Some(ha.availability_topic()),
            inbound: Some(inbound_tx),
        };
        let session = Arc::new(BrokerSession::new(connector, options));
        let runner = MeasurementRunner::new(tool, config.speedtest.min_spacing());
        let pipeline = PublishPipeline::new(ha.clone(), fetcher);

        Self {
            cycle: Arc::new(Cycle::new(runner, session.clone(), pipeline)),
            session,
            inbound,
            command_topic: ha.command_topic.clone(),
            interval: config.schedule.interval(),
            cancel: CancellationToken::new(),
        }
    }

    /// Cancelling this token stops `run`.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs a single cycle and shuts the session down.
    pub async fn run_once(self) -> CycleOutcome {
        let outcome = self.cycle.run(Trigger::Once).await;
        self.cycle.shutdown().await;
        outcome
    }

    /// Connects, then runs the schedule and command listener until cancelled.
    pub async fn run(self) {
        if let Err(e) = self.session.get_or_create().await {
            warn!("Initial broker connection failed, retrying on next cycle: {}", e);
        }

        let listener =
            CommandListener::new(self.command_topic, self.cycle.clone(), self.cancel.clone());
        let listener_task = tokio::spawn(listener.run(self.inbound));

        let schedule = ScheduleLoop::new(self.cycle.clone(), self.interval);
        let schedule_task = tokio::spawn(schedule.run(self.cancel.clone()));

        self.cancel.cancelled().await;
        info!("Shutting down");

        for task in [listener_task, schedule_task] {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }
        // In-flight cycles are abandoned by the same token; wait for them
        // before the final DISCONNECT so none can reconnect afterwards.
        self.cycle.shutdown().await;
        info!("Shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::core::testing::{MockConnector, MockFetcher, MockTool};

    struct Parts {
        tool: Arc<MockTool>,
        connector: Arc<MockConnector>,
        service: Service,
    }

    fn service(config: &Config) -> Parts {
        service_with(config, MockTool::succeeding())
    }

    fn service_with(config: &Config, tool: MockTool) -> Parts {
        let tool = Arc::new(tool);
        let connector = Arc::new(MockConnector::default());
        let service = Service::with_parts(
            config,
            tool.clone(),
            connector.clone(),
            Arc::new(MockFetcher::serving(b"png")),
        );
        Parts {
            tool,
            connector,
            service,
        }
    }

    #[tokio::test]
    async fn test_run_once_publishes_and_closes() {
        let Parts {
            tool,
            connector,
            service,
        } = service(&Config::default());

        assert!(matches!(
            service.run_once().await,
            CycleOutcome::Published { .. }
        ));
        assert_eq!(tool.invocations(), 1);
        assert_eq!(connector.connects(), 1);
        assert_eq!(connector.sessions()[0].closes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_service_lifecycle() {
        let mut config = Config::default();
        config.schedule.interval = 3600;
        let Parts {
            tool,
            connector,
            service,
        } = service(&config);
        let cancel = service.cancel_token();
        let task = tokio::spawn(service.run());

        // Eager connect plus the immediate first tick.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(connector.connects(), 1);
        assert_eq!(tool.invocations(), 1);

        let options = connector.last_options().unwrap();
        assert_eq!(options.subscriptions, ["home/internet/speedtest/command"]);
        assert_eq!(
            options.availability_topic.as_deref(),
            Some("home/internet/speedtest/status")
        );

        // A command after the spacing window runs on the same session.
        tokio::time::sleep(Duration::from_secs(40)).await;
        options
            .inbound
            .unwrap()
            .send(InboundMessage {
                topic: "home/internet/speedtest/command".into(),
                payload: Bytes::from_static(b"run"),
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(tool.invocations(), 2);
        assert_eq!(connector.connects(), 1);

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(connector.sessions()[0].closes(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_during_measurement_leaves_no_session_open() {
        let Parts {
            tool,
            connector,
            service,
        } = service_with(&Config::default(), MockTool::succeeding().held());
        let cancel = service.cancel_token();
        let task = tokio::spawn(service.run());

        tool.wait_started().await;
        cancel.cancel();
        task.await.unwrap();
        assert_eq!(connector.connects(), 1);
        assert_eq!(connector.sessions()[0].closes(), 1);

        // Letting the tool finish must not open a second connection.
        tool.release();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(connector.connects(), 1);
        assert!(connector.sessions()[0].published().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_connect_failure_is_not_fatal() {
        let Parts {
            tool,
            connector,
            service,
        } = service(&Config::default());
        connector.fail_next(1);
        let cancel = service.cancel_token();
        let task = tokio::spawn(service.run());

        tokio::time::sleep(Duration::from_secs(1)).await;
        // The first cycle reconnected after the failed eager attempt.
        assert_eq!(tool.invocations(), 1);
        assert_eq!(connector.connects(), 1);

        cancel.cancel();
        task.await.unwrap();
    }

    #[test]
    fn test_from_config_builds_production_parts() {
        assert!(Service::from_config(&Config::default()).is_ok());
    }
}
