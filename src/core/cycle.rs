//! One measure-and-publish pass, shared by every trigger.

use std::{fmt, sync::Arc};

use tokio::task::JoinHandle;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, instrument, warn};

use super::{
    measurement::{MeasurementOutcome, MeasurementRunner},
    pipeline::PublishPipeline,
    session::BrokerSession,
};

/// What started a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Schedule,
    Command,
    /// Single run in test mode.
    Once,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Trigger::Schedule => "schedule",
            Trigger::Command => "command",
            Trigger::Once => "once",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The test ran and `messages` publishes were handed to the broker.
    Published { messages: usize },
    /// Another run is in flight or the last one was too recent.
    RateLimited,
    /// The tool failed; nothing was published.
    ToolFailed,
    /// The test ran but no broker session could be opened.
    BrokerUnavailable,
}

pub struct Cycle {
    runner: MeasurementRunner,
    session: Arc<BrokerSession>,
    pipeline: PublishPipeline,
    tasks: TaskTracker,
}

impl Cycle {
    pub fn new(
        runner: MeasurementRunner,
        session: Arc<BrokerSession>,
        pipeline: PublishPipeline,
    ) -> Self {
        Self {
            runner,
            session,
            pipeline,
            tasks: TaskTracker::new(),
        }
    }

    pub fn session(&self) -> &Arc<BrokerSession> {
        &self.session
    }

    /// Measures, then publishes the result. Failures end the cycle and are
    /// logged here; nothing propagates to the trigger.
    #[instrument(name = "cycle", skip(self))]
    pub async fn run(&self, trigger: Trigger) -> CycleOutcome {
        let summary = match self.runner.attempt().await {
            MeasurementOutcome::Measured(summary) => summary,
            MeasurementOutcome::RateLimited(reason) => {
                debug!("Ignoring {} trigger: {}", trigger, reason);
                return CycleOutcome::RateLimited;
            }
            MeasurementOutcome::Failed(failure) => {
                error!("Speed test failed: {}", failure);
                if let Some((stdout, stderr)) = failure.captured_output() {
                    error!(%stdout, %stderr, "Speed test output");
                }
                return CycleOutcome::ToolFailed;
            }
        };

        let session = match self.session.get_or_create().await {
            Ok(session) => session,
            Err(e) => {
                warn!("Broker unavailable, results not published: {}", e);
                return CycleOutcome::BrokerUnavailable;
            }
        };

        let messages = self.pipeline.publish_all(session.as_ref(), &summary).await;
        info!("Cycle complete, {} messages published", messages);
        CycleOutcome::Published { messages }
    }

    /// Runs a cycle on its own tracked task. If `cancel` fires first the
    /// cycle is dropped, which kills a running tool, and the task yields
    /// `None`.
    pub fn spawn(
        self: &Arc<Self>,
        trigger: Trigger,
        cancel: CancellationToken,
    ) -> JoinHandle<Option<CycleOutcome>> {
        let cycle = self.clone();
        self.tasks.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Abandoning {} cycle for shutdown", trigger);
                    None
                }
                outcome = cycle.run(trigger) => Some(outcome),
            }
        })
    }

    /// Waits for every spawned cycle, then shuts the broker session down so
    /// nothing can reconnect.
    pub async fn shutdown(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.session.shutdown().await;
    }
}
