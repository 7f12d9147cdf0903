//! On-demand run commands received over MQTT.
//!
//! The connection kernel forwards every inbound publish into a bounded
//! channel; [`CommandListener::run`] drains it on its own task and starts a
//! cycle for each recognised command without waiting for it to finish.

use std::sync::Arc;

use speedbee_mqtt::InboundMessage;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::cycle::{Cycle, CycleOutcome, Trigger};

/// Payloads (case-insensitive, surrounding whitespace ignored) that start a run.
pub const RUN_COMMANDS: [&str; 4] = ["run", "start", "execute", "go"];

/// True if `payload` is one of [`RUN_COMMANDS`].
pub fn is_run_command(payload: &str) -> bool {
    let payload = payload.trim();
    RUN_COMMANDS
        .iter()
        .any(|command| payload.eq_ignore_ascii_case(command))
}

pub struct CommandListener {
    topic: String,
    cycle: Arc<Cycle>,
    cancel: CancellationToken,
}

impl CommandListener {
    /// `cancel` stops the listener and abandons the cycles it started.
    pub fn new(
        topic: impl Into<String>,
        cycle: Arc<Cycle>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            topic: topic.into(),
            cycle,
            cancel,
        }
    }

    /// Handles one inbound message. Returns the spawned cycle, if any.
    pub fn handle(&self, message: &InboundMessage) -> Option<JoinHandle<Option<CycleOutcome>>> {
        if message.topic != self.topic {
            debug!("Ignoring message on unexpected topic {}", message.topic);
            return None;
        }

        let payload = match std::str::from_utf8(&message.payload) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Discarding non-UTF-8 command on {}: {}", message.topic, e);
                return None;
            }
        };

        if !is_run_command(payload) {
            info!("Ignoring unrecognised command '{}'", payload.trim());
            return None;
        }

        info!("Run command received on {}", message.topic);
        Some(self.cycle.spawn(Trigger::Command, self.cancel.clone()))
    }

    /// Drains `inbound` until it closes or the listener is cancelled.
    pub async fn run(self, mut inbound: mpsc::Receiver<InboundMessage>) {
        info!("Listening for commands on {}", self.topic);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                message = inbound.recv() => match message {
                    Some(message) => {
                        self.handle(&message);
                    }
                    None => {
                        debug!("Inbound channel closed");
                        break;
                    }
                },
            }
        }
        info!("Command listener stopped");
    }
}
