//! The shared broker session.
//!
//! Every trigger publishes through one [`BrokerSession`]. It connects lazily,
//! hands out the same live connection while the broker keeps it, and replaces
//! it on the next request once it has dropped. Only `get_or_create`,
//! `close` and `shutdown` touch the slot, all under one async mutex.

use std::sync::Arc;

use async_trait::async_trait;
use speedbee_mqtt::{MqttInstance, MqttManager, SessionOptions, TransferError};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Something messages can be published through.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool)
        -> Result<(), TransferError>;
}

/// A broker connection as seen by the cycle.
#[async_trait]
pub trait LiveSession: Publisher {
    fn is_connected(&self) -> bool;

    /// Flushes queued publishes and disconnects. Safe to call repeatedly.
    async fn close(&self);
}

/// Opens broker connections.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, options: SessionOptions)
        -> Result<Arc<dyn LiveSession>, TransferError>;
}

#[async_trait]
impl Publisher for MqttInstance {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
    ) -> Result<(), TransferError> {
        MqttInstance::publish(self, topic, payload, retain).await
    }
}

#[async_trait]
impl LiveSession for MqttInstance {
    fn is_connected(&self) -> bool {
        MqttInstance::is_connected(self)
    }

    async fn close(&self) {
        self.shutdown().await
    }
}

#[async_trait]
impl Connector for MqttManager {
    async fn connect(
        &self,
        options: SessionOptions,
    ) -> Result<Arc<dyn LiveSession>, TransferError> {
        let instance = MqttManager::connect(self, options).await?;
        Ok(Arc::new(instance))
    }
}

#[derive(Default)]
struct Slot {
    live: Option<Arc<dyn LiveSession>>,
    shut_down: bool,
}

pub struct BrokerSession {
    connector: Arc<dyn Connector>,
    options: SessionOptions,
    slot: Mutex<Slot>,
}

impl BrokerSession {
    /// `options` are reused for every connection this session opens.
    pub fn new(connector: Arc<dyn Connector>, options: SessionOptions) -> Self {
        Self {
            connector,
            options,
            slot: Mutex::new(Slot::default()),
        }
    }

    /// Returns the live connection, opening a new one if there is none or
    /// the previous one has dropped.
    ///
    /// Concurrent callers wait on each other, so at most one connection
    /// attempt is in progress at a time. Fails with `NotConnected` after
    /// `shutdown`.
    pub async fn get_or_create(&self) -> Result<Arc<dyn LiveSession>, TransferError> {
        let mut slot = self.slot.lock().await;
        if slot.shut_down {
            return Err(TransferError::NotConnected);
        }

        if let Some(session) = slot.live.as_ref() {
            if session.is_connected() {
                return Ok(session.clone());
            }
        }

        if let Some(stale) = slot.live.take() {
            info!("Broker session is no longer connected, reconnecting");
            stale.close().await;
        }

        let session = self.connector.connect(self.options.clone()).await?;
        info!("Broker session established");
        slot.live = Some(session.clone());
        Ok(session)
    }

    /// Closes the current connection, if any. Idempotent; a later
    /// `get_or_create` connects again.
    pub async fn close(&self) {
        let mut slot = self.slot.lock().await;
        Self::close_live(&mut slot).await;
    }

    /// Closes the current connection and refuses any further ones.
    pub async fn shutdown(&self) {
        let mut slot = self.slot.lock().await;
        slot.shut_down = true;
        Self::close_live(&mut slot).await;
    }

    async fn close_live(slot: &mut Slot) {
        match slot.live.take() {
            Some(session) => {
                session.close().await;
                info!("Broker session closed");
            }
            None => debug!("No broker session to close"),
        }
    }
}
