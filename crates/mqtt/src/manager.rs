//! MQTT Manager Module
//!
//! `MqttManager` turns a validated [`Config`] into live connections, and
//! `MqttInstance` is the handle applications publish through.
//!
//! `connect` does the full handshake before returning:
//! 1. Builds the client and event loop
//! 2. Spawns the [`ConnectionKernel`] on its own task
//! 3. Waits for CONNACK, bounded by `connection_timeout`
//!
//! so a caller either gets a connected instance or an error it can log and
//! retry on its next attempt.
//!
//! # Typical Usage
//!
//! ```ignore
//! let manager = MqttManager::from_config(config)?;
//! let instance = manager.connect(SessionOptions {
//!     subscriptions: vec!["home/speedtest/command".into()],
//!     ..Default::default()
//! }).await?;
//!
//! instance.publish("home/speedtest/ping_ms", "12.35", true).await?;
//! instance.shutdown().await;
//! ```

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use rumqttc::{AsyncClient, QoS};
use tokio::{
    sync::{watch, Mutex, Notify},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use validator::Validate;

use super::{
    client::ClientBuilder,
    config::Config,
    connection::{ConnectionKernel, SessionOptions},
    error::TransferError,
    state::ConnectionState,
};

/// Tracks publish calls that are still handing their payload to the client,
/// so shutdown can wait for them before stopping the event loop.
#[derive(Debug, Default)]
struct PublishDrain {
    inflight: AtomicUsize,
    notify: Notify,
}

impl PublishDrain {
    fn enter(self: &Arc<Self>) -> PublishGuard {
        self.inflight.fetch_add(1, Ordering::AcqRel);
        PublishGuard {
            drain: self.clone(),
        }
    }

    fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Acquire)
    }

    async fn wait_idle(&self) {
        loop {
            // Register interest before checking, or a guard dropped in
            // between would notify nobody.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.inflight() == 0 {
                return;
            }
            notified.await;
        }
    }
}

struct PublishGuard {
    drain: Arc<PublishDrain>,
}

impl Drop for PublishGuard {
    fn drop(&mut self) {
        if self.drain.inflight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drain.notify.notify_waiters();
        }
    }
}

/// Entry point for building broker connections.
#[derive(Debug, Clone)]
pub struct MqttManager {
    config: Config,
}

impl MqttManager {
    /// Creates a manager from an existing configuration struct.
    ///
    /// # Errors
    ///
    /// Returns `TransferError::ConfigError` if validation fails.
    pub fn from_config(config: Config) -> Result<Self, TransferError> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Opens a new connection and waits until the broker accepts it.
    ///
    /// # Errors
    ///
    /// - `ConnectTimeout` if no CONNACK arrives within `connection_timeout`
    /// - `ConnectionClosed` if the event loop fails first (refused, DNS, ...)
    pub async fn connect(&self, options: SessionOptions) -> Result<MqttInstance, TransferError> {
        info!(
            "Connecting to MQTT broker {}:{}",
            self.config.host, self.config.port
        );

        let mut builder = ClientBuilder::from_config(&self.config)?;
        if let Some(topic) = &options.availability_topic {
            builder = builder.availability(topic);
        }
        let (client, event_loop) = builder.build();

        let cancel = CancellationToken::new();
        let kernel = ConnectionKernel::new(client.clone(), event_loop, options, cancel.clone());
        let mut state_rx = kernel.subscribe_state();
        let task = tokio::spawn(kernel.run());

        let timeout = Duration::from_secs(self.config.connection_timeout);
        let outcome = tokio::time::timeout(timeout, wait_for_connack(&mut state_rx)).await;

        let failure = match outcome {
            Ok(Ok(())) => {
                return Ok(MqttInstance {
                    client,
                    state_rx,
                    cancel,
                    publish_drain: Arc::new(PublishDrain::default()),
                    task: Arc::new(Mutex::new(Some(task))),
                });
            }
            Ok(Err(reason)) => TransferError::ConnectionClosed(reason),
            Err(_) => TransferError::ConnectTimeout(self.config.connection_timeout),
        };

        cancel.cancel();
        if let Err(e) = task.await {
            debug!("Connection task ended abnormally: {}", e);
        }
        Err(failure)
    }
}

async fn wait_for_connack(state_rx: &mut watch::Receiver<ConnectionState>) -> Result<(), String> {
    loop {
        match &*state_rx.borrow_and_update() {
            ConnectionState::Connected => return Ok(()),
            ConnectionState::Disconnected(reason) => return Err(reason.clone()),
            ConnectionState::Connecting => {}
        }
        if state_rx.changed().await.is_err() {
            return Err("connection task ended".into());
        }
    }
}

/// A connected broker session.
///
/// Cheap to clone; all clones share the same connection, and `shutdown`
/// on any of them closes it for all.
#[derive(Debug, Clone)]
pub struct MqttInstance {
    /// The MQTT client for sending requests
    client: AsyncClient,

    /// Connection state published by the kernel
    state_rx: watch::Receiver<ConnectionState>,

    /// Stops the kernel (after a flushed DISCONNECT)
    cancel: CancellationToken,

    /// In-flight publish calls; shutdown waits for them
    publish_drain: Arc<PublishDrain>,

    /// Kernel task, taken by the first shutdown
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl MqttInstance {
    /// True while the kernel reports `Connected` and no shutdown was requested.
    pub fn is_connected(&self) -> bool {
        !self.cancel.is_cancelled() && self.state_rx.borrow().is_connected()
    }

    /// Publishes `payload` to `topic` at QoS 1.
    ///
    /// Returns once the request is queued for the event loop.
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
        retain: bool,
    ) -> Result<(), TransferError> {
        if self.cancel.is_cancelled() {
            return Err(TransferError::NotConnected);
        }
        let _guard = self.publish_drain.enter();
        self.client
            .publish(topic, QoS::AtLeastOnce, retain, payload.into())
            .await?;
        Ok(())
    }

    /// Gracefully closes the connection.
    ///
    /// Waits for in-flight publish calls, then stops the kernel, which
    /// flushes queued requests and sends DISCONNECT. Calling it again, or
    /// on a connection that already failed, is a no-op.
    pub async fn shutdown(&self) {
        self.publish_drain.wait_idle().await;
        self.cancel.cancel();

        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Connection task ended abnormally: {}", e);
            }
            info!("MQTT connection closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manager_creation() {
        let manager = MqttManager::from_config(Config::default()).unwrap();
        assert_eq!(manager.config.host, "localhost");
        assert_eq!(manager.config.port, 1883);
    }

    #[test]
    fn test_manager_rejects_invalid_config() {
        let result = MqttManager::from_config(Config {
            port: 0,
            ..Default::default()
        });
        assert!(matches!(result, Err(TransferError::ConfigError(_))));
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_fails() {
        // Port 1 on loopback is never an MQTT broker.
        let manager = MqttManager::from_config(Config {
            host: "127.0.0.1".into(),
            port: 1,
            connection_timeout: 5,
            ..Default::default()
        })
        .unwrap();

        let result = manager.connect(SessionOptions::default()).await;
        assert!(matches!(
            result,
            Err(TransferError::ConnectionClosed(_)) | Err(TransferError::ConnectTimeout(_))
        ));
    }

    #[tokio::test]
    async fn test_publish_drain_waits_for_guards() {
        let drain = Arc::new(PublishDrain::default());
        let guard = drain.enter();
        assert_eq!(drain.inflight(), 1);

        let waiter = {
            let drain = drain.clone();
            tokio::spawn(async move { drain.wait_idle().await })
        };

        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
        assert_eq!(drain.inflight(), 0);
    }

    #[tokio::test]
    async fn test_publish_drain_idle_returns_immediately() {
        let drain = PublishDrain::default();
        drain.wait_idle().await;
    }

    #[tokio::test]
    async fn test_wait_for_connack_reports_disconnect_reason() {
        let (tx, mut rx) = watch::channel(ConnectionState::Connecting);
        tx.send(ConnectionState::Disconnected("refused".into())).unwrap();
        assert_eq!(wait_for_connack(&mut rx).await, Err("refused".to_string()));
    }

    #[tokio::test]
    async fn test_wait_for_connack_sees_connected() {
        let (tx, mut rx) = watch::channel(ConnectionState::Connecting);
        let waiter = tokio::spawn(async move { wait_for_connack(&mut rx).await });
        tx.send(ConnectionState::Connected).unwrap();
        assert_eq!(waiter.await.unwrap(), Ok(()));
    }
}
