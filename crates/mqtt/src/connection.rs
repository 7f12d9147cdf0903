//! Connection kernel: the delivery loop behind a session.
//!
//! The kernel owns rumqttc's `EventLoop` and runs on its own tokio task.
//! It is the only place that polls the network, which makes it the
//! "delivery thread" of the application:
//!
//! ```text
//! Application (publish / subscribe through AsyncClient)
//!     ↓ request channel
//! ConnectionKernel::run  ──► inbound publishes ──► mpsc::Sender<InboundMessage>
//!     ↓
//! rumqttc EventLoop (MQTT protocol over TCP)
//! ```
//!
//! Unlike a self-healing client, the kernel does not reconnect. A network
//! error ends the loop and flips the state to `Disconnected`; whoever owns
//! the session notices on next use and builds a new one.
//!
//! Everything the kernel does on its own task must stay non-blocking:
//! requests go out through `try_*` client calls and inbound messages are
//! handed off with `try_send`, so a slow consumer can never stall the loop
//! that also has to drain our own outgoing requests.

use std::time::Duration;

use bytes::Bytes;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, Outgoing, Packet, QoS,
};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::{client::AVAILABILITY_ONLINE, state::ConnectionState};

/// Upper bound for flushing queued requests after a shutdown request.
const DISCONNECT_GRACE: Duration = Duration::from_secs(5);

/// A publish received from the broker on one of our subscriptions.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
}

/// Hooks installed on a connection when it is created.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Topic filters (re)subscribed at QoS 1 after every CONNACK.
    pub subscriptions: Vec<String>,

    /// Where to publish the retained `online` marker after CONNACK. The
    /// matching `offline` last will is registered by the client builder.
    pub availability_topic: Option<String>,

    /// Receiver side of inbound message handling. `None` drops inbound
    /// publishes after tracing them.
    pub inbound: Option<mpsc::Sender<InboundMessage>>,
}

/// Runs the event loop of a single connection.
pub struct ConnectionKernel {
    client: AsyncClient,
    event_loop: EventLoop,
    options: SessionOptions,
    cancel: CancellationToken,
    state_tx: watch::Sender<ConnectionState>,
}

impl ConnectionKernel {
    /// Creates a kernel in the `Connecting` state. Nothing touches the
    /// network until `run` is polled.
    pub fn new(
        client: AsyncClient,
        event_loop: EventLoop,
        options: SessionOptions,
        cancel: CancellationToken,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        Self {
            client,
            event_loop,
            options,
            cancel,
            state_tx,
        }
    }

    /// Returns a receiver observing the connection state.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    fn update_state(&self, state: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                info!("Connection state changed: {} -> {}", current, state);
                *current = state;
                true
            }
        });
    }

    /// Drives the connection until it fails or cancellation is requested.
    ///
    /// On cancellation a DISCONNECT is queued behind any pending publishes
    /// and the loop keeps polling until it has gone out (bounded by a grace
    /// period), so already queued messages are flushed to the broker.
    pub async fn run(mut self) {
        debug!("Starting connection event loop");
        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    self.disconnect().await;
                    self.update_state(ConnectionState::Disconnected("closed by client".into()));
                    debug!("Connection event loop stopped");
                    return;
                }

                event = self.event_loop.poll() => match event {
                    Ok(event) => self.handle_event(event),
                    Err(e) => {
                        let reason = get_error_message(&e);
                        if is_fatal_error(&e) {
                            error!("Broker connection failed permanently: {}", reason);
                        } else {
                            warn!("Broker connection lost: {}", reason);
                        }
                        self.update_state(ConnectionState::Disconnected(reason));
                        return;
                    }
                }
            }
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Incoming(Packet::ConnAck(ack)) => {
                if ack.code == ConnectReturnCode::Success {
                    info!("Connection established successfully");
                    self.update_state(ConnectionState::Connected);
                    self.on_connect();
                }
            }
            Event::Incoming(Packet::Publish(publish)) => {
                trace!("Received publish on topic {}", publish.topic);
                self.forward(InboundMessage {
                    topic: publish.topic,
                    payload: publish.payload,
                });
            }
            Event::Incoming(Packet::Disconnect) => {
                warn!("Disconnected by broker");
                self.update_state(ConnectionState::Disconnected(
                    "Disconnected by broker".into(),
                ));
            }
            Event::Incoming(packet) => trace!("Incoming packet: {:?}", packet),
            Event::Outgoing(outgoing) => trace!("Outgoing packet: {:?}", outgoing),
        }
    }

    /// Re-applies subscriptions and availability after every CONNACK.
    fn on_connect(&self) {
        for topic in &self.options.subscriptions {
            match self.client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
                Ok(()) => info!("Subscribed to topic: {}", topic),
                Err(e) => warn!("Failed to subscribe to '{}': {}", topic, e),
            }
        }

        if let Some(topic) = &self.options.availability_topic {
            if let Err(e) = self.client.try_publish(
                topic.as_str(),
                QoS::AtLeastOnce,
                true,
                AVAILABILITY_ONLINE.as_bytes().to_vec(),
            ) {
                warn!("Failed to publish online status to '{}': {}", topic, e);
            } else {
                debug!("Published online status to {}", topic);
            }
        }
    }

    fn forward(&self, message: InboundMessage) {
        let Some(inbound) = &self.options.inbound else {
            debug!("No inbound handler, dropping message on {}", message.topic);
            return;
        };

        match inbound.try_send(message) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(message)) => {
                warn!("Inbound queue full, dropping message on {}", message.topic);
            }
            Err(mpsc::error::TrySendError::Closed(message)) => {
                debug!("Inbound handler gone, dropping message on {}", message.topic);
            }
        }
    }

    async fn disconnect(&mut self) {
        let mut requested = self.client.try_disconnect().is_ok();
        let deadline = tokio::time::sleep(DISCONNECT_GRACE);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    warn!("Broker did not take DISCONNECT within {:?}", DISCONNECT_GRACE);
                    return;
                }
                event = self.event_loop.poll() => match event {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                        debug!("DISCONNECT sent");
                        return;
                    }
                    Ok(_) => {
                        // The request channel was full; retry once space frees up.
                        if !requested {
                            requested = self.client.try_disconnect().is_ok();
                        }
                    }
                    Err(e) => {
                        debug!("Connection ended during disconnect: {}", get_error_message(&e));
                        return;
                    }
                }
            }
        }
    }
}

/// Errors after which building a new connection with the same settings
/// cannot succeed. Only used to pick the log level; the session still
/// tries again on the next trigger.
fn is_fatal_error(err: &ConnectionError) -> bool {
    match err {
        ConnectionError::Tls(_) | ConnectionError::NotConnAck(_) => true,
        ConnectionError::ConnectionRefused(code) => matches!(
            code,
            ConnectReturnCode::RefusedProtocolVersion
                | ConnectReturnCode::BadClientId
                | ConnectReturnCode::BadUserNamePassword
                | ConnectReturnCode::NotAuthorized
        ),
        ConnectionError::Io(e) => matches!(
            e.kind(),
            std::io::ErrorKind::PermissionDenied | std::io::ErrorKind::InvalidInput
        ),
        _ => false,
    }
}

/// Extracts the innermost error message from an error chain.
fn get_error_message(e: &dyn std::error::Error) -> String {
    let mut current = e;
    while let Some(source) = current.source() {
        current = source;
    }
    current.to_string().trim_matches('"').to_string()
}

#[cfg(test)]
mod tests {
    use std::io;

    use rumqttc::MqttOptions;

    use super::*;

    fn kernel(options: SessionOptions) -> ConnectionKernel {
        let mqtt_options = MqttOptions::new("test", "localhost", 1883);
        let (client, event_loop) = AsyncClient::new(mqtt_options, 10);
        ConnectionKernel::new(client, event_loop, options, CancellationToken::new())
    }

    fn publish(topic: &str, payload: &'static [u8]) -> Event {
        Event::Incoming(Packet::Publish(rumqttc::Publish::new(
            topic,
            QoS::AtLeastOnce,
            payload,
        )))
    }

    #[tokio::test]
    async fn test_initial_state_is_connecting() {
        let kernel = kernel(SessionOptions::default());
        assert_eq!(*kernel.subscribe_state().borrow(), ConnectionState::Connecting);
    }

    #[tokio::test]
    async fn test_connack_marks_connected() {
        let mut kernel = kernel(SessionOptions::default());
        let state_rx = kernel.subscribe_state();
        kernel.handle_event(Event::Incoming(Packet::ConnAck(rumqttc::ConnAck::new(
            ConnectReturnCode::Success,
            false,
        ))));
        assert!(state_rx.borrow().is_connected());
    }

    #[tokio::test]
    async fn test_inbound_publish_is_forwarded() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut kernel = kernel(SessionOptions {
            inbound: Some(tx),
            ..Default::default()
        });

        kernel.handle_event(publish("cmd/topic", b"run"));

        let message = rx.try_recv().unwrap();
        assert_eq!(message.topic, "cmd/topic");
        assert_eq!(&message.payload[..], b"run");
    }

    #[tokio::test]
    async fn test_full_inbound_queue_drops_without_blocking() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut kernel = kernel(SessionOptions {
            inbound: Some(tx),
            ..Default::default()
        });

        kernel.handle_event(publish("cmd", b"first"));
        kernel.handle_event(publish("cmd", b"second"));

        assert_eq!(&rx.try_recv().unwrap().payload[..], b"first");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broker_disconnect_marks_disconnected() {
        let mut kernel = kernel(SessionOptions::default());
        let state_rx = kernel.subscribe_state();
        kernel.handle_event(Event::Incoming(Packet::Disconnect));
        assert!(matches!(*state_rx.borrow(), ConnectionState::Disconnected(_)));
    }

    #[tokio::test]
    async fn test_cancelled_kernel_stops() {
        let kernel = kernel(SessionOptions::default());
        let state_rx = kernel.subscribe_state();
        kernel.cancel.cancel();
        kernel.run().await;
        assert!(matches!(*state_rx.borrow(), ConnectionState::Disconnected(_)));
    }

    #[test]
    fn test_is_fatal_error_detection() {
        let refused = ConnectionError::Io(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "connection refused",
        ));
        assert!(!is_fatal_error(&refused));

        let denied = ConnectionError::Io(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "permission denied",
        ));
        assert!(is_fatal_error(&denied));

        let bad_auth = ConnectionError::ConnectionRefused(ConnectReturnCode::BadUserNamePassword);
        assert!(is_fatal_error(&bad_auth));
    }
}
