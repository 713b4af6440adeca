//! MQTT side: the subscription feeding ingest, and the publish path.
//!
//! A single `rumqttc` client serves both directions. Its event loop runs
//! in its own task; incoming publishes are forwarded in delivery order to
//! the ingest task over an unbounded channel so storage latency never
//! stalls broker keep-alives.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::MqttConfig;
use crate::error::RelayError;
use crate::types::LocationInput;

/// Request queue depth between the client handle and its event loop.
const CLIENT_CAPACITY: usize = 64;

/// Pause before polling again after a connection error.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// Whether the event loop currently holds a broker session. Set on every
/// `ConnAck`, cleared on every connection error.
#[derive(Debug, Clone, Default)]
pub struct LinkState(Arc<AtomicBool>);

impl LinkState {
    pub fn is_up(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn set(&self, up: bool) {
        self.0.store(up, Ordering::Release);
    }
}

/// Forwards producer locations onto the broker.
#[async_trait]
pub trait LocationPublisher: Send + Sync {
    async fn publish(&self, location: &LocationInput) -> Result<(), RelayError>;
}

/// Publishes on the shared client. The connection itself is owned and
/// re-established by the event loop task.
///
/// Refuses to publish while the link is down, and never waits on a full
/// request queue: either case is reported as `BrokerUnavailable`.
#[derive(Clone)]
pub struct MqttPublisher {
    client: AsyncClient,
    topic: String,
    link: LinkState,
}

impl MqttPublisher {
    pub fn new(client: AsyncClient, topic: impl Into<String>, link: LinkState) -> Self {
        Self {
            client,
            topic: topic.into(),
            link,
        }
    }
}

#[async_trait]
impl LocationPublisher for MqttPublisher {
    async fn publish(&self, location: &LocationInput) -> Result<(), RelayError> {
        if !self.link.is_up() {
            return Err(RelayError::BrokerUnavailable("not connected to broker".into()));
        }
        let payload = location.to_payload()?;
        self.client
            .try_publish(self.topic.as_str(), QoS::AtMostOnce, false, payload)?;
        debug!(topic = %self.topic, "location published");
        Ok(())
    }
}

/// A connected broker client plus the task driving it.
pub struct BrokerLink {
    pub client: AsyncClient,
    pub payloads: mpsc::UnboundedReceiver<Bytes>,
    pub state: LinkState,
    pub task: JoinHandle<()>,
}

pub fn mqtt_options(config: &MqttConfig) -> MqttOptions {
    let mut opts = MqttOptions::new(&config.client_id, &config.host, config.port);
    opts.set_keep_alive(config.keep_alive);
    if let Some((user, pass)) = &config.credentials {
        opts.set_credentials(user, pass);
    }
    opts
}

/// Connect, wait for the first `ConnAck`, then hand the event loop to a
/// background task. Failing to reach the broker here is fatal to startup.
pub async fn connect(config: &MqttConfig) -> Result<BrokerLink, RelayError> {
    let (client, mut eventloop) = AsyncClient::new(mqtt_options(config), CLIENT_CAPACITY);
    let (tx, payloads) = mpsc::unbounded_channel();
    let link = LinkState::default();

    loop {
        match eventloop.poll().await? {
            Event::Incoming(Packet::ConnAck(ack)) => {
                info!(host = %config.host, port = config.port, code = ?ack.code, "MQTT connection successful");
                subscribe(&client, &config.topic)?;
                link.set(true);
                break;
            }
            other => debug!(?other, "waiting for connack"),
        }
    }

    let task = tokio::spawn(drive(
        eventloop,
        client.clone(),
        config.topic.clone(),
        tx,
        link.clone(),
    ));
    Ok(BrokerLink {
        client,
        payloads,
        state: link,
        task,
    })
}

fn subscribe(client: &AsyncClient, topic: &str) -> Result<(), RelayError> {
    client.try_subscribe(topic, QoS::ExactlyOnce)?;
    info!(topic = %topic, qos = 2, "subscribed");
    Ok(())
}

async fn drive(
    mut eventloop: EventLoop,
    client: AsyncClient,
    topic: String,
    tx: mpsc::UnboundedSender<Bytes>,
    link: LinkState,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                debug!(topic = %publish.topic, bytes = publish.payload.len(), "message received");
                if tx.send(publish.payload).is_err() {
                    info!("ingest stopped, broker loop exiting");
                    return;
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("MQTT reconnected");
                match subscribe(&client, &topic) {
                    Ok(()) => link.set(true),
                    Err(e) => error!("resubscribe failed: {e}"),
                }
            }
            Ok(_) => {}
            Err(e) => {
                if link.is_up() {
                    warn!("MQTT connection lost: {e}");
                } else {
                    debug!("MQTT still unreachable: {e}");
                }
                link.set(false);
                tokio::time::sleep(RECONNECT_BACKOFF).await;
            }
        }
    }
}
