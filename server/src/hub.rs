//! Viewer registry and broadcast hub.
//!
//! The registry is the only owner of live viewer sinks. Connection tasks
//! insert on connect and remove on teardown; the hub task snapshots it
//! for each event and evicts sinks whose write fails. Whoever gets `Some`
//! back from [`Registry::remove`] is the one that closes the transport,
//! so a sink is closed exactly once.
//!
//! The hub drains a typed unbounded queue from a single task, so events
//! reach every viewer in the order ingest enqueued them.
//!
//! A viewer registered with [`Registry::insert_replaying`] is still being
//! sent history. Broadcasts to it are held in a per-viewer backlog until
//! [`Registry::go_live`] flushes them, so live frames never interleave with
//! replayed ones.

use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use dashmap::DashMap;
use futures::future::join_all;
use futures::stream::SplitSink;
use futures::SinkExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::RelayError;
use crate::types::LocationEvent;

/// Outbound half of one viewer connection.
#[async_trait]
pub trait ViewerSink: Send {
    async fn send_text(&mut self, text: String) -> Result<(), RelayError>;
    async fn send_ping(&mut self) -> Result<(), RelayError>;
    async fn close(&mut self);
}

#[async_trait]
impl ViewerSink for SplitSink<WebSocket, Message> {
    async fn send_text(&mut self, text: String) -> Result<(), RelayError> {
        self.send(Message::Text(text.into()))
            .await
            .map_err(|e| RelayError::TransportClosed(e.to_string()))
    }

    async fn send_ping(&mut self) -> Result<(), RelayError> {
        self.send(Message::Ping(Default::default()))
            .await
            .map_err(|e| RelayError::TransportClosed(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = SinkExt::close(self).await;
    }
}

pub type SharedSink = Arc<Mutex<Box<dyn ViewerSink>>>;

/// Send one text frame, giving up after `timeout`.
pub async fn send_frame(sink: &SharedSink, text: String, timeout: Duration) -> Result<(), RelayError> {
    tokio::time::timeout(timeout, async {
        let mut guard = sink.lock().await;
        guard.send_text(text).await
    })
    .await
    .map_err(|_| RelayError::TransportClosed("write timed out".into()))?
}

/// Send a ping, giving up after `timeout`.
pub async fn send_ping(sink: &SharedSink, timeout: Duration) -> Result<(), RelayError> {
    tokio::time::timeout(timeout, async {
        let mut guard = sink.lock().await;
        guard.send_ping().await
    })
    .await
    .map_err(|_| RelayError::TransportClosed("ping timed out".into()))?
}

// ═══════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════

/// Outcome of one broadcast cycle.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    /// Held for viewers still replaying.
    pub buffered: usize,
    pub evicted: Vec<Uuid>,
}

enum Delivery {
    Written,
    Buffered,
}

/// One registered connection: its sink plus, while replaying, the live
/// frames it has not been sent yet.
struct Viewer {
    sink: SharedSink,
    backlog: StdMutex<Option<Vec<String>>>,
}

impl Viewer {
    fn backlog(&self) -> MutexGuard<'_, Option<Vec<String>>> {
        self.backlog.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn offer(&self, frame: &str, timeout: Duration) -> Result<Delivery, RelayError> {
        {
            let mut backlog = self.backlog();
            if let Some(pending) = backlog.as_mut() {
                pending.push(frame.to_string());
                return Ok(Delivery::Buffered);
            }
        }
        send_frame(&self.sink, frame.to_string(), timeout).await?;
        Ok(Delivery::Written)
    }
}

/// Every currently connected viewer.
pub struct Registry {
    connections: DashMap<Uuid, Arc<Viewer>>,
    write_timeout: Duration,
}

impl Registry {
    pub fn new(write_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            connections: DashMap::new(),
            write_timeout,
        })
    }

    pub fn write_timeout(&self) -> Duration {
        self.write_timeout
    }

    /// Register a sink that receives broadcasts straight away.
    pub fn insert(&self, sink: Box<dyn ViewerSink>) -> (Uuid, SharedSink) {
        self.register(sink, None)
    }

    /// Register a sink whose broadcasts are held back until [`go_live`].
    ///
    /// [`go_live`]: Registry::go_live
    pub fn insert_replaying(&self, sink: Box<dyn ViewerSink>) -> (Uuid, SharedSink) {
        self.register(sink, Some(Vec::new()))
    }

    fn register(&self, sink: Box<dyn ViewerSink>, backlog: Option<Vec<String>>) -> (Uuid, SharedSink) {
        let id = Uuid::new_v4();
        let sink: SharedSink = Arc::new(Mutex::new(sink));
        let viewer = Viewer {
            sink: Arc::clone(&sink),
            backlog: StdMutex::new(backlog),
        };
        self.connections.insert(id, Arc::new(viewer));
        (id, sink)
    }

    /// Flush everything broadcast to `id` while it was replaying, then let
    /// later broadcasts write to it directly. Returns the number of frames
    /// flushed.
    pub async fn go_live(&self, id: &Uuid) -> Result<usize, RelayError> {
        let Some(viewer) = self.connections.get(id).map(|entry| Arc::clone(entry.value())) else {
            return Ok(0);
        };

        let mut flushed = 0;
        loop {
            // Drain in batches: the hub may append while we write. The
            // backlog is only dropped once it is seen empty under the lock.
            let batch = {
                let mut backlog = viewer.backlog();
                let pending = backlog.take().unwrap_or_default();
                if pending.is_empty() {
                    break;
                }
                *backlog = Some(Vec::new());
                pending
            };
            for frame in batch {
                send_frame(&viewer.sink, frame, self.write_timeout).await?;
                flushed += 1;
            }
        }
        Ok(flushed)
    }

    /// Take a sink out of the registry. `None` if someone already did.
    pub fn remove(&self, id: &Uuid) -> Option<SharedSink> {
        self.connections
            .remove(id)
            .map(|(_, viewer)| Arc::clone(&viewer.sink))
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.connections.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Point-in-time copy of the registered viewers. No map lock is held
    /// once this returns.
    fn snapshot(&self) -> Vec<(Uuid, Arc<Viewer>)> {
        self.connections
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect()
    }

    /// Remove and close a sink. Returns false if it was already gone.
    pub async fn evict(&self, id: &Uuid) -> bool {
        match self.remove(id) {
            Some(sink) => {
                let closing = async {
                    let mut guard = sink.lock().await;
                    ViewerSink::close(&mut **guard).await
                };
                if tokio::time::timeout(self.write_timeout, closing).await.is_err() {
                    debug!(conn_id = %id, "close timed out");
                }
                true
            }
            None => false,
        }
    }

    /// Write `frame` to every viewer registered right now, all writes in
    /// flight at once. A failing viewer is evicted after the cycle and does
    /// not stop delivery to the rest.
    pub async fn broadcast(&self, frame: &str) -> BroadcastReport {
        let viewers = self.snapshot();
        let writes = viewers.iter().map(|(id, viewer)| async move {
            (*id, viewer.offer(frame, self.write_timeout).await)
        });

        let mut report = BroadcastReport::default();
        for (id, outcome) in join_all(writes).await {
            match outcome {
                Ok(Delivery::Written) => report.delivered += 1,
                Ok(Delivery::Buffered) => report.buffered += 1,
                Err(e) => {
                    warn!(conn_id = %id, "broadcast write failed: {e}");
                    report.evicted.push(id);
                }
            }
        }

        for id in &report.evicted {
            if self.evict(id).await {
                info!(conn_id = %id, "viewer evicted after failed write");
            }
        }

        report
    }
}

// ═══════════════════════════════════════════════════════════════
// Hub
// ═══════════════════════════════════════════════════════════════

/// Producer side of the broadcast queue. Cloneable.
#[derive(Clone)]
pub struct Hub {
    tx: mpsc::UnboundedSender<LocationEvent>,
}

impl Hub {
    /// Start the single broadcast task over `registry`.
    pub fn spawn(registry: Arc<Registry>) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run(registry, rx));
        (Self { tx }, handle)
    }

    /// Queue an event for delivery. Never blocks.
    pub fn enqueue(&self, event: LocationEvent) -> Result<(), RelayError> {
        self.tx.send(event).map_err(|_| RelayError::HubClosed)
    }
}

async fn run(registry: Arc<Registry>, mut rx: mpsc::UnboundedReceiver<LocationEvent>) {
    while let Some(event) = rx.recv().await {
        let report = registry.broadcast(&event.to_frame()).await;
        debug!(
            timestamp = %event.timestamp,
            delivered = report.delivered,
            buffered = report.buffered,
            evicted = report.evicted.len(),
            "event broadcast"
        );
    }
    info!("broadcast queue closed, hub stopping");
}
