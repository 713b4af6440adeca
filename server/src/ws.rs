//! WebSocket viewer connections.
//!
//! Flow per connection:
//! 1. Accept WS upgrade
//! 2. Register the sink as replaying, so nothing broadcast from here on is
//!    missed; broadcasts are held in its backlog
//! 3. Replay every stored bucket in key order
//! 4. Flush the backlog, then read until the client goes away, pinging to
//!    detect dead peers
//! 5. Evict from the registry and close
//!
//! Registering before replay means an event ingested during replay can
//! arrive twice (once from history, once live). It is never lost, and no
//! live frame is sent before the last history frame.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::{Stream, StreamExt};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::RelayError;
use crate::hub::{send_frame, send_ping, Registry, SharedSink};
use crate::state::AppState;
use crate::store::LocationStore;
use crate::types::LocationEvent;

/// Axum handler for GET /ws — upgrades to WebSocket.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_failed_upgrade(|e| warn!("websocket upgrade failed: {e}"))
        .on_upgrade(move |socket| handle_socket(socket, state))
}

/// Per-connection state machine.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (sender, receiver) = socket.split();

    // ── Replaying ───────────────────────────────────────────
    let (conn_id, sink) = state.registry.insert_replaying(Box::new(sender));
    info!(conn_id = %conn_id, viewers = state.registry.len(), "viewer connected");

    let caught_up = async {
        let sent = replay(state.store.as_ref(), &sink, state.registry.write_timeout()).await?;
        let held = state.registry.go_live(&conn_id).await?;
        Ok::<_, RelayError>((sent, held))
    };

    match caught_up.await {
        Ok((sent, held)) => {
            info!(conn_id = %conn_id, sent, held, "replay complete, going live");

            // ── Live ────────────────────────────────────────
            let timers = LiveTimers {
                ping_interval: state.config.ping_interval,
                idle_timeout: state.config.idle_timeout,
            };
            let exit = live(receiver, &sink, conn_id, &state.registry, timers).await;
            debug!(conn_id = %conn_id, ?exit, "live loop ended");
        }
        Err(e) => warn!(conn_id = %conn_id, "replay aborted: {e}"),
    }

    // ── Closing ─────────────────────────────────────────────
    if state.registry.evict(&conn_id).await {
        info!(conn_id = %conn_id, viewers = state.registry.len(), "viewer disconnected");
    } else {
        debug!(conn_id = %conn_id, "already evicted by hub");
    }
}

// ═══════════════════════════════════════════════════════════════
// Replay
// ═══════════════════════════════════════════════════════════════

/// Stream every stored pair to `sink`, oldest key first, one frame per
/// pair. Store failures degrade the replay (a bucket that cannot be read is
/// skipped); a failed write ends it with `TransportClosed`.
pub async fn replay(
    store: &dyn LocationStore,
    sink: &SharedSink,
    write_timeout: Duration,
) -> Result<usize, RelayError> {
    let mut keys = match store.keys().await {
        Ok(keys) => keys,
        Err(e) => {
            warn!("cannot list buckets, replaying nothing: {e}");
            return Ok(0);
        }
    };
    // Keys are fixed-width timestamps: string order is time order.
    keys.sort_unstable();

    let mut sent = 0;
    for key in &keys {
        let values = match store.range(key).await {
            Ok(values) => values,
            Err(e) => {
                warn!(key = %key, "skipping bucket: {e}");
                continue;
            }
        };

        let mut pairs = values.chunks_exact(2);
        for pair in &mut pairs {
            let event = LocationEvent::new(pair[0].as_str(), pair[1].as_str(), key.as_str());
            send_frame(sink, event.to_frame(), write_timeout).await?;
            sent += 1;
        }
        if !pairs.remainder().is_empty() {
            warn!(key = %key, "bucket ends with an unpaired value, skipped");
        }
    }

    Ok(sent)
}

// ═══════════════════════════════════════════════════════════════
// Live
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy)]
pub struct LiveTimers {
    pub ping_interval: Duration,
    pub idle_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveExit {
    ClientClosed,
    ReadError,
    IdleTimeout,
    PingFailed,
    /// The hub dropped this viewer after a failed broadcast write.
    Evicted,
}

/// Wait for the viewer to go away. Inbound frames carry no meaning; any of
/// them (pongs included) only pushes the idle deadline back.
pub async fn live<S, E>(
    mut receiver: S,
    sink: &SharedSink,
    conn_id: Uuid,
    registry: &Registry,
    timers: LiveTimers,
) -> LiveExit
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let mut ping = tokio::time::interval_at(
        Instant::now() + timers.ping_interval,
        timers.ping_interval,
    );
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let idle = tokio::time::sleep(timers.idle_timeout);
    tokio::pin!(idle);

    loop {
        tokio::select! {
            msg = receiver.next() => match msg {
                None | Some(Ok(Message::Close(_))) => return LiveExit::ClientClosed,
                Some(Err(e)) => {
                    debug!(conn_id = %conn_id, "ws recv error: {e}");
                    return LiveExit::ReadError;
                }
                Some(Ok(_)) => idle.as_mut().reset(Instant::now() + timers.idle_timeout),
            },
            _ = ping.tick() => {
                if !registry.contains(&conn_id) {
                    return LiveExit::Evicted;
                }
                if let Err(e) = send_ping(sink, registry.write_timeout()).await {
                    debug!(conn_id = %conn_id, "ping failed: {e}");
                    return LiveExit::PingFailed;
                }
            }
            () = &mut idle => {
                info!(conn_id = %conn_id, "viewer idle too long");
                return LiveExit::IdleTimeout;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use futures::channel::mpsc;

    use super::*;
    use crate::hub::testing::RecordingSink;
    use crate::store::MemoryStore;

    const WRITE_TIMEOUT: Duration = Duration::from_millis(100);

    fn pair(lat: &str, lon: &str) -> Vec<String> {
        vec![lat.to_string(), lon.to_string()]
    }

    /// Fails `range` for one key, delegates everything else.
    struct FlakyStore {
        inner: MemoryStore,
        bad_key: &'static str,
    }

    #[async_trait]
    impl LocationStore for FlakyStore {
        async fn append(&self, key: &str, values: &[String]) -> Result<(), RelayError> {
            self.inner.append(key, values).await
        }
        async fn range(&self, key: &str) -> Result<Vec<String>, RelayError> {
            if key == self.bad_key {
                return Err(RelayError::StoreUnavailable("timeout".into()));
            }
            self.inner.range(key).await
        }
        async fn keys(&self) -> Result<Vec<String>, RelayError> {
            self.inner.keys().await
        }
    }

    #[tokio::test]
    async fn test_replay_orders_keys_then_arrival() {
        let store = MemoryStore::new();
        store.append("24_01_01-10:00:02", &pair("3", "3")).await.unwrap();
        store.append("24_01_01-10:00:00", &pair("1", "1")).await.unwrap();
        store.append("24_01_01-10:00:01", &pair("2a", "2a")).await.unwrap();
        store.append("24_01_01-10:00:01", &pair("2b", "2b")).await.unwrap();

        let registry = Registry::new(WRITE_TIMEOUT);
        let (sink, frames, _) = RecordingSink::new();
        let (_, shared) = registry.insert(Box::new(sink));

        let sent = replay(&store, &shared, WRITE_TIMEOUT).await.unwrap();
        assert_eq!(sent, 4);

        let got: Vec<LocationEvent> = frames
            .lock()
            .unwrap()
            .iter()
            .map(|f| serde_json::from_str(f).unwrap())
            .collect();
        let lats: Vec<&str> = got.iter().map(|e| e.latitude.as_str()).collect();
        assert_eq!(lats, vec!["1", "2a", "2b", "3"]);
        assert_eq!(got[1].timestamp, "24_01_01-10:00:01");
    }

    #[tokio::test]
    async fn test_replay_skips_unreadable_bucket() {
        let store = FlakyStore {
            inner: MemoryStore::new(),
            bad_key: "k2",
        };
        store.append("k1", &pair("1", "1")).await.unwrap();
        store.append("k2", &pair("2", "2")).await.unwrap();
        store.append("k3", &pair("3", "3")).await.unwrap();

        let registry = Registry::new(WRITE_TIMEOUT);
        let (sink, frames, _) = RecordingSink::new();
        let (_, shared) = registry.insert(Box::new(sink));

        assert_eq!(replay(&store, &shared, WRITE_TIMEOUT).await.unwrap(), 2);
        assert_eq!(frames.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_replay_drops_dangling_value() {
        let store = MemoryStore::new();
        store
            .append("k", &["1".to_string(), "2".to_string(), "3".to_string()])
            .await
            .unwrap();

        let registry = Registry::new(WRITE_TIMEOUT);
        let (sink, frames, _) = RecordingSink::new();
        let (_, shared) = registry.insert(Box::new(sink));

        assert_eq!(replay(&store, &shared, WRITE_TIMEOUT).await.unwrap(), 1);
        assert_eq!(
            frames.lock().unwrap()[0],
            r#"{"lat":"1","lon":"2","timestamp":"k"}"#
        );
    }

    #[tokio::test]
    async fn test_replay_stops_on_broken_viewer() {
        let store = MemoryStore::new();
        store.append("k", &pair("1", "1")).await.unwrap();

        let registry = Registry::new(WRITE_TIMEOUT);
        let (sink, _) = RecordingSink::broken();
        let (_, shared) = registry.insert(Box::new(sink));

        let err = replay(&store, &shared, WRITE_TIMEOUT).await.unwrap_err();
        assert!(matches!(err, RelayError::TransportClosed(_)));
    }

    fn timers(ping_ms: u64, idle_ms: u64) -> LiveTimers {
        LiveTimers {
            ping_interval: Duration::from_millis(ping_ms),
            idle_timeout: Duration::from_millis(idle_ms),
        }
    }

    #[tokio::test]
    async fn test_live_ends_on_client_close() {
        let registry = Registry::new(WRITE_TIMEOUT);
        let (sink, _, _) = RecordingSink::new();
        let (id, shared) = registry.insert(Box::new(sink));

        let (tx, rx) = mpsc::unbounded::<Result<Message, std::io::Error>>();
        tx.unbounded_send(Ok(Message::Text("hi".into()))).unwrap();
        tx.unbounded_send(Ok(Message::Close(None))).unwrap();

        let exit = live(rx, &shared, id, &registry, timers(1000, 1000)).await;
        assert_eq!(exit, LiveExit::ClientClosed);
    }

    #[tokio::test]
    async fn test_live_ends_on_read_error() {
        let registry = Registry::new(WRITE_TIMEOUT);
        let (sink, _, _) = RecordingSink::new();
        let (id, shared) = registry.insert(Box::new(sink));

        let (tx, rx) = mpsc::unbounded::<Result<Message, std::io::Error>>();
        tx.unbounded_send(Err(std::io::Error::other("reset"))).unwrap();

        let exit = live(rx, &shared, id, &registry, timers(1000, 1000)).await;
        assert_eq!(exit, LiveExit::ReadError);
    }

    #[tokio::test]
    async fn test_live_silent_client_times_out() {
        let registry = Registry::new(WRITE_TIMEOUT);
        let (sink, _, _) = RecordingSink::new();
        let (id, shared) = registry.insert(Box::new(sink));

        let (_tx, rx) = mpsc::unbounded::<Result<Message, std::io::Error>>();
        let exit = live(rx, &shared, id, &registry, timers(20, 80)).await;
        assert_eq!(exit, LiveExit::IdleTimeout);
    }

    #[tokio::test]
    async fn test_live_notices_eviction() {
        let registry = Registry::new(WRITE_TIMEOUT);
        let (sink, _, _) = RecordingSink::new();
        let (id, shared) = registry.insert(Box::new(sink));
        registry.remove(&id);

        let (_tx, rx) = mpsc::unbounded::<Result<Message, std::io::Error>>();
        let exit = live(rx, &shared, id, &registry, timers(20, 5000)).await;
        assert_eq!(exit, LiveExit::Evicted);
    }

    #[tokio::test]
    async fn test_live_ping_failure_ends_loop() {
        let registry = Registry::new(WRITE_TIMEOUT);
        let (sink, _) = RecordingSink::broken();
        let (id, shared) = registry.insert(Box::new(sink));

        let (_tx, rx) = mpsc::unbounded::<Result<Message, std::io::Error>>();
        let exit = live(rx, &shared, id, &registry, timers(20, 5000)).await;
        assert_eq!(exit, LiveExit::PingFailed);
    }

    /// Yields before every read so a concurrent broadcast gets polled
    /// between buckets.
    struct YieldingStore(MemoryStore);

    #[async_trait]
    impl LocationStore for YieldingStore {
        async fn append(&self, key: &str, values: &[String]) -> Result<(), RelayError> {
            self.0.append(key, values).await
        }
        async fn range(&self, key: &str) -> Result<Vec<String>, RelayError> {
            tokio::task::yield_now().await;
            self.0.range(key).await
        }
        async fn keys(&self) -> Result<Vec<String>, RelayError> {
            self.0.keys().await
        }
    }

    #[tokio::test]
    async fn test_live_frame_never_precedes_history() {
        const BUCKETS: usize = 500;
        let store = YieldingStore(MemoryStore::new());
        for i in 0..BUCKETS {
            store
                .append(&format!("k{i:04}"), &pair(&i.to_string(), "0"))
                .await
                .unwrap();
        }

        let registry = Registry::new(WRITE_TIMEOUT);
        let (sink, frames, _) = RecordingSink::new();
        let (id, shared) = registry.insert_replaying(Box::new(sink));

        let live_event = LocationEvent::new("live", "live", "k9999");
        let broadcasting = async {
            // Let replay get partway through first.
            for _ in 0..10 {
                tokio::task::yield_now().await;
            }
            registry.broadcast(&live_event.to_frame()).await
        };
        let (sent, report) = tokio::join!(replay(&store, &shared, WRITE_TIMEOUT), broadcasting);
        assert_eq!(sent.unwrap(), BUCKETS);
        assert_eq!(report.buffered, 1);
        assert_eq!(frames.lock().unwrap().len(), BUCKETS);

        assert_eq!(registry.go_live(&id).await.unwrap(), 1);

        let frames = frames.lock().unwrap();
        assert_eq!(frames.len(), BUCKETS + 1);
        let live_at = frames
            .iter()
            .position(|f| *f == live_event.to_frame())
            .unwrap();
        assert_eq!(live_at, BUCKETS, "live frame sent before history finished");
    }
}
