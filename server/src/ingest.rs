//! Ingest pipeline: broker payload → store → hub.
//!
//! One task consumes payloads in broker delivery order. For each payload
//! the timestamp key is assigned here, the pair is appended to the store,
//! and only then is the event queued for broadcast, so a viewer that
//! replays after the append sees it in history.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::RelayError;
use crate::hub::Hub;
use crate::parser::parse_coordinates;
use crate::store::LocationStore;
use crate::timestamp::{Clock, KeyFormatter};
use crate::types::LocationEvent;

pub struct Ingestor {
    store: Arc<dyn LocationStore>,
    hub: Hub,
    clock: Arc<dyn Clock>,
    keys: KeyFormatter,
}

impl Ingestor {
    pub fn new(
        store: Arc<dyn LocationStore>,
        hub: Hub,
        clock: Arc<dyn Clock>,
        keys: KeyFormatter,
    ) -> Self {
        Self {
            store,
            hub,
            clock,
            keys,
        }
    }

    /// Handle one broker payload.
    ///
    /// A failed append is logged and the event is still broadcast: live
    /// viewers keep getting updates while the store is down, at the cost of
    /// that event missing from later replays.
    pub async fn ingest(&self, payload: &[u8]) -> Result<LocationEvent, RelayError> {
        let coords = parse_coordinates(payload)?;
        let timestamp = self.keys.format(self.clock.now());

        let values = [coords.latitude.clone(), coords.longitude.clone()];
        if let Err(e) = self.store.append(&timestamp, &values).await {
            error!(key = %timestamp, "append failed, broadcasting anyway: {e}");
        }

        let event = LocationEvent::new(coords.latitude, coords.longitude, timestamp);
        self.hub.enqueue(event.clone())?;
        Ok(event)
    }

    /// Drain `rx` until the broker loop drops its sender.
    pub async fn run(self, mut rx: mpsc::UnboundedReceiver<Bytes>) {
        while let Some(payload) = rx.recv().await {
            match self.ingest(&payload).await {
                Ok(event) => debug!(
                    key = %event.timestamp,
                    lat = %event.latitude,
                    lon = %event.longitude,
                    "location ingested"
                ),
                Err(RelayError::HubClosed) => {
                    warn!("hub stopped, ingest exiting");
                    return;
                }
                Err(e) => warn!("dropping broker message: {e}"),
            }
        }
        info!("ingest queue closed");
    }
}
