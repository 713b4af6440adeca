//! Wire types.
//!
//! Covers: the outbound viewer frame, the producer request body,
//! and the producer acknowledgement.

use serde::{Deserialize, Serialize};

use crate::error::RelayError;

// ═══════════════════════════════════════════════════════════════
// Server → Viewer
// ═══════════════════════════════════════════════════════════════

/// One location update as delivered to viewers.
///
/// Coordinates keep the decimal text they arrived with; they are never
/// round-tripped through `f64`. `timestamp` is the store key the pair was
/// appended under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationEvent {
    #[serde(rename = "lat")]
    pub latitude: String,
    #[serde(rename = "lon")]
    pub longitude: String,
    pub timestamp: String,
}

impl LocationEvent {
    pub fn new(latitude: impl Into<String>, longitude: impl Into<String>, timestamp: impl Into<String>) -> Self {
        Self {
            latitude: latitude.into(),
            longitude: longitude.into(),
            timestamp: timestamp.into(),
        }
    }

    /// UTF-8 JSON text frame: `{"lat":"…","lon":"…","timestamp":"…"}`.
    pub fn to_frame(&self) -> String {
        // Three string fields cannot fail to serialize.
        serde_json::to_string(self).unwrap_or_default()
    }
}

// ═══════════════════════════════════════════════════════════════
// Producer → Server
// ═══════════════════════════════════════════════════════════════

/// Body of `POST /api/location`, also the broker payload shape.
///
/// Field order matters: it is serialized as
/// `{"latitude":<n>,"longitude":<n>}`, which is what the ingest
/// parser looks for.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationInput {
    pub latitude: f64,
    pub longitude: f64,
}

impl LocationInput {
    pub fn validate(&self) -> Result<(), RelayError> {
        if !self.latitude.is_finite() || !(-90.0..=90.0).contains(&self.latitude) {
            return Err(RelayError::InvalidLocation(format!(
                "latitude out of range: {}",
                self.latitude
            )));
        }
        if !self.longitude.is_finite() || !(-180.0..=180.0).contains(&self.longitude) {
            return Err(RelayError::InvalidLocation(format!(
                "longitude out of range: {}",
                self.longitude
            )));
        }
        Ok(())
    }

    pub fn to_payload(&self) -> Result<Vec<u8>, RelayError> {
        serde_json::to_vec(self).map_err(|e| RelayError::InvalidLocation(e.to_string()))
    }
}

/// Sent after a location was handed to the broker.
#[derive(Debug, Serialize, Deserialize)]
pub struct Ack {
    pub status: String,
}

impl Ack {
    pub fn received() -> Self {
        Self {
            status: "received".into(),
        }
    }
}
