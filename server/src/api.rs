//! Producer ingress.
//!
//! A location posted here is not stored or broadcast directly. It goes out
//! on the broker and comes back through the subscription, so ingest stays
//! the only writer.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::Json;
use tracing::debug;

use crate::error::RelayError;
use crate::state::AppState;
use crate::types::{Ack, LocationInput};

/// Axum handler for POST /api/location.
pub async fn post_location(
    State(state): State<Arc<AppState>>,
    body: Result<Json<LocationInput>, JsonRejection>,
) -> Result<Json<Ack>, RelayError> {
    let Json(location) = body.map_err(|e| RelayError::InvalidLocation(e.body_text()))?;
    location.validate()?;

    state.publisher.publish(&location).await?;
    debug!(lat = location.latitude, lon = location.longitude, "location forwarded");

    Ok(Json(Ack::received()))
}

/// Liveness probe.
pub async fn healthz() -> &'static str {
    "ok"
}
