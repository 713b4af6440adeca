//! Error types for nerede.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Broker payload without the `"latitude":…,"longitude":…` pair.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Viewer read/write failed or timed out.
    #[error("transport closed: {0}")]
    TransportClosed(String),

    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// Producer sent a body that is not a usable location.
    #[error("invalid location: {0}")]
    InvalidLocation(String),

    /// The broadcast task is gone; only happens during shutdown.
    #[error("broadcast hub stopped")]
    HubClosed,
}

impl From<redis::RedisError> for RelayError {
    fn from(e: redis::RedisError) -> Self {
        RelayError::StoreUnavailable(e.to_string())
    }
}

impl From<rumqttc::ClientError> for RelayError {
    fn from(e: rumqttc::ClientError) -> Self {
        RelayError::BrokerUnavailable(e.to_string())
    }
}

impl From<rumqttc::ConnectionError> for RelayError {
    fn from(e: rumqttc::ConnectionError) -> Self {
        RelayError::BrokerUnavailable(e.to_string())
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        // Internal detail goes to the log only.
        warn!("request failed: {self}");
        let (status, message) = match &self {
            RelayError::InvalidLocation(_) | RelayError::MalformedPayload(_) => {
                (StatusCode::BAD_REQUEST, "invalid location")
            }
            RelayError::BrokerUnavailable(_) => (StatusCode::BAD_GATEWAY, "could not forward location"),
            RelayError::StoreUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "storage unavailable"),
            RelayError::TransportClosed(_) | RelayError::HubClosed => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error")
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}
