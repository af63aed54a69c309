//! `POST /api/{key}`: decode a JSON body and broadcast it.

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use metrics::counter;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::metrics::INGEST_REQUESTS_TOTAL;
use crate::relay::{InboundMessage, RelayError};
use crate::server::AppState;

/// Body returned to publishers.
#[derive(Debug, Clone, Serialize)]
pub struct IngestResponse {
    /// `"ok"` or `"error"`.
    pub status: &'static str,
    /// Present on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IngestResponse {
    fn ok() -> Self {
        Self {
            status: "ok",
            error: None,
        }
    }
}

/// Why an ingest request was refused.
#[derive(Debug, Error)]
pub enum IngestError {
    /// The body is not well-formed JSON.
    #[error("request body is not valid JSON: {0}")]
    Decode(#[from] serde_json::Error),
    /// The frame could not be built.
    #[error(transparent)]
    Relay(#[from] RelayError),
}

impl IngestError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Decode(_) => StatusCode::BAD_REQUEST,
            Self::Relay(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn outcome(&self) -> &'static str {
        match self {
            Self::Decode(_) => "decode_error",
            Self::Relay(_) => "relay_error",
        }
    }
}

impl IntoResponse for IngestError {
    fn into_response(self) -> Response {
        counter!(INGEST_REQUESTS_TOTAL, "outcome" => self.outcome()).increment(1);
        let body = IngestResponse {
            status: "error",
            error: Some(self.to_string()),
        };
        (self.status(), Json(body)).into_response()
    }
}

/// Decode the raw body as JSON regardless of `Content-Type`.
pub fn decode_body(body: &[u8]) -> Result<Value, IngestError> {
    Ok(serde_json::from_slice(body)?)
}

/// Handle `POST /api/{key}`.
///
/// The response is sent after every registered connection has had the frame
/// queued; it does not wait for the sockets to flush.
pub async fn ingest_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
    body: Bytes,
) -> Result<Json<IngestResponse>, IngestError> {
    let payload = match decode_body(&body) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(key = %key, bytes = body.len(), error = %e, "rejecting ingest request");
            return Err(e);
        }
    };
    debug!(key = %key, payload = %payload, "ingest payload");

    let msg = InboundMessage::new(key, payload);
    let report = state.relay.publish(&msg)?;
    info!(
        key = msg.key(),
        recipients = report.recipients,
        delivered = report.delivered,
        failed = report.failed,
        "published"
    );
    counter!(INGEST_REQUESTS_TOTAL, "outcome" => "ok").increment(1);
    Ok(Json(IngestResponse::ok()))
}
