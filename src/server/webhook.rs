//! `POST /webhooks/{source_id}`: webhook-mode source ingestion.
//!
//! The registered source translates the raw body into events; the handler
//! stamps the source id, appends every event to the bus, and answers 202
//! once the batch is durably accepted.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::{debug, warn};

use crate::connector::SourceError;
use crate::observe::ObserverEvent;
use crate::types::SourceId;

use super::AppState;

/// Errors that turn into non-2xx webhook responses.
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("unknown webhook source {0:?}")]
    UnknownSource(String),

    #[error("content-type must be application/json")]
    UnsupportedContentType,

    #[error("malformed webhook body: {0}")]
    Malformed(String),

    #[error("engine is draining")]
    Draining,

    #[error("failed to persist events")]
    Persist,
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status = match &self {
            WebhookError::UnknownSource(_) => StatusCode::NOT_FOUND,
            WebhookError::UnsupportedContentType | WebhookError::Malformed(_) => {
                StatusCode::BAD_REQUEST
            }
            WebhookError::Draining => StatusCode::SERVICE_UNAVAILABLE,
            WebhookError::Persist => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

/// Accepts one webhook delivery for a webhook-mode source.
pub async fn webhook_handler(
    State(state): State<AppState>,
    Path(source_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, &'static str), WebhookError> {
    if state.is_draining() {
        return Err(WebhookError::Draining);
    }

    let source_id = SourceId::new(source_id);
    let source = state
        .webhook_source(&source_id)
        .ok_or_else(|| WebhookError::UnknownSource(source_id.as_str().to_string()))?;

    if !is_json_content_type(&headers) {
        return Err(WebhookError::UnsupportedContentType);
    }

    let events = source.translate(&body).map_err(|e| match e {
        SourceError::Transient(message) | SourceError::Fatal(message) => {
            warn!(source = %source_id, error = %message, "webhook translation failed");
            WebhookError::Malformed(message)
        }
    })?;

    debug!(source = %source_id, events = events.len(), "webhook translated");

    for mut event in events {
        event.source = source_id.clone();
        let offset = state.bus().append(&event).map_err(|e| {
            warn!(source = %source_id, error = %e, "failed to append webhook event");
            WebhookError::Persist
        })?;
        state.observer().emit(ObserverEvent::EventAccepted {
            event_id: event.id,
            source: event.source,
            offset,
        });
    }

    // Durable before we acknowledge.
    state.bus().sync().map_err(|e| {
        warn!(source = %source_id, error = %e, "failed to sync bus");
        WebhookError::Persist
    })?;

    Ok((StatusCode::ACCEPTED, "Accepted"))
}

fn is_json_content_type(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| {
            let mime = v.split(';').next().unwrap_or("").trim();
            mime.eq_ignore_ascii_case("application/json")
        })
}
