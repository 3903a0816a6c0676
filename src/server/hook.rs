//! `POST /hooks/{hook_name}`: out-of-process hook ingestion.
//!
//! Hooks carry wire-format events directly: the body is NDJSON (one event
//! per line) or a single JSON event. Events are stamped with the hook's
//! owning source id regardless of what the sender wrote.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::{debug, warn};

use crate::observe::ObserverEvent;
use crate::types::{Event, HookName};

use super::AppState;

/// Errors that turn into non-2xx hook responses.
#[derive(Debug, Error)]
pub enum HookError {
    #[error("unknown hook {0:?}")]
    UnknownHook(String),

    #[error("malformed hook body at line {line}: {message}")]
    Malformed { line: usize, message: String },

    #[error("empty hook body")]
    Empty,

    #[error("engine is draining")]
    Draining,

    #[error("failed to persist events")]
    Persist,
}

impl IntoResponse for HookError {
    fn into_response(self) -> Response {
        let status = match &self {
            HookError::UnknownHook(_) => StatusCode::NOT_FOUND,
            HookError::Malformed { .. } | HookError::Empty => StatusCode::BAD_REQUEST,
            HookError::Draining => StatusCode::SERVICE_UNAVAILABLE,
            HookError::Persist => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

/// Accepts NDJSON (or a single JSON event) on a registered hook path.
pub async fn hook_handler(
    State(state): State<AppState>,
    Path(hook_name): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, &'static str), HookError> {
    if state.is_draining() {
        return Err(HookError::Draining);
    }

    let hook = HookName::new(hook_name);
    let source_id = state
        .hook_source(&hook)
        .ok_or_else(|| HookError::UnknownHook(hook.as_str().to_string()))?
        .clone();

    // Parse the whole batch before appending anything: a malformed line
    // rejects the request without a partial append.
    let text = String::from_utf8_lossy(&body);
    let mut events: Vec<Event> = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let event: Event = serde_json::from_str(trimmed).map_err(|e| HookError::Malformed {
            line: idx + 1,
            message: e.to_string(),
        })?;
        events.push(event);
    }
    if events.is_empty() {
        return Err(HookError::Empty);
    }

    debug!(hook = %hook, source = %source_id, events = events.len(), "hook batch parsed");

    for mut event in events {
        event.source = source_id.clone();
        let offset = state.bus().append(&event).map_err(|e| {
            warn!(hook = %hook, error = %e, "failed to append hook event");
            HookError::Persist
        })?;
        state.observer().emit(ObserverEvent::EventAccepted {
            event_id: event.id,
            source: event.source,
            offset,
        });
    }

    state.bus().sync().map_err(|e| {
        warn!(hook = %hook, error = %e, "failed to sync bus");
        HookError::Persist
    })?;

    Ok((StatusCode::ACCEPTED, "Accepted"))
}
