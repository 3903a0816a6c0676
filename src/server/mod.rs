//! HTTP listener for webhook and hook ingestion.
//!
//! Binds to loopback (default port 4800) and exposes:
//!
//! - `POST /webhooks/{source_id}` - webhook-mode source ingestion
//! - `POST /hooks/{hook_name}` - out-of-process hook forwarding
//! - `GET /health` - liveness
//!
//! Non-2xx responses are reserved for malformed requests and unknown paths;
//! 202 Accepted means the engine has durably appended the events. During
//! drain every ingestion path answers 503.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub mod hook;
pub mod webhook;

pub use hook::hook_handler;
pub use webhook::webhook_handler;

use crate::bus::EventBus;
use crate::connector::Source;
use crate::observe::ObserverBus;
use crate::types::{HookName, SourceId};

/// Shared listener state, passed to handlers via axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    /// Webhook-mode sources by source id.
    webhooks: HashMap<SourceId, Arc<dyn Source>>,

    /// Hook path registrations: hook name → owning source id.
    hooks: HashMap<HookName, SourceId>,

    bus: EventBus,
    observer: ObserverBus,

    /// Set during drain; ingestion answers 503 while true.
    draining: AtomicBool,
}

impl AppState {
    pub fn new(
        webhooks: HashMap<SourceId, Arc<dyn Source>>,
        hooks: HashMap<HookName, SourceId>,
        bus: EventBus,
        observer: ObserverBus,
    ) -> Self {
        AppState {
            inner: Arc::new(AppStateInner {
                webhooks,
                hooks,
                bus,
                observer,
                draining: AtomicBool::new(false),
            }),
        }
    }

    pub fn webhook_source(&self, id: &SourceId) -> Option<&Arc<dyn Source>> {
        self.inner.webhooks.get(id)
    }

    pub fn hook_source(&self, name: &HookName) -> Option<&SourceId> {
        self.inner.hooks.get(name)
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn observer(&self) -> &ObserverBus {
        &self.inner.observer
    }

    /// Flips the listener into drain mode (503 on ingestion).
    pub fn begin_drain(&self) {
        self.inner.draining.store(true, Ordering::SeqCst);
    }

    pub fn is_draining(&self) -> bool {
        self.inner.draining.load(Ordering::SeqCst)
    }
}

/// Builds the axum router with all endpoints and the body-size cap.
pub fn build_router(state: AppState, max_body_bytes: usize) -> axum::Router {
    use axum::routing::{get, post};

    axum::Router::new()
        .route("/webhooks/{source_id}", post(webhook_handler))
        .route("/hooks/{hook_name}", post(hook_handler))
        .route("/health", get(health_handler))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .with_state(state)
}

/// Liveness probe; 503 while draining.
async fn health_handler(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> (StatusCode, &'static str) {
    if state.is_draining() {
        (StatusCode::SERVICE_UNAVAILABLE, "draining")
    } else {
        (StatusCode::OK, "OK")
    }
}

/// Binds the listener and serves until `cancel` fires.
///
/// Returns the bound address (useful with port 0 in tests) and the server
/// task handle.
pub async fn serve(
    router: axum::Router,
    addr: SocketAddr,
    cancel: CancellationToken,
) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, "HTTP listener bound");

    let task = tokio::spawn(async move {
        let shutdown = async move { cancel.cancelled().await };
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
        {
            tracing::error!(error = %e, "HTTP listener failed");
        }
    });

    Ok((local_addr, task))
}
