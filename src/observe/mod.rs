//! Observer bus: non-blocking fan-out of engine events to loggers.
//!
//! Every pipeline stage taps the observer bus. Loggers are the observer
//! contract's consumers (console/file/OTLP sinks live outside the core);
//! each registered logger gets its own bounded channel and forwarding task.
//! When a logger's buffer is full the event is dropped for that logger only:
//! observers never apply backpressure to the pipeline.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use crate::types::{ActorId, EventId, RouteName, SourceId};

/// Per-logger channel capacity.
const LOGGER_BUFFER: usize = 256;

/// Terminal classification of a delivery, as seen by observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Delivered,
    Rejected,
    /// A retryable error; another attempt will follow.
    Error,
    /// Retries exhausted; terminal.
    Failed,
}

/// Engine lifecycle phases surfaced to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecyclePhase {
    Starting,
    Running,
    Draining,
    Stopped,
}

/// The fixed observer event taxonomy.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind")]
pub enum ObserverEvent {
    #[serde(rename = "source.polled")]
    SourcePolled { source: SourceId, events: usize },

    #[serde(rename = "event.accepted")]
    EventAccepted {
        event_id: EventId,
        source: SourceId,
        offset: u64,
    },

    #[serde(rename = "route.matched")]
    RouteMatched { event_id: EventId, route: RouteName },

    #[serde(rename = "transform.dropped")]
    TransformDropped {
        event_id: EventId,
        route: RouteName,
        transform: String,
    },

    #[serde(rename = "delivery.attempt")]
    DeliveryAttempt {
        event_id: EventId,
        route: RouteName,
        actor: ActorId,
        attempt: u32,
    },

    #[serde(rename = "delivery.result")]
    DeliveryResult {
        event_id: EventId,
        route: RouteName,
        actor: ActorId,
        attempt: u32,
        status: DeliveryStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    #[serde(rename = "engine.lifecycle")]
    EngineLifecycle { phase: LifecyclePhase },
}

/// The logger contract consumed by the observer bus.
pub trait Logger: Send + Sync {
    /// Stable name, used in diagnostics about the logger itself.
    fn name(&self) -> &str;

    /// Handles one observer event. Must be fast; slow sinks should buffer
    /// internally.
    fn observe(&self, event: &ObserverEvent);

    fn shutdown(&self) {}
}

struct LoggerHandle {
    tx: mpsc::Sender<ObserverEvent>,
    task: JoinHandle<()>,
    logger: Arc<dyn Logger>,
}

struct ObserverInner {
    loggers: std::sync::RwLock<Vec<LoggerHandle>>,
    dropped: AtomicU64,
}

/// The observer bus. Cheap to clone.
#[derive(Clone)]
pub struct ObserverBus {
    inner: Arc<ObserverInner>,
}

impl ObserverBus {
    pub fn new() -> Self {
        ObserverBus {
            inner: Arc::new(ObserverInner {
                loggers: std::sync::RwLock::new(Vec::new()),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Registers a logger, spawning its forwarding task.
    pub fn register(&self, logger: Arc<dyn Logger>) {
        let (tx, mut rx) = mpsc::channel::<ObserverEvent>(LOGGER_BUFFER);
        let forward = Arc::clone(&logger);
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                forward.observe(&event);
            }
        });

        debug!(logger = logger.name(), "registered observer logger");
        self.write_loggers().push(LoggerHandle { tx, task, logger });
    }

    /// Fans an event out to every logger without blocking.
    ///
    /// A full logger buffer drops the event for that logger only.
    pub fn emit(&self, event: ObserverEvent) {
        let loggers = self.read_loggers();
        for handle in loggers.iter() {
            if handle.tx.try_send(event.clone()).is_err() {
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                trace!(
                    logger = handle.logger.name(),
                    "observer buffer full, dropping event for this logger"
                );
            }
        }
    }

    /// Events dropped across all loggers since startup.
    pub fn dropped_count(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Drains the forwarding tasks and shuts the loggers down.
    pub async fn shutdown(&self) {
        let handles: Vec<LoggerHandle> = self.write_loggers().drain(..).collect();
        for handle in handles {
            drop(handle.tx);
            let _ = handle.task.await;
            handle.logger.shutdown();
        }
    }

    fn read_loggers(&self) -> std::sync::RwLockReadGuard<'_, Vec<LoggerHandle>> {
        self.inner
            .loggers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_loggers(&self) -> std::sync::RwLockWriteGuard<'_, Vec<LoggerHandle>> {
        self.inner
            .loggers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for ObserverBus {
    fn default() -> Self {
        ObserverBus::new()
    }
}

/// A logger that forwards observer events into `tracing`, so the engine is
/// observable with no external sinks configured.
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn name(&self) -> &str {
        "tracing"
    }

    fn observe(&self, event: &ObserverEvent) {
        match serde_json::to_string(event) {
            Ok(json) => info!(target: "orgloop::observer", "{json}"),
            Err(e) => debug!(target: "orgloop::observer", error = %e, "unserializable observer event"),
        }
    }
}
