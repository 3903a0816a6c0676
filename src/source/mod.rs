//! Source runners: the long-lived workers that drive declared sources.
//!
//! Poll-mode sources get one task each: poll on the declared interval
//! (jittered ±10% so sources sharing an interval spread out), append the
//! batch to the bus, and only then advance the checkpoint. Webhook-mode
//! sources are driven by the HTTP listener instead. Hook-mode sources share
//! one stdin pump reading NDJSON, one event per line.
//!
//! Checkpoint discipline: the cursor a poll returns is persisted only after
//! every event of that batch is durably in the WAL. A failed poll or a
//! failed append leaves the cursor untouched, so the next tick re-fetches;
//! the dedup window absorbs the repeats.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::EventBus;
use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::config::{DEFAULT_POLL_INTERVAL_SECS, SourceSpec};
use crate::connector::{Source, SourceError};
use crate::observe::{ObserverBus, ObserverEvent};
use crate::types::{Event, SourceId};

/// Jitter applied to poll intervals (±10%).
const POLL_JITTER: f64 = 0.10;

/// Spawns the poll loop for one source.
pub fn spawn_poll_source(
    spec: SourceSpec,
    source: Arc<dyn Source>,
    bus: EventBus,
    checkpoints: CheckpointStore,
    observer: ObserverBus,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval =
            Duration::from_secs(spec.interval_secs.unwrap_or(DEFAULT_POLL_INTERVAL_SECS));
        info!(source = %spec.id, ?interval, "starting poll source");

        loop {
            match poll_once(&spec.id, &source, &bus, &checkpoints, &observer, &cancel).await {
                PollTick::Continue => {}
                PollTick::Disabled => {
                    error!(source = %spec.id, "source disabled after fatal error");
                    return;
                }
                PollTick::Cancelled => return,
            }

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(jittered(interval)) => {}
            }
        }
    })
}

enum PollTick {
    Continue,
    Disabled,
    Cancelled,
}

async fn poll_once(
    id: &SourceId,
    source: &Arc<dyn Source>,
    bus: &EventBus,
    checkpoints: &CheckpointStore,
    observer: &ObserverBus,
    cancel: &CancellationToken,
) -> PollTick {
    let cursor = checkpoints.get(id).and_then(|c| c.cursor);

    let batch = tokio::select! {
        _ = cancel.cancelled() => return PollTick::Cancelled,
        result = source.poll(cursor.as_deref(), cancel) => match result {
            Ok(batch) => batch,
            Err(SourceError::Transient(message)) => {
                warn!(source = %id, error = %message, "transient poll error, will retry next tick");
                return PollTick::Continue;
            }
            Err(SourceError::Fatal(message)) => {
                error!(source = %id, error = %message, "fatal poll error");
                return PollTick::Disabled;
            }
        },
    };

    let count = batch.events.len();
    for mut event in batch.events {
        // The bus records the source instance that owns this runner,
        // whatever the connector stamped.
        event.source = id.clone();
        match append_event(bus, observer, event) {
            Ok(()) => {}
            Err(e) => {
                // Events already appended stay durable; the cursor is not
                // advanced, so the next tick re-polls from the old cursor.
                error!(source = %id, error = %e, "failed to append polled event; checkpoint not advanced");
                return PollTick::Continue;
            }
        }
    }

    // Durability before checkpoint advancement.
    if let Err(e) = bus.sync() {
        error!(source = %id, error = %e, "failed to sync bus; checkpoint not advanced");
        return PollTick::Continue;
    }

    observer.emit(ObserverEvent::SourcePolled {
        source: id.clone(),
        events: count,
    });

    let mut checkpoint = checkpoints.get(id).unwrap_or_else(Checkpoint::new);
    if batch.checkpoint.is_some() {
        checkpoint.cursor = batch.checkpoint;
    }
    checkpoint.updated_at = chrono::Utc::now();
    if let Err(e) = checkpoints.put(id, checkpoint) {
        // The events are durable in the WAL; only the cursor write failed.
        // Re-polling from the stale cursor is safe.
        warn!(source = %id, error = %e, "checkpoint write failed; will retry next tick");
    }

    debug!(source = %id, events = count, "poll tick complete");
    PollTick::Continue
}

/// Appends one event and emits `event.accepted`.
fn append_event(
    bus: &EventBus,
    observer: &ObserverBus,
    event: Event,
) -> Result<(), crate::bus::BusError> {
    let offset = bus.append(&event)?;
    observer.emit(ObserverEvent::EventAccepted {
        event_id: event.id,
        source: event.source,
        offset,
    });
    Ok(())
}

/// Spawns the shared stdin pump for hook-mode sources.
///
/// Each NDJSON line is parsed as a wire-format event; its `source` field
/// must name a declared hook source or the line is dropped with a warning.
pub fn spawn_stdin_pump(
    hook_sources: HashSet<SourceId>,
    bus: EventBus,
    observer: ObserverBus,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(sources = hook_sources.len(), "starting stdin hook pump");
        let mut lines = BufReader::new(tokio::io::stdin()).lines();

        loop {
            let line = tokio::select! {
                _ = cancel.cancelled() => return,
                line = lines.next_line() => line,
            };

            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => {
                    debug!("stdin closed, hook pump exiting");
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "stdin read error, hook pump exiting");
                    return;
                }
            };

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let event: Event = match serde_json::from_str(trimmed) {
                Ok(event) => event,
                Err(e) => {
                    warn!(error = %e, "dropping malformed hook line");
                    continue;
                }
            };

            if !hook_sources.contains(&event.source) {
                warn!(source = %event.source, "dropping hook event for undeclared source");
                continue;
            }

            if let Err(e) = append_event(&bus, &observer, event) {
                error!(error = %e, "failed to append hook event");
            }
        }
    })
}

fn jittered(interval: Duration) -> Duration {
    if interval.is_zero() {
        return interval;
    }
    let scale = rand::rng().random_range((1.0 - POLL_JITTER)..=(1.0 + POLL_JITTER));
    Duration::from_secs_f64(interval.as_secs_f64() * scale)
}
