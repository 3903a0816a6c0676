//! The delivery scheduler: per-actor bounded queues, worker pools, retries.
//!
//! One bounded FIFO queue per actor, drained by N workers (actor config,
//! default 4). A worker claims an item, invokes `Actor::deliver` with a
//! deadline, and classifies the outcome:
//!
//! ```text
//!     scheduled ──deliver()──▶ delivered (terminal)
//!          │                ╲─▶ rejected (terminal)
//!          │                 ╲─▶ error ──attempts<max──▶ scheduled (backoff)
//!          │                              ╲─attempts=max──▶ failed (terminal)
//! ```
//!
//! Retries happen in the claiming worker: after `error` it sleeps the
//! jittered backoff and re-attempts the same delivery, so the attempt
//! counter and FIFO claim order stay intact. Actors needing strict ordering
//! configure a single worker.
//!
//! Backpressure: `enqueue` blocks while an actor's queue is full, which
//! propagates flow control back to the bus tailer. No queue ever waits on
//! the router, so the waiting graph stays acyclic.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ActorSpec, RouteSpec};
use crate::connector::{Actor, DeliveryOutcome};
use crate::observe::{DeliveryStatus, ObserverBus, ObserverEvent};
use crate::types::{ActorId, Event};

use super::backoff::BackoffConfig;

/// Default deadline for one `deliver` invocation.
pub const DEFAULT_DELIVER_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors from scheduling deliveries.
#[derive(Debug, Error)]
pub enum DeliverError {
    /// The route names an actor the scheduler does not manage. Validation
    /// prevents this; hitting it at runtime is a wiring bug.
    #[error("no delivery queue for actor {actor}")]
    UnknownActor { actor: ActorId },

    /// The scheduler is draining and accepts no new work.
    #[error("delivery queues are closed")]
    Closed,
}

/// A unit of work: one event bound for one route's actor.
#[derive(Debug, Clone)]
pub struct DeliveryItem {
    pub event: Event,
    pub route: Arc<RouteSpec>,
}

/// Scheduler tuning.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub backoff: BackoffConfig,
    pub deliver_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            backoff: BackoffConfig::DEFAULT,
            deliver_timeout: DEFAULT_DELIVER_TIMEOUT,
        }
    }
}

struct ActorWorkers {
    tx: mpsc::Sender<DeliveryItem>,
    workers: Vec<JoinHandle<()>>,
    actor: Arc<dyn Actor>,
}

/// Per-actor delivery queues and worker pools.
pub struct DeliveryScheduler {
    actors: HashMap<ActorId, ActorWorkers>,
    /// Hard-stop token fired when the drain timeout expires.
    hard_stop: CancellationToken,
}

impl DeliveryScheduler {
    /// Spawns queues and worker pools for every declared actor.
    pub fn start(
        actors: Vec<(ActorSpec, Arc<dyn Actor>)>,
        observer: ObserverBus,
        config: SchedulerConfig,
    ) -> Self {
        let hard_stop = CancellationToken::new();
        let mut map = HashMap::new();

        for (spec, actor) in actors {
            let (tx, rx) = mpsc::channel::<DeliveryItem>(spec.queue_capacity());
            let rx = Arc::new(Mutex::new(rx));

            let worker_count = spec.worker_count();
            let mut workers = Vec::with_capacity(worker_count);
            for worker_idx in 0..worker_count {
                workers.push(tokio::spawn(run_worker(
                    spec.id.clone(),
                    worker_idx,
                    Arc::clone(&actor),
                    Arc::clone(&rx),
                    observer.clone(),
                    config,
                    hard_stop.clone(),
                )));
            }

            debug!(
                actor = %spec.id,
                workers = worker_count,
                queue = spec.queue_capacity(),
                "started delivery workers"
            );
            map.insert(spec.id.clone(), ActorWorkers { tx, workers, actor });
        }

        DeliveryScheduler {
            actors: map,
            hard_stop,
        }
    }

    /// Enqueues a delivery, blocking while the actor's queue is full.
    pub async fn enqueue(&self, item: DeliveryItem) -> Result<(), DeliverError> {
        let actor = &item.route.then.actor;
        let entry = self
            .actors
            .get(actor)
            .ok_or_else(|| DeliverError::UnknownActor {
                actor: actor.clone(),
            })?;

        entry
            .tx
            .send(item)
            .await
            .map_err(|_| DeliverError::Closed)
    }

    /// Drains the scheduler: closes every queue, waits up to `drain_timeout`
    /// for workers to finish queued and in-flight deliveries, then
    /// force-terminates the stragglers.
    pub async fn drain(mut self, drain_timeout: Duration) {
        // Close every queue up front so all workers start running them dry.
        let entries: Vec<(ActorId, Vec<JoinHandle<()>>, Arc<dyn Actor>)> = self
            .actors
            .drain()
            .map(|(id, entry)| {
                drop(entry.tx);
                (id, entry.workers, entry.actor)
            })
            .collect();

        let deadline = tokio::time::Instant::now() + drain_timeout;
        let mut forced = false;
        for (actor_id, workers, actor) in entries {
            for mut worker in workers {
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                if !forced && timeout(remaining, &mut worker).await.is_err() {
                    warn!(actor = %actor_id, "drain timeout expired, force-terminating workers");
                    self.hard_stop.cancel();
                    forced = true;
                }
                if forced {
                    // Workers observe the hard stop at their next await.
                    let _ = worker.await;
                }
            }

            actor.shutdown().await;
        }
        info!("delivery scheduler drained");
    }
}

/// One worker: claim, deliver, classify, retry.
async fn run_worker(
    actor_id: ActorId,
    worker_idx: usize,
    actor: Arc<dyn Actor>,
    rx: Arc<Mutex<mpsc::Receiver<DeliveryItem>>>,
    observer: ObserverBus,
    config: SchedulerConfig,
    hard_stop: CancellationToken,
) {
    loop {
        // Claim the next item; holding the lock only around recv keeps the
        // other workers free to deliver.
        let item = {
            let mut rx = rx.lock().await;
            tokio::select! {
                _ = hard_stop.cancelled() => return,
                item = rx.recv() => item,
            }
        };
        let Some(item) = item else {
            // Queue closed and empty: drain complete for this worker.
            return;
        };

        deliver_with_retry(&actor_id, worker_idx, &actor, item, &observer, &config, &hard_stop)
            .await;
    }
}

/// Runs the full attempt state machine for one delivery.
async fn deliver_with_retry(
    actor_id: &ActorId,
    worker_idx: usize,
    actor: &Arc<dyn Actor>,
    item: DeliveryItem,
    observer: &ObserverBus,
    config: &SchedulerConfig,
    hard_stop: &CancellationToken,
) {
    let event_id = item.event.id.clone();
    let route = item.route.name.clone();

    for attempt in 1..=config.backoff.max_attempts {
        observer.emit(ObserverEvent::DeliveryAttempt {
            event_id: event_id.clone(),
            route: route.clone(),
            actor: actor_id.clone(),
            attempt,
        });

        let outcome = tokio::select! {
            _ = hard_stop.cancelled() => return,
            result = timeout(
                config.deliver_timeout,
                actor.deliver(&item.event, &item.route.then.config, hard_stop),
            ) => match result {
                Ok(outcome) => outcome,
                Err(_) => DeliveryOutcome::Error {
                    message: format!(
                        "delivery timed out after {:?}",
                        config.deliver_timeout
                    ),
                },
            },
        };

        match outcome {
            DeliveryOutcome::Delivered => {
                debug!(actor = %actor_id, worker = worker_idx, event = %event_id, attempt, "delivered");
                observer.emit(ObserverEvent::DeliveryResult {
                    event_id,
                    route,
                    actor: actor_id.clone(),
                    attempt,
                    status: DeliveryStatus::Delivered,
                    error: None,
                });
                return;
            }
            DeliveryOutcome::Rejected { reason } => {
                debug!(actor = %actor_id, event = %event_id, attempt, %reason, "rejected (terminal)");
                observer.emit(ObserverEvent::DeliveryResult {
                    event_id,
                    route,
                    actor: actor_id.clone(),
                    attempt,
                    status: DeliveryStatus::Rejected,
                    error: Some(reason),
                });
                return;
            }
            DeliveryOutcome::Error { message } => {
                if attempt == config.backoff.max_attempts {
                    warn!(
                        actor = %actor_id,
                        event = %event_id,
                        attempt,
                        error = %message,
                        "retries exhausted, delivery failed"
                    );
                    observer.emit(ObserverEvent::DeliveryResult {
                        event_id,
                        route,
                        actor: actor_id.clone(),
                        attempt,
                        status: DeliveryStatus::Failed,
                        error: Some(message),
                    });
                    return;
                }

                observer.emit(ObserverEvent::DeliveryResult {
                    event_id: event_id.clone(),
                    route: route.clone(),
                    actor: actor_id.clone(),
                    attempt,
                    status: DeliveryStatus::Error,
                    error: Some(message),
                });

                let delay = config.backoff.jittered_delay_after_attempt(attempt);
                debug!(actor = %actor_id, event = %event_id, attempt, ?delay, "scheduling retry");
                tokio::select! {
                    _ = hard_stop.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}
