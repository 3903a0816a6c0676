//! The engine supervisor: lifecycle, wiring, and the router task.
//!
//! Startup order: open bus → open checkpoint store → instantiate connectors
//! → resolve routes against sources/actors → start listener → start source
//! runners → start schedulers → start the router tail.
//!
//! Shutdown runs the reverse with a drain phase: the listener flips to 503,
//! sources stop emitting, the router stops enqueueing, then the scheduler
//! finishes in-flight deliveries up to the drain timeout before workers are
//! force-terminated.
//!
//! The engine is a plain owned object with explicit start/shutdown; several
//! can coexist in one process (tests rely on this).

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::bus::{BusError, EventBus, FsyncPolicy, WalConfig};
use crate::checkpoint::{Checkpoint, CheckpointError, CheckpointStore};
use crate::config::validate::resolve_and_validate;
use crate::config::{ConfigError, EngineConfig, RouteSpec};
use crate::connector::{Registry, RegistryError, SourceMode};
use crate::deliver::{DeliveryItem, DeliveryScheduler, SchedulerConfig};
use crate::observe::{LifecyclePhase, Logger, ObserverBus, ObserverEvent};
use crate::route::RouteMatcher;
use crate::server::{AppState, build_router, serve};
use crate::source::{spawn_poll_source, spawn_stdin_pump};
use crate::transform::{Pipeline, PipelineOutcome, TransformContext};
use crate::types::{HookName, RouteName, SourceId};

/// Reserved checkpoint entry holding the router's tail position.
const ROUTER_CURSOR_ID: &str = "__router__";

/// Interval for the maintenance task (fingerprint sweep + compaction).
const MAINTENANCE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);

/// Fatal engine errors. Per the error taxonomy, only configuration problems
/// and bus corruption abort startup; individual connector failures do not.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration invalid: {0}")]
    Config(#[from] ConfigError),

    #[error("fsync policy: {0}")]
    FsyncPolicy(String),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("listener error: {0}")]
    Listener(#[from] std::io::Error),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

struct RoutePipeline {
    route: Arc<RouteSpec>,
    pipeline: Pipeline,
    ctx: TransformContext,
}

/// A running engine. Obtain with [`Engine::start`]; stop with
/// [`Engine::shutdown`].
pub struct Engine {
    bus: EventBus,
    checkpoints: CheckpointStore,
    observer: ObserverBus,
    listener_state: AppState,
    local_addr: SocketAddr,

    /// Cancels sources, the stdin pump, maintenance and the router.
    cancel: CancellationToken,
    /// Cancels the HTTP listener, after the drain completes.
    server_cancel: CancellationToken,

    scheduler: Arc<DeliveryScheduler>,
    sources: Vec<Arc<dyn crate::connector::Source>>,
    source_tasks: Vec<JoinHandle<()>>,
    router_task: JoinHandle<()>,
    maintenance_task: JoinHandle<()>,
    server_task: JoinHandle<()>,

    drain_timeout: std::time::Duration,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").finish_non_exhaustive()
    }
}

impl Engine {
    /// Validates the configuration, wires every component and starts the
    /// pipeline.
    #[instrument(skip_all, fields(data_dir = %config.data_dir.display()))]
    pub async fn start(
        mut config: EngineConfig,
        registry: Registry,
        loggers: Vec<Arc<dyn Logger>>,
    ) -> Result<Engine> {
        resolve_and_validate(&mut config, &registry.transform_names())?;

        let fsync: FsyncPolicy = config
            .fsync
            .parse()
            .map_err(EngineError::FsyncPolicy)?;

        let observer = ObserverBus::new();
        for logger in loggers {
            observer.register(logger);
        }
        observer.emit(ObserverEvent::EngineLifecycle {
            phase: LifecyclePhase::Starting,
        });

        // Storage first: bus corruption must abort before any connector runs.
        let bus = EventBus::open(WalConfig::new(config.wal_dir()).with_fsync(fsync))?;
        let checkpoints = CheckpointStore::open(config.checkpoint_dir())?;

        // Instantiate connectors. A source that fails init is disabled and
        // the rest of the engine continues; actors are load-bearing for
        // routes, so their failures abort startup.
        let mut poll_sources = Vec::new();
        let mut webhook_sources = HashMap::new();
        let mut hooks: HashMap<HookName, SourceId> = HashMap::new();
        let mut hook_ids: HashSet<SourceId> = HashSet::new();
        let mut all_sources: Vec<Arc<dyn crate::connector::Source>> = Vec::new();

        for spec in &config.sources {
            let source = match registry.create_source(&spec.connector, &spec.config) {
                Ok(source) => source,
                Err(e) => {
                    error!(source = %spec.id, error = %e, "source init failed; disabling");
                    continue;
                }
            };
            all_sources.push(Arc::clone(&source));
            match source.mode() {
                SourceMode::Poll => poll_sources.push((spec.clone(), source)),
                SourceMode::Webhook => {
                    webhook_sources.insert(spec.id.clone(), source);
                }
                SourceMode::Hook => {
                    let name = spec
                        .config
                        .get("hook_name")
                        .and_then(|v| v.as_str())
                        .map(HookName::new)
                        .unwrap_or_else(|| HookName::new(spec.id.as_str()));
                    hooks.insert(name, spec.id.clone());
                    hook_ids.insert(spec.id.clone());
                }
            }
        }

        let mut actors = Vec::new();
        for spec in &config.actors {
            let actor = registry.create_actor(&spec.connector, &spec.config)?;
            actors.push((spec.clone(), actor));
        }

        // Resolve routes: build each pipeline against the registry.
        let mut pipelines: HashMap<RouteName, RoutePipeline> = HashMap::new();
        for route_spec in &config.routes {
            let mut stages = Vec::with_capacity(route_spec.transforms.len());
            for transform_spec in &route_spec.transforms {
                let transform =
                    registry.create_transform(&transform_spec.connector, &transform_spec.config)?;
                stages.push((transform_spec.connector.clone(), transform));
            }
            let route = Arc::new(route_spec.clone());
            pipelines.insert(
                route_spec.name.clone(),
                RoutePipeline {
                    route: Arc::clone(&route),
                    pipeline: Pipeline::new(stages),
                    ctx: TransformContext {
                        route: route_spec.name.clone(),
                        with: route_spec.with.clone(),
                        checkpoints: checkpoints.clone(),
                    },
                },
            );
        }
        let matcher = RouteMatcher::new(config.routes.iter().cloned());

        let cancel = CancellationToken::new();
        let server_cancel = CancellationToken::new();

        // Listener.
        let listener_state = AppState::new(
            webhook_sources,
            hooks,
            bus.clone(),
            observer.clone(),
        );
        let router = build_router(listener_state.clone(), config.listener.max_body_bytes);
        let (local_addr, server_task) =
            serve(router, config.listener.addr, server_cancel.clone()).await?;

        // Source runners.
        let mut source_tasks = Vec::new();
        for (spec, source) in poll_sources {
            source_tasks.push(spawn_poll_source(
                spec,
                source,
                bus.clone(),
                checkpoints.clone(),
                observer.clone(),
                cancel.clone(),
            ));
        }
        if !hook_ids.is_empty() {
            source_tasks.push(spawn_stdin_pump(
                hook_ids,
                bus.clone(),
                observer.clone(),
                cancel.clone(),
            ));
        }

        // Delivery scheduler, then the router tail that feeds it.
        let scheduler = Arc::new(DeliveryScheduler::start(
            actors,
            observer.clone(),
            SchedulerConfig::default(),
        ));

        let router_task = tokio::spawn(run_router(
            bus.clone(),
            checkpoints.clone(),
            matcher,
            pipelines,
            Arc::clone(&scheduler),
            observer.clone(),
            cancel.clone(),
        ));

        let maintenance_task = tokio::spawn(run_maintenance(
            bus.clone(),
            checkpoints.clone(),
            config.retention.into(),
            cancel.clone(),
        ));

        observer.emit(ObserverEvent::EngineLifecycle {
            phase: LifecyclePhase::Running,
        });
        info!(addr = %local_addr, routes = config.routes.len(), "engine running");

        Ok(Engine {
            bus,
            checkpoints,
            observer,
            listener_state,
            local_addr,
            cancel,
            server_cancel,
            scheduler,
            sources: all_sources,
            source_tasks,
            router_task,
            maintenance_task,
            server_task,
            drain_timeout: config.drain_timeout(),
        })
    }

    /// The listener's bound address (relevant with port 0 in tests).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The engine's event bus handle.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// The engine's checkpoint store handle.
    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    /// Graceful shutdown: drain, then stop everything.
    ///
    /// After this returns no further observer events are emitted.
    #[instrument(skip(self))]
    pub async fn shutdown(self) {
        self.observer.emit(ObserverEvent::EngineLifecycle {
            phase: LifecyclePhase::Draining,
        });
        self.listener_state.begin_drain();

        // Stop producing: sources, stdin pump, maintenance, router.
        self.cancel.cancel();
        for task in self.source_tasks {
            let _ = task.await;
        }
        for source in &self.sources {
            source.shutdown().await;
        }
        let _ = self.router_task.await;
        let _ = self.maintenance_task.await;

        // Drain in-flight deliveries.
        match Arc::try_unwrap(self.scheduler) {
            Ok(scheduler) => scheduler.drain(self.drain_timeout).await,
            Err(_) => warn!("scheduler still shared at shutdown; skipping drain"),
        }

        if let Err(e) = self.bus.sync() {
            warn!(error = %e, "final bus sync failed");
        }

        // Listener last: it answered 503 throughout the drain.
        self.server_cancel.cancel();
        let _ = self.server_task.await;

        self.observer.emit(ObserverEvent::EngineLifecycle {
            phase: LifecyclePhase::Stopped,
        });
        self.observer.shutdown().await;
        info!("engine stopped");
    }
}

/// The router task: tail the bus, match routes, run pipelines, enqueue.
///
/// The tail position is persisted in the checkpoint store under a reserved
/// id and advanced only after the scheduler has accepted the event, so a
/// crash re-enqueues at most the in-flight window (at-least-once; the dedup
/// window absorbs repeats).
async fn run_router(
    bus: EventBus,
    checkpoints: CheckpointStore,
    matcher: RouteMatcher,
    pipelines: HashMap<RouteName, RoutePipeline>,
    scheduler: Arc<DeliveryScheduler>,
    observer: ObserverBus,
    cancel: CancellationToken,
) {
    let router_id = SourceId::new(ROUTER_CURSOR_ID);
    let start = checkpoints
        .get(&router_id)
        .and_then(|c| c.cursor)
        .and_then(|cursor| cursor.parse::<u64>().ok())
        .unwrap_or(0);

    debug!(start, "router tail starting");
    let mut tailer = bus.tail(start);

    'tail: loop {
        let tailed = tokio::select! {
            _ = cancel.cancelled() => break 'tail,
            tailed = tailer.next() => tailed,
        };

        let tailed = match tailed {
            Ok(Some(tailed)) => tailed,
            Ok(None) => break 'tail,
            Err(e) => {
                // Mid-segment corruption or truncation under our feet; both
                // are unrecoverable for this tail.
                error!(error = %e, "router tail failed; routing stopped");
                cancel.cancel();
                break 'tail;
            }
        };

        for route in matcher.matches(&tailed.event) {
            observer.emit(ObserverEvent::RouteMatched {
                event_id: tailed.event.id.clone(),
                route: route.name.clone(),
            });

            let Some(entry) = pipelines.get(&route.name) else {
                // Pipelines are built from the same route list; missing
                // entries cannot happen past startup.
                continue;
            };

            // Each route sees its own clone; drops stay route-local.
            match entry.pipeline.run(tailed.event.clone(), &entry.ctx).await {
                PipelineOutcome::Pass(event) => {
                    let item = DeliveryItem {
                        event,
                        route: Arc::clone(&entry.route),
                    };
                    // Blocks while the actor's queue is full: backpressure
                    // propagates here, never into the bus.
                    if let Err(e) = scheduler.enqueue(item).await {
                        warn!(route = %route.name, error = %e, "enqueue failed; router stopping");
                        break 'tail;
                    }
                }
                PipelineOutcome::Drop { transform } => {
                    observer.emit(ObserverEvent::TransformDropped {
                        event_id: tailed.event.id.clone(),
                        route: route.name.clone(),
                        transform,
                    });
                }
            }
        }

        // Advance the router cursor past this offset.
        let mut checkpoint = checkpoints.get(&router_id).unwrap_or_else(Checkpoint::new);
        checkpoint.cursor = Some((tailed.offset + 1).to_string());
        checkpoint.updated_at = chrono::Utc::now();
        if let Err(e) = checkpoints.put(&router_id, checkpoint) {
            warn!(error = %e, "router cursor write failed; replay window grows");
        }
    }

    for entry in pipelines.values() {
        entry.pipeline.shutdown().await;
    }
}

/// Periodic housekeeping: dedup-window sweep and WAL compaction.
async fn run_maintenance(
    bus: EventBus,
    checkpoints: CheckpointStore,
    compaction: crate::bus::CompactionConfig,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(MAINTENANCE_INTERVAL) => {}
        }

        if let Err(e) = checkpoints.sweep_expired() {
            warn!(error = %e, "fingerprint sweep failed");
        }
        match bus.compact(&compaction) {
            Ok(0) => {}
            Ok(removed) => info!(removed, "compacted WAL segments"),
            Err(e) => warn!(error = %e, "WAL compaction failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{
        Actor, ConfigMap, DeliveryOutcome, PollBatch, Source, SourceError,
    };
    use crate::observe::DeliveryStatus;
    use crate::types::{Event, EventType};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tempfile::tempdir;

    /// Poll source emitting each scripted batch once, then idling.
    struct ScriptedSource {
        batches: Mutex<Vec<PollBatch>>,
    }

    impl ScriptedSource {
        fn new(batches: Vec<PollBatch>) -> Arc<Self> {
            Arc::new(ScriptedSource {
                batches: Mutex::new(batches),
            })
        }
    }

    #[async_trait]
    impl Source for ScriptedSource {
        fn mode(&self) -> SourceMode {
            SourceMode::Poll
        }

        async fn poll(
            &self,
            _cursor: Option<&str>,
            _cancel: &CancellationToken,
        ) -> std::result::Result<PollBatch, SourceError> {
            let mut batches = self.batches.lock().unwrap();
            if batches.is_empty() {
                Ok(PollBatch::default())
            } else {
                Ok(batches.remove(0))
            }
        }
    }

    struct CountingActor {
        delivered: AtomicU32,
        outcome: DeliveryOutcome,
    }

    impl CountingActor {
        fn new(outcome: DeliveryOutcome) -> Arc<Self> {
            Arc::new(CountingActor {
                delivered: AtomicU32::new(0),
                outcome,
            })
        }
    }

    #[async_trait]
    impl Actor for CountingActor {
        async fn deliver(
            &self,
            _event: &Event,
            _config: &ConfigMap,
            _cancel: &CancellationToken,
        ) -> DeliveryOutcome {
            self.delivered.fetch_add(1, Ordering::SeqCst);
            self.outcome.clone()
        }
    }

    struct Capture {
        events: Mutex<Vec<ObserverEvent>>,
    }

    impl Capture {
        fn new() -> Arc<Self> {
            Arc::new(Capture {
                events: Mutex::new(Vec::new()),
            })
        }

        fn count(&self, pred: impl Fn(&ObserverEvent) -> bool) -> usize {
            self.events.lock().unwrap().iter().filter(|e| pred(e)).count()
        }
    }

    impl Logger for Capture {
        fn name(&self) -> &str {
            "capture"
        }
        fn observe(&self, event: &ObserverEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    fn gh_event(platform_event: &str, n: u64) -> Event {
        Event::new(SourceId::new("stamped-later"), EventType::ResourceChanged)
            .with_provenance("platform_event", platform_event)
            .with_payload("n", n)
    }

    fn test_config(dir: &std::path::Path, routes: serde_json::Value) -> EngineConfig {
        serde_json::from_value(json!({
            "data_dir": dir.to_str().unwrap(),
            "listener": {"addr": "127.0.0.1:0"},
            "sources": [{"id": "gh", "connector": "scripted", "interval_secs": 0}],
            "actors": [{"id": "agent", "connector": "counting", "workers": 1}],
            "routes": routes
        }))
        .unwrap()
    }

    fn registry_with(
        source: Arc<ScriptedSource>,
        actor: Arc<CountingActor>,
    ) -> Registry {
        let mut registry = Registry::new();
        registry.register_source("scripted", move |_config| {
            Ok(Arc::clone(&source) as Arc<dyn Source>)
        });
        registry.register_actor("counting", move |_config| {
            Ok(Arc::clone(&actor) as Arc<dyn Actor>)
        });
        registry
    }

    async fn wait_until(mut predicate: impl FnMut() -> bool) {
        for _ in 0..400 {
            if predicate() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn single_poll_single_delivery() {
        let dir = tempdir().unwrap();
        let source = ScriptedSource::new(vec![PollBatch {
            events: vec![gh_event("pull_request.merged", 1)],
            checkpoint: Some("tick-1".to_string()),
        }]);
        let actor = CountingActor::new(DeliveryOutcome::Delivered);
        let capture = Capture::new();

        let config = test_config(
            dir.path(),
            json!([{
                "name": "merged",
                "when": {"source": "gh", "event_types": ["resource.changed"]},
                "then": {"actor": "agent"}
            }]),
        );

        let engine = Engine::start(
            config,
            registry_with(source, actor.clone()),
            vec![capture.clone()],
        )
        .await
        .unwrap();

        let a = actor.clone();
        wait_until(move || a.delivered.load(Ordering::SeqCst) == 1).await;

        // One bus record, checkpoint advanced to the poll's cursor.
        assert_eq!(engine.bus().next_offset(), 1);
        let ckpt = engine.checkpoints().get(&SourceId::new("gh")).unwrap();
        assert_eq!(ckpt.cursor.as_deref(), Some("tick-1"));

        engine.shutdown().await;

        assert_eq!(actor.delivered.load(Ordering::SeqCst), 1);
        assert_eq!(
            capture.count(|e| matches!(e, ObserverEvent::DeliveryAttempt { .. })),
            1
        );
        assert_eq!(
            capture.count(|e| matches!(
                e,
                ObserverEvent::DeliveryResult { status: DeliveryStatus::Delivered, .. }
            )),
            1
        );
    }

    #[tokio::test]
    async fn route_filter_drops_non_matching_events() {
        let dir = tempdir().unwrap();
        let source = ScriptedSource::new(vec![PollBatch {
            events: vec![
                gh_event("push", 1),
                gh_event("pull_request.merged", 2),
            ],
            checkpoint: None,
        }]);
        let actor = CountingActor::new(DeliveryOutcome::Delivered);
        let capture = Capture::new();

        let config = test_config(
            dir.path(),
            json!([{
                "name": "merged-only",
                "when": {
                    "source": "gh",
                    "event_types": ["resource.changed"],
                    "filter": {"op": "equals", "key": "provenance.platform_event",
                               "value": "pull_request.merged"}
                },
                "then": {"actor": "agent"}
            }]),
        );

        let engine = Engine::start(
            config,
            registry_with(source, actor.clone()),
            vec![capture.clone()],
        )
        .await
        .unwrap();

        let a = actor.clone();
        wait_until(move || a.delivered.load(Ordering::SeqCst) == 1).await;
        // Both events are durable even though only one was routed.
        assert_eq!(engine.bus().next_offset(), 2);
        engine.shutdown().await;

        assert_eq!(actor.delivered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dedup_within_window_delivers_once() {
        let dir = tempdir().unwrap();
        // The same logical event arrives in two separate polls.
        let source = ScriptedSource::new(vec![
            PollBatch {
                events: vec![gh_event("pull_request.merged", 1)],
                checkpoint: None,
            },
            PollBatch {
                events: vec![gh_event("pull_request.merged", 1)],
                checkpoint: None,
            },
        ]);
        let actor = CountingActor::new(DeliveryOutcome::Delivered);
        let capture = Capture::new();

        let config = test_config(
            dir.path(),
            json!([{
                "name": "merged",
                "when": {"source": "gh", "event_types": ["resource.changed"]},
                "transforms": [
                    {"connector": "dedup", "config": {"fields": ["payload.n"], "ttl_secs": 60}}
                ],
                "then": {"actor": "agent"}
            }]),
        );

        let engine = Engine::start(
            config,
            registry_with(source, actor.clone()),
            vec![capture.clone()],
        )
        .await
        .unwrap();

        let bus = engine.bus().clone();
        wait_until(move || bus.next_offset() == 2).await;
        let c = capture.clone();
        wait_until(move || {
            c.count(|e| matches!(e, ObserverEvent::TransformDropped { .. })) == 1
        })
        .await;
        engine.shutdown().await;

        // Two bus records, exactly one delivery attempt.
        assert_eq!(engine_offsets(dir.path()).await, 2);
        assert_eq!(actor.delivered.load(Ordering::SeqCst), 1);
        assert_eq!(
            capture.count(|e| matches!(e, ObserverEvent::DeliveryAttempt { .. })),
            1
        );
    }

    /// Reopens the WAL after shutdown and reports its next offset.
    async fn engine_offsets(dir: &std::path::Path) -> u64 {
        EventBus::open(WalConfig::new(dir.join("wal")))
            .unwrap()
            .next_offset()
    }

    #[tokio::test]
    async fn restart_does_not_redeliver_routed_events() {
        let dir = tempdir().unwrap();
        let actor = CountingActor::new(DeliveryOutcome::Delivered);
        let capture = Capture::new();

        let routes = json!([{
            "name": "all",
            "when": {"source": "gh", "event_types": ["resource.changed"]},
            "then": {"actor": "agent"}
        }]);

        {
            let source = ScriptedSource::new(vec![PollBatch {
                events: vec![gh_event("push", 1)],
                checkpoint: None,
            }]);
            let engine = Engine::start(
                test_config(dir.path(), routes.clone()),
                registry_with(source, actor.clone()),
                vec![capture.clone()],
            )
            .await
            .unwrap();

            let a = actor.clone();
            wait_until(move || a.delivered.load(Ordering::SeqCst) == 1).await;
            engine.shutdown().await;
        }

        // Second engine over the same data dir, source has nothing new.
        {
            let source = ScriptedSource::new(Vec::new());
            let engine = Engine::start(
                test_config(dir.path(), routes),
                registry_with(source, actor.clone()),
                vec![capture.clone()],
            )
            .await
            .unwrap();
            // Give the router time to (incorrectly) replay if it were going to.
            tokio::time::sleep(Duration::from_millis(100)).await;
            engine.shutdown().await;
        }

        assert_eq!(actor.delivered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rejected_delivery_is_terminal_at_engine_level() {
        let dir = tempdir().unwrap();
        let source = ScriptedSource::new(vec![PollBatch {
            events: vec![gh_event("push", 1)],
            checkpoint: None,
        }]);
        let actor = CountingActor::new(DeliveryOutcome::Rejected {
            reason: "not my event".to_string(),
        });
        let capture = Capture::new();

        let config = test_config(
            dir.path(),
            json!([{
                "name": "all",
                "when": {"source": "gh", "event_types": ["resource.changed"]},
                "then": {"actor": "agent"}
            }]),
        );

        let engine = Engine::start(
            config,
            registry_with(source, actor.clone()),
            vec![capture.clone()],
        )
        .await
        .unwrap();

        let c = capture.clone();
        wait_until(move || {
            c.count(|e| matches!(
                e,
                ObserverEvent::DeliveryResult { status: DeliveryStatus::Rejected, .. }
            )) == 1
        })
        .await;
        engine.shutdown().await;

        assert_eq!(actor.delivered.load(Ordering::SeqCst), 1);
        assert_eq!(
            capture.count(|e| matches!(e, ObserverEvent::DeliveryAttempt { .. })),
            1
        );
    }

    #[tokio::test]
    async fn no_delivery_attempts_after_shutdown_returns() {
        let dir = tempdir().unwrap();
        let source = ScriptedSource::new(vec![PollBatch {
            events: (0..5).map(|n| gh_event("push", n)).collect(),
            checkpoint: None,
        }]);
        let actor = CountingActor::new(DeliveryOutcome::Delivered);
        let capture = Capture::new();

        let config = test_config(
            dir.path(),
            json!([{
                "name": "all",
                "when": {"source": "gh", "event_types": ["resource.changed"]},
                "then": {"actor": "agent"}
            }]),
        );

        let engine = Engine::start(
            config,
            registry_with(source, actor.clone()),
            vec![capture.clone()],
        )
        .await
        .unwrap();

        let bus = engine.bus().clone();
        wait_until(move || bus.next_offset() == 5).await;
        engine.shutdown().await;

        let attempts_at_shutdown =
            capture.count(|e| matches!(e, ObserverEvent::DeliveryAttempt { .. }));
        tokio::time::sleep(Duration::from_millis(100)).await;
        let attempts_later =
            capture.count(|e| matches!(e, ObserverEvent::DeliveryAttempt { .. }));
        assert_eq!(attempts_at_shutdown, attempts_later);
    }

    #[tokio::test]
    async fn invalid_config_fails_before_start() {
        let dir = tempdir().unwrap();
        let config = test_config(
            dir.path(),
            json!([{
                "name": "broken",
                "when": {"source": "ghost", "event_types": ["resource.changed"]},
                "then": {"actor": "agent"}
            }]),
        );

        let source = ScriptedSource::new(Vec::new());
        let actor = CountingActor::new(DeliveryOutcome::Delivered);
        let err = Engine::start(config, registry_with(source, actor), Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[tokio::test]
    async fn failed_source_init_disables_only_that_source() {
        let dir = tempdir().unwrap();
        let mut config = test_config(
            dir.path(),
            json!([{
                "name": "all",
                "when": {"source": "gh", "event_types": ["resource.changed"]},
                "then": {"actor": "agent"}
            }]),
        );
        config.sources.push(
            serde_json::from_value(json!({"id": "broken", "connector": "failing"})).unwrap(),
        );

        let source = ScriptedSource::new(vec![PollBatch {
            events: vec![gh_event("push", 1)],
            checkpoint: None,
        }]);
        let actor = CountingActor::new(DeliveryOutcome::Delivered);
        let mut registry = registry_with(source, actor.clone());
        registry.register_source("failing", |_config| Err("bad credentials".to_string()));

        let engine = Engine::start(config, registry, Vec::new()).await.unwrap();
        let a = actor.clone();
        wait_until(move || a.delivered.load(Ordering::SeqCst) == 1).await;
        engine.shutdown().await;
    }
}
