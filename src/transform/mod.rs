//! Per-route transform pipelines.
//!
//! Each route carries an ordered list of transforms. A transform receives
//! the route's cloned event and either passes it on (possibly modified) or
//! drops it by returning `None`. Dropping affects only that route's
//! pipeline; other routes see their own clones.
//!
//! Transforms may be stateful (the dedup window lives in the checkpoint
//! store) but must tolerate concurrent events on different routes.

pub mod dedup;
pub mod enrich;
pub mod filter;
pub mod gate;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

use crate::checkpoint::{CheckpointError, CheckpointStore};
use crate::types::{Event, RouteName};

/// Factory entry points used by the connector registry.
pub mod builtin {
    pub use super::dedup::dedup_from_config;
    pub use super::enrich::enrich_from_config;
    pub use super::filter::filter_from_config;
    pub use super::gate::gate_from_config;
}

/// Errors from transform execution.
///
/// Per the engine's error policy, a transform error drops the event for that
/// route only; it never propagates further up.
#[derive(Debug, Error)]
pub enum TransformError {
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("transform failed: {0}")]
    Failed(String),
}

/// Execution context handed to every transform invocation.
pub struct TransformContext {
    /// The route this pipeline instance belongs to.
    pub route: RouteName,

    /// The route's `with` side-data.
    pub with: Map<String, Value>,

    /// Shared checkpoint store (dedup windows).
    pub checkpoints: CheckpointStore,
}

/// A transform connector instance.
#[async_trait]
pub trait Transform: Send + Sync {
    /// Processes one event. `Ok(None)` drops the event from this route.
    async fn execute(
        &self,
        event: Event,
        ctx: &TransformContext,
    ) -> Result<Option<Event>, TransformError>;

    async fn shutdown(&self) {}
}

impl std::fmt::Debug for dyn Transform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Transform")
    }
}

/// Outcome of running a full pipeline.
#[derive(Debug)]
pub enum PipelineOutcome {
    /// The event survived every stage.
    Pass(Event),

    /// A stage dropped the event (or errored, which drops it too).
    Drop { transform: String },
}

/// One route's ordered transform chain.
pub struct Pipeline {
    stages: Vec<(String, Box<dyn Transform>)>,
}

impl Pipeline {
    /// Builds a pipeline from named stages, in order.
    pub fn new(stages: Vec<(String, Box<dyn Transform>)>) -> Self {
        Pipeline { stages }
    }

    /// An empty pipeline that passes everything through.
    pub fn empty() -> Self {
        Pipeline { stages: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Runs the event through every stage in order.
    ///
    /// A stage returning `None` short-circuits the chain. A stage error is
    /// logged and treated as a drop by that stage.
    pub async fn run(&self, event: Event, ctx: &TransformContext) -> PipelineOutcome {
        let mut current = event;
        for (name, stage) in &self.stages {
            match stage.execute(current, ctx).await {
                Ok(Some(event)) => current = event,
                Ok(None) => {
                    return PipelineOutcome::Drop {
                        transform: name.clone(),
                    };
                }
                Err(e) => {
                    warn!(
                        route = %ctx.route,
                        transform = %name,
                        error = %e,
                        "transform failed; dropping event for this route"
                    );
                    return PipelineOutcome::Drop {
                        transform: name.clone(),
                    };
                }
            }
        }
        PipelineOutcome::Pass(current)
    }

    /// Shuts down every stage, in order.
    pub async fn shutdown(&self) {
        for (_, stage) in &self.stages {
            stage.shutdown().await;
        }
    }
}
