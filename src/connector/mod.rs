//! Connector contracts: the boundary between the engine core and plugins.
//!
//! The core never knows concrete connector types. Sources, actors and
//! transforms are declared in config by connector name and instantiated
//! through the [`Registry`]; instantiation is the contract's `init` step and
//! receives the opaque (env-resolved) config mapping to validate.
//!
//! Concrete connectors (GitHub, Linear, cron, agent-ctl, ...) live outside
//! this crate and register themselves on the registry before engine start.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::transform::{Transform, builtin};
use crate::types::Event;

/// The opaque config mapping handed to connector init.
pub type ConfigMap = Map<String, Value>;

/// Errors surfaced by source connectors.
#[derive(Debug, Error)]
pub enum SourceError {
    /// Transient: logged, checkpoint not advanced, retried next tick.
    #[error("transient source error: {0}")]
    Transient(String),

    /// Fatal: the source is disabled; other sources continue.
    #[error("fatal source error: {0}")]
    Fatal(String),
}

impl SourceError {
    pub fn transient(message: impl Into<String>) -> Self {
        SourceError::Transient(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        SourceError::Fatal(message.into())
    }
}

/// How a source feeds the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceMode {
    /// The runner calls [`Source::poll`] on the declared interval.
    Poll,

    /// The listener routes `POST /webhooks/{source_id}` bodies through
    /// [`Source::translate`].
    Webhook,

    /// Out-of-process signals: NDJSON on stdin or `POST /hooks/{name}`.
    Hook,
}

/// One poll's worth of events plus the cursor to persist after the engine
/// has durably accepted them.
#[derive(Debug, Default)]
pub struct PollBatch {
    pub events: Vec<Event>,
    pub checkpoint: Option<String>,
}

/// A source connector instance.
#[async_trait]
pub trait Source: Send + Sync {
    /// How this instance is driven.
    fn mode(&self) -> SourceMode;

    /// Fetches new events since `cursor`. Only called for poll-mode sources.
    ///
    /// Implementations should honor `cancel` and return promptly when it
    /// fires; the engine enforces a hard deadline regardless.
    async fn poll(
        &self,
        cursor: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<PollBatch, SourceError> {
        let _ = (cursor, cancel);
        Err(SourceError::fatal("source does not support polling"))
    }

    /// Translates an inbound webhook body into events. Only called for
    /// webhook-mode sources.
    fn translate(&self, body: &[u8]) -> Result<Vec<Event>, SourceError> {
        let _ = body;
        Err(SourceError::fatal("source does not accept webhooks"))
    }

    async fn shutdown(&self) {}
}

/// Terminal classification of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The actor accepted the event.
    Delivered,

    /// The actor refused the event; terminal, never retried.
    Rejected { reason: String },

    /// Transient failure; retried with backoff.
    Error { message: String },
}

/// An actor connector instance.
///
/// One instance is shared across all workers for its actor id, so `deliver`
/// must be safe to invoke concurrently.
#[async_trait]
pub trait Actor: Send + Sync {
    /// Delivers one event with the route's `then.config`.
    async fn deliver(
        &self,
        event: &Event,
        config: &ConfigMap,
        cancel: &CancellationToken,
    ) -> DeliveryOutcome;

    async fn shutdown(&self) {}
}

impl std::fmt::Debug for dyn Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Source")
    }
}

impl std::fmt::Debug for dyn Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Actor")
    }
}

/// An external capability consulted by the gate transform
/// (e.g. "does any active session exist?").
#[async_trait]
pub trait GateCheck: Send + Sync {
    /// `Ok(false)` closes the gate; errors fail open at the call site.
    async fn is_open(&self) -> Result<bool, String>;
}

/// Errors from connector instantiation.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown {kind} connector {name:?}")]
    UnknownConnector { kind: &'static str, name: String },

    #[error("{kind} connector {name:?} failed to initialize: {message}")]
    Init {
        kind: &'static str,
        name: String,
        message: String,
    },
}

type SourceFactory =
    Box<dyn Fn(&ConfigMap) -> Result<Arc<dyn Source>, String> + Send + Sync>;
type ActorFactory = Box<dyn Fn(&ConfigMap) -> Result<Arc<dyn Actor>, String> + Send + Sync>;
type TransformFactory =
    Box<dyn Fn(&ConfigMap) -> Result<Box<dyn Transform>, String> + Send + Sync>;

/// The connector registry: names → factories.
///
/// The built-in transforms (`filter`, `dedup`, `enrich`, `gate`) are always
/// known; everything else is registered by the embedder.
#[derive(Default)]
pub struct Registry {
    sources: HashMap<String, SourceFactory>,
    actors: HashMap<String, ActorFactory>,
    transforms: HashMap<String, TransformFactory>,
    gates: HashMap<String, Arc<dyn GateCheck>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    pub fn register_source<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&ConfigMap) -> Result<Arc<dyn Source>, String> + Send + Sync + 'static,
    {
        self.sources.insert(name.into(), Box::new(factory));
    }

    pub fn register_actor<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&ConfigMap) -> Result<Arc<dyn Actor>, String> + Send + Sync + 'static,
    {
        self.actors.insert(name.into(), Box::new(factory));
    }

    pub fn register_transform<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&ConfigMap) -> Result<Box<dyn Transform>, String> + Send + Sync + 'static,
    {
        self.transforms.insert(name.into(), Box::new(factory));
    }

    /// Registers a named gate capability for the built-in gate transform.
    pub fn register_gate(&mut self, name: impl Into<String>, check: Arc<dyn GateCheck>) {
        self.gates.insert(name.into(), check);
    }

    /// Instantiates a source connector (the contract's `init`).
    pub fn create_source(
        &self,
        connector: &str,
        config: &ConfigMap,
    ) -> Result<Arc<dyn Source>, RegistryError> {
        let factory = self
            .sources
            .get(connector)
            .ok_or_else(|| RegistryError::UnknownConnector {
                kind: "source",
                name: connector.to_string(),
            })?;
        factory(config).map_err(|message| RegistryError::Init {
            kind: "source",
            name: connector.to_string(),
            message,
        })
    }

    /// Instantiates an actor connector.
    pub fn create_actor(
        &self,
        connector: &str,
        config: &ConfigMap,
    ) -> Result<Arc<dyn Actor>, RegistryError> {
        let factory = self
            .actors
            .get(connector)
            .ok_or_else(|| RegistryError::UnknownConnector {
                kind: "actor",
                name: connector.to_string(),
            })?;
        factory(config).map_err(|message| RegistryError::Init {
            kind: "actor",
            name: connector.to_string(),
            message,
        })
    }

    /// Instantiates a transform: built-ins first, then registered customs.
    pub fn create_transform(
        &self,
        connector: &str,
        config: &ConfigMap,
    ) -> Result<Box<dyn Transform>, RegistryError> {
        let built = match connector {
            "filter" => Some(builtin::filter_from_config(config)),
            "dedup" => Some(builtin::dedup_from_config(config)),
            "enrich" => Some(builtin::enrich_from_config(config)),
            "gate" => Some(builtin::gate_from_config(config, &self.gates)),
            _ => None,
        };

        if let Some(result) = built {
            return result.map_err(|message| RegistryError::Init {
                kind: "transform",
                name: connector.to_string(),
                message,
            });
        }

        let factory = self
            .transforms
            .get(connector)
            .ok_or_else(|| RegistryError::UnknownConnector {
                kind: "transform",
                name: connector.to_string(),
            })?;
        factory(config).map_err(|message| RegistryError::Init {
            kind: "transform",
            name: connector.to_string(),
            message,
        })
    }

    /// Every transform connector name this registry can build, for
    /// validation of route specs.
    pub fn transform_names(&self) -> HashSet<String> {
        let mut names: HashSet<String> = ["filter", "dedup", "enrich", "gate"]
            .into_iter()
            .map(String::from)
            .collect();
        names.extend(self.transforms.keys().cloned());
        names
    }
}
