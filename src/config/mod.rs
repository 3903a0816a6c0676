//! Declarative engine configuration: sources, actors, routes.
//!
//! The model is deliberately connector-agnostic: a `SourceSpec` or
//! `ActorSpec` names a connector and carries an opaque config mapping that
//! the connector validates in its own `init`. YAML parsing, schema files and
//! module composition live outside the engine; this module consumes the
//! already-shaped data (JSON via serde in the bundled binary).

pub mod env;
pub mod validate;

use std::net::SocketAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::route::filter::Predicate;
use crate::types::{ActorId, EventType, RouteName, SourceId};

pub use validate::{ConfigError, validate};

/// Default poll interval for sources that do not declare one.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;

/// Default worker count per actor.
pub const DEFAULT_ACTOR_WORKERS: usize = 4;

/// Default per-actor queue capacity.
pub const DEFAULT_ACTOR_QUEUE: usize = 64;

/// Default drain timeout on shutdown.
pub const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 30;

/// A declared source instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSpec {
    pub id: SourceId,

    /// Connector type name, resolved against the registry.
    pub connector: String,

    /// Opaque connector configuration, validated by the connector's init.
    #[serde(default)]
    pub config: Map<String, Value>,

    /// Poll interval in seconds; only meaningful for poll-mode sources.
    #[serde(default)]
    pub interval_secs: Option<u64>,
}

/// A declared actor instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActorSpec {
    pub id: ActorId,

    /// Connector type name, resolved against the registry.
    pub connector: String,

    /// Opaque connector configuration, validated by the connector's init.
    #[serde(default)]
    pub config: Map<String, Value>,

    /// Concurrent delivery workers for this actor. Routes that need strict
    /// per-actor ordering set this to 1.
    #[serde(default)]
    pub workers: Option<usize>,

    /// Bounded delivery queue capacity; the router blocks when full.
    #[serde(default)]
    pub queue: Option<usize>,
}

impl ActorSpec {
    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or(DEFAULT_ACTOR_WORKERS).max(1)
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue.unwrap_or(DEFAULT_ACTOR_QUEUE).max(1)
    }
}

/// The `when` clause of a route: which events it applies to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WhenClause {
    /// Source-instance id the route listens on.
    pub source: SourceId,

    /// Event types the route accepts; validation rejects an empty list.
    pub event_types: Vec<EventType>,

    /// Optional predicate over the full event.
    #[serde(default)]
    pub filter: Option<Predicate>,
}

/// One transform in a route's pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformSpec {
    /// Transform connector name (`filter`, `dedup`, `enrich`, `gate`, or a
    /// registered custom transform).
    pub connector: String,

    #[serde(default)]
    pub config: Map<String, Value>,
}

/// The `then` clause of a route: where matched events go.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThenClause {
    pub actor: ActorId,

    /// Per-route delivery configuration passed to `Actor::deliver`.
    #[serde(default)]
    pub config: Map<String, Value>,
}

/// A declarative route: `when` → `transforms` → `then`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteSpec {
    pub name: RouteName,
    pub when: WhenClause,

    #[serde(default)]
    pub transforms: Vec<TransformSpec>,

    pub then: ThenClause,

    /// Arbitrary side-data carried on the route, visible to transforms.
    #[serde(default)]
    pub with: Map<String, Value>,
}

/// HTTP listener settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// Bind address; loopback-only by default.
    #[serde(default = "default_listen_addr")]
    pub addr: SocketAddr,

    /// Request body cap in bytes.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 4800))
}

fn default_max_body_bytes() -> usize {
    1024 * 1024
}

impl Default for ListenerConfig {
    fn default() -> Self {
        ListenerConfig {
            addr: default_listen_addr(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

/// WAL retention settings; see the compaction task.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Segments younger than this are never compacted.
    #[serde(default = "default_retention_days")]
    pub max_age_days: u64,

    /// Compaction only runs while the log exceeds this total size.
    #[serde(default = "default_retention_bytes")]
    pub max_total_bytes: u64,
}

fn default_retention_days() -> u64 {
    7
}

fn default_retention_bytes() -> u64 {
    1024 * 1024 * 1024
}

impl Default for RetentionConfig {
    fn default() -> Self {
        RetentionConfig {
            max_age_days: default_retention_days(),
            max_total_bytes: default_retention_bytes(),
        }
    }
}

impl From<RetentionConfig> for crate::bus::CompactionConfig {
    fn from(cfg: RetentionConfig) -> Self {
        crate::bus::CompactionConfig {
            max_age: std::time::Duration::from_secs(cfg.max_age_days * 24 * 60 * 60),
            max_total_bytes: cfg.max_total_bytes,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Root for the WAL (`<data_dir>/wal`) and checkpoints
    /// (`<data_dir>/checkpoints`).
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub listener: ListenerConfig,

    /// WAL fsync policy: `"per-record"` or `"batched:<N>ms"`.
    #[serde(default = "default_fsync")]
    pub fsync: String,

    #[serde(default)]
    pub retention: RetentionConfig,

    /// Seconds to wait for in-flight deliveries on shutdown.
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,

    #[serde(default)]
    pub sources: Vec<SourceSpec>,

    #[serde(default)]
    pub actors: Vec<ActorSpec>,

    #[serde(default)]
    pub routes: Vec<RouteSpec>,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_fsync() -> String {
    "per-record".to_string()
}

fn default_drain_timeout() -> u64 {
    DEFAULT_DRAIN_TIMEOUT_SECS
}

impl EngineConfig {
    pub fn wal_dir(&self) -> PathBuf {
        self.data_dir.join("wal")
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.data_dir.join("checkpoints")
    }

    pub fn drain_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn source(&self, id: &SourceId) -> Option<&SourceSpec> {
        self.sources.iter().find(|s| &s.id == id)
    }

    pub fn actor(&self, id: &ActorId) -> Option<&ActorSpec> {
        self.actors.iter().find(|a| &a.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let config: EngineConfig = serde_json::from_value(json!({})).unwrap();
        assert_eq!(config.listener.addr.port(), 4800);
        assert!(config.listener.addr.ip().is_loopback());
        assert_eq!(config.listener.max_body_bytes, 1024 * 1024);
        assert_eq!(config.fsync, "per-record");
        assert_eq!(config.retention.max_age_days, 7);
        assert_eq!(config.drain_timeout_secs, 30);
    }

    #[test]
    fn full_route_parses() {
        let config: EngineConfig = serde_json::from_value(json!({
            "sources": [
                {"id": "gh", "connector": "github", "config": {"repo": "a/b"}, "interval_secs": 30}
            ],
            "actors": [
                {"id": "agent", "connector": "agent-ctl", "workers": 1, "queue": 8}
            ],
            "routes": [
                {
                    "name": "merged-prs",
                    "when": {
                        "source": "gh",
                        "event_types": ["resource.changed"],
                        "filter": {"op": "equals", "key": "provenance.platform_event",
                                   "value": "pull_request.merged"}
                    },
                    "transforms": [
                        {"connector": "dedup", "config": {"fields": ["payload.pr_number"]}}
                    ],
                    "then": {"actor": "agent", "config": {"prompt": "review"}},
                    "with": {"team": "infra"}
                }
            ]
        }))
        .unwrap();

        let route = &config.routes[0];
        assert_eq!(route.when.source, SourceId::new("gh"));
        assert_eq!(route.when.event_types, vec![EventType::ResourceChanged]);
        assert!(route.when.filter.is_some());
        assert_eq!(route.then.actor, ActorId::new("agent"));
        assert_eq!(config.actors[0].worker_count(), 1);
        assert_eq!(config.actors[0].queue_capacity(), 8);
    }

    #[test]
    fn actor_defaults_apply() {
        let actor: ActorSpec =
            serde_json::from_value(json!({"id": "a", "connector": "noop"})).unwrap();
        assert_eq!(actor.worker_count(), DEFAULT_ACTOR_WORKERS);
        assert_eq!(actor.queue_capacity(), DEFAULT_ACTOR_QUEUE);
    }
}
