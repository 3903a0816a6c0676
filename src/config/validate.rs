//! Load-time configuration validation.
//!
//! Everything here is fatal at startup (`ConfigInvalid` in the error
//! taxonomy): dead sources, orphan transforms, duplicate ids, missing env
//! vars. Runtime never sees a config that failed validation.

use std::collections::HashSet;

use thiserror::Error;

use super::{EngineConfig, env::substitute_env};

/// Reserved id prefix for engine-internal checkpoint entries (the router
/// cursor lives under `__router__`).
pub const RESERVED_ID_PREFIX: &str = "__";

/// Fatal configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid id {id:?}: {reason}")]
    InvalidId { id: String, reason: String },

    #[error("duplicate source id {id:?}")]
    DuplicateSource { id: String },

    #[error("duplicate actor id {id:?}")]
    DuplicateActor { id: String },

    #[error("duplicate route name {name:?}")]
    DuplicateRoute { name: String },

    #[error(
        "id {id:?} is declared as both a source and an actor; feedback requires a distinct source id"
    )]
    SharedId { id: String },

    #[error("route {route:?}: when.source references undeclared source {source_id:?}")]
    UnknownSource { route: String, source_id: String },

    #[error("route {route:?}: then.actor references undeclared actor {actor:?}")]
    UnknownActor { route: String, actor: String },

    #[error("route {route:?}: when.event_types must not be empty")]
    EmptyEventTypes { route: String },

    #[error("route {route:?}: unknown transform connector {connector:?}")]
    UnknownTransform { route: String, connector: String },

    #[error("environment variable {name} referenced in config but not set")]
    MissingEnvVar { name: String },
}

/// Result type for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Resolves `${VAR}` references against the process environment, then
/// validates the route graph. Call once at startup, before any connector is
/// instantiated.
pub fn resolve_and_validate(
    config: &mut EngineConfig,
    known_transforms: &HashSet<String>,
) -> Result<()> {
    resolve_env(config, &|name| std::env::var(name).ok())?;
    validate(config, known_transforms)
}

/// Env substitution over every connector config in the engine config.
pub fn resolve_env(
    config: &mut EngineConfig,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> Result<()> {
    for source in &mut config.sources {
        substitute_env(&mut source.config, lookup)?;
    }
    for actor in &mut config.actors {
        substitute_env(&mut actor.config, lookup)?;
    }
    for route in &mut config.routes {
        for transform in &mut route.transforms {
            substitute_env(&mut transform.config, lookup)?;
        }
        substitute_env(&mut route.then.config, lookup)?;
    }
    Ok(())
}

/// Structural validation of the route graph.
pub fn validate(config: &EngineConfig, known_transforms: &HashSet<String>) -> Result<()> {
    let mut source_ids = HashSet::new();
    for source in &config.sources {
        check_id(source.id.as_str())?;
        if !source_ids.insert(source.id.as_str()) {
            return Err(ConfigError::DuplicateSource {
                id: source.id.as_str().to_string(),
            });
        }
    }

    let mut actor_ids = HashSet::new();
    for actor in &config.actors {
        check_id(actor.id.as_str())?;
        if !actor_ids.insert(actor.id.as_str()) {
            return Err(ConfigError::DuplicateActor {
                id: actor.id.as_str().to_string(),
            });
        }
        // Actors never emit into the bus; an actor that is also a source
        // must be declared under a different id so the cycle is explicit.
        if source_ids.contains(actor.id.as_str()) {
            return Err(ConfigError::SharedId {
                id: actor.id.as_str().to_string(),
            });
        }
    }

    let mut route_names = HashSet::new();
    for route in &config.routes {
        let name = route.name.as_str();
        if !route_names.insert(name) {
            return Err(ConfigError::DuplicateRoute {
                name: name.to_string(),
            });
        }

        if !source_ids.contains(route.when.source.as_str()) {
            return Err(ConfigError::UnknownSource {
                route: name.to_string(),
                source_id: route.when.source.as_str().to_string(),
            });
        }

        if !actor_ids.contains(route.then.actor.as_str()) {
            return Err(ConfigError::UnknownActor {
                route: name.to_string(),
                actor: route.then.actor.as_str().to_string(),
            });
        }

        if route.when.event_types.is_empty() {
            return Err(ConfigError::EmptyEventTypes {
                route: name.to_string(),
            });
        }

        for transform in &route.transforms {
            if !known_transforms.contains(&transform.connector) {
                return Err(ConfigError::UnknownTransform {
                    route: name.to_string(),
                    connector: transform.connector.clone(),
                });
            }
        }
    }

    Ok(())
}

/// Ids become file names (checkpoints) and URL path segments (webhooks), so
/// the charset is restricted accordingly.
fn check_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(ConfigError::InvalidId {
            id: id.to_string(),
            reason: "empty".to_string(),
        });
    }
    if id.starts_with(RESERVED_ID_PREFIX) {
        return Err(ConfigError::InvalidId {
            id: id.to_string(),
            reason: format!("prefix {RESERVED_ID_PREFIX:?} is reserved for engine internals"),
        });
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(ConfigError::InvalidId {
            id: id.to_string(),
            reason: "only ASCII alphanumerics, '_' and '-' are allowed".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn known() -> HashSet<String> {
        ["filter", "dedup", "enrich", "gate"]
            .into_iter()
            .map(String::from)
            .collect()
    }

    fn config(value: serde_json::Value) -> EngineConfig {
        serde_json::from_value(value).unwrap()
    }

    fn base() -> serde_json::Value {
        json!({
            "sources": [{"id": "gh", "connector": "github"}],
            "actors": [{"id": "agent", "connector": "agent-ctl"}],
            "routes": [{
                "name": "r1",
                "when": {"source": "gh", "event_types": ["resource.changed"]},
                "then": {"actor": "agent"}
            }]
        })
    }

    #[test]
    fn valid_config_passes() {
        assert!(validate(&config(base()), &known()).is_ok());
    }

    #[test]
    fn dead_source_rejected() {
        let mut value = base();
        value["routes"][0]["when"]["source"] = json!("nope");
        let err = validate(&config(value), &known()).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownSource { .. }));
    }

    #[test]
    fn unknown_actor_rejected() {
        let mut value = base();
        value["routes"][0]["then"]["actor"] = json!("ghost");
        let err = validate(&config(value), &known()).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownActor { .. }));
    }

    #[test]
    fn empty_event_types_rejected() {
        let mut value = base();
        value["routes"][0]["when"]["event_types"] = json!([]);
        let err = validate(&config(value), &known()).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyEventTypes { .. }));
    }

    #[test]
    fn orphan_transform_rejected() {
        let mut value = base();
        value["routes"][0]["transforms"] = json!([{"connector": "no-such-transform"}]);
        let err = validate(&config(value), &known()).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownTransform { .. }));
    }

    #[test]
    fn shared_source_actor_id_rejected() {
        let mut value = base();
        value["actors"] = json!([{"id": "gh", "connector": "agent-ctl"}]);
        value["routes"][0]["then"]["actor"] = json!("gh");
        let err = validate(&config(value), &known()).unwrap_err();
        assert!(matches!(err, ConfigError::SharedId { .. }));
    }

    #[test]
    fn duplicate_ids_rejected() {
        let mut value = base();
        value["sources"] = json!([
            {"id": "gh", "connector": "github"},
            {"id": "gh", "connector": "github"}
        ]);
        let err = validate(&config(value), &known()).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateSource { .. }));
    }

    #[test]
    fn reserved_prefix_rejected() {
        let mut value = base();
        value["sources"][0]["id"] = json!("__router__");
        value["routes"][0]["when"]["source"] = json!("__router__");
        let err = validate(&config(value), &known()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidId { .. }));
    }

    #[test]
    fn hostile_id_charset_rejected() {
        let mut value = base();
        value["sources"][0]["id"] = json!("../escape");
        value["routes"][0]["when"]["source"] = json!("../escape");
        let err = validate(&config(value), &known()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidId { .. }));
    }

    #[test]
    fn env_resolution_covers_all_config_sites() {
        let mut cfg = config(json!({
            "sources": [{"id": "gh", "connector": "github", "config": {"token": "${T}"}}],
            "actors": [{"id": "a", "connector": "x", "config": {"key": "${T}"}}],
            "routes": [{
                "name": "r",
                "when": {"source": "gh", "event_types": ["resource.changed"]},
                "transforms": [{"connector": "enrich", "config": {"team": "${T}"}}],
                "then": {"actor": "a", "config": {"url": "${T}"}}
            }]
        }));

        resolve_env(&mut cfg, &|name| {
            (name == "T").then(|| "resolved".to_string())
        })
        .unwrap();

        assert_eq!(cfg.sources[0].config["token"], json!("resolved"));
        assert_eq!(cfg.actors[0].config["key"], json!("resolved"));
        assert_eq!(cfg.routes[0].transforms[0].config["team"], json!("resolved"));
        assert_eq!(cfg.routes[0].then.config["url"], json!("resolved"));
    }

    #[test]
    fn missing_env_var_is_fatal() {
        let mut cfg = config(json!({
            "sources": [{"id": "gh", "connector": "github", "config": {"token": "${NOPE}"}}]
        }));
        let err = resolve_env(&mut cfg, &|_| None).unwrap_err();
        assert!(err.to_string().contains("NOPE"));
    }
}
