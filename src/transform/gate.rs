//! The gate transform: drops events while an external capability reports
//! closed.
//!
//! Capabilities are registered on the connector registry by name (e.g. an
//! "active-session" check backed by agent-ctl). A capability error fails
//! open: delivering during an outage of the check beats silently losing
//! events.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::connector::{ConfigMap, GateCheck};
use crate::types::Event;

use super::{Transform, TransformContext, TransformError};

#[derive(Debug, Deserialize)]
struct GateConfig {
    /// Name of the registered capability to consult.
    capability: String,
}

/// Consults a capability per event; closed gate drops the event.
pub struct GateTransform {
    capability: String,
    check: Arc<dyn GateCheck>,
}

#[async_trait]
impl Transform for GateTransform {
    async fn execute(
        &self,
        event: Event,
        ctx: &TransformContext,
    ) -> Result<Option<Event>, TransformError> {
        match self.check.is_open().await {
            Ok(true) => Ok(Some(event)),
            Ok(false) => Ok(None),
            Err(e) => {
                warn!(
                    route = %ctx.route,
                    capability = %self.capability,
                    error = %e,
                    "gate capability errored; failing open"
                );
                Ok(Some(event))
            }
        }
    }
}

/// Builds a gate transform from `{capability: "name"}` against the
/// registry's registered capabilities.
pub fn gate_from_config(
    config: &ConfigMap,
    gates: &HashMap<String, Arc<dyn GateCheck>>,
) -> Result<Box<dyn Transform>, String> {
    let parsed: GateConfig = serde_json::from_value(Value::Object(config.clone()))
        .map_err(|e| format!("invalid gate config: {e}"))?;

    let check = gates
        .get(&parsed.capability)
        .ok_or_else(|| format!("unknown gate capability {:?}", parsed.capability))?;

    Ok(Box::new(GateTransform {
        capability: parsed.capability,
        check: Arc::clone(check),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointStore;
    use crate::types::{EventType, RouteName, SourceId};
    use serde_json::{Map, json};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::tempdir;

    struct FlagGate {
        open: AtomicBool,
        fail: AtomicBool,
    }

    #[async_trait]
    impl GateCheck for FlagGate {
        async fn is_open(&self) -> Result<bool, String> {
            if self.fail.load(Ordering::SeqCst) {
                return Err("capability unreachable".to_string());
            }
            Ok(self.open.load(Ordering::SeqCst))
        }
    }

    fn setup(
        open: bool,
        fail: bool,
    ) -> (Box<dyn Transform>, Arc<FlagGate>) {
        let gate = Arc::new(FlagGate {
            open: AtomicBool::new(open),
            fail: AtomicBool::new(fail),
        });

        let mut gates: HashMap<String, Arc<dyn GateCheck>> = HashMap::new();
        gates.insert("session".to_string(), gate.clone());

        let config = json!({"capability": "session"});
        let transform =
            gate_from_config(config.as_object().unwrap(), &gates).unwrap();
        (transform, gate)
    }

    fn ctx(dir: &std::path::Path) -> TransformContext {
        TransformContext {
            route: RouteName::new("r"),
            with: Map::new(),
            checkpoints: CheckpointStore::open(dir).unwrap(),
        }
    }

    fn event() -> Event {
        Event::new(SourceId::new("s"), EventType::MessageReceived)
    }

    #[tokio::test]
    async fn open_gate_passes() {
        let dir = tempdir().unwrap();
        let (transform, _) = setup(true, false);
        assert!(
            transform
                .execute(event(), &ctx(dir.path()))
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn closed_gate_drops() {
        let dir = tempdir().unwrap();
        let (transform, gate) = setup(false, false);
        assert!(
            transform
                .execute(event(), &ctx(dir.path()))
                .await
                .unwrap()
                .is_none()
        );

        // Reopening lets events through again.
        gate.open.store(true, Ordering::SeqCst);
        assert!(
            transform
                .execute(event(), &ctx(dir.path()))
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn capability_error_fails_open() {
        let dir = tempdir().unwrap();
        let (transform, _) = setup(false, true);
        assert!(
            transform
                .execute(event(), &ctx(dir.path()))
                .await
                .unwrap()
                .is_some()
        );
    }

    #[test]
    fn unknown_capability_fails_init() {
        let gates: HashMap<String, Arc<dyn GateCheck>> = HashMap::new();
        let config = json!({"capability": "nope"});
        let err = gate_from_config(config.as_object().unwrap(), &gates).unwrap_err();
        assert!(err.contains("unknown gate capability"));
    }
}
