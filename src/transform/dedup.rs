//! The dedup transform: at-most-once-per-fingerprint within a TTL window.
//!
//! A fingerprint is a SHA-256 over the configured dot-path fields (or the
//! whole payload when no fields are configured). Fingerprints live in the
//! checkpoint store's per-source dedup window, so suppression survives
//! engine restarts.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::connector::ConfigMap;
use crate::types::{Event, Fingerprint};

use super::{Transform, TransformContext, TransformError};

/// Default dedup window when the route does not configure one.
pub const DEFAULT_DEDUP_TTL_SECS: u64 = 3600;

#[derive(Debug, Deserialize)]
struct DedupConfig {
    /// Dot-path fields hashed into the fingerprint. Empty means the whole
    /// payload.
    #[serde(default)]
    fields: Vec<String>,

    #[serde(default = "default_ttl")]
    ttl_secs: u64,
}

fn default_ttl() -> u64 {
    DEFAULT_DEDUP_TTL_SECS
}

/// Suppresses events whose fingerprint is already in the window.
pub struct DedupTransform {
    fields: Vec<String>,
    ttl: Duration,
}

impl DedupTransform {
    pub fn new(fields: Vec<String>, ttl: Duration) -> Self {
        DedupTransform { fields, ttl }
    }

    /// Computes the stable content hash for an event.
    ///
    /// Each configured field contributes `path=<canonical JSON>` on its own
    /// line; a missing field contributes `null`, so presence is part of the
    /// identity. serde_json's default map ordering is sorted, which keeps
    /// nested-object hashes stable.
    pub fn fingerprint(&self, event: &Event) -> Fingerprint {
        let mut hasher = Sha256::new();

        if self.fields.is_empty() {
            hasher.update(Value::Object(event.payload.clone()).to_string().as_bytes());
        } else {
            for field in &self.fields {
                let value = event.lookup(field).unwrap_or(Value::Null);
                hasher.update(field.as_bytes());
                hasher.update(b"=");
                hasher.update(value.to_string().as_bytes());
                hasher.update(b"\n");
            }
        }

        let digest = hasher.finalize();
        let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        Fingerprint::new(hex)
    }
}

#[async_trait]
impl Transform for DedupTransform {
    async fn execute(
        &self,
        mut event: Event,
        ctx: &TransformContext,
    ) -> Result<Option<Event>, TransformError> {
        let fp = self.fingerprint(&event);

        if ctx.checkpoints.seen(&event.source, &fp) {
            return Ok(None);
        }

        ctx.checkpoints
            .observe_fingerprint(&event.source, &fp, self.ttl)?;
        event.fingerprint = Some(fp);
        Ok(Some(event))
    }
}

/// Builds a dedup transform from `{fields: [..], ttl_secs: N}`.
pub fn dedup_from_config(config: &ConfigMap) -> Result<Box<dyn Transform>, String> {
    let parsed: DedupConfig = serde_json::from_value(Value::Object(config.clone()))
        .map_err(|e| format!("invalid dedup config: {e}"))?;
    Ok(Box::new(DedupTransform::new(
        parsed.fields,
        Duration::from_secs(parsed.ttl_secs),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointStore;
    use crate::types::{EventType, RouteName, SourceId};
    use serde_json::{Map, json};
    use tempfile::tempdir;

    fn ctx(dir: &std::path::Path) -> TransformContext {
        TransformContext {
            route: RouteName::new("r"),
            with: Map::new(),
            checkpoints: CheckpointStore::open(dir).unwrap(),
        }
    }

    fn config(value: serde_json::Value) -> ConfigMap {
        value.as_object().unwrap().clone()
    }

    fn event(x: i64) -> Event {
        Event::new(SourceId::new("s"), EventType::ResourceChanged).with_payload("x", x)
    }

    #[tokio::test]
    async fn second_identical_event_is_dropped() {
        let dir = tempdir().unwrap();
        let ctx = ctx(dir.path());
        let transform =
            dedup_from_config(&config(json!({"fields": ["payload.x"], "ttl_secs": 60}))).unwrap();

        let first = transform.execute(event(1), &ctx).await.unwrap();
        assert!(first.is_some());
        assert!(first.unwrap().fingerprint.is_some());

        let second = transform.execute(event(1), &ctx).await.unwrap();
        assert!(second.is_none());

        // A different value passes.
        assert!(transform.execute(event(2), &ctx).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn suppression_survives_store_reopen() {
        let dir = tempdir().unwrap();
        let transform =
            dedup_from_config(&config(json!({"fields": ["payload.x"], "ttl_secs": 600}))).unwrap();

        {
            let ctx = ctx(dir.path());
            assert!(transform.execute(event(7), &ctx).await.unwrap().is_some());
        }

        // Fresh store over the same directory: the window is persisted.
        let ctx = ctx(dir.path());
        assert!(transform.execute(event(7), &ctx).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_window_readmits() {
        let dir = tempdir().unwrap();
        let ctx = ctx(dir.path());
        let transform =
            dedup_from_config(&config(json!({"fields": ["payload.x"], "ttl_secs": 0}))).unwrap();

        assert!(transform.execute(event(1), &ctx).await.unwrap().is_some());
        // TTL zero expires immediately.
        assert!(transform.execute(event(1), &ctx).await.unwrap().is_some());
    }

    #[test]
    fn fingerprint_ignores_unconfigured_fields() {
        let transform = DedupTransform::new(
            vec!["payload.x".to_string()],
            Duration::from_secs(60),
        );

        let a = event(1).with_payload("noise", "a");
        let b = event(1).with_payload("noise", "b");
        assert_eq!(transform.fingerprint(&a), transform.fingerprint(&b));

        let c = event(2);
        assert_ne!(transform.fingerprint(&a), transform.fingerprint(&c));
    }

    #[test]
    fn missing_field_is_part_of_identity() {
        let transform = DedupTransform::new(
            vec!["payload.x".to_string(), "payload.y".to_string()],
            Duration::from_secs(60),
        );

        let with_y = event(1).with_payload("y", 0);
        let without_y = event(1);
        assert_ne!(transform.fingerprint(&with_y), transform.fingerprint(&without_y));
    }

    #[test]
    fn empty_fields_hash_whole_payload() {
        let transform = DedupTransform::new(Vec::new(), Duration::from_secs(60));

        let a = event(1);
        let b = event(1);
        // Ids and timestamps differ, but the payload is identical.
        assert_eq!(transform.fingerprint(&a), transform.fingerprint(&b));

        let c = event(1).with_payload("extra", true);
        assert_ne!(transform.fingerprint(&a), transform.fingerprint(&c));
    }
}
