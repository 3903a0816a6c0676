//! The enrich transform: adds, copies or templates fields into the event.
//!
//! Config shape:
//!
//! ```json
//! { "fields": [
//!     { "target": "payload.team", "value": "infra" },
//!     { "target": "provenance.actor_hint", "from": "provenance.author" },
//!     { "target": "payload.summary", "template": "PR {{payload.pr_number}} by {{provenance.author}}" }
//! ]}
//! ```
//!
//! Targets must land in `payload.*` or `provenance.*`; intermediate objects
//! are created as needed. Fields apply in declaration order, so later fields
//! can reference earlier ones.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::connector::ConfigMap;
use crate::types::Event;

use super::{Transform, TransformContext, TransformError};

#[derive(Debug, Deserialize)]
struct EnrichConfig {
    fields: Vec<EnrichField>,
}

/// One enrichment action. The variant is inferred from which key is present.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum EnrichField {
    Copy { target: String, from: String },
    Template { target: String, template: String },
    Set { target: String, value: Value },
}

impl EnrichField {
    fn target(&self) -> &str {
        match self {
            EnrichField::Copy { target, .. }
            | EnrichField::Template { target, .. }
            | EnrichField::Set { target, .. } => target,
        }
    }
}

/// Applies a list of enrichment actions to each event.
pub struct EnrichTransform {
    fields: Vec<EnrichField>,
}

#[async_trait]
impl Transform for EnrichTransform {
    async fn execute(
        &self,
        mut event: Event,
        _ctx: &TransformContext,
    ) -> Result<Option<Event>, TransformError> {
        for field in &self.fields {
            let value = match field {
                EnrichField::Set { value, .. } => value.clone(),
                EnrichField::Copy { from, .. } => event.lookup(from).unwrap_or(Value::Null),
                EnrichField::Template { template, .. } => {
                    Value::String(render_template(template, &event))
                }
            };
            set_path(&mut event, field.target(), value)?;
        }
        Ok(Some(event))
    }
}

/// Builds an enrich transform, validating every target path up front.
pub fn enrich_from_config(config: &ConfigMap) -> Result<Box<dyn Transform>, String> {
    let parsed: EnrichConfig = serde_json::from_value(Value::Object(config.clone()))
        .map_err(|e| format!("invalid enrich config: {e}"))?;

    for field in &parsed.fields {
        let target = field.target();
        if split_target(target).is_none() {
            return Err(format!(
                "invalid enrich target {target:?}: must be payload.<path> or provenance.<path>"
            ));
        }
    }

    Ok(Box::new(EnrichTransform {
        fields: parsed.fields,
    }))
}

/// Splits a target into (section, rest); only payload/provenance are
/// writable.
fn split_target(target: &str) -> Option<(&str, &str)> {
    let (section, rest) = target.split_once('.')?;
    if rest.is_empty() {
        return None;
    }
    matches!(section, "payload" | "provenance").then_some((section, rest))
}

/// Writes `value` at the dot-path `target`, creating intermediate objects.
fn set_path(event: &mut Event, target: &str, value: Value) -> Result<(), TransformError> {
    let (section, rest) = split_target(target).ok_or_else(|| {
        TransformError::Failed(format!("invalid enrich target {target:?}"))
    })?;

    let map = match section {
        "payload" => &mut event.payload,
        _ => &mut event.provenance,
    };

    let (parents, leaf) = match rest.rsplit_once('.') {
        Some((parents, leaf)) => (Some(parents), leaf),
        None => (None, rest),
    };

    let mut current = map;
    for segment in parents.into_iter().flat_map(|p| p.split('.')) {
        let entry = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        match entry {
            Value::Object(next) => current = next,
            _ => {
                return Err(TransformError::Failed(format!(
                    "enrich target {target:?} collides with a non-object value at {segment:?}"
                )));
            }
        }
    }
    current.insert(leaf.to_string(), value);
    Ok(())
}

/// Substitutes `{{dot.path}}` references against the event.
///
/// Scalars render as their text form; structured values render as compact
/// JSON; missing paths render empty.
fn render_template(template: &str, event: &Event) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];

        let Some(end) = after.find("}}") else {
            out.push_str(&rest[start..]);
            return out;
        };

        let path = after[..end].trim();
        match event.lookup(path) {
            Some(Value::String(s)) => out.push_str(&s),
            Some(Value::Number(n)) => out.push_str(&n.to_string()),
            Some(Value::Bool(b)) => out.push_str(if b { "true" } else { "false" }),
            Some(other) => out.push_str(&other.to_string()),
            None => {}
        }
        rest = &after[end + 2..];
    }

    out.push_str(rest);
    out
}
