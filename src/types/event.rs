//! The event: the unit of data flowing through the engine.
//!
//! Events are immutable once appended to the bus. The wire format (JSON) is:
//!
//! ```json
//! {
//!   "id": "0190c9a4-...",
//!   "source": "gh",
//!   "type": "resource.changed",
//!   "timestamp": "2026-07-01T12:00:00Z",
//!   "provenance": { "platform": "github", "platform_event": "pull_request.merged" },
//!   "payload": { "pr_number": 42 }
//! }
//! ```
//!
//! Transforms operate on cloned events, so mutation inside a route's pipeline
//! never leaks into other routes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::ids::{EventId, Fingerprint, SourceId};

/// The closed set of event types the engine routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    /// An external resource changed (PR merged, issue updated, file written).
    #[serde(rename = "resource.changed")]
    ResourceChanged,

    /// A target actor stopped (session end, container exit).
    #[serde(rename = "actor.stopped")]
    ActorStopped,

    /// An inbound message arrived for an actor.
    #[serde(rename = "message.received")]
    MessageReceived,
}

impl EventType {
    /// Returns the wire name of this event type.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::ResourceChanged => "resource.changed",
            EventType::ActorStopped => "actor.stopped",
            EventType::MessageReceived => "message.received",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An event as it flows through the bus, router and pipelines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Globally-unique identifier.
    pub id: EventId,

    /// The source instance that emitted this event.
    pub source: SourceId,

    /// Event type.
    #[serde(rename = "type")]
    pub kind: EventType,

    /// Producer wall-clock timestamp (RFC3339 on the wire).
    pub timestamp: DateTime<Utc>,

    /// Where the event came from: `platform`, `platform_event`, `author`,
    /// `author_type`, plus arbitrary connector-specific keys.
    #[serde(default)]
    pub provenance: Map<String, Value>,

    /// Free-form event body.
    #[serde(default)]
    pub payload: Map<String, Value>,

    /// Content hash set by the dedup transform; absent until computed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<Fingerprint>,
}

impl Event {
    /// Creates an event with a freshly minted id and the current timestamp.
    pub fn new(source: SourceId, kind: EventType) -> Self {
        Event {
            id: EventId::generate(),
            source,
            kind,
            timestamp: Utc::now(),
            provenance: Map::new(),
            payload: Map::new(),
            fingerprint: None,
        }
    }

    /// Builder-style payload field insertion, mostly for tests and connectors.
    pub fn with_payload(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// Builder-style provenance field insertion.
    pub fn with_provenance(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.provenance.insert(key.into(), value.into());
        self
    }

    /// Resolves a dot-path key against the full event.
    ///
    /// The first segment selects the section: `id`, `source`, `type`,
    /// `timestamp`, `provenance`, or `payload`. Remaining segments descend
    /// through nested JSON objects. Returns `None` when any segment is
    /// missing or a non-object is indexed into.
    ///
    /// Scalars at the top level (`id`, `type`, ...) resolve to their string
    /// forms, matching the wire format.
    pub fn lookup(&self, path: &str) -> Option<Value> {
        let mut segments = path.split('.');
        let head = segments.next()?;

        let root: Value = match head {
            "id" => return trailing_empty(segments).then(|| Value::String(self.id.0.clone())),
            "source" => {
                return trailing_empty(segments).then(|| Value::String(self.source.0.clone()));
            }
            "type" => {
                return trailing_empty(segments)
                    .then(|| Value::String(self.kind.as_str().to_string()));
            }
            "timestamp" => {
                return trailing_empty(segments)
                    .then(|| Value::String(self.timestamp.to_rfc3339()));
            }
            "provenance" => Value::Object(self.provenance.clone()),
            "payload" => Value::Object(self.payload.clone()),
            _ => return None,
        };

        let mut current = root;
        for segment in segments {
            match current {
                Value::Object(mut map) => {
                    current = map.remove(segment)?;
                }
                _ => return None,
            }
        }
        Some(current)
    }
}

fn trailing_empty<'a>(mut segments: impl Iterator<Item = &'a str>) -> bool {
    segments.next().is_none()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_event() -> Event {
        Event::new(SourceId::new("gh"), EventType::ResourceChanged)
            .with_provenance("platform", "github")
            .with_provenance("platform_event", "pull_request.merged")
            .with_payload("pr_number", 42)
            .with_payload("nested", json!({"a": {"b": "deep"}}))
    }

    #[test]
    fn event_type_wire_names() {
        assert_eq!(
            serde_json::to_string(&EventType::ResourceChanged).unwrap(),
            "\"resource.changed\""
        );
        assert_eq!(
            serde_json::to_string(&EventType::ActorStopped).unwrap(),
            "\"actor.stopped\""
        );
        assert_eq!(
            serde_json::to_string(&EventType::MessageReceived).unwrap(),
            "\"message.received\""
        );
    }

    #[test]
    fn wire_roundtrip_preserves_event() {
        let event = sample_event();
        let json = serde_json::to_string(&event).unwrap();
        let parsed: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn fingerprint_omitted_when_absent() {
        let event = sample_event();
        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains("fingerprint"));
    }

    #[test]
    fn missing_sections_default_to_empty() {
        let json = json!({
            "id": "e1",
            "source": "gh",
            "type": "resource.changed",
            "timestamp": "2026-07-01T12:00:00Z"
        });
        let event: Event = serde_json::from_value(json).unwrap();
        assert!(event.payload.is_empty());
        assert!(event.provenance.is_empty());
        assert!(event.fingerprint.is_none());
    }

    #[test]
    fn lookup_top_level_fields() {
        let event = sample_event();
        assert_eq!(
            event.lookup("source"),
            Some(Value::String("gh".to_string()))
        );
        assert_eq!(
            event.lookup("type"),
            Some(Value::String("resource.changed".to_string()))
        );
        assert_eq!(
            event.lookup("id"),
            Some(Value::String(event.id.as_str().to_string()))
        );
    }

    #[test]
    fn lookup_provenance_and_payload() {
        let event = sample_event();
        assert_eq!(
            event.lookup("provenance.platform_event"),
            Some(json!("pull_request.merged"))
        );
        assert_eq!(event.lookup("payload.pr_number"), Some(json!(42)));
        assert_eq!(event.lookup("payload.nested.a.b"), Some(json!("deep")));
    }

    #[test]
    fn lookup_missing_paths_return_none() {
        let event = sample_event();
        assert_eq!(event.lookup("payload.absent"), None);
        assert_eq!(event.lookup("payload.pr_number.too_deep"), None);
        assert_eq!(event.lookup("no_such_section"), None);
        // Scalars do not admit sub-paths.
        assert_eq!(event.lookup("source.sub"), None);
    }

    #[test]
    fn lookup_whole_sections() {
        let event = sample_event();
        let payload = event.lookup("payload").unwrap();
        assert_eq!(payload.get("pr_number"), Some(&json!(42)));
    }
}
