//! The predicate grammar shared by `when.filter` clauses and the filter
//! transform.
//!
//! A predicate is a tree. Leaves test one dot-path key against the full
//! event (`provenance.platform_event`, `payload.pr_number`, ...); combiners
//! aggregate children:
//!
//! ```json
//! { "op": "match", "all": [
//!     { "op": "equals", "key": "provenance.platform", "value": "github" },
//!     { "op": "exclude", "any": [
//!         { "op": "matches", "key": "provenance.author", "pattern": ".*\\[bot\\]$" }
//!     ]}
//! ]}
//! ```
//!
//! Regexes are compiled at deserialization time, so an invalid pattern is a
//! load-time configuration error, never a runtime one.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::Event;

/// A regex compiled at config-load time.
///
/// Wraps [`regex::Regex`] to give it the serde / `PartialEq` surface the
/// config model needs (equality compares source patterns).
#[derive(Debug, Clone)]
pub struct Pattern(Regex);

impl Pattern {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Pattern(Regex::new(pattern)?))
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.0.is_match(text)
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_str() == other.0.as_str()
    }
}

impl Serialize for Pattern {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.0.as_str())
    }
}

impl<'de> Deserialize<'de> for Pattern {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let pattern = String::deserialize(deserializer)?;
        Pattern::new(&pattern).map_err(serde::de::Error::custom)
    }
}

/// One node of a filter predicate tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Predicate {
    /// True when every child matches. An empty list is vacuously true.
    Match { all: Vec<Predicate> },

    /// True when no child matches.
    Exclude { any: Vec<Predicate> },

    /// The value at `key` equals `value` exactly.
    Equals { key: String, value: Value },

    /// The value at `key` is absent or differs from `value`.
    NotEquals { key: String, value: Value },

    /// The value at `key` is one of `values`.
    In { key: String, values: Vec<Value> },

    /// The value at `key`, rendered as text, matches `pattern`.
    /// Non-textual values (objects, arrays, null) never match.
    Matches { key: String, pattern: Pattern },

    /// A value exists at `key`.
    Exists { key: String },
}

impl Predicate {
    /// Evaluates this predicate against an event.
    pub fn evaluate(&self, event: &Event) -> bool {
        match self {
            Predicate::Match { all } => all.iter().all(|p| p.evaluate(event)),
            Predicate::Exclude { any } => !any.iter().any(|p| p.evaluate(event)),
            Predicate::Equals { key, value } => event.lookup(key).as_ref() == Some(value),
            Predicate::NotEquals { key, value } => event.lookup(key).as_ref() != Some(value),
            Predicate::In { key, values } => event
                .lookup(key)
                .is_some_and(|found| values.contains(&found)),
            Predicate::Matches { key, pattern } => event
                .lookup(key)
                .and_then(|found| value_as_text(&found))
                .is_some_and(|text| pattern.is_match(&text)),
            Predicate::Exists { key } => event.lookup(key).is_some(),
        }
    }
}

/// Renders scalars as matchable text; structured values yield `None`.
fn value_as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
