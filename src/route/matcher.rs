//! Route matching: which routes does an event fan out to.
//!
//! Routes are indexed by `when.source` so matching an event is a map lookup
//! plus per-route checks, not a scan of the whole route table. Multiple
//! matching routes produce independent delivery attempts, one per route.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::RouteSpec;
use crate::types::{Event, SourceId};

/// Immutable route index, built once at engine start.
pub struct RouteMatcher {
    by_source: HashMap<SourceId, Vec<Arc<RouteSpec>>>,
    route_count: usize,
}

impl RouteMatcher {
    /// Builds the index. Specs are assumed validated.
    pub fn new(routes: impl IntoIterator<Item = RouteSpec>) -> Self {
        let mut by_source: HashMap<SourceId, Vec<Arc<RouteSpec>>> = HashMap::new();
        let mut route_count = 0;
        for route in routes {
            route_count += 1;
            by_source
                .entry(route.when.source.clone())
                .or_default()
                .push(Arc::new(route));
        }
        RouteMatcher {
            by_source,
            route_count,
        }
    }

    /// Returns every route the event matches, in declaration order.
    ///
    /// 1. Routes indexed under `event.source`.
    /// 2. `when.event_types` contains the event's type.
    /// 3. The `when.filter` predicate, if present, accepts the event.
    pub fn matches(&self, event: &Event) -> Vec<Arc<RouteSpec>> {
        let Some(candidates) = self.by_source.get(&event.source) else {
            return Vec::new();
        };

        candidates
            .iter()
            .filter(|route| route.when.event_types.contains(&event.kind))
            .filter(|route| {
                route
                    .when
                    .filter
                    .as_ref()
                    .is_none_or(|predicate| predicate.evaluate(event))
            })
            .cloned()
            .collect()
    }

    pub fn route_count(&self) -> usize {
        self.route_count
    }
}
