//! The filter transform: the route matcher's predicate grammar, applied
//! mid-pipeline to the already-matched event.

use async_trait::async_trait;
use serde_json::Value;

use crate::connector::ConfigMap;
use crate::route::Predicate;
use crate::types::Event;

use super::{Transform, TransformContext, TransformError};

/// Passes events matching the predicate; drops the rest.
pub struct FilterTransform {
    predicate: Predicate,
}

impl FilterTransform {
    pub fn new(predicate: Predicate) -> Self {
        FilterTransform { predicate }
    }
}

#[async_trait]
impl Transform for FilterTransform {
    async fn execute(
        &self,
        event: Event,
        _ctx: &TransformContext,
    ) -> Result<Option<Event>, TransformError> {
        Ok(self.predicate.evaluate(&event).then_some(event))
    }
}

/// Builds a filter transform; the config map is the predicate itself.
pub fn filter_from_config(config: &ConfigMap) -> Result<Box<dyn Transform>, String> {
    let predicate: Predicate = serde_json::from_value(Value::Object(config.clone()))
        .map_err(|e| format!("invalid filter predicate: {e}"))?;
    Ok(Box::new(FilterTransform::new(predicate)))
}
