//! Domain events and trigger matching.

use crate::action::ActionHandle;
use crate::context::ContextMap;
use crate::error::EngineError;
use crate::trigger::EventTrigger;
use serde_json::Value;

/// An inbound domain event: subject type, verb, and payload.
#[derive(Debug, Clone)]
pub struct Event {
    /// The event's subject type.
    pub object: String,
    /// The event's verb.
    pub action: String,
    /// Free-form event payload.
    pub payload: Value,
}

impl Event {
    /// Creates an event.
    pub fn new(object: impl Into<String>, action: impl Into<String>, payload: Value) -> Self {
        Self {
            object: object.into(),
            action: action.into(),
            payload,
        }
    }
}

impl EventTrigger {
    /// Evaluates this trigger against an event.
    ///
    /// The identity check runs first; on mismatch the handler is never
    /// invoked. On identity match the handler produces a
    /// [`TriggerConfig`](crate::TriggerConfig); a present `filter` returning
    /// false means no fire. The returned context is the transformed payload
    /// (or the raw payload when no transform is set), merged with the
    /// config's explicit `context` — explicit entries win on key collision.
    ///
    /// Returns `Ok(None)` when the trigger does not fire, `Ok(Some(context))`
    /// when it does.
    pub async fn evaluate(
        &self,
        event: &Event,
        actions: &dyn ActionHandle,
    ) -> Result<Option<ContextMap>, EngineError> {
        if self.object != event.object || self.action != event.action {
            return Ok(None);
        }

        let config = self.handler.configure(actions).await?;

        if let Some(filter) = &config.filter {
            if !filter(&event.payload) {
                return Ok(None);
            }
        }

        let base = match &config.transform {
            Some(transform) => transform(&event.payload),
            None => event.payload.clone(),
        };
        let mut context = into_map(base);
        if let Some(explicit) = config.context {
            for (key, value) in explicit {
                context.insert(key, value);
            }
        }

        Ok(Some(context))
    }
}

/// Lifts a non-object value into a map under the `"value"` key so the run
/// context is always a structured map.
pub(crate) fn into_map(value: Value) -> ContextMap {
    match value {
        Value::Object(map) => map,
        other => {
            let mut map = ContextMap::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}
