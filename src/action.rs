//! The action-invocation capability handed to workflow code.

use crate::error::EngineError;
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::Instrument;
use uuid::Uuid;

/// Opaque capability for performing external side effects.
///
/// Workflow code calls named actions through this handle; the engine only
/// forwards it and never inspects or retries its internal failures beyond
/// what the step retry model specifies.
///
/// # Examples
///
/// ```
/// use weft::{ActionHandle, EngineError};
/// use async_trait::async_trait;
/// use serde_json::{json, Value};
///
/// struct EchoActions;
///
/// #[async_trait]
/// impl ActionHandle for EchoActions {
///     async fn invoke(&self, action: &str, input: Value) -> Result<Value, EngineError> {
///         Ok(json!({ "action": action, "input": input }))
///     }
/// }
/// ```
#[async_trait]
pub trait ActionHandle: Send + Sync {
    /// Invokes the named external action with the given input.
    async fn invoke(&self, action: &str, input: Value) -> Result<Value, EngineError>;
}

/// An [`ActionHandle`] scoped to a single run.
///
/// Every invocation is made inside a tracing span carrying the owning
/// `execution_id`, so external collaborators can attribute calls per run.
pub struct ScopedActions {
    inner: Arc<dyn ActionHandle>,
    execution_id: Uuid,
}

impl ScopedActions {
    /// Wraps a handle so its invocations are attributable to `execution_id`.
    pub fn new(inner: Arc<dyn ActionHandle>, execution_id: Uuid) -> Self {
        Self {
            inner,
            execution_id,
        }
    }

    /// Returns the execution id this handle is scoped to.
    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }
}

impl fmt::Debug for ScopedActions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedActions")
            .field("execution_id", &self.execution_id)
            .finish()
    }
}

#[async_trait]
impl ActionHandle for ScopedActions {
    async fn invoke(&self, action: &str, input: Value) -> Result<Value, EngineError> {
        let span = tracing::info_span!(
            "action",
            action = %action,
            execution_id = %self.execution_id,
        );
        self.inner.invoke(action, input).instrument(span).await
    }
}
