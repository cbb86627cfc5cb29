//! Per-run execution context handed to workflow code.

use crate::action::{ActionHandle, ScopedActions};
use crate::clock::Clock;
use crate::trigger::ScheduleTrigger;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Free-form trigger and step payloads, as a structured key-value map.
pub type ContextMap = serde_json::Map<String, serde_json::Value>;

/// The trigger instance that fired a run.
///
/// Event triggers are captured by their identity pair; schedule triggers
/// carry their full cadence declaration.
#[derive(Debug, Clone)]
pub enum FiredTrigger {
    /// An event trigger fired, identified by its object/action pair.
    Event {
        /// The event's subject type.
        object: String,
        /// The event's verb.
        action: String,
    },
    /// A schedule trigger fired.
    Schedule(ScheduleTrigger),
}

/// Identity and timing of a single run.
///
/// `execution_id` is unique per run and assigned at run start;
/// `started_at` is immutable once assigned.
#[derive(Debug, Clone)]
pub struct ExecutionMetadata {
    /// The workflow this run belongs to.
    pub workflow_id: String,
    /// Globally unique id for this run.
    pub execution_id: Uuid,
    /// The instant the run started.
    pub started_at: DateTime<Utc>,
    /// The workflow definition's version.
    pub version: String,
}

/// The per-run bundle handed to workflow code.
///
/// Created fresh per run and owned exclusively by it; discarded after
/// completion except for the metadata, which the history sink persists.
pub struct WorkflowContext {
    trigger: FiredTrigger,
    context: ContextMap,
    actions: Arc<dyn ActionHandle>,
    metadata: ExecutionMetadata,
}

impl WorkflowContext {
    /// Builds a context for a new run.
    ///
    /// Pure construction, no I/O: generates a fresh execution id, stamps
    /// `started_at` from the clock, and scopes the action handle so that
    /// invocations made through it are attributable to this run.
    pub fn build(
        workflow_id: impl Into<String>,
        version: impl Into<String>,
        trigger: FiredTrigger,
        context: ContextMap,
        actions: Arc<dyn ActionHandle>,
        clock: &dyn Clock,
    ) -> Self {
        let execution_id = Uuid::new_v4();
        let actions: Arc<dyn ActionHandle> = Arc::new(ScopedActions::new(actions, execution_id));
        Self {
            trigger,
            context,
            actions,
            metadata: ExecutionMetadata {
                workflow_id: workflow_id.into(),
                execution_id,
                started_at: clock.now(),
                version: version.into(),
            },
        }
    }

    /// The trigger instance that fired this run.
    pub fn trigger(&self) -> &FiredTrigger {
        &self.trigger
    }

    /// Trigger-produced context for this run.
    pub fn context(&self) -> &ContextMap {
        &self.context
    }

    /// The action-invocation handle, scoped to this run.
    pub fn actions(&self) -> &Arc<dyn ActionHandle> {
        &self.actions
    }

    /// Identity and timing of this run.
    pub fn metadata(&self) -> &ExecutionMetadata {
        &self.metadata
    }
}

impl fmt::Debug for WorkflowContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowContext")
            .field("trigger", &self.trigger)
            .field("context", &self.context)
            .field("metadata", &self.metadata)
            .finish()
    }
}
