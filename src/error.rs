use crate::graph::StepId;
use thiserror::Error;

/// The type of workflow-level lifecycle hook that failed.
///
/// Used in [`EngineError::Hook`] to identify which hook caused the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookType {
    /// The `on_error` hook, called after a run fails.
    OnError,
    /// The `on_complete` hook, called after a run succeeds.
    OnComplete,
}

impl std::fmt::Display for HookType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HookType::OnError => write!(f, "on_error"),
            HookType::OnComplete => write!(f, "on_complete"),
        }
    }
}

/// Errors produced while loading definitions or executing runs.
///
/// Load-time variants ([`EngineError::Definition`], [`EngineError::Schedule`],
/// [`EngineError::StepNotFound`]) are fatal for the definition being loaded:
/// it is never registered, never partially active. Run-time variants are
/// resolved as locally as the retry/branch model allows; anything left over
/// becomes the run's single terminal failure.
///
/// # Non-Exhaustive
///
/// This enum is marked `#[non_exhaustive]` to allow adding new variants
/// in future versions without breaking downstream code. When matching
/// on this error, always include a wildcard pattern.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum EngineError {
    /// A trigger's handler, filter or transform failed while evaluating a
    /// candidate event.
    ///
    /// Isolated to that trigger: reported, never retried, and never aborts
    /// evaluation of other triggers for the same event.
    #[error("Trigger evaluation failed for workflow '{workflow}': {details}")]
    Trigger {
        /// The workflow whose trigger failed
        workflow: String,
        /// Details about the failure
        details: String,
    },

    /// An external action invocation failed.
    ///
    /// Recoverable through the owning step's retry policy; once retries are
    /// exhausted it is routed along the step's error edge, or promoted to a
    /// workflow-level failure when no edge is present.
    #[error("Action '{action}' failed: {details}")]
    Action {
        /// The name of the action that failed
        action: String,
        /// Details about the failure
        details: String,
    },

    /// A workflow handler failed.
    #[error("Workflow '{workflow}' failed: {details}")]
    Workflow {
        /// The workflow that failed
        workflow: String,
        /// Details about the failure
        details: String,
    },

    /// A step edge references a step id that does not exist in the graph.
    ///
    /// Detected at load time; a graph with a dangling reference is rejected
    /// before registration.
    #[error("Step not found: {0}")]
    StepNotFound(StepId),

    /// A definition failed validation at load time.
    #[error("Invalid definition: {0}")]
    Definition(String),

    /// A schedule trigger is malformed: unknown timezone, unparseable time,
    /// missing weekly day, or a raw expression with no evaluator.
    #[error("Invalid schedule: {0}")]
    Schedule(String),

    /// A workflow-level lifecycle hook failed.
    ///
    /// Reported alongside the run's original outcome; it never masks the
    /// original error and never flips a succeeded run back to failed.
    #[error("Hook '{hook}' failed for workflow '{workflow}': {details}")]
    Hook {
        /// The workflow whose hook failed
        workflow: String,
        /// Which hook failed
        hook: HookType,
        /// Details about the failure
        details: String,
    },

    /// The run was abandoned at a suspension point after cancellation.
    #[error("Run cancelled")]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = EngineError::Action {
            action: "send_email".to_string(),
            details: "connection refused".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Action 'send_email' failed: connection refused"
        );

        let error = EngineError::StepNotFound(StepId::new("missing"));
        assert_eq!(error.to_string(), "Step not found: missing");
    }

    #[test]
    fn test_hook_error_display() {
        let error = EngineError::Hook {
            workflow: "billing".to_string(),
            hook: HookType::OnComplete,
            details: "notify failed".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Hook 'on_complete' failed for workflow 'billing': notify failed"
        );
    }

    #[test]
    fn test_hook_type_display() {
        assert_eq!(HookType::OnError.to_string(), "on_error");
        assert_eq!(HookType::OnComplete.to_string(), "on_complete");
    }
}
