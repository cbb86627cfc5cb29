//! Workflow definitions: triggers bound to an execute function.

use crate::context::WorkflowContext;
use crate::error::EngineError;
use crate::trigger::Trigger;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// The execute function of a workflow.
#[async_trait]
pub trait WorkflowHandler: Send + Sync {
    /// Runs the workflow's logic for one fire.
    async fn run(&self, ctx: &WorkflowContext) -> Result<(), EngineError>;
}

/// Optional hook invoked after a run fails.
///
/// Receives the triggering error and the run's context. A failure of the
/// hook itself is reported alongside the original error, never in place
/// of it.
#[async_trait]
pub trait ErrorHook: Send + Sync {
    /// Called once with the run's terminal error.
    async fn on_error(
        &self,
        ctx: &WorkflowContext,
        error: &EngineError,
    ) -> Result<(), EngineError>;
}

/// Optional hook invoked after a run succeeds.
///
/// A failure of the hook is reported, not retried, and does not flip the
/// run back to failed.
#[async_trait]
pub trait CompleteHook: Send + Sync {
    /// Called once after the run reaches `Succeeded`.
    async fn on_complete(&self, ctx: &WorkflowContext) -> Result<(), EngineError>;
}

/// A declarative workflow: triggers bound to an execute function.
///
/// Immutable once registered; the engine only reads it. Built through
/// [`WorkflowBuilder`], which validates the definition at load time.
///
/// # Examples
///
/// ```
/// use weft::{EngineError, Interval, ScheduleTrigger, WorkflowContext,
///            WorkflowDefinition, WorkflowHandler};
/// use async_trait::async_trait;
///
/// struct NightlyReport;
///
/// #[async_trait]
/// impl WorkflowHandler for NightlyReport {
///     async fn run(&self, ctx: &WorkflowContext) -> Result<(), EngineError> {
///         ctx.actions().invoke("report.generate", serde_json::json!({})).await?;
///         Ok(())
///     }
/// }
///
/// let workflow = WorkflowDefinition::builder("nightly-report")
///     .description("Generates the nightly report")
///     .trigger(ScheduleTrigger::interval(Interval::Daily).at("02:00")?)
///     .execute(NightlyReport)
///     .build()?;
/// assert_eq!(workflow.name(), "nightly-report");
/// # Ok::<(), weft::EngineError>(())
/// ```
pub struct WorkflowDefinition {
    name: String,
    description: Option<String>,
    version: String,
    triggers: Vec<Trigger>,
    execute: Arc<dyn WorkflowHandler>,
    on_error: Option<Arc<dyn ErrorHook>>,
    on_complete: Option<Arc<dyn CompleteHook>>,
}

impl WorkflowDefinition {
    /// Creates a builder for a workflow named `name`.
    pub fn builder(name: impl Into<String>) -> WorkflowBuilder {
        WorkflowBuilder::new(name)
    }

    /// Workflow identity.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Optional human-readable description.
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Definition version.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// The triggers that can fire this workflow, in declaration order.
    pub fn triggers(&self) -> &[Trigger] {
        &self.triggers
    }

    /// The execute function.
    pub fn handler(&self) -> &Arc<dyn WorkflowHandler> {
        &self.execute
    }

    /// The `on_error` hook, if any.
    pub fn on_error(&self) -> Option<&Arc<dyn ErrorHook>> {
        self.on_error.as_ref()
    }

    /// The `on_complete` hook, if any.
    pub fn on_complete(&self) -> Option<&Arc<dyn CompleteHook>> {
        self.on_complete.as_ref()
    }
}

impl fmt::Debug for WorkflowDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowDefinition")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("triggers", &self.triggers)
            .field("on_error", &self.on_error.is_some())
            .field("on_complete", &self.on_complete.is_some())
            .finish()
    }
}

/// Builder for [`WorkflowDefinition`] instances.
pub struct WorkflowBuilder {
    name: String,
    description: Option<String>,
    version: String,
    triggers: Vec<Trigger>,
    execute: Option<Arc<dyn WorkflowHandler>>,
    on_error: Option<Arc<dyn ErrorHook>>,
    on_complete: Option<Arc<dyn CompleteHook>>,
}

impl WorkflowBuilder {
    /// Creates a builder for a workflow named `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            version: "1".to_string(),
            triggers: Vec::new(),
            execute: None,
            on_error: None,
            on_complete: None,
        }
    }

    /// Sets the description.
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Sets the definition version (default `"1"`).
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Adds a trigger.
    pub fn trigger(mut self, trigger: impl Into<Trigger>) -> Self {
        self.triggers.push(trigger.into());
        self
    }

    /// Sets the execute function.
    pub fn execute<H: WorkflowHandler + 'static>(mut self, handler: H) -> Self {
        self.execute = Some(Arc::new(handler));
        self
    }

    /// Sets the `on_error` hook.
    pub fn on_error<H: ErrorHook + 'static>(mut self, hook: H) -> Self {
        self.on_error = Some(Arc::new(hook));
        self
    }

    /// Sets the `on_complete` hook.
    pub fn on_complete<H: CompleteHook + 'static>(mut self, hook: H) -> Self {
        self.on_complete = Some(Arc::new(hook));
        self
    }

    /// Validates and builds the definition.
    ///
    /// Requires a non-empty trigger set and an execute function; every
    /// trigger must pass its own load-time validation.
    pub fn build(self) -> Result<WorkflowDefinition, EngineError> {
        if self.name.is_empty() {
            return Err(EngineError::Definition(
                "workflow name must not be empty".to_string(),
            ));
        }
        if self.triggers.is_empty() {
            return Err(EngineError::Definition(format!(
                "workflow '{}' declares no triggers",
                self.name
            )));
        }
        for trigger in &self.triggers {
            trigger.validate()?;
        }
        let execute = self.execute.ok_or_else(|| {
            EngineError::Definition(format!(
                "workflow '{}' has no execute function",
                self.name
            ))
        })?;

        Ok(WorkflowDefinition {
            name: self.name,
            description: self.description,
            version: self.version,
            triggers: self.triggers,
            execute,
            on_error: self.on_error,
            on_complete: self.on_complete,
        })
    }
}
