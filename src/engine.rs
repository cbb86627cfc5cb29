//! The execution lifecycle manager: registry, dispatch, scheduling.

use crate::action::ActionHandle;
use crate::clock::{Clock, SystemClock};
use crate::context::{ContextMap, FiredTrigger, WorkflowContext};
use crate::error::{EngineError, HookType};
use crate::event::{into_map, Event};
use crate::executor::{GraphExecutor, RunStatus};
use crate::graph::{CompiledGraph, GraphDefinition};
use crate::schedule::{ScheduleExpr, ScheduleResolver};
use crate::trigger::{ScheduleTrigger, Trigger};
use crate::workflow::WorkflowDefinition;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// Terminal record of one run, published to the history sink.
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    /// Unique id of the run.
    pub execution_id: Uuid,
    /// The workflow the run belongs to.
    pub workflow_id: String,
    /// Terminal status, `Succeeded` or `Failed`.
    pub status: RunStatus,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run reached its terminal state.
    pub ended_at: DateTime<Utc>,
    /// The terminal error, when the run failed.
    pub error: Option<String>,
}

/// Receives one [`ExecutionRecord`] per run at completion.
///
/// The engine never reads this sink back during execution.
#[async_trait]
pub trait HistorySink: Send + Sync {
    /// Persists a terminal record.
    async fn record(&self, record: ExecutionRecord);
}

/// Discards all records. The default sink.
#[derive(Debug, Default)]
pub struct NullSink;

#[async_trait]
impl HistorySink for NullSink {
    async fn record(&self, _record: ExecutionRecord) {}
}

/// Keeps records in memory, for inspection in tests and demos.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: std::sync::Mutex<Vec<ExecutionRecord>>,
}

impl MemorySink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all records received so far.
    pub fn records(&self) -> Vec<ExecutionRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl HistorySink for MemorySink {
    async fn record(&self, record: ExecutionRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.push(record);
        }
    }
}

/// A registered workflow: a handler definition or a compiled step graph.
#[derive(Clone)]
enum Registered {
    Handler(Arc<WorkflowDefinition>),
    Graph(Arc<CompiledGraph>),
}

impl Registered {
    fn identity(&self) -> (&str, &str) {
        match self {
            Registered::Handler(def) => (def.name(), def.version()),
            Registered::Graph(graph) => (graph.id(), graph.version()),
        }
    }
}

/// Handle to one spawned run.
///
/// Dropping the handle detaches the run; awaiting it returns the run's
/// terminal status.
#[derive(Debug)]
pub struct RunHandle {
    execution_id: Uuid,
    workflow_id: String,
    task: JoinHandle<RunStatus>,
}

impl RunHandle {
    /// The run's unique id.
    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    /// The workflow the run belongs to.
    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    /// Waits for the run to reach its terminal state.
    pub async fn wait(self) -> RunStatus {
        self.task.await.unwrap_or(RunStatus::Failed)
    }

    /// Lets the run proceed in the background.
    pub fn detach(self) {}
}

struct Inner {
    registry: RwLock<HashMap<String, Registered>>,
    actions: Arc<dyn ActionHandle>,
    clock: Arc<dyn Clock>,
    resolver: ScheduleResolver,
    history: Arc<dyn HistorySink>,
    cancel: CancellationToken,
    // Woken on every registry change so the scheduler re-plans its sleep.
    wake: Notify,
}

/// The workflow engine.
///
/// Owns the registry of definitions, evaluates triggers against inbound
/// events, produces schedule fires, and drives each run through
/// `Pending → Running → {Succeeded | Failed}`. Each run is an independent
/// tokio task; the only shared state is the read-mostly registry.
///
/// Cloning is cheap and clones share the same engine.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    /// Creates an engine builder.
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Registers a handler-form workflow.
    ///
    /// Fails if a workflow with the same name is already registered.
    /// Registration is serialized against trigger evaluation, so a trigger
    /// never fires against a partially registered definition.
    pub async fn register(&self, workflow: WorkflowDefinition) -> Result<(), EngineError> {
        self.insert(workflow.name().to_string(), Registered::Handler(Arc::new(workflow)))
            .await
    }

    /// Validates, compiles and registers a graph-form workflow.
    pub async fn register_graph(&self, definition: GraphDefinition) -> Result<(), EngineError> {
        let graph = definition.compile()?;
        self.insert(graph.id().to_string(), Registered::Graph(Arc::new(graph)))
            .await
    }

    async fn insert(&self, name: String, registered: Registered) -> Result<(), EngineError> {
        let mut registry = self.inner.registry.write().await;
        if registry.contains_key(&name) {
            return Err(EngineError::Definition(format!(
                "workflow '{name}' is already registered"
            )));
        }
        info!(workflow = %name, "workflow registered");
        registry.insert(name, registered);
        self.inner.wake.notify_one();
        Ok(())
    }

    /// Removes a workflow from the registry.
    ///
    /// Returns true if it was present. Runs already dispatched keep their
    /// own `Arc` to the definition and finish normally.
    pub async fn unregister(&self, name: &str) -> bool {
        let removed = self.inner.registry.write().await.remove(name).is_some();
        if removed {
            info!(workflow = %name, "workflow unregistered");
            self.inner.wake.notify_one();
        }
        removed
    }

    /// Names of all registered workflows.
    pub async fn workflow_names(&self) -> Vec<String> {
        self.inner.registry.read().await.keys().cloned().collect()
    }

    /// Evaluates an inbound event against every registered trigger and
    /// starts one run per match.
    ///
    /// A failing trigger handler is reported and skipped; it never prevents
    /// evaluation of other triggers for the same event.
    pub async fn dispatch_event(&self, event: &Event) -> Vec<RunHandle> {
        let registry = self.inner.registry.read().await;
        let mut handles = Vec::new();

        for registered in registry.values() {
            match registered {
                Registered::Handler(def) => {
                    for trigger in def.triggers() {
                        let Trigger::Event(event_trigger) = trigger else {
                            continue;
                        };
                        match event_trigger
                            .evaluate(event, self.inner.actions.as_ref())
                            .await
                        {
                            Ok(Some(context)) => {
                                let fired = FiredTrigger::Event {
                                    object: event_trigger.object.clone(),
                                    action: event_trigger.action.clone(),
                                };
                                handles.push(self.spawn_run(registered.clone(), fired, context));
                            }
                            Ok(None) => {}
                            Err(error) => {
                                let error = EngineError::Trigger {
                                    workflow: def.name().to_string(),
                                    details: error.to_string(),
                                };
                                warn!(%error, "trigger evaluation failed");
                            }
                        }
                    }
                }
                Registered::Graph(graph) => {
                    for spec in graph.triggers() {
                        if spec.matches_event(event) {
                            let fired = FiredTrigger::Event {
                                object: event.object.clone(),
                                action: event.action.clone(),
                            };
                            let context = into_map(event.payload.clone());
                            handles.push(self.spawn_run(registered.clone(), fired, context));
                        }
                    }
                }
            }
        }

        handles
    }

    /// Produces schedule fires until the engine is shut down.
    ///
    /// Computes the earliest next fire instant across all registered
    /// schedule triggers, sleeps until it, and starts the matching runs.
    /// Registering or unregistering a workflow wakes the loop so a newly
    /// added trigger never waits behind a longer sleep already in progress.
    /// Stops producing fires immediately on shutdown; runs already
    /// dispatched are not forcibly killed mid-step.
    pub async fn run_scheduler(&self) {
        let inner = &self.inner;
        // Last fire instant per (workflow, trigger index), so a slow clock
        // read cannot re-fire the same instant.
        let mut last_fired: HashMap<(String, usize), DateTime<Utc>> = HashMap::new();
        info!("scheduler started");

        while !inner.cancel.is_cancelled() {
            let now = inner.clock.now();
            let due = self.next_due(now, &mut last_fired).await;

            let Some((fire_at, fires)) = due else {
                // Nothing scheduled yet; wait for a registry change.
                tokio::select! {
                    _ = inner.cancel.cancelled() => break,
                    _ = inner.wake.notified() => {}
                }
                continue;
            };

            let wait = (fire_at - now).to_std().unwrap_or(std::time::Duration::ZERO);
            tokio::select! {
                _ = inner.cancel.cancelled() => break,
                _ = inner.wake.notified() => continue,
                _ = tokio::time::sleep(wait) => {}
            }

            for (name, registered, index, trigger) in fires {
                last_fired.insert((name, index), fire_at);
                let handle = self.spawn_run(
                    registered,
                    FiredTrigger::Schedule(trigger),
                    ContextMap::new(),
                );
                info!(
                    workflow = %handle.workflow_id(),
                    execution_id = %handle.execution_id(),
                    fire_at = %fire_at,
                    "schedule fired"
                );
                handle.detach();
            }
        }
        info!("scheduler stopped");
    }

    /// Finds the earliest upcoming fire instant and every trigger due at it.
    ///
    /// Also drops fire bookkeeping for workflows no longer registered.
    async fn next_due(
        &self,
        now: DateTime<Utc>,
        last_fired: &mut HashMap<(String, usize), DateTime<Utc>>,
    ) -> Option<(DateTime<Utc>, Vec<(String, Registered, usize, ScheduleTrigger)>)> {
        let inner = &self.inner;
        let registry = inner.registry.read().await;
        last_fired.retain(|(name, _), _| registry.contains_key(name));
        let mut due: Option<(DateTime<Utc>, Vec<_>)> = None;

        for (name, registered) in registry.iter() {
            for (index, trigger) in schedule_triggers(registered) {
                let reference = last_fired
                    .get(&(name.clone(), index))
                    .map_or(now, |last| (*last).max(now));
                let fire_at = match inner.resolver.next_fire(&trigger, reference) {
                    Ok(fire_at) => fire_at,
                    Err(error) => {
                        warn!(workflow = %name, %error, "schedule resolution failed");
                        continue;
                    }
                };
                let entry = (name.clone(), registered.clone(), index, trigger);
                match &mut due {
                    Some((earliest, fires)) => {
                        if fire_at < *earliest {
                            *earliest = fire_at;
                            fires.clear();
                            fires.push(entry);
                        } else if fire_at == *earliest {
                            fires.push(entry);
                        }
                    }
                    None => due = Some((fire_at, vec![entry])),
                }
            }
        }
        due
    }

    /// Starts one run as an independent task.
    fn spawn_run(
        &self,
        registered: Registered,
        fired: FiredTrigger,
        context: ContextMap,
    ) -> RunHandle {
        let (workflow_id, version) = {
            let (id, version) = registered.identity();
            (id.to_string(), version.to_string())
        };
        let ctx = WorkflowContext::build(
            workflow_id.clone(),
            version,
            fired,
            context,
            self.inner.actions.clone(),
            self.inner.clock.as_ref(),
        );
        let execution_id = ctx.metadata().execution_id;
        let inner = self.inner.clone();
        let task = tokio::spawn(run_to_completion(inner, registered, ctx));
        RunHandle {
            execution_id,
            workflow_id,
            task,
        }
    }

    /// Cancels the scheduler and asks in-flight runs to stop at their next
    /// suspension point.
    pub fn shutdown(&self) {
        info!("engine shutdown requested");
        self.inner.cancel.cancel();
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").finish()
    }
}

fn schedule_triggers(registered: &Registered) -> Vec<(usize, ScheduleTrigger)> {
    match registered {
        Registered::Handler(def) => def
            .triggers()
            .iter()
            .enumerate()
            .filter_map(|(i, trigger)| match trigger {
                Trigger::Schedule(st) => Some((i, st.clone())),
                Trigger::Event(_) => None,
            })
            .collect(),
        Registered::Graph(graph) => graph
            .triggers()
            .iter()
            .enumerate()
            // Compiled graphs validated their trigger specs at load time.
            .filter_map(|(i, spec)| spec.schedule_trigger().ok().flatten().map(|st| (i, st)))
            .collect(),
    }
}

/// Drives one run to its terminal state and publishes the record.
async fn run_to_completion(
    inner: Arc<Inner>,
    registered: Registered,
    ctx: WorkflowContext,
) -> RunStatus {
    let meta = ctx.metadata().clone();
    info!(
        workflow = %meta.workflow_id,
        execution_id = %meta.execution_id,
        status = %RunStatus::Running,
        "run started"
    );

    let result: Result<(), EngineError> = match &registered {
        Registered::Handler(def) => {
            tokio::select! {
                _ = inner.cancel.cancelled() => Err(EngineError::Cancelled),
                result = def.handler().run(&ctx) => result,
            }
        }
        Registered::Graph(graph) => {
            let executor =
                GraphExecutor::new(graph, ctx.actions().as_ref(), inner.cancel.child_token());
            let outcome = executor.run(ctx.context()).await;
            match outcome.status {
                RunStatus::Succeeded => Ok(()),
                _ => Err(outcome.error.unwrap_or(EngineError::Workflow {
                    workflow: meta.workflow_id.clone(),
                    details: "step graph failed".to_string(),
                })),
            }
        }
    };

    let status = match &result {
        Ok(()) => {
            info!(
                workflow = %meta.workflow_id,
                execution_id = %meta.execution_id,
                status = %RunStatus::Succeeded,
                "run succeeded"
            );
            if let Registered::Handler(def) = &registered {
                if let Some(hook) = def.on_complete() {
                    if let Err(error) = hook.on_complete(&ctx).await {
                        let error = EngineError::Hook {
                            workflow: meta.workflow_id.clone(),
                            hook: HookType::OnComplete,
                            details: error.to_string(),
                        };
                        // Reported only; the run stays succeeded.
                        warn!(%error, "lifecycle hook failed");
                    }
                }
            }
            RunStatus::Succeeded
        }
        Err(error) => {
            warn!(
                workflow = %meta.workflow_id,
                execution_id = %meta.execution_id,
                status = %RunStatus::Failed,
                %error,
                "run failed"
            );
            if let Registered::Handler(def) = &registered {
                if let Some(hook) = def.on_error() {
                    if let Err(hook_error) = hook.on_error(&ctx, error).await {
                        let hook_error = EngineError::Hook {
                            workflow: meta.workflow_id.clone(),
                            hook: HookType::OnError,
                            details: hook_error.to_string(),
                        };
                        // The secondary error never masks the original.
                        warn!(original = %error, %hook_error, "lifecycle hook failed");
                    }
                }
            }
            RunStatus::Failed
        }
    };

    inner
        .history
        .record(ExecutionRecord {
            execution_id: meta.execution_id,
            workflow_id: meta.workflow_id,
            status,
            started_at: meta.started_at,
            ended_at: inner.clock.now(),
            error: result.err().map(|e| e.to_string()),
        })
        .await;
    status
}

/// Builder for [`Engine`] instances.
pub struct EngineBuilder {
    actions: Option<Arc<dyn ActionHandle>>,
    clock: Arc<dyn Clock>,
    history: Arc<dyn HistorySink>,
    expr: Option<Arc<dyn ScheduleExpr>>,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineBuilder {
    /// Creates a builder with a system clock and a null history sink.
    pub fn new() -> Self {
        Self {
            actions: None,
            clock: Arc::new(SystemClock),
            history: Arc::new(NullSink),
            expr: None,
        }
    }

    /// Sets the action-invocation handle. Required.
    pub fn actions(mut self, actions: Arc<dyn ActionHandle>) -> Self {
        self.actions = Some(actions);
        self
    }

    /// Substitutes the clock source.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Sets the history sink.
    pub fn history(mut self, history: Arc<dyn HistorySink>) -> Self {
        self.history = history;
        self
    }

    /// Attaches an evaluator for raw schedule expressions.
    pub fn schedule_expr(mut self, expr: Arc<dyn ScheduleExpr>) -> Self {
        self.expr = Some(expr);
        self
    }

    /// Builds the engine.
    pub fn build(self) -> Result<Engine, EngineError> {
        let actions = self.actions.ok_or_else(|| {
            EngineError::Definition("engine requires an action handle".to_string())
        })?;
        let mut resolver = ScheduleResolver::new();
        if let Some(expr) = self.expr {
            resolver = resolver.with_expr(expr);
        }
        Ok(Engine {
            inner: Arc::new(Inner {
                registry: RwLock::new(HashMap::new()),
                actions,
                clock: self.clock,
                resolver,
                history: self.history,
                cancel: CancellationToken::new(),
                wake: Notify::new(),
            }),
        })
    }
}
