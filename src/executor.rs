//! Step graph execution: retry, backoff and branching.

use crate::action::ActionHandle;
use crate::context::ContextMap;
use crate::error::EngineError;
use crate::graph::{Backoff, CompiledGraph, RetrySpec, StepSpec};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// The state of a single run.
///
/// Top-level runs move `Pending → Running → {Succeeded | Failed}`;
/// `Retrying` appears only inside the step graph executor while a step
/// waits out its backoff delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Fire signal received, run not yet started.
    Pending,
    /// Workflow code is executing.
    Running,
    /// A step failed and is waiting out its backoff delay.
    Retrying,
    /// Terminal: the run completed successfully.
    Succeeded,
    /// Terminal: the run failed.
    Failed,
}

impl RunStatus {
    /// Returns true for `Succeeded` and `Failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Succeeded | RunStatus::Failed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Retrying => "retrying",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
        };
        write!(f, "{name}")
    }
}

/// Terminal result of a graph traversal: status plus the accumulated
/// per-step outputs.
#[derive(Debug)]
pub struct GraphOutcome {
    /// Terminal status, `Succeeded` or `Failed`.
    pub status: RunStatus,
    /// Step outputs keyed by step id (plus `trigger` for the firing context).
    pub outputs: ContextMap,
    /// The failure that ended the run, when `status` is `Failed`.
    pub error: Option<EngineError>,
}

enum StepVerdict {
    Output(Value),
    Failed(EngineError),
    Cancelled,
}

/// Runs one compiled graph to a terminal state.
///
/// Steps execute strictly in graph order, never concurrently with each
/// other; retry waits are non-blocking tokio timers, so a retrying run
/// yields the scheduling resource rather than holding a thread.
pub struct GraphExecutor<'a> {
    graph: &'a CompiledGraph,
    actions: &'a dyn ActionHandle,
    cancel: CancellationToken,
}

impl<'a> GraphExecutor<'a> {
    /// Creates an executor for one run of `graph`.
    pub fn new(
        graph: &'a CompiledGraph,
        actions: &'a dyn ActionHandle,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            graph,
            actions,
            cancel,
        }
    }

    /// Traverses the graph from its entry step.
    ///
    /// The trigger-produced context is exposed to input templates under the
    /// `trigger` key. When a step fails over along its error edge, the error
    /// value becomes the next step's implicit input unless that step declares
    /// its own template. Cancellation is observed at every suspension point
    /// and turns the run into a `Failed` outcome with a cancellation reason.
    pub async fn run(&self, trigger_context: &ContextMap) -> GraphOutcome {
        let mut outputs = ContextMap::new();
        if !trigger_context.is_empty() {
            outputs.insert(
                "trigger".to_string(),
                Value::Object(trigger_context.clone()),
            );
        }

        let steps = self.graph.steps();
        let mut index = 0usize;
        let mut failover_input: Option<Value> = None;
        loop {
            let step = &steps[index];
            let input = match (step.input.as_ref(), failover_input.take()) {
                (Some(template), _) => render_value(template, &outputs),
                (None, Some(error_value)) => error_value,
                (None, None) => Value::Null,
            };

            match self.run_step(step, input).await {
                StepVerdict::Output(value) => {
                    outputs.insert(step.id.to_string(), value);
                    match self.graph.edges(index).on_success {
                        Some(next) => index = next,
                        None => {
                            return GraphOutcome {
                                status: RunStatus::Succeeded,
                                outputs,
                                error: None,
                            }
                        }
                    }
                }
                StepVerdict::Failed(error) => {
                    // The error value is recorded under the failed step's id
                    // and handed to the failover step as its implicit input.
                    let error_value = json!({ "error": error.to_string() });
                    outputs.insert(step.id.to_string(), error_value.clone());
                    match self.graph.edges(index).on_error {
                        Some(next) => {
                            failover_input = Some(error_value);
                            index = next;
                        }
                        None => {
                            return GraphOutcome {
                                status: RunStatus::Failed,
                                outputs,
                                error: Some(error),
                            }
                        }
                    }
                }
                StepVerdict::Cancelled => {
                    return GraphOutcome {
                        status: RunStatus::Failed,
                        outputs,
                        error: Some(EngineError::Cancelled),
                    }
                }
            }
        }
    }

    /// Runs one step through its retry policy.
    ///
    /// Retries always precede the error edge: a step is retried in place
    /// until its attempts are exhausted, and only then does the caller
    /// consider failing over. `attempts = 0` fails over on the first error
    /// with no wait.
    async fn run_step(&self, step: &StepSpec, input: Value) -> StepVerdict {
        let no_retry = RetrySpec::new(0, Backoff::Linear, 0);
        let retry = step.retry.as_ref().unwrap_or(&no_retry);
        let mut attempt: u32 = 0;

        loop {
            let result = tokio::select! {
                _ = self.cancel.cancelled() => return StepVerdict::Cancelled,
                result = self.actions.invoke(&step.action, input.clone()) => result,
            };

            match result {
                Ok(output) => {
                    info!(step = %step.id, action = %step.action, "step completed");
                    return StepVerdict::Output(output);
                }
                Err(error) => {
                    if attempt < retry.attempts {
                        attempt += 1;
                        let delay = retry.delay_for(attempt);
                        info!(
                            step = %step.id,
                            attempt,
                            max_attempts = retry.attempts,
                            delay_ms = delay.as_millis() as u64,
                            status = %RunStatus::Retrying,
                            "step failed, retrying"
                        );
                        tokio::select! {
                            _ = self.cancel.cancelled() => return StepVerdict::Cancelled,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    } else {
                        warn!(step = %step.id, %error, "step failed, retries exhausted");
                        return StepVerdict::Failed(error);
                    }
                }
            }
        }
    }
}

/// Resolves an input template against the run's accumulated variables.
///
/// String values of the form `{{step_id}}` or `{{step_id.path.to.field}}`
/// are replaced by the referenced prior output; everything else passes
/// through unchanged. An unresolvable placeholder is left as-is.
fn render_value(template: &Value, vars: &ContextMap) -> Value {
    match template {
        Value::String(s) => resolve_placeholder(s, vars).unwrap_or_else(|| template.clone()),
        Value::Array(items) => Value::Array(items.iter().map(|v| render_value(v, vars)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_value(v, vars)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn resolve_placeholder(s: &str, vars: &ContextMap) -> Option<Value> {
    let inner = s.strip_prefix("{{")?.strip_suffix("}}")?.trim();
    let mut parts = inner.split('.');
    let mut current = vars.get(parts.next()?)?;
    for part in parts {
        current = current.get(part)?;
    }
    Some(current.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{GraphDefinition, StepSpec};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Fails each action a scripted number of times, then succeeds,
    /// recording every invocation.
    struct ScriptedActions {
        failures: Mutex<HashMap<String, u32>>,
        log: Mutex<Vec<(String, Value)>>,
    }

    impl ScriptedActions {
        fn new(failures: &[(&str, u32)]) -> Self {
            Self {
                failures: Mutex::new(
                    failures
                        .iter()
                        .map(|(k, v)| (k.to_string(), *v))
                        .collect(),
                ),
                log: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<(String, Value)> {
            self.log.lock().unwrap().clone()
        }

        fn call_count(&self, action: &str) -> usize {
            self.calls().iter().filter(|(a, _)| a == action).count()
        }
    }

    #[async_trait]
    impl ActionHandle for ScriptedActions {
        async fn invoke(&self, action: &str, input: Value) -> Result<Value, EngineError> {
            self.log.lock().unwrap().push((action.to_string(), input));
            let mut failures = self.failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(action) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(EngineError::Action {
                        action: action.to_string(),
                        details: "scripted failure".to_string(),
                    });
                }
            }
            Ok(json!({ "ok": action }))
        }
    }

    fn compile(steps: Vec<StepSpec>) -> CompiledGraph {
        GraphDefinition {
            id: "test".to_string(),
            name: "test".to_string(),
            version: "1".to_string(),
            triggers: vec![],
            steps,
        }
        .compile()
        .unwrap()
    }

    fn branching_graph(retry: Option<RetrySpec>) -> CompiledGraph {
        let mut a = StepSpec::new("a", "act.a").on_success("b").on_error("c");
        a.retry = retry;
        compile(vec![a, StepSpec::new("b", "act.b"), StepSpec::new("c", "act.c")])
    }

    #[tokio::test]
    async fn test_success_path() {
        let graph = branching_graph(None);
        let actions = ScriptedActions::new(&[]);
        let executor = GraphExecutor::new(&graph, &actions, CancellationToken::new());

        let outcome = executor.run(&ContextMap::new()).await;
        assert_eq!(outcome.status, RunStatus::Succeeded);
        assert_eq!(outcome.outputs.get("a"), Some(&json!({ "ok": "act.a" })));
        assert_eq!(outcome.outputs.get("b"), Some(&json!({ "ok": "act.b" })));
        assert_eq!(actions.call_count("act.c"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_then_error_branch() {
        // A exhausts 2 retries (linear, 100ms), waits 100ms then 200ms,
        // fails over to C, and the run succeeds.
        let graph = branching_graph(Some(RetrySpec::new(2, Backoff::Linear, 100)));
        let actions = ScriptedActions::new(&[("act.a", 10)]);
        let executor = GraphExecutor::new(&graph, &actions, CancellationToken::new());

        let started = tokio::time::Instant::now();
        let outcome = executor.run(&ContextMap::new()).await;

        assert_eq!(outcome.status, RunStatus::Succeeded);
        assert_eq!(started.elapsed(), Duration::from_millis(300));
        assert_eq!(actions.call_count("act.a"), 3);
        assert_eq!(actions.call_count("act.b"), 0);
        assert_eq!(actions.call_count("act.c"), 1);
        assert!(outcome.outputs.get("a").unwrap().get("error").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_attempts_fails_over_without_wait() {
        let graph = branching_graph(Some(RetrySpec::new(0, Backoff::Linear, 5000)));
        let actions = ScriptedActions::new(&[("act.a", 10)]);
        let executor = GraphExecutor::new(&graph, &actions, CancellationToken::new());

        let started = tokio::time::Instant::now();
        let outcome = executor.run(&ContextMap::new()).await;

        assert_eq!(outcome.status, RunStatus::Succeeded);
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(actions.call_count("act.a"), 1);
        assert_eq!(actions.call_count("act.c"), 1);
    }

    #[tokio::test]
    async fn test_error_edge_step_receives_error_as_implicit_input() {
        let graph = branching_graph(None);
        let actions = ScriptedActions::new(&[("act.a", 10)]);
        let executor = GraphExecutor::new(&graph, &actions, CancellationToken::new());

        let outcome = executor.run(&ContextMap::new()).await;
        assert_eq!(outcome.status, RunStatus::Succeeded);

        // c declares no input template, so it gets a's error value.
        let (action, input) = actions.calls().last().unwrap().clone();
        assert_eq!(action, "act.c");
        assert!(input["error"].as_str().unwrap().contains("act.a"));
    }

    #[tokio::test]
    async fn test_explicit_template_wins_over_implicit_input() {
        let graph = compile(vec![
            StepSpec::new("a", "act.a").on_error("c"),
            StepSpec::new("c", "act.c").with_input(json!({ "cause": "{{a.error}}" })),
        ]);
        let actions = ScriptedActions::new(&[("act.a", 10)]);
        let executor = GraphExecutor::new(&graph, &actions, CancellationToken::new());

        let outcome = executor.run(&ContextMap::new()).await;
        assert_eq!(outcome.status, RunStatus::Succeeded);

        let (_, input) = actions.calls().last().unwrap().clone();
        assert!(input["cause"].as_str().unwrap().contains("act.a"));
        assert!(input.get("error").is_none());
    }

    #[tokio::test]
    async fn test_exhausted_without_error_edge_fails() {
        let graph = compile(vec![StepSpec::new("only", "act.only")
            .with_retry(RetrySpec::new(1, Backoff::Linear, 0))]);
        let actions = ScriptedActions::new(&[("act.only", 10)]);
        let executor = GraphExecutor::new(&graph, &actions, CancellationToken::new());

        let outcome = executor.run(&ContextMap::new()).await;
        assert_eq!(outcome.status, RunStatus::Failed);
        assert!(matches!(outcome.error, Some(EngineError::Action { .. })));
        assert_eq!(actions.call_count("act.only"), 2);
    }

    #[tokio::test]
    async fn test_transition_bound() {
        // Invocations never exceed steps × (attempts + 1).
        let graph = compile(vec![
            StepSpec::new("a", "act.a")
                .on_error("b")
                .with_retry(RetrySpec::new(2, Backoff::Linear, 0)),
            StepSpec::new("b", "act.b")
                .with_retry(RetrySpec::new(2, Backoff::Linear, 0)),
        ]);
        let actions = ScriptedActions::new(&[("act.a", 100), ("act.b", 100)]);
        let executor = GraphExecutor::new(&graph, &actions, CancellationToken::new());

        let outcome = executor.run(&ContextMap::new()).await;
        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(actions.calls().len(), 2 * 3);
    }

    #[tokio::test]
    async fn test_input_templates_see_prior_outputs() {
        let graph = compile(vec![
            StepSpec::new("fetch", "data.fetch").on_success("send"),
            StepSpec::new("send", "mail.send")
                .with_input(json!({ "body": "{{fetch.ok}}", "static": 7 })),
        ]);
        let actions = ScriptedActions::new(&[]);
        let executor = GraphExecutor::new(&graph, &actions, CancellationToken::new());

        let outcome = executor.run(&ContextMap::new()).await;
        assert_eq!(outcome.status, RunStatus::Succeeded);

        let send_input = &actions.calls()[1].1;
        assert_eq!(send_input, &json!({ "body": "data.fetch", "static": 7 }));
    }

    #[tokio::test]
    async fn test_trigger_context_available_to_templates() {
        let graph = compile(vec![StepSpec::new("notify", "mail.send")
            .with_input(json!({ "to": "{{trigger.email}}" }))]);
        let actions = ScriptedActions::new(&[]);
        let executor = GraphExecutor::new(&graph, &actions, CancellationToken::new());

        let mut context = ContextMap::new();
        context.insert("email".to_string(), json!("a@example.com"));
        let outcome = executor.run(&context).await;

        assert_eq!(outcome.status, RunStatus::Succeeded);
        assert_eq!(actions.calls()[0].1, json!({ "to": "a@example.com" }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_during_retry_wait() {
        let graph = compile(vec![StepSpec::new("a", "act.a")
            .with_retry(RetrySpec::new(5, Backoff::Exponential, 60_000))]);
        let actions = ScriptedActions::new(&[("act.a", 10)]);
        let cancel = CancellationToken::new();
        let executor = GraphExecutor::new(&graph, &actions, cancel.clone());

        let context = ContextMap::new();
        let run = executor.run(&context);
        tokio::pin!(run);

        // Let the first attempt fail and enter the retry wait, then cancel.
        tokio::select! {
            _ = &mut run => panic!("run should still be retrying"),
            _ = tokio::time::sleep(Duration::from_millis(10)) => {}
        }
        cancel.cancel();

        let outcome = run.await;
        assert_eq!(outcome.status, RunStatus::Failed);
        assert!(matches!(outcome.error, Some(EngineError::Cancelled)));
        assert_eq!(actions.call_count("act.a"), 1);
    }

    #[test]
    fn test_backoff_exactness() {
        let linear = RetrySpec::new(4, Backoff::Linear, 1000);
        let exponential = RetrySpec::new(4, Backoff::Exponential, 1000);
        for (attempt, linear_ms, exp_ms) in
            [(1, 1000, 1000), (2, 2000, 2000), (3, 3000, 4000), (4, 4000, 8000)]
        {
            assert_eq!(linear.delay_for(attempt), Duration::from_millis(linear_ms));
            assert_eq!(
                exponential.delay_for(attempt),
                Duration::from_millis(exp_ms)
            );
        }
    }
}
