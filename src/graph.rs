//! YAML-style step-graph workflow definitions.
//!
//! A graph definition is an ordered list of steps connected by success and
//! error edges. All structural validation happens at load time: dangling
//! edge references, duplicate ids and cycles are rejected before the
//! definition can be registered, so traversal never has to handle them.

use crate::error::EngineError;
use crate::event::Event;
use crate::trigger::{Interval, ScheduleTrigger};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Type-safe step id wrapper, unique within one graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(String);

impl StepId {
    /// Creates a new StepId.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StepId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for StepId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for StepId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::borrow::Borrow<str> for StepId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Backoff function mapping retry attempt number to wait duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    /// `delay × n` for attempt n.
    #[default]
    Linear,
    /// `delay × 2^(n-1)` for attempt n.
    Exponential,
}

/// Per-step retry policy.
///
/// `attempts = 0` means no retry: the step fails over on its first error.
///
/// # Examples
///
/// ```
/// use weft::{Backoff, RetrySpec};
/// use std::time::Duration;
///
/// let retry = RetrySpec::new(4, Backoff::Exponential, 1000);
/// assert_eq!(retry.delay_for(1), Duration::from_millis(1000));
/// assert_eq!(retry.delay_for(4), Duration::from_millis(8000));
///
/// let retry = RetrySpec::new(4, Backoff::Linear, 1000);
/// assert_eq!(retry.delay_for(4), Duration::from_millis(4000));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySpec {
    /// Maximum number of retry attempts after the initial one.
    pub attempts: u32,
    /// Backoff strategy.
    #[serde(default)]
    pub backoff: Backoff,
    /// Base delay in milliseconds.
    #[serde(rename = "delay", default)]
    pub delay_ms: u64,
}

impl RetrySpec {
    /// Creates a retry policy.
    pub fn new(attempts: u32, backoff: Backoff, delay_ms: u64) -> Self {
        Self {
            attempts,
            backoff,
            delay_ms,
        }
    }

    /// The wait before retry attempt `n` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let millis = match self.backoff {
            Backoff::Linear => self.delay_ms.saturating_mul(u64::from(attempt)),
            Backoff::Exponential => self
                .delay_ms
                .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1))),
        };
        Duration::from_millis(millis)
    }
}

/// A single step in a graph workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    /// Unique id within the graph.
    pub id: StepId,
    /// Name of the external action this step invokes.
    pub action: String,
    /// Optional parameter template, resolved against prior step outputs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<serde_json::Value>,
    /// Step to run next on success; absent means end of graph.
    #[serde(default, rename = "onSuccess", skip_serializing_if = "Option::is_none")]
    pub on_success: Option<StepId>,
    /// Step to fail over to once retries are exhausted.
    #[serde(default, rename = "onError", skip_serializing_if = "Option::is_none")]
    pub on_error: Option<StepId>,
    /// Retry policy applied before the error edge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetrySpec>,
}

impl StepSpec {
    /// Creates a step invoking `action`.
    pub fn new(id: impl Into<StepId>, action: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            action: action.into(),
            input: None,
            on_success: None,
            on_error: None,
            retry: None,
        }
    }

    /// Sets the input template.
    pub fn with_input(mut self, input: serde_json::Value) -> Self {
        self.input = Some(input);
        self
    }

    /// Sets the success edge.
    pub fn on_success(mut self, next: impl Into<StepId>) -> Self {
        self.on_success = Some(next.into());
        self
    }

    /// Sets the error edge.
    pub fn on_error(mut self, next: impl Into<StepId>) -> Self {
        self.on_error = Some(next.into());
        self
    }

    /// Sets the retry policy.
    pub fn with_retry(mut self, retry: RetrySpec) -> Self {
        self.retry = Some(retry);
        self
    }
}

/// Lightweight trigger descriptor carried by a graph definition.
///
/// `on` declares an event trigger as an `object.action` pair; `every`
/// declares a schedule trigger as an interval name or raw expression.
/// Exactly one of the two must be present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggerSpec {
    /// Event identity, `object.action`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on: Option<String>,
    /// Interval name (`daily`, `weekly`, ...) or raw schedule expression.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub every: Option<String>,
    /// Weekday qualifier for weekly cadence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day: Option<String>,
    /// Wall-clock fire time, `HH:MM`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    /// IANA timezone name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

impl TriggerSpec {
    /// Declares an event trigger from an `object.action` pair.
    pub fn on(identity: impl Into<String>) -> Self {
        Self {
            on: Some(identity.into()),
            ..Self::default()
        }
    }

    /// Declares a schedule trigger from an interval name or raw expression.
    pub fn every(cadence: impl Into<String>) -> Self {
        Self {
            every: Some(cadence.into()),
            ..Self::default()
        }
    }

    /// Returns true if this descriptor matches the event's identity.
    pub fn matches_event(&self, event: &Event) -> bool {
        match &self.on {
            Some(identity) => match identity.split_once('.') {
                Some((object, action)) => event.object == object && event.action == action,
                None => false,
            },
            None => false,
        }
    }

    /// Builds the schedule trigger declared by `every`, if any.
    ///
    /// An `every` value naming a known interval becomes a semantic cadence;
    /// anything else is treated as a raw schedule expression.
    pub fn schedule_trigger(&self) -> Result<Option<ScheduleTrigger>, EngineError> {
        let Some(every) = &self.every else {
            return Ok(None);
        };
        let mut trigger = match every.parse::<Interval>() {
            Ok(interval) => ScheduleTrigger::interval(interval),
            Err(_) => ScheduleTrigger::expression(every.clone()),
        };
        if let Some(day) = &self.day {
            let day = day
                .parse()
                .map_err(|_| EngineError::Schedule(format!("unknown weekday '{day}'")))?;
            trigger = trigger.on(day);
        }
        if let Some(time) = &self.time {
            trigger = trigger.at(time)?;
        }
        if let Some(zone) = &self.timezone {
            trigger = trigger.in_zone(zone)?;
        }
        trigger.validate()?;
        Ok(Some(trigger))
    }

    fn validate(&self) -> Result<(), EngineError> {
        match (&self.on, &self.every) {
            (Some(_), Some(_)) => Err(EngineError::Definition(
                "trigger declares both 'on' and 'every'".to_string(),
            )),
            (None, None) => Err(EngineError::Definition(
                "trigger declares neither 'on' nor 'every'".to_string(),
            )),
            (Some(identity), None) if !identity.contains('.') => Err(EngineError::Definition(
                format!("event trigger '{identity}' is not an object.action pair"),
            )),
            _ => {
                self.schedule_trigger()?;
                Ok(())
            }
        }
    }
}

/// A declarative graph workflow, as authored.
///
/// # Examples
///
/// ```
/// use weft::GraphDefinition;
///
/// let yaml = r#"
/// $id: order-fulfilment
/// name: Order fulfilment
/// version: "1"
/// triggers:
///   - on: order.created
/// steps:
///   - id: charge
///     action: billing.charge
///     onSuccess: ship
///     onError: refund
///     retry: { attempts: 2, backoff: exponential, delay: 500 }
///   - id: ship
///     action: logistics.ship
///   - id: refund
///     action: billing.refund
/// "#;
///
/// let graph = GraphDefinition::from_yaml(yaml)?.compile()?;
/// assert_eq!(graph.id(), "order-fulfilment");
/// assert_eq!(graph.steps().len(), 3);
/// # Ok::<(), weft::EngineError>(())
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphDefinition {
    /// Definition identity.
    #[serde(rename = "$id")]
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Definition version.
    pub version: String,
    /// Trigger descriptors.
    #[serde(default)]
    pub triggers: Vec<TriggerSpec>,
    /// Ordered steps; the first is the entry step.
    pub steps: Vec<StepSpec>,
}

impl GraphDefinition {
    /// Parses a definition from YAML source.
    pub fn from_yaml(source: &str) -> Result<Self, EngineError> {
        serde_yaml::from_str(source).map_err(|e| EngineError::Definition(e.to_string()))
    }

    /// Validates the definition and resolves its edges.
    pub fn compile(self) -> Result<CompiledGraph, EngineError> {
        CompiledGraph::new(self)
    }
}

/// A validated graph: arena of steps plus edges resolved to indices.
///
/// Construction rejects empty graphs, duplicate step ids, dangling
/// `onSuccess`/`onError` references, malformed triggers, and any directed
/// cycle — including cycles reachable only through error edges, which would
/// otherwise let a run loop forever.
#[derive(Debug, Clone)]
pub struct CompiledGraph {
    definition: GraphDefinition,
    edges: Vec<StepEdges>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct StepEdges {
    pub(crate) on_success: Option<usize>,
    pub(crate) on_error: Option<usize>,
}

impl CompiledGraph {
    fn new(definition: GraphDefinition) -> Result<Self, EngineError> {
        if definition.steps.is_empty() {
            return Err(EngineError::Definition(format!(
                "graph '{}' has no steps",
                definition.id
            )));
        }

        let mut index: HashMap<&str, usize> = HashMap::new();
        for (i, step) in definition.steps.iter().enumerate() {
            if index.insert(step.id.as_str(), i).is_some() {
                return Err(EngineError::Definition(format!(
                    "duplicate step id '{}'",
                    step.id
                )));
            }
        }

        let mut edges = Vec::with_capacity(definition.steps.len());
        for step in &definition.steps {
            let resolve = |target: &Option<StepId>| -> Result<Option<usize>, EngineError> {
                match target {
                    Some(id) => index
                        .get(id.as_str())
                        .copied()
                        .map(Some)
                        .ok_or_else(|| EngineError::StepNotFound(id.clone())),
                    None => Ok(None),
                }
            };
            edges.push(StepEdges {
                on_success: resolve(&step.on_success)?,
                on_error: resolve(&step.on_error)?,
            });
        }

        for trigger in &definition.triggers {
            trigger.validate()?;
        }

        let graph = Self { definition, edges };
        graph.reject_cycles()?;
        Ok(graph)
    }

    /// Rejects any directed cycle over the combined success/error edges.
    fn reject_cycles(&self) -> Result<(), EngineError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            White,
            Grey,
            Black,
        }

        let n = self.edges.len();
        let mut marks = vec![Mark::White; n];

        for root in 0..n {
            if marks[root] != Mark::White {
                continue;
            }
            // Iterative DFS; a grey node reached again closes a cycle.
            let mut stack = vec![(root, 0usize)];
            marks[root] = Mark::Grey;
            while let Some(&(node, edge)) = stack.last() {
                if edge >= 2 {
                    marks[node] = Mark::Black;
                    stack.pop();
                    continue;
                }
                if let Some(frame) = stack.last_mut() {
                    frame.1 += 1;
                }
                let next = if edge == 0 {
                    self.edges[node].on_success
                } else {
                    self.edges[node].on_error
                };
                if let Some(target) = next {
                    match marks[target] {
                        Mark::Grey => {
                            return Err(EngineError::Definition(format!(
                                "graph '{}' contains a cycle through step '{}'",
                                self.definition.id, self.definition.steps[target].id
                            )));
                        }
                        Mark::White => {
                            marks[target] = Mark::Grey;
                            stack.push((target, 0));
                        }
                        Mark::Black => {}
                    }
                }
            }
        }
        Ok(())
    }

    /// Definition identity.
    pub fn id(&self) -> &str {
        &self.definition.id
    }

    /// Human-readable name.
    pub fn name(&self) -> &str {
        &self.definition.name
    }

    /// Definition version.
    pub fn version(&self) -> &str {
        &self.definition.version
    }

    /// Trigger descriptors.
    pub fn triggers(&self) -> &[TriggerSpec] {
        &self.definition.triggers
    }

    /// The step arena, in declaration order.
    pub fn steps(&self) -> &[StepSpec] {
        &self.definition.steps
    }

    pub(crate) fn edges(&self, index: usize) -> StepEdges {
        self.edges[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_step_graph() -> GraphDefinition {
        GraphDefinition {
            id: "g".to_string(),
            name: "g".to_string(),
            version: "1".to_string(),
            triggers: vec![],
            steps: vec![
                StepSpec::new("a", "act.a").on_success("b").on_error("c"),
                StepSpec::new("b", "act.b"),
                StepSpec::new("c", "act.c"),
            ],
        }
    }

    #[test]
    fn test_compile_resolves_edges() {
        let graph = three_step_graph().compile().unwrap();
        assert_eq!(graph.edges(0).on_success, Some(1));
        assert_eq!(graph.edges(0).on_error, Some(2));
        assert_eq!(graph.edges(1).on_success, None);
    }

    #[test]
    fn test_dangling_reference_rejected() {
        let mut def = three_step_graph();
        def.steps[1].on_success = Some(StepId::new("ghost"));
        let result = def.compile();
        assert!(
            matches!(result, Err(EngineError::StepNotFound(id)) if id.as_str() == "ghost")
        );
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let mut def = three_step_graph();
        def.steps[2].id = StepId::new("a");
        assert!(matches!(def.compile(), Err(EngineError::Definition(_))));
    }

    #[test]
    fn test_empty_graph_rejected() {
        let def = GraphDefinition {
            id: "g".to_string(),
            name: "g".to_string(),
            version: "1".to_string(),
            triggers: vec![],
            steps: vec![],
        };
        assert!(matches!(def.compile(), Err(EngineError::Definition(_))));
    }

    #[test]
    fn test_success_cycle_rejected() {
        let mut def = three_step_graph();
        def.steps[1].on_success = Some(StepId::new("a"));
        assert!(matches!(def.compile(), Err(EngineError::Definition(_))));
    }

    #[test]
    fn test_error_cycle_rejected() {
        // A cycle reachable only through error edges still never terminates.
        let mut def = three_step_graph();
        def.steps[2].on_error = Some(StepId::new("a"));
        assert!(matches!(def.compile(), Err(EngineError::Definition(_))));
    }

    #[test]
    fn test_diamond_is_not_a_cycle() {
        let def = GraphDefinition {
            id: "g".to_string(),
            name: "g".to_string(),
            version: "1".to_string(),
            triggers: vec![],
            steps: vec![
                StepSpec::new("a", "act.a").on_success("b").on_error("c"),
                StepSpec::new("b", "act.b").on_success("d"),
                StepSpec::new("c", "act.c").on_success("d"),
                StepSpec::new("d", "act.d"),
            ],
        };
        assert!(def.compile().is_ok());
    }

    #[test]
    fn test_trigger_spec_validation() {
        let mut def = three_step_graph();
        def.triggers = vec![TriggerSpec::default()];
        assert!(matches!(def.compile(), Err(EngineError::Definition(_))));

        let mut def = three_step_graph();
        def.triggers = vec![TriggerSpec::on("order")];
        assert!(matches!(def.compile(), Err(EngineError::Definition(_))));

        let mut def = three_step_graph();
        def.triggers = vec![TriggerSpec::on("order.created")];
        assert!(def.compile().is_ok());
    }

    #[test]
    fn test_trigger_spec_schedule_resolution() {
        let mut spec = TriggerSpec::every("weekly");
        spec.day = Some("mon".to_string());
        spec.time = Some("09:00".to_string());
        spec.timezone = Some("Europe/London".to_string());
        let trigger = spec.schedule_trigger().unwrap().unwrap();
        assert_eq!(trigger.day(), Some(chrono::Weekday::Mon));

        // Unknown interval names fall through to raw expressions.
        let spec = TriggerSpec::every("*/5 * * * *");
        let trigger = spec.schedule_trigger().unwrap().unwrap();
        assert!(matches!(
            trigger.schedule(),
            crate::trigger::Schedule::Expression(_)
        ));
    }

    #[test]
    fn test_yaml_round_trip() {
        let yaml = r#"
$id: notify
name: Notify
version: "2"
triggers:
  - every: daily
    time: "07:30"
steps:
  - id: gather
    action: report.gather
    onSuccess: send
  - id: send
    action: mail.send
    input:
      to: "ops@example.com"
      body: "{{gather.summary}}"
    retry: { attempts: 3, delay: 1000 }
"#;
        let graph = GraphDefinition::from_yaml(yaml).unwrap().compile().unwrap();
        assert_eq!(graph.version(), "2");
        let retry = graph.steps()[1].retry.as_ref().unwrap();
        assert_eq!(retry.attempts, 3);
        assert_eq!(retry.backoff, Backoff::Linear);
    }
}
