//! # Weft
//!
//! A trigger-resolution and execution engine for declarative workflows.
//!
//! A workflow binds one or more triggers to workflow logic. Triggers come
//! in two shapes: event triggers, which fire when a matching domain event
//! arrives, and schedule triggers, which fire on a calendar cadence.
//! Workflow logic comes in two shapes as well: a handler written in Rust,
//! or a declarative step graph with retry, backoff and error branching.
//!
//! ## Features
//!
//! - **Calendar-aligned schedules**: hourly through yearly cadences with
//!   weekday, wall-clock time and IANA timezone qualifiers, resolved
//!   through DST transitions
//! - **Event matching**: identity check first, then a handler-supplied
//!   filter and payload transform decide whether and with what context a
//!   run starts
//! - **Step graphs**: YAML-defined steps with `onSuccess`/`onError` edges,
//!   per-step retry policies (linear or exponential backoff), and input
//!   templates over prior step outputs — validated fully at load time
//! - **Lifecycle management**: every run moves `Pending → Running` to a
//!   terminal `Succeeded` or `Failed`, with optional hooks and a pluggable
//!   history sink
//! - **Async first**: runs are independent tokio tasks; retry waits are
//!   timers, not blocked threads
//!
//! ## Quick Start
//!
//! ```rust
//! use weft::prelude::*;
//! use async_trait::async_trait;
//! use serde_json::{json, Value};
//! use std::sync::Arc;
//!
//! struct Actions;
//!
//! #[async_trait]
//! impl ActionHandle for Actions {
//!     async fn invoke(&self, action: &str, _input: Value) -> Result<Value, EngineError> {
//!         Ok(json!({ "invoked": action }))
//!     }
//! }
//!
//! struct ProPlanOnly;
//!
//! #[async_trait]
//! impl TriggerHandler for ProPlanOnly {
//!     async fn configure(
//!         &self,
//!         _actions: &dyn ActionHandle,
//!     ) -> Result<TriggerConfig, EngineError> {
//!         Ok(TriggerConfig::new().with_filter(|payload| payload["plan"] == "pro"))
//!     }
//! }
//!
//! struct SendWelcome;
//!
//! #[async_trait]
//! impl WorkflowHandler for SendWelcome {
//!     async fn run(&self, ctx: &WorkflowContext) -> Result<(), EngineError> {
//!         ctx.actions()
//!             .invoke("mail.send", json!({ "template": "welcome" }))
//!             .await?;
//!         Ok(())
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), EngineError> {
//! let engine = Engine::builder().actions(Arc::new(Actions)).build()?;
//!
//! let workflow = WorkflowDefinition::builder("welcome")
//!     .trigger(EventTrigger::new("user", "signed_up", Arc::new(ProPlanOnly)))
//!     .execute(SendWelcome)
//!     .build()?;
//! engine.register(workflow).await?;
//!
//! let runs = engine
//!     .dispatch_event(&Event::new("user", "signed_up", json!({ "plan": "pro" })))
//!     .await;
//! for run in runs {
//!     assert_eq!(run.wait().await, RunStatus::Succeeded);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Schedules
//!
//! ```rust
//! use weft::{Interval, ScheduleTrigger};
//! use chrono::Weekday;
//!
//! // Every Monday at 09:00 New York time, across DST transitions.
//! let trigger = ScheduleTrigger::interval(Interval::Weekly)
//!     .on(Weekday::Mon)
//!     .at("09:00")?
//!     .in_zone("America/New_York")?;
//! trigger.validate()?;
//! # Ok::<(), weft::EngineError>(())
//! ```
//!
//! ## Step Graphs
//!
//! ```rust
//! use weft::GraphDefinition;
//!
//! let yaml = r#"
//! $id: order-fulfilment
//! name: Order fulfilment
//! version: "1"
//! triggers:
//!   - on: order.created
//! steps:
//!   - id: charge
//!     action: billing.charge
//!     onSuccess: ship
//!     onError: refund
//!     retry: { attempts: 3, backoff: exponential, delay: 500 }
//!   - id: ship
//!     action: logistics.ship
//!     input: { order: "{{trigger.order_id}}", receipt: "{{charge.receipt}}" }
//!   - id: refund
//!     action: billing.refund
//! "#;
//!
//! let graph = GraphDefinition::from_yaml(yaml)?.compile()?;
//! assert_eq!(graph.id(), "order-fulfilment");
//! # Ok::<(), weft::EngineError>(())
//! ```

mod action;
mod clock;
mod context;
mod engine;
mod error;
mod event;
mod executor;
mod graph;
mod schedule;
mod trigger;
mod workflow;

pub mod prelude;

pub use action::{ActionHandle, ScopedActions};
pub use clock::{Clock, SystemClock};
pub use context::{ContextMap, ExecutionMetadata, FiredTrigger, WorkflowContext};
pub use engine::{
    Engine, EngineBuilder, ExecutionRecord, HistorySink, MemorySink, NullSink, RunHandle,
};
pub use error::{EngineError, HookType};
pub use event::Event;
pub use executor::{GraphExecutor, GraphOutcome, RunStatus};
pub use graph::{
    Backoff, CompiledGraph, GraphDefinition, RetrySpec, StepId, StepSpec, TriggerSpec,
};
pub use schedule::{ScheduleExpr, ScheduleResolver};
pub use trigger::{
    EventTrigger, FilterFn, Interval, Schedule, ScheduleTrigger, TransformFn, Trigger,
    TriggerConfig, TriggerHandler,
};
pub use workflow::{
    CompleteHook, ErrorHook, WorkflowBuilder, WorkflowDefinition, WorkflowHandler,
};
