//! End-to-end demo: an order-fulfilment step graph plus a handler workflow,
//! both fired from the same inbound event.
//!
//! Run with `cargo run --example order_fulfilment`.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use weft::prelude::*;
use weft::{MemorySink, WorkflowContext};

struct DemoActions;

#[async_trait]
impl ActionHandle for DemoActions {
    async fn invoke(&self, action: &str, input: Value) -> Result<Value, EngineError> {
        tracing::info!(action, %input, "invoking action");
        if action == "billing.charge" && input["amount"] == 0 {
            return Err(EngineError::Action {
                action: action.to_string(),
                details: "cannot charge a zero amount".to_string(),
            });
        }
        Ok(json!({ "ok": action }))
    }
}

struct LargeOrdersOnly;

#[async_trait]
impl TriggerHandler for LargeOrdersOnly {
    async fn configure(&self, _actions: &dyn ActionHandle) -> Result<TriggerConfig, EngineError> {
        Ok(TriggerConfig::new().with_filter(|payload| payload["amount"].as_u64() >= Some(50)))
    }
}

struct NotifySales;

#[async_trait]
impl WorkflowHandler for NotifySales {
    async fn run(&self, ctx: &WorkflowContext) -> Result<(), EngineError> {
        ctx.actions()
            .invoke("sales.notify", json!({ "order": ctx.context().get("order_id") }))
            .await?;
        Ok(())
    }
}

const FULFILMENT: &str = r#"
$id: order-fulfilment
name: Order fulfilment
version: "1"
triggers:
  - on: order.created
steps:
  - id: charge
    action: billing.charge
    input: { amount: "{{trigger.amount}}" }
    onSuccess: ship
    onError: refund
    retry: { attempts: 2, backoff: exponential, delay: 200 }
  - id: ship
    action: logistics.ship
    input: { order: "{{trigger.order_id}}" }
  - id: refund
    action: billing.refund
    input: { reason: "{{charge.error}}" }
"#;

#[tokio::main]
async fn main() -> Result<(), EngineError> {
    tracing_subscriber::fmt::init();

    let history = Arc::new(MemorySink::new());
    let engine = Engine::builder()
        .actions(Arc::new(DemoActions))
        .history(history.clone())
        .build()?;

    engine
        .register_graph(GraphDefinition::from_yaml(FULFILMENT)?)
        .await?;
    engine
        .register(
            WorkflowDefinition::builder("notify-sales")
                .trigger(EventTrigger::new("order", "created", Arc::new(LargeOrdersOnly)))
                .execute(NotifySales)
                .build()?,
        )
        .await?;

    let event = Event::new("order", "created", json!({ "order_id": 42, "amount": 120 }));
    for run in engine.dispatch_event(&event).await {
        let workflow = run.workflow_id().to_string();
        let status = run.wait().await;
        println!("{workflow}: {status}");
    }

    for record in history.records() {
        println!(
            "history: {} {} {} ({}ms)",
            record.workflow_id,
            record.execution_id,
            record.status,
            (record.ended_at - record.started_at).num_milliseconds()
        );
    }
    Ok(())
}
