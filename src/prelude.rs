//! Commonly used types and traits

pub use crate::action::ActionHandle;
pub use crate::context::WorkflowContext;
pub use crate::engine::Engine;
pub use crate::error::EngineError;
pub use crate::event::Event;
pub use crate::executor::RunStatus;
pub use crate::graph::GraphDefinition;
pub use crate::trigger::{
    EventTrigger, Interval, ScheduleTrigger, TriggerConfig, TriggerHandler,
};
pub use crate::workflow::{WorkflowDefinition, WorkflowHandler};
