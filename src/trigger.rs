//! Trigger declarations: when a workflow runs.

use crate::action::ActionHandle;
use crate::context::ContextMap;
use crate::error::EngineError;
use async_trait::async_trait;
use chrono::{NaiveTime, Weekday};
use chrono_tz::Tz;
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Predicate over an event payload; a falsy result means the trigger
/// does not fire.
pub type FilterFn = dyn Fn(&Value) -> bool + Send + Sync;

/// Maps an event payload to the value placed into the run's context.
pub type TransformFn = dyn Fn(&Value) -> Value + Send + Sync;

/// Per-event configuration produced by an [`EventTrigger`]'s handler.
///
/// All three parts are optional. When both `transform` output and explicit
/// `context` are present they are merged, with the explicit `context`
/// winning on key collision.
#[derive(Default, Clone)]
pub struct TriggerConfig {
    /// Optional predicate deciding whether the trigger fires for this event.
    pub filter: Option<Arc<FilterFn>>,
    /// Explicit context entries, merged over the transformed payload.
    pub context: Option<ContextMap>,
    /// Optional payload transform applied before context construction.
    pub transform: Option<Arc<TransformFn>>,
}

impl TriggerConfig {
    /// Creates an empty config: always fires, raw payload becomes context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the filter predicate.
    pub fn with_filter(mut self, filter: impl Fn(&Value) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// Sets explicit context entries.
    pub fn with_context(mut self, context: ContextMap) -> Self {
        self.context = Some(context);
        self
    }

    /// Sets the payload transform.
    pub fn with_transform(
        mut self,
        transform: impl Fn(&Value) -> Value + Send + Sync + 'static,
    ) -> Self {
        self.transform = Some(Arc::new(transform));
        self
    }
}

impl fmt::Debug for TriggerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TriggerConfig")
            .field("filter", &self.filter.is_some())
            .field("context", &self.context)
            .field("transform", &self.transform.is_some())
            .finish()
    }
}

/// Decides applicability and computes per-event context for an
/// [`EventTrigger`].
///
/// Called once per candidate event, after the identity check has already
/// passed. Must be side-effect-free with respect to scheduling; side
/// effects belong in the workflow's execute handler.
#[async_trait]
pub trait TriggerHandler: Send + Sync {
    /// Produces the trigger configuration for a candidate event.
    async fn configure(&self, actions: &dyn ActionHandle) -> Result<TriggerConfig, EngineError>;
}

/// A trigger that fires when a matching domain event arrives.
#[derive(Clone)]
pub struct EventTrigger {
    /// The event's subject type this trigger listens for.
    pub object: String,
    /// The event's verb this trigger listens for.
    pub action: String,
    /// Handler producing the per-event [`TriggerConfig`].
    pub handler: Arc<dyn TriggerHandler>,
}

impl EventTrigger {
    /// Creates an event trigger for the given object/action identity.
    pub fn new(
        object: impl Into<String>,
        action: impl Into<String>,
        handler: Arc<dyn TriggerHandler>,
    ) -> Self {
        Self {
            object: object.into(),
            action: action.into(),
            handler,
        }
    }
}

impl fmt::Debug for EventTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventTrigger")
            .field("object", &self.object)
            .field("action", &self.action)
            .finish()
    }
}

/// A named calendar cadence.
///
/// Semantic intervals are calendar-aligned, not fixed durations: `Daily`
/// fires once per calendar day at the trigger's wall-clock time, in the
/// trigger's timezone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interval {
    /// Once per hour.
    Hourly,
    /// Once per calendar day.
    Daily,
    /// Once per week, on the trigger's `day`.
    Weekly,
    /// Once per calendar month, on the reference day-of-month.
    Monthly,
    /// Every three calendar months, on the reference day-of-month.
    Quarterly,
    /// Once per calendar year, on the reference month and day.
    Yearly,
}

impl Interval {
    /// The number of months between fires, for month-stepped cadences.
    pub(crate) fn month_step(self) -> Option<u32> {
        match self {
            Interval::Monthly => Some(1),
            Interval::Quarterly => Some(3),
            Interval::Yearly => Some(12),
            _ => None,
        }
    }
}

impl FromStr for Interval {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hourly" => Ok(Interval::Hourly),
            "daily" => Ok(Interval::Daily),
            "weekly" => Ok(Interval::Weekly),
            "monthly" => Ok(Interval::Monthly),
            "quarterly" => Ok(Interval::Quarterly),
            "yearly" => Ok(Interval::Yearly),
            other => Err(EngineError::Schedule(format!(
                "unknown interval '{other}'"
            ))),
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Interval::Hourly => "hourly",
            Interval::Daily => "daily",
            Interval::Weekly => "weekly",
            Interval::Monthly => "monthly",
            Interval::Quarterly => "quarterly",
            Interval::Yearly => "yearly",
        };
        write!(f, "{name}")
    }
}

/// What a schedule trigger fires on: a semantic interval or a raw
/// expression resolved by an external evaluator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    /// A named calendar cadence.
    Interval(Interval),
    /// A raw schedule expression, opaque to the engine.
    Expression(String),
}

impl From<Interval> for Schedule {
    fn from(interval: Interval) -> Self {
        Schedule::Interval(interval)
    }
}

/// A trigger that fires on a calendar cadence.
///
/// Built through the validating constructors; a malformed time or unknown
/// timezone is rejected at load time, not at resolution time.
///
/// # Examples
///
/// ```
/// use weft::{Interval, ScheduleTrigger};
/// use chrono::Weekday;
///
/// let trigger = ScheduleTrigger::interval(Interval::Weekly)
///     .on(Weekday::Mon)
///     .at("09:00")?
///     .in_zone("America/New_York")?;
/// trigger.validate()?;
/// # Ok::<(), weft::EngineError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleTrigger {
    schedule: Schedule,
    day: Option<Weekday>,
    time: NaiveTime,
    timezone: Tz,
}

impl ScheduleTrigger {
    /// Creates a schedule trigger with default qualifiers: midnight, UTC.
    pub fn new(schedule: impl Into<Schedule>) -> Self {
        Self {
            schedule: schedule.into(),
            day: None,
            time: NaiveTime::MIN,
            timezone: chrono_tz::UTC,
        }
    }

    /// Creates a trigger for a semantic interval.
    pub fn interval(interval: Interval) -> Self {
        Self::new(interval)
    }

    /// Creates a trigger for a raw schedule expression.
    pub fn expression(expression: impl Into<String>) -> Self {
        Self::new(Schedule::Expression(expression.into()))
    }

    /// Sets the weekday qualifier (required for weekly cadence).
    pub fn on(mut self, day: Weekday) -> Self {
        self.day = Some(day);
        self
    }

    /// Sets the wall-clock fire time from an `HH:MM` string.
    pub fn at(mut self, time: &str) -> Result<Self, EngineError> {
        self.time = NaiveTime::parse_from_str(time, "%H:%M")
            .map_err(|e| EngineError::Schedule(format!("invalid time '{time}': {e}")))?;
        Ok(self)
    }

    /// Sets the IANA timezone the wall-clock time is resolved in.
    pub fn in_zone(mut self, zone: &str) -> Result<Self, EngineError> {
        self.timezone = Tz::from_str(zone)
            .map_err(|_| EngineError::Schedule(format!("unknown timezone '{zone}'")))?;
        Ok(self)
    }

    /// Checks cross-field constraints.
    ///
    /// Weekly cadence requires a `day` qualifier.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.schedule == Schedule::Interval(Interval::Weekly) && self.day.is_none() {
            return Err(EngineError::Schedule(
                "weekly cadence requires a day qualifier".to_string(),
            ));
        }
        Ok(())
    }

    /// The cadence this trigger fires on.
    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    /// The weekday qualifier, if any.
    pub fn day(&self) -> Option<Weekday> {
        self.day
    }

    /// The wall-clock fire time.
    pub fn time(&self) -> NaiveTime {
        self.time
    }

    /// The timezone the fire time is resolved in.
    pub fn timezone(&self) -> Tz {
        self.timezone
    }
}

/// A declarative rule binding a workflow to its firing condition.
#[derive(Debug, Clone)]
pub enum Trigger {
    /// Fires when a matching domain event arrives.
    Event(EventTrigger),
    /// Fires on a calendar cadence.
    Schedule(ScheduleTrigger),
}

impl Trigger {
    /// Checks load-time constraints for this trigger.
    pub fn validate(&self) -> Result<(), EngineError> {
        match self {
            Trigger::Event(_) => Ok(()),
            Trigger::Schedule(st) => st.validate(),
        }
    }
}

impl From<EventTrigger> for Trigger {
    fn from(t: EventTrigger) -> Self {
        Trigger::Event(t)
    }
}

impl From<ScheduleTrigger> for Trigger {
    fn from(t: ScheduleTrigger) -> Self {
        Trigger::Schedule(t)
    }
}
