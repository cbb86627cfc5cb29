//! Schedule resolution: turning a cadence into concrete fire instants.

use crate::error::EngineError;
use crate::trigger::{Interval, Schedule, ScheduleTrigger};
use chrono::{DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use std::sync::Arc;

/// External evaluator for raw (non-semantic) schedule expressions.
///
/// The engine calls it through a fixed contract: given an expression and a
/// reference instant, return the next fire instant strictly after the
/// reference.
pub trait ScheduleExpr: Send + Sync {
    /// Resolves the next fire instant for `expression` after `reference`.
    fn next_after(
        &self,
        expression: &str,
        reference: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, EngineError>;
}

/// Resolves a [`ScheduleTrigger`] to its next fire instant.
///
/// Resolution is deterministic and idempotent: the same trigger and
/// reference always produce the same instant, strictly after the reference.
///
/// # Examples
///
/// ```
/// use weft::{Interval, ScheduleResolver, ScheduleTrigger};
/// use chrono::{TimeZone, Utc};
///
/// let resolver = ScheduleResolver::new();
/// let trigger = ScheduleTrigger::interval(Interval::Daily).at("09:00")?;
///
/// let reference = Utc.with_ymd_and_hms(2024, 3, 10, 8, 0, 0).unwrap();
/// let fire = resolver.next_fire(&trigger, reference)?;
/// assert_eq!(fire, Utc.with_ymd_and_hms(2024, 3, 10, 9, 0, 0).unwrap());
/// # Ok::<(), weft::EngineError>(())
/// ```
#[derive(Clone, Default)]
pub struct ScheduleResolver {
    expr: Option<Arc<dyn ScheduleExpr>>,
}

impl ScheduleResolver {
    /// Creates a resolver for semantic intervals only.
    ///
    /// Raw expression triggers will fail to resolve until an evaluator is
    /// attached with [`ScheduleResolver::with_expr`].
    pub fn new() -> Self {
        Self { expr: None }
    }

    /// Attaches an external raw-expression evaluator.
    pub fn with_expr(mut self, expr: Arc<dyn ScheduleExpr>) -> Self {
        self.expr = Some(expr);
        self
    }

    /// Returns the next fire instant strictly after `reference`.
    pub fn next_fire(
        &self,
        trigger: &ScheduleTrigger,
        reference: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, EngineError> {
        match trigger.schedule() {
            Schedule::Expression(expression) => {
                let expr = self.expr.as_ref().ok_or_else(|| {
                    EngineError::Schedule(
                        "raw schedule expression given but no evaluator is configured".to_string(),
                    )
                })?;
                expr.next_after(expression, reference)
            }
            Schedule::Interval(interval) => self.next_semantic(*interval, trigger, reference),
        }
    }

    fn next_semantic(
        &self,
        interval: Interval,
        trigger: &ScheduleTrigger,
        reference: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, EngineError> {
        let tz = trigger.timezone();
        let time = trigger.time();
        let local = reference.with_timezone(&tz);

        if let Some(step) = interval.month_step() {
            return next_month_aligned(tz, time, local.date_naive(), step, reference);
        }

        match interval {
            Interval::Hourly => next_hourly(tz, time, reference),
            Interval::Daily => next_matching_day(tz, time, reference, local.date_naive(), |_| true),
            Interval::Weekly => {
                let day = trigger.day().ok_or_else(|| {
                    EngineError::Schedule("weekly cadence requires a day qualifier".to_string())
                })?;
                next_matching_day(tz, time, reference, local.date_naive(), |date| {
                    date.weekday() == day
                })
            }
            // Month-stepped intervals handled above.
            _ => Err(EngineError::Schedule(format!(
                "cannot resolve interval '{interval}'"
            ))),
        }
    }
}

impl std::fmt::Debug for ScheduleResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduleResolver")
            .field("expr", &self.expr.is_some())
            .finish()
    }
}

/// Resolves a wall-clock instant in `tz`, handling DST transitions.
///
/// A spring-forward gap that skips the exact minute resolves to the next
/// valid local instant; an ambiguous fall-back instant takes the earlier
/// offset.
fn resolve_local(tz: Tz, date: NaiveDate, time: NaiveTime) -> Option<DateTime<Utc>> {
    let mut naive = date.and_time(time);
    // A DST gap is at most a few hours; probe forward a minute at a time.
    for _ in 0..240 {
        match tz.from_local_datetime(&naive) {
            LocalResult::Single(dt) => return Some(dt.with_timezone(&Utc)),
            LocalResult::Ambiguous(earliest, _) => return Some(earliest.with_timezone(&Utc)),
            LocalResult::None => naive += Duration::minutes(1),
        }
    }
    None
}

/// Walks forward a day at a time until `matches` accepts a date whose
/// resolved instant is strictly after `reference`.
fn next_matching_day(
    tz: Tz,
    time: NaiveTime,
    reference: DateTime<Utc>,
    start: NaiveDate,
    matches: impl Fn(NaiveDate) -> bool,
) -> Result<DateTime<Utc>, EngineError> {
    let mut date = start;
    for _ in 0..=8 {
        if matches(date) {
            if let Some(fire) = resolve_local(tz, date, time) {
                if fire > reference {
                    return Ok(fire);
                }
            }
        }
        date = date
            .succ_opt()
            .ok_or_else(|| EngineError::Schedule("date out of range".to_string()))?;
    }
    Err(EngineError::Schedule(
        "no fire instant found within the search window".to_string(),
    ))
}

/// Fires at the qualifier minute of every hour.
fn next_hourly(
    tz: Tz,
    time: NaiveTime,
    reference: DateTime<Utc>,
) -> Result<DateTime<Utc>, EngineError> {
    let local = reference.with_timezone(&tz);
    let minute = time.minute();
    let mut naive = local
        .date_naive()
        .and_hms_opt(local.hour(), minute, 0)
        .ok_or_else(|| EngineError::Schedule("invalid hour alignment".to_string()))?;

    for _ in 0..=30 {
        match tz.from_local_datetime(&naive) {
            LocalResult::Single(dt) | LocalResult::Ambiguous(dt, _) => {
                let fire = dt.with_timezone(&Utc);
                if fire > reference {
                    return Ok(fire);
                }
            }
            // Gap hour: the next valid instant at this minute is next hour.
            LocalResult::None => {}
        }
        naive += Duration::hours(1);
    }
    Err(EngineError::Schedule(
        "no fire instant found within the search window".to_string(),
    ))
}

/// Fires every `step` months on the reference day-of-month, clamped to the
/// last valid day when the target month is shorter.
fn next_month_aligned(
    tz: Tz,
    time: NaiveTime,
    anchor: NaiveDate,
    step: u32,
    reference: DateTime<Utc>,
) -> Result<DateTime<Utc>, EngineError> {
    let anchor_day = anchor.day();
    let mut year = anchor.year();
    let mut month = anchor.month();

    for _ in 0..=16 {
        let day = anchor_day.min(days_in_month(year, month));
        if let Some(date) = NaiveDate::from_ymd_opt(year, month, day) {
            if let Some(fire) = resolve_local(tz, date, time) {
                if fire > reference {
                    return Ok(fire);
                }
            }
        }
        month += step;
        while month > 12 {
            month -= 12;
            year += 1;
        }
    }
    Err(EngineError::Schedule(
        "no fire instant found within the search window".to_string(),
    ))
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|d| d.pred_opt())
        .map(|d| d.day())
        .unwrap_or(28)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Weekday;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        match Utc.with_ymd_and_hms(y, mo, d, h, mi, 0) {
            LocalResult::Single(dt) => dt,
            _ => panic!("invalid test instant"),
        }
    }

    #[test]
    fn test_daily_at_nine_utc() {
        let resolver = ScheduleResolver::new();
        let trigger = ScheduleTrigger::interval(Interval::Daily)
            .at("09:00")
            .unwrap();

        let first = resolver
            .next_fire(&trigger, utc(2024, 3, 10, 8, 0))
            .unwrap();
        assert_eq!(first, utc(2024, 3, 10, 9, 0));

        let second = resolver.next_fire(&trigger, first).unwrap();
        assert_eq!(second, utc(2024, 3, 11, 9, 0));
    }

    #[test]
    fn test_resolution_is_idempotent() {
        let resolver = ScheduleResolver::new();
        let trigger = ScheduleTrigger::interval(Interval::Daily)
            .at("12:30")
            .unwrap();
        let reference = utc(2024, 6, 1, 3, 15);

        let a = resolver.next_fire(&trigger, reference).unwrap();
        let b = resolver.next_fire(&trigger, reference).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_monotonic_sequence() {
        let resolver = ScheduleResolver::new();
        for trigger in [
            ScheduleTrigger::interval(Interval::Hourly),
            ScheduleTrigger::interval(Interval::Daily),
            ScheduleTrigger::interval(Interval::Weekly).on(Weekday::Wed),
            ScheduleTrigger::interval(Interval::Monthly),
            ScheduleTrigger::interval(Interval::Quarterly),
            ScheduleTrigger::interval(Interval::Yearly),
        ] {
            let mut reference = utc(2024, 1, 31, 10, 30);
            for _ in 0..6 {
                let fire = resolver.next_fire(&trigger, reference).unwrap();
                assert!(fire > reference, "{:?} did not advance", trigger.schedule());
                reference = fire;
            }
        }
    }

    #[test]
    fn test_weekly_lands_on_day() {
        let resolver = ScheduleResolver::new();
        let trigger = ScheduleTrigger::interval(Interval::Weekly)
            .on(Weekday::Mon)
            .at("08:00")
            .unwrap();

        // 2024-03-10 is a Sunday.
        let fire = resolver
            .next_fire(&trigger, utc(2024, 3, 10, 12, 0))
            .unwrap();
        assert_eq!(fire, utc(2024, 3, 11, 8, 0));
    }

    #[test]
    fn test_monthly_clamps_to_short_month() {
        let resolver = ScheduleResolver::new();
        let trigger = ScheduleTrigger::interval(Interval::Monthly);

        // Anchored on the 31st; April has 30 days.
        let fire = resolver
            .next_fire(&trigger, utc(2024, 3, 31, 1, 0))
            .unwrap();
        assert_eq!(fire, utc(2024, 4, 30, 0, 0));
    }

    #[test]
    fn test_yearly_clamps_leap_day() {
        let resolver = ScheduleResolver::new();
        let trigger = ScheduleTrigger::interval(Interval::Yearly);

        let fire = resolver
            .next_fire(&trigger, utc(2024, 2, 29, 1, 0))
            .unwrap();
        assert_eq!(fire, utc(2025, 2, 28, 0, 0));
    }

    #[test]
    fn test_hourly_at_minute() {
        let resolver = ScheduleResolver::new();
        let trigger = ScheduleTrigger::interval(Interval::Hourly)
            .at("00:15")
            .unwrap();

        let fire = resolver
            .next_fire(&trigger, utc(2024, 3, 10, 8, 20))
            .unwrap();
        assert_eq!(fire, utc(2024, 3, 10, 9, 15));
    }

    #[test]
    fn test_dst_wall_clock_stability() {
        let resolver = ScheduleResolver::new();
        let trigger = ScheduleTrigger::interval(Interval::Daily)
            .at("09:00")
            .unwrap()
            .in_zone("America/New_York")
            .unwrap();

        // 2024-03-10: US spring-forward. 09:00 local is 13:00 UTC after the
        // transition, 14:00 UTC before it.
        let before = resolver
            .next_fire(&trigger, utc(2024, 3, 9, 0, 0))
            .unwrap();
        assert_eq!(before, utc(2024, 3, 9, 14, 0));

        let after = resolver.next_fire(&trigger, before).unwrap();
        assert_eq!(after, utc(2024, 3, 10, 13, 0));
    }

    #[test]
    fn test_spring_forward_gap_resolves_to_next_valid() {
        let resolver = ScheduleResolver::new();
        // 02:30 does not exist on 2024-03-10 in New York; the next valid
        // local instant is 03:00 (07:00 UTC).
        let trigger = ScheduleTrigger::interval(Interval::Daily)
            .at("02:30")
            .unwrap()
            .in_zone("America/New_York")
            .unwrap();

        let fire = resolver
            .next_fire(&trigger, utc(2024, 3, 10, 1, 0))
            .unwrap();
        assert_eq!(fire, utc(2024, 3, 10, 7, 0));
    }

    #[test]
    fn test_expression_without_evaluator_fails() {
        let resolver = ScheduleResolver::new();
        let trigger = ScheduleTrigger::expression("*/5 * * * *");
        let result = resolver.next_fire(&trigger, utc(2024, 1, 1, 0, 0));
        assert!(matches!(result, Err(EngineError::Schedule(_))));
    }

    #[test]
    fn test_expression_delegates_to_evaluator() {
        struct FixedExpr;
        impl ScheduleExpr for FixedExpr {
            fn next_after(
                &self,
                _expression: &str,
                reference: DateTime<Utc>,
            ) -> Result<DateTime<Utc>, EngineError> {
                Ok(reference + Duration::minutes(5))
            }
        }

        let resolver = ScheduleResolver::new().with_expr(Arc::new(FixedExpr));
        let trigger = ScheduleTrigger::expression("*/5 * * * *");
        let reference = utc(2024, 1, 1, 0, 0);
        let fire = resolver.next_fire(&trigger, reference).unwrap();
        assert_eq!(fire, reference + Duration::minutes(5));
    }
}
