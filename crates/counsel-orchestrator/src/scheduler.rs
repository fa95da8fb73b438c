use crate::clock::{Clock, SharedClock};
use chrono::{DateTime, Utc};
use counsel_core::{CounselError, CounselResult};
use cron::Schedule;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Fires older than this are skipped instead of replayed in a burst.
const MISFIRE_TOLERANCE_SECS: i64 = 30;

/// A parsed cron expression.
///
/// Accepts the classic five-field form (`min hour dom month dow`) and the
/// six-field form with a leading seconds column. Numeric day-of-week values
/// follow the `cron` crate (1 = Sunday); prefer names such as `MON-FRI`.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    schedule: Schedule,
}

impl CronSchedule {
    /// Parse and validate an expression.
    ///
    /// Fails with a configuration error when the field count is wrong, the
    /// expression does not parse, or it never fires again.
    pub fn parse(expression: &str) -> CounselResult<Self> {
        let trimmed = expression.trim();
        let normalized = match trimmed.split_whitespace().count() {
            5 => format!("0 {trimmed}"),
            6 => trimmed.to_string(),
            n => {
                return Err(CounselError::Configuration(format!(
                    "Invalid cron expression '{expression}': expected 5 or 6 fields, got {n}"
                )))
            }
        };
        let schedule = Schedule::from_str(&normalized).map_err(|e| {
            CounselError::Configuration(format!("Invalid cron expression '{expression}': {e}"))
        })?;
        if schedule.after(&Utc::now()).next().is_none() {
            return Err(CounselError::Configuration(format!(
                "Cron expression '{expression}' has no upcoming fire times"
            )));
        }
        Ok(Self {
            expression: trimmed.to_string(),
            schedule,
        })
    }

    /// Expression as given, trimmed.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First fire time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }

    /// All fire times in `(start, end]`.
    pub fn fire_times_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<DateTime<Utc>> {
        self.schedule
            .after(&start)
            .take_while(|t| *t <= end)
            .collect()
    }
}

#[derive(Debug, Default)]
struct TriggerState {
    cancelled: bool,
}

/// Handle to a running schedule trigger.
///
/// Dropping the handle cancels the trigger.
#[derive(Debug)]
pub struct TriggerHandle {
    name: String,
    state: Arc<Mutex<TriggerState>>,
    task: JoinHandle<()>,
}

impl TriggerHandle {
    /// Trigger name, usually the agent id.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop the trigger. Idempotent; once this returns the callback never runs again.
    pub fn cancel(&self) {
        let mut state = self.state.lock();
        if !state.cancelled {
            state.cancelled = true;
            tracing::debug!(trigger = %self.name, "Trigger cancelled");
        }
        drop(state);
        self.task.abort();
    }

    /// Whether the trigger may still fire.
    pub fn is_active(&self) -> bool {
        !self.state.lock().cancelled && !self.task.is_finished()
    }
}

impl Drop for TriggerHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Cron-driven trigger that invokes a callback at every matching instant.
pub struct ScheduleTrigger;

impl ScheduleTrigger {
    /// Spawn a trigger loop on the current tokio runtime.
    ///
    /// `on_fire` receives the scheduled fire time. It runs on the trigger task
    /// and must only hand work off (send on a channel, enqueue); the next fire
    /// time is computed from the previous one, never from when the callback
    /// returned.
    pub fn spawn<F>(
        name: impl Into<String>,
        schedule: CronSchedule,
        clock: SharedClock,
        on_fire: F,
    ) -> TriggerHandle
    where
        F: Fn(DateTime<Utc>) + Send + Sync + 'static,
    {
        let name = name.into();
        let state = Arc::new(Mutex::new(TriggerState::default()));
        let loop_state = state.clone();
        let loop_name = name.clone();

        let task = tokio::spawn(async move {
            let mut cursor = clock.now();
            loop {
                let Some(next) = schedule.next_after(cursor) else {
                    tracing::warn!(
                        trigger = %loop_name,
                        expression = %schedule.expression(),
                        "Trigger: schedule has no further fire times"
                    );
                    break;
                };

                let now = clock.now();
                if next > now {
                    let wait = (next - now).to_std().unwrap_or_default();
                    tracing::trace!(trigger = %loop_name, ?wait, "Trigger: sleeping until next fire");
                    tokio::time::sleep(wait).await;
                } else if (now - next).num_seconds() > MISFIRE_TOLERANCE_SECS {
                    tracing::warn!(
                        trigger = %loop_name,
                        missed = %next,
                        "Trigger: skipping missed fire time"
                    );
                    cursor = now;
                    continue;
                }

                {
                    let state = loop_state.lock();
                    if state.cancelled {
                        break;
                    }
                    tracing::debug!(trigger = %loop_name, fire_time = %next, "Trigger: firing");
                    on_fire(next);
                }
                cursor = next;
            }
        });

        TriggerHandle { name, state, task }
    }
}

/// The set of live triggers, keyed by agent id.
#[derive(Debug, Default)]
pub struct TriggerSet {
    triggers: HashMap<String, TriggerHandle>,
}

impl TriggerSet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a trigger, cancelling any previous trigger under the same key.
    pub fn insert(&mut self, key: impl Into<String>, handle: TriggerHandle) {
        if let Some(previous) = self.triggers.insert(key.into(), handle) {
            previous.cancel();
        }
    }

    /// Cancel and forget one trigger. Returns whether it existed.
    pub fn cancel(&mut self, key: &str) -> bool {
        match self.triggers.remove(key) {
            Some(handle) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel and forget every trigger.
    pub fn cancel_all(&mut self) {
        for (_, handle) in self.triggers.drain() {
            handle.cancel();
        }
    }

    /// Whether the trigger under `key` may still fire.
    pub fn is_active(&self, key: &str) -> bool {
        self.triggers.get(key).is_some_and(TriggerHandle::is_active)
    }

    /// Triggers that may still fire.
    pub fn active_count(&self) -> usize {
        self.triggers.values().filter(|h| h.is_active()).count()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::clock::VirtualClock;
    use chrono::{Datelike, TimeZone, Timelike, Weekday};
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_parse_five_and_six_fields() {
        assert!(CronSchedule::parse("*/5 * * * *").is_ok());
        assert!(CronSchedule::parse("30 0 9 * * *").is_ok());
    }

    #[test]
    fn test_parse_invalid_cron() {
        let err = CronSchedule::parse("not a cron expression").unwrap_err();
        assert!(err.is_configuration());
        let err = CronSchedule::parse("61 * * * *").unwrap_err();
        assert!(err.is_configuration());
        let err = CronSchedule::parse("* * *").unwrap_err();
        assert!(err.to_string().contains("expected 5 or 6 fields"));
    }

    #[test]
    fn test_next_after_is_strictly_later() {
        let schedule = CronSchedule::parse("0 * * * *").unwrap();
        let at = Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap();
        assert_eq!(
            schedule.next_after(at).unwrap(),
            Utc.with_ymd_and_hms(2026, 3, 2, 11, 0, 0).unwrap()
        );
    }

    fn brute_force(
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        matches: impl Fn(DateTime<Utc>) -> bool,
    ) -> BTreeSet<DateTime<Utc>> {
        let mut out = BTreeSet::new();
        let mut t = start + chrono::Duration::minutes(1);
        while t <= end {
            if matches(t) {
                out.insert(t);
            }
            t += chrono::Duration::minutes(1);
        }
        out
    }

    #[test]
    fn test_fires_exactly_on_matching_minutes_over_48_hours() {
        // Sunday noon to Tuesday noon, so weekday filters see both sides.
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let end = start + chrono::Duration::hours(48);

        type Predicate = Box<dyn Fn(DateTime<Utc>) -> bool>;
        let cases: Vec<(&str, Predicate)> = vec![
            ("* * * * *", Box::new(|_| true)),
            ("*/15 * * * *", Box::new(|t| t.minute() % 15 == 0)),
            ("0 9 * * *", Box::new(|t| t.hour() == 9 && t.minute() == 0)),
            ("0 */2 * * *", Box::new(|t| t.hour() % 2 == 0 && t.minute() == 0)),
            (
                "30 8,17 * * MON-FRI",
                Box::new(|t| {
                    t.minute() == 30
                        && (t.hour() == 8 || t.hour() == 17)
                        && !matches!(t.weekday(), Weekday::Sat | Weekday::Sun)
                }),
            ),
        ];

        for (expr, predicate) in cases {
            let schedule = CronSchedule::parse(expr).unwrap();
            let fired: BTreeSet<_> = schedule.fire_times_between(start, end).into_iter().collect();
            let expected = brute_force(start, end, predicate);
            assert_eq!(fired, expected, "mismatch for '{expr}'");
            assert!(fired.iter().all(|t| t.second() == 0));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_fires_on_virtual_clock() {
        let origin = Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 30).unwrap();
        let clock: SharedClock = Arc::new(VirtualClock::starting_at(origin));
        let fired = Arc::new(Mutex::new(Vec::new()));
        let sink = fired.clone();

        let handle = ScheduleTrigger::spawn(
            "every-minute",
            CronSchedule::parse("* * * * *").unwrap(),
            clock,
            move |at| sink.lock().push(at),
        );

        tokio::time::sleep(Duration::from_secs(185)).await;
        assert!(handle.is_active());
        let times = fired.lock().clone();
        assert_eq!(
            times,
            vec![
                Utc.with_ymd_and_hms(2026, 3, 2, 8, 1, 0).unwrap(),
                Utc.with_ymd_and_hms(2026, 3, 2, 8, 2, 0).unwrap(),
                Utc.with_ymd_and_hms(2026, 3, 2, 8, 3, 0).unwrap(),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_is_idempotent_and_final() {
        let origin = Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 30).unwrap();
        let clock: SharedClock = Arc::new(VirtualClock::starting_at(origin));
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();

        let handle = ScheduleTrigger::spawn(
            "cancel-me",
            CronSchedule::parse("* * * * *").unwrap(),
            clock,
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        );

        tokio::time::sleep(Duration::from_secs(65)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        handle.cancel();
        handle.cancel();
        assert!(!handle.is_active());

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_set_replaces_and_cancels() {
        let clock: SharedClock = Arc::new(VirtualClock::starting_at(Utc::now()));
        let schedule = CronSchedule::parse("0 * * * *").unwrap();
        let mut set = TriggerSet::new();

        set.insert("a", ScheduleTrigger::spawn("a", schedule.clone(), clock.clone(), |_| {}));
        set.insert("a", ScheduleTrigger::spawn("a2", schedule.clone(), clock.clone(), |_| {}));
        set.insert("b", ScheduleTrigger::spawn("b", schedule, clock, |_| {}));
        assert_eq!(set.active_count(), 2);
        assert!(set.is_active("a"));

        assert!(set.cancel("a"));
        assert!(!set.cancel("a"));
        assert!(!set.is_active("a"));

        set.cancel_all();
        assert_eq!(set.active_count(), 0);
    }
}
