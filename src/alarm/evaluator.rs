//! Debounced alarm state machines, one per alarm definition.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;

use super::{AlarmDefinition, AlarmEvent, AlarmStateValue, MetricSelector};
use crate::metrics::{CyclePoint, MetricKind, MetricPoint};

/// Run-time state of one alarm.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlarmState {
    pub current_state: AlarmStateValue,
    pub consecutive_breaches: u32,
    /// Start of the last window that was evaluated.
    pub last_evaluated_window: Option<DateTime<Utc>>,
    /// End of the last window that carried data, or evaluator start.
    pub last_data_at: DateTime<Utc>,
}

impl AlarmState {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            current_state: AlarmStateValue::InsufficientData,
            consecutive_breaches: 0,
            last_evaluated_window: None,
            last_data_at: now,
        }
    }
}

/// Owns every alarm's state; points for one alarm are applied strictly in order.
pub struct AlarmEvaluator {
    definitions: Vec<AlarmDefinition>,
    states: HashMap<String, AlarmState>,
    grace: ChronoDuration,
    /// How long after its end a window is evaluated at the earliest.
    settle: ChronoDuration,
}

impl AlarmEvaluator {
    pub fn new(definitions: &[AlarmDefinition], grace: Duration, now: DateTime<Utc>) -> Self {
        let states = definitions
            .iter()
            .map(|d| (d.name.clone(), AlarmState::new(now)))
            .collect();

        Self {
            definitions: definitions.to_vec(),
            states,
            grace: ChronoDuration::milliseconds(grace.as_millis() as i64),
            settle: ChronoDuration::zero(),
        }
    }

    /// Account for windows being closed `settle` after they end, so the grace
    /// period starts when the next window could first have been evaluated.
    pub fn with_settle(mut self, settle: ChronoDuration) -> Self {
        self.settle = settle;
        self
    }

    pub fn state(&self, alarm_name: &str) -> Option<&AlarmState> {
        self.states.get(alarm_name)
    }

    pub fn definitions(&self) -> &[AlarmDefinition] {
        &self.definitions
    }

    /// Apply a closed window to every alarm watching its URL.
    pub fn evaluate(&mut self, point: &MetricPoint, now: DateTime<Utc>) -> Vec<AlarmEvent> {
        self.apply(
            |selector| selector.url_name == point.url_name,
            point.window_start,
            point.window_end,
            |kind| point.value(kind),
            now,
        )
    }

    /// Apply a closed cycle-duration window to the canary-level alarms.
    pub fn evaluate_cycle(&mut self, point: &CyclePoint, now: DateTime<Utc>) -> Vec<AlarmEvent> {
        self.apply(
            |selector| selector.kind == MetricKind::TimeToProcess,
            point.window_start,
            point.window_end,
            |kind| point.value(kind),
            now,
        )
    }

    fn apply(
        &mut self,
        watches: impl Fn(&MetricSelector) -> bool,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        value_of: impl Fn(MetricKind) -> Option<f64>,
        now: DateTime<Utc>,
    ) -> Vec<AlarmEvent> {
        let mut events = Vec::new();

        for def in self.definitions.iter().filter(|d| watches(&d.selector)) {
            // A window with samples but no value for this metric counts as missing data
            let Some(value) = value_of(def.selector.kind) else {
                continue;
            };
            let Some(state) = self.states.get_mut(&def.name) else {
                continue;
            };

            if let Some(last) = state.last_evaluated_window {
                if window_start <= last {
                    tracing::debug!(
                        "AlarmEvaluator: {} ignoring stale window {}",
                        def.name,
                        window_start
                    );
                    continue;
                }
            }
            state.last_evaluated_window = Some(window_start);
            state.last_data_at = window_end;

            if def.comparison.breaches(value, def.threshold) {
                state.consecutive_breaches += 1;
                if state.consecutive_breaches >= def.evaluation_periods
                    && state.current_state != AlarmStateValue::Alarm
                {
                    let reason = format!(
                        "breached {} {} for {} consecutive periods",
                        def.comparison, def.threshold, def.evaluation_periods
                    );
                    events.push(transition(def, state, AlarmStateValue::Alarm, reason, now));
                }
            } else {
                state.consecutive_breaches = 0;
                if state.current_state != AlarmStateValue::Ok {
                    let reason = format!(
                        "{} {} did not breach {} {}",
                        def.selector.kind.as_str(),
                        value,
                        def.comparison,
                        def.threshold
                    );
                    events.push(transition(def, state, AlarmStateValue::Ok, reason, now));
                }
            }
        }

        events
    }

    /// Drop alarms that have seen no data for longer than the grace period.
    pub fn check_missing(&mut self, now: DateTime<Utc>) -> Vec<AlarmEvent> {
        let mut events = Vec::new();

        for def in &self.definitions {
            let Some(state) = self.states.get_mut(&def.name) else {
                continue;
            };

            // The next window is not evaluated before `settle` past its end
            if now - (state.last_data_at + self.settle) <= self.grace {
                continue;
            }
            let silent_for = now - state.last_data_at;

            state.consecutive_breaches = 0;
            if state.current_state != AlarmStateValue::InsufficientData {
                let reason = format!(
                    "no data received for {} seconds",
                    silent_for.num_seconds()
                );
                events.push(transition(
                    def,
                    state,
                    AlarmStateValue::InsufficientData,
                    reason,
                    now,
                ));
            }
        }

        events
    }
}

fn transition(
    def: &AlarmDefinition,
    state: &mut AlarmState,
    new_state: AlarmStateValue,
    reason: String,
    now: DateTime<Utc>,
) -> AlarmEvent {
    let old_state = state.current_state;
    state.current_state = new_state;

    tracing::info!(
        "AlarmEvaluator: {} {} -> {}: {}",
        def.name,
        old_state,
        new_state,
        reason
    );

    AlarmEvent {
        alarm_name: def.name.clone(),
        old_state,
        new_state,
        reason,
        state_change_time: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarm::{Comparison, MetricSelector};
    use crate::metrics::MetricKind;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn availability_alarm(periods: u32) -> AlarmDefinition {
        AlarmDefinition {
            name: "siteAvailabilityAlarm".to_string(),
            description: "Availability Alarm for site".to_string(),
            selector: MetricSelector {
                url_name: "site".to_string(),
                kind: MetricKind::Availability,
            },
            threshold: 90.0,
            comparison: Comparison::LessThan,
            evaluation_periods: periods,
        }
    }

    fn latency_alarm() -> AlarmDefinition {
        AlarmDefinition {
            name: "siteLatencyAlarm".to_string(),
            description: "Latency Alarm for site".to_string(),
            selector: MetricSelector {
                url_name: "site".to_string(),
                kind: MetricKind::Latency,
            },
            threshold: 3000.0,
            comparison: Comparison::GreaterThan,
            evaluation_periods: 1,
        }
    }

    /// Point for the `index`-th five minute window after t0.
    fn point(index: i64, availability: f64, latency: Option<f64>) -> MetricPoint {
        let start = t0() + ChronoDuration::minutes(5 * index);
        MetricPoint {
            url_name: "site".to_string(),
            window_start: start,
            window_end: start + ChronoDuration::minutes(5),
            availability_pct: availability,
            avg_latency_ms: latency,
            sample_count: 3,
        }
    }

    fn evaluator(defs: &[AlarmDefinition]) -> AlarmEvaluator {
        AlarmEvaluator::new(defs, Duration::from_secs(600), t0())
    }

    #[test]
    fn test_initial_state() {
        let ev = evaluator(&[availability_alarm(1)]);
        let state = ev.state("siteAvailabilityAlarm").unwrap();
        assert_eq!(state.current_state, AlarmStateValue::InsufficientData);
        assert_eq!(state.consecutive_breaches, 0);
        assert_eq!(state.last_evaluated_window, None);
    }

    #[test]
    fn test_single_breach_alarms_with_one_period() {
        let mut ev = evaluator(&[availability_alarm(1)]);
        let events = ev.evaluate(&point(0, 0.0, None), t0());

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].new_state, AlarmStateValue::Alarm);
        assert_eq!(events[0].old_state, AlarmStateValue::InsufficientData);
        assert_eq!(
            events[0].reason,
            "breached LESS_THAN 90 for 1 consecutive periods"
        );
    }

    #[test]
    fn test_alarm_needs_exactly_n_breaches() {
        for n in 1..=5u32 {
            let mut ev = evaluator(&[availability_alarm(n)]);
            for i in 0..(n as i64 - 1) {
                let events = ev.evaluate(&point(i, 50.0, Some(10.0)), t0());
                assert!(events.is_empty(), "alarmed after {} of {} breaches", i + 1, n);
            }
            let events = ev.evaluate(&point(n as i64 - 1, 50.0, Some(10.0)), t0());
            assert_eq!(events.len(), 1);
            assert_eq!(events[0].new_state, AlarmStateValue::Alarm);
            assert_eq!(ev.state("siteAvailabilityAlarm").unwrap().consecutive_breaches, n);
        }
    }

    #[test]
    fn test_non_breach_resets_count() {
        let mut ev = evaluator(&[availability_alarm(3)]);
        ev.evaluate(&point(0, 50.0, None), t0());
        ev.evaluate(&point(1, 50.0, None), t0());
        assert_eq!(ev.state("siteAvailabilityAlarm").unwrap().consecutive_breaches, 2);

        let events = ev.evaluate(&point(2, 100.0, None), t0());
        assert_eq!(ev.state("siteAvailabilityAlarm").unwrap().consecutive_breaches, 0);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].new_state, AlarmStateValue::Ok);

        // Two more breaches are not enough after the reset
        assert!(ev.evaluate(&point(3, 50.0, None), t0()).is_empty());
        assert!(ev.evaluate(&point(4, 50.0, None), t0()).is_empty());
        let events = ev.evaluate(&point(5, 50.0, None), t0());
        assert_eq!(events[0].new_state, AlarmStateValue::Alarm);
    }

    #[test]
    fn test_no_event_when_state_unchanged() {
        let mut ev = evaluator(&[availability_alarm(1)]);
        assert_eq!(ev.evaluate(&point(0, 100.0, None), t0()).len(), 1);
        assert!(ev.evaluate(&point(1, 100.0, None), t0()).is_empty());

        assert_eq!(ev.evaluate(&point(2, 10.0, None), t0()).len(), 1);
        assert!(ev.evaluate(&point(3, 10.0, None), t0()).is_empty());
        assert_eq!(ev.state("siteAvailabilityAlarm").unwrap().consecutive_breaches, 2);
    }

    #[test]
    fn test_stale_window_ignored() {
        let mut ev = evaluator(&[availability_alarm(2)]);
        ev.evaluate(&point(3, 50.0, None), t0());
        assert!(ev.evaluate(&point(3, 50.0, None), t0()).is_empty());
        assert!(ev.evaluate(&point(1, 50.0, None), t0()).is_empty());
        assert_eq!(ev.state("siteAvailabilityAlarm").unwrap().consecutive_breaches, 1);
    }

    #[test]
    fn test_latency_without_value_is_missing_data() {
        let mut ev = evaluator(&[latency_alarm()]);
        assert!(ev.evaluate(&point(0, 0.0, None), t0()).is_empty());
        let state = ev.state("siteLatencyAlarm").unwrap();
        assert_eq!(state.last_evaluated_window, None);
        assert_eq!(state.last_data_at, t0());

        let events = ev.evaluate(&point(1, 100.0, Some(4500.0)), t0());
        assert_eq!(events[0].new_state, AlarmStateValue::Alarm);
        assert_eq!(
            events[0].reason,
            "breached GREATER_THAN 3000 for 1 consecutive periods"
        );
    }

    #[test]
    fn test_points_for_other_urls_ignored() {
        let mut ev = evaluator(&[availability_alarm(1)]);
        let mut other = point(0, 0.0, None);
        other.url_name = "elsewhere".to_string();
        assert!(ev.evaluate(&other, t0()).is_empty());
    }

    #[test]
    fn test_grace_period_moves_to_insufficient_data() {
        let mut ev = evaluator(&[availability_alarm(2)]);
        ev.evaluate(&point(0, 100.0, None), t0());
        ev.evaluate(&point(1, 50.0, None), t0());
        // Data covers up to t0 + 10m
        assert!(ev.check_missing(t0() + ChronoDuration::minutes(20)).is_empty());

        let events = ev.check_missing(t0() + ChronoDuration::minutes(21));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].old_state, AlarmStateValue::Ok);
        assert_eq!(events[0].new_state, AlarmStateValue::InsufficientData);
        assert_eq!(events[0].reason, "no data received for 660 seconds");
        assert_eq!(ev.state("siteAvailabilityAlarm").unwrap().consecutive_breaches, 0);

        // Already INSUFFICIENT_DATA: no second event
        assert!(ev.check_missing(t0() + ChronoDuration::minutes(30)).is_empty());
    }

    #[test]
    fn test_never_seen_data_stays_insufficient_without_event() {
        let mut ev = evaluator(&[availability_alarm(1)]);
        assert!(ev.check_missing(t0() + ChronoDuration::hours(1)).is_empty());
        assert_eq!(
            ev.state("siteAvailabilityAlarm").unwrap().current_state,
            AlarmStateValue::InsufficientData
        );
    }

    #[test]
    fn test_grace_counts_from_earliest_evaluation() {
        let settle = ChronoDuration::seconds(13);
        let mut ev = AlarmEvaluator::new(&[availability_alarm(2)], Duration::from_secs(300), t0())
            .with_settle(settle);
        ev.evaluate(&point(0, 50.0, None), t0() + ChronoDuration::minutes(5) + settle);
        assert_eq!(ev.state("siteAvailabilityAlarm").unwrap().consecutive_breaches, 1);

        // One full window later the next point is still settling: the count must survive
        let before_next_close = t0() + ChronoDuration::minutes(10) + ChronoDuration::seconds(10);
        assert!(ev.check_missing(before_next_close).is_empty());
        assert_eq!(ev.state("siteAvailabilityAlarm").unwrap().consecutive_breaches, 1);

        let events = ev.evaluate(&point(1, 50.0, None), before_next_close + settle);
        assert_eq!(events[0].new_state, AlarmStateValue::Alarm);

        // Past the settled grace the alarm drops to INSUFFICIENT_DATA
        let events = ev.check_missing(t0() + ChronoDuration::minutes(15) + ChronoDuration::seconds(14));
        assert_eq!(events[0].new_state, AlarmStateValue::InsufficientData);
        assert_eq!(events[0].reason, "no data received for 314 seconds");
    }

    #[test]
    fn test_cycle_points_feed_time_to_process_alarm() {
        let ttp = AlarmDefinition {
            name: "TimeToProcessAlarm".to_string(),
            description: "TimeToProcess Alarm for CanaryWatch".to_string(),
            selector: MetricSelector {
                url_name: "CanaryWatch".to_string(),
                kind: MetricKind::TimeToProcess,
            },
            threshold: 10000.0,
            comparison: Comparison::GreaterThan,
            evaluation_periods: 1,
        };
        let mut ev = evaluator(&[availability_alarm(1), ttp]);

        let cycle = CyclePoint {
            window_start: t0(),
            window_end: t0() + ChronoDuration::minutes(5),
            avg_duration_ms: 12500.0,
            cycle_count: 3,
        };
        let events = ev.evaluate_cycle(&cycle, t0());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].alarm_name, "TimeToProcessAlarm");
        assert_eq!(events[0].new_state, AlarmStateValue::Alarm);

        // URL points never touch the canary alarm
        ev.evaluate(&point(1, 100.0, Some(10.0)), t0());
        assert_eq!(
            ev.state("TimeToProcessAlarm").unwrap().last_evaluated_window,
            Some(t0())
        );
    }
}
