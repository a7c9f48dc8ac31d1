//! Aggregator for rolling probe samples up into fixed windows.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use super::{CyclePoint, MetricPoint};
use crate::probe::ProbeSample;

#[derive(Debug, Default, Clone, Copy)]
struct WindowAccumulator {
    total: u32,
    successes: u32,
    latency_sum: f64,
}

impl WindowAccumulator {
    fn add(&mut self, sample: &ProbeSample) {
        self.total += 1;
        if sample.success {
            self.successes += 1;
            self.latency_sum += sample.latency_ms.unwrap_or(0.0);
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct CycleAccumulator {
    count: u32,
    duration_sum: f64,
}

/// Groups samples per URL into epoch-aligned windows and emits one
/// [`MetricPoint`] per URL per window that received at least one sample.
///
/// Owned by a single task; it is the only writer for every URL it tracks.
pub struct Aggregator {
    window: ChronoDuration,
    pending: HashMap<String, BTreeMap<DateTime<Utc>, WindowAccumulator>>,
    /// Every window ending at or before this instant has been emitted.
    closed_before: Option<DateTime<Utc>>,
    late_samples: u64,
    cycles: BTreeMap<DateTime<Utc>, CycleAccumulator>,
    cycles_closed_before: Option<DateTime<Utc>>,
}

impl Aggregator {
    pub fn new(window: Duration) -> Self {
        let millis = (window.as_millis() as i64).max(1);
        Self {
            window: ChronoDuration::milliseconds(millis),
            pending: HashMap::new(),
            closed_before: None,
            late_samples: 0,
            cycles: BTreeMap::new(),
            cycles_closed_before: None,
        }
    }

    /// Start of the window containing `ts`.
    pub fn window_start(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        truncate_to_window(ts, self.window)
    }

    /// Add a sample to its window. Returns `false` if the window was already closed.
    pub fn ingest(&mut self, sample: &ProbeSample) -> bool {
        let start = self.window_start(sample.timestamp);

        if let Some(closed) = self.closed_before {
            if start + self.window <= closed {
                self.late_samples += 1;
                tracing::warn!(
                    "Aggregator: dropping late sample for {} at {} (window {} already closed)",
                    sample.url_name,
                    sample.timestamp,
                    start
                );
                return false;
            }
        }

        self.pending
            .entry(sample.url_name.clone())
            .or_default()
            .entry(start)
            .or_default()
            .add(sample);
        true
    }

    /// Close every window ending at or before `cutoff`.
    ///
    /// Returned points are ordered by window start, then URL name.
    pub fn close_windows(&mut self, cutoff: DateTime<Utc>) -> Vec<MetricPoint> {
        let boundary = truncate_to_window(cutoff, self.window);
        let mut points = Vec::new();

        for (url_name, windows) in self.pending.iter_mut() {
            // Everything before `boundary` ends at or before the cutoff
            let open = windows.split_off(&boundary);
            let closed = std::mem::replace(windows, open);

            for (start, acc) in closed {
                if acc.total == 0 {
                    continue;
                }
                let avg_latency_ms = if acc.successes > 0 {
                    Some(acc.latency_sum / acc.successes as f64)
                } else {
                    None
                };
                let point = MetricPoint {
                    url_name: url_name.clone(),
                    window_start: start,
                    window_end: start + self.window,
                    availability_pct: 100.0 * acc.successes as f64 / acc.total as f64,
                    avg_latency_ms,
                    sample_count: acc.total,
                };
                tracing::debug!(
                    "Aggregator: closed {} at {}: {} samples, {:.1}% available",
                    point.url_name,
                    point.window_start.format("%H:%M:%S"),
                    point.sample_count,
                    point.availability_pct
                );
                points.push(point);
            }
        }

        self.pending.retain(|_, windows| !windows.is_empty());
        self.closed_before = Some(match self.closed_before {
            Some(prev) if prev > boundary => prev,
            _ => boundary,
        });

        points.sort_by(|a, b| {
            a.window_start
                .cmp(&b.window_start)
                .then_with(|| a.url_name.cmp(&b.url_name))
        });
        points
    }

    /// Record the duration of one probe cycle that started at `started_at`.
    ///
    /// Returns `false` if that window was already closed.
    pub fn ingest_cycle(&mut self, started_at: DateTime<Utc>, duration_ms: f64) -> bool {
        let start = self.window_start(started_at);

        if let Some(closed) = self.cycles_closed_before {
            if start + self.window <= closed {
                self.late_samples += 1;
                tracing::warn!(
                    "Aggregator: dropping late cycle duration at {} (window {} already closed)",
                    started_at,
                    start
                );
                return false;
            }
        }

        let acc = self.cycles.entry(start).or_default();
        acc.count += 1;
        acc.duration_sum += duration_ms;
        true
    }

    /// Close every cycle-duration window ending at or before `cutoff`, oldest first.
    pub fn close_cycle_windows(&mut self, cutoff: DateTime<Utc>) -> Vec<CyclePoint> {
        let boundary = truncate_to_window(cutoff, self.window);
        let open = self.cycles.split_off(&boundary);
        let closed = std::mem::replace(&mut self.cycles, open);

        self.cycles_closed_before = Some(match self.cycles_closed_before {
            Some(prev) if prev > boundary => prev,
            _ => boundary,
        });

        closed
            .into_iter()
            .filter(|(_, acc)| acc.count > 0)
            .map(|(start, acc)| CyclePoint {
                window_start: start,
                window_end: start + self.window,
                avg_duration_ms: acc.duration_sum / acc.count as f64,
                cycle_count: acc.count,
            })
            .collect()
    }

    /// Samples dropped because their window had already been emitted.
    pub fn late_samples(&self) -> u64 {
        self.late_samples
    }

    /// Number of open accumulators, per URL window plus cycle windows.
    pub fn open_windows(&self) -> usize {
        self.pending.values().map(BTreeMap::len).sum::<usize>() + self.cycles.len()
    }
}

/// Truncate a datetime to the start of its containing epoch-aligned window.
pub fn truncate_to_window(dt: DateTime<Utc>, window: ChronoDuration) -> DateTime<Utc> {
    let window_ms = window.num_milliseconds().max(1);
    let ts = dt.timestamp_millis();
    let truncated = ts - ts.rem_euclid(window_ms);
    DateTime::from_timestamp_millis(truncated).unwrap_or(dt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::ProbeErrorKind;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, m, s).unwrap()
    }

    fn sample(url: &str, ts: DateTime<Utc>, latency: Option<f64>) -> ProbeSample {
        ProbeSample {
            url_name: url.to_string(),
            url: format!("https://{}.example.com", url),
            timestamp: ts,
            success: latency.is_some(),
            latency_ms: latency,
            error_kind: latency.map_or(Some(ProbeErrorKind::Timeout), |_| None),
        }
    }

    #[test]
    fn test_truncate_to_window() {
        let dt = at(12, 34, 56);
        assert_eq!(truncate_to_window(dt, ChronoDuration::seconds(60)), at(12, 34, 0));
        assert_eq!(truncate_to_window(dt, ChronoDuration::seconds(300)), at(12, 30, 0));
        assert_eq!(truncate_to_window(dt, ChronoDuration::seconds(3600)), at(12, 0, 0));
    }

    #[test]
    fn test_availability_and_latency() {
        let mut agg = Aggregator::new(Duration::from_secs(300));
        assert!(agg.ingest(&sample("a", at(12, 0, 10), Some(100.0))));
        assert!(agg.ingest(&sample("a", at(12, 2, 10), Some(300.0))));
        assert!(agg.ingest(&sample("a", at(12, 4, 10), None)));
        assert!(agg.ingest(&sample("a", at(12, 4, 50), None)));

        let points = agg.close_windows(at(12, 5, 0));
        assert_eq!(points.len(), 1);
        let p = &points[0];
        assert_eq!(p.window_start, at(12, 0, 0));
        assert_eq!(p.window_end, at(12, 5, 0));
        assert_eq!(p.sample_count, 4);
        assert_eq!(p.availability_pct, 50.0);
        assert_eq!(p.avg_latency_ms, Some(200.0));
    }

    #[test]
    fn test_open_window_not_emitted() {
        let mut agg = Aggregator::new(Duration::from_secs(300));
        agg.ingest(&sample("a", at(12, 3, 0), Some(10.0)));

        assert!(agg.close_windows(at(12, 4, 59)).is_empty());
        assert_eq!(agg.open_windows(), 1);
        assert_eq!(agg.close_windows(at(12, 5, 0)).len(), 1);
        assert_eq!(agg.open_windows(), 0);
    }

    #[test]
    fn test_empty_window_yields_no_point() {
        let mut agg = Aggregator::new(Duration::from_secs(300));
        agg.ingest(&sample("a", at(12, 1, 0), Some(10.0)));
        // Nothing between 12:05 and 12:10
        agg.ingest(&sample("a", at(12, 11, 0), Some(10.0)));

        let points = agg.close_windows(at(12, 15, 0));
        let starts: Vec<_> = points.iter().map(|p| p.window_start).collect();
        assert_eq!(starts, vec![at(12, 0, 0), at(12, 10, 0)]);
    }

    #[test]
    fn test_all_failures_has_no_latency() {
        let mut agg = Aggregator::new(Duration::from_secs(300));
        for m in 0..3 {
            agg.ingest(&sample("a", at(12, m, 0), None));
        }
        let points = agg.close_windows(at(12, 5, 0));
        assert_eq!(points[0].availability_pct, 0.0);
        assert_eq!(points[0].avg_latency_ms, None);
    }

    #[test]
    fn test_boundary_sample_counted_once() {
        // 120s probe cycle against a 300s window: cycles do not line up with windows
        let mut agg = Aggregator::new(Duration::from_secs(300));
        let mut ts = at(12, 0, 0);
        for _ in 0..10 {
            agg.ingest(&sample("a", ts, Some(1.0)));
            ts = ts + ChronoDuration::seconds(120);
        }

        let points = agg.close_windows(at(12, 20, 0));
        let total: u32 = points.iter().map(|p| p.sample_count).sum();
        assert_eq!(total, 10);
        // The 12:10:00 sample opens the 12:10 window rather than closing the 12:05 one
        let counts: Vec<_> = points.iter().map(|p| p.sample_count).collect();
        assert_eq!(counts, vec![3, 2, 3, 2]);
    }

    #[test]
    fn test_late_sample_dropped() {
        let mut agg = Aggregator::new(Duration::from_secs(300));
        agg.ingest(&sample("a", at(12, 1, 0), Some(10.0)));
        assert_eq!(agg.close_windows(at(12, 6, 0)).len(), 1);

        assert!(!agg.ingest(&sample("a", at(12, 4, 0), Some(10.0))));
        assert!(!agg.ingest(&sample("b", at(12, 2, 0), Some(10.0))));
        assert_eq!(agg.late_samples(), 2);
        assert!(agg.close_windows(at(12, 30, 0)).is_empty());
    }

    #[test]
    fn test_points_sorted_by_window_then_url() {
        let mut agg = Aggregator::new(Duration::from_secs(60));
        agg.ingest(&sample("b", at(12, 1, 0), Some(1.0)));
        agg.ingest(&sample("a", at(12, 1, 0), Some(1.0)));
        agg.ingest(&sample("b", at(12, 0, 0), Some(1.0)));

        let points = agg.close_windows(at(12, 2, 0));
        let order: Vec<_> = points
            .iter()
            .map(|p| (p.window_start, p.url_name.as_str()))
            .collect();
        assert_eq!(
            order,
            vec![(at(12, 0, 0), "b"), (at(12, 1, 0), "a"), (at(12, 1, 0), "b")]
        );
    }

    #[test]
    fn test_cycle_durations() {
        let mut agg = Aggregator::new(Duration::from_secs(300));
        assert!(agg.ingest_cycle(at(12, 0, 0), 1000.0));
        assert!(agg.ingest_cycle(at(12, 2, 0), 3000.0));
        assert!(agg.ingest_cycle(at(12, 4, 0), 14000.0));
        assert!(agg.ingest_cycle(at(12, 6, 0), 500.0));

        assert!(agg.close_cycle_windows(at(12, 4, 59)).is_empty());
        let points = agg.close_cycle_windows(at(12, 5, 0));
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].window_start, at(12, 0, 0));
        assert_eq!(points[0].cycle_count, 3);
        assert_eq!(points[0].avg_duration_ms, 6000.0);

        // URL windows are closed independently
        assert_eq!(agg.open_windows(), 1);
        assert!(!agg.ingest_cycle(at(12, 1, 0), 10.0));
        assert_eq!(agg.late_samples(), 1);
    }
}
