// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::{HashMap, VecDeque};

use jiff::Timestamp;
use serde::{Deserialize, Serialize};

/// One observation of one metric. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    timestamp: Timestamp,
    metric: String,
    value: f64,
    unit: String,
}

impl MetricSample {
    /// A sample of `metric` taken at `timestamp`.
    #[must_use]
    pub fn new(timestamp: Timestamp, metric: impl Into<String>, value: f64, unit: impl Into<String>) -> Self {
        Self {
            timestamp,
            metric: metric.into(),
            value,
            unit: unit.into(),
        }
    }

    /// When the value was observed.
    #[must_use]
    pub const fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// Name of the observed metric.
    #[must_use]
    pub fn metric(&self) -> &str {
        &self.metric
    }

    /// The observed value.
    #[must_use]
    pub const fn value(&self) -> f64 {
        self.value
    }

    /// Unit of the value, e.g. `%`.
    #[must_use]
    pub fn unit(&self) -> &str {
        &self.unit
    }
}

/// An inclusive time interval; an open bound matches everything on that side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeRange {
    start: Option<Timestamp>,
    end: Option<Timestamp>,
}

impl TimeRange {
    /// Matches every sample.
    #[must_use]
    pub const fn all() -> Self {
        Self { start: None, end: None }
    }

    /// Matches samples at or after `start`.
    #[must_use]
    pub const fn since(start: Timestamp) -> Self {
        Self { start: Some(start), end: None }
    }

    /// Matches samples at or before `end`.
    #[must_use]
    pub const fn until(end: Timestamp) -> Self {
        Self { start: None, end: Some(end) }
    }

    /// Matches samples from `start` to `end`, both inclusive.
    #[must_use]
    pub const fn between(start: Timestamp, end: Timestamp) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
        }
    }

    /// Whether `timestamp` falls inside the range.
    #[must_use]
    pub fn contains(&self, timestamp: Timestamp) -> bool {
        self.start.is_none_or(|start| timestamp >= start) && self.end.is_none_or(|end| timestamp <= end)
    }
}

/// Derived statistics over a window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    /// Samples in the window.
    pub count: usize,
    /// Arithmetic mean.
    pub mean: f64,
    /// Smallest value.
    pub min: f64,
    /// Largest value.
    pub peak: f64,
    /// Newest value.
    pub latest: f64,
}

/// The most recent samples of one metric, oldest first.
///
/// Holds at most `capacity` samples; pushing onto a full window evicts the oldest sample.
#[derive(Debug, Clone)]
pub struct HistoryWindow {
    samples: VecDeque<MetricSample>,
    capacity: usize,
}

impl HistoryWindow {
    /// Creates an empty window. A capacity of zero is treated as one.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends `sample`, returning the evicted sample if the window was full.
    pub fn push(&mut self, sample: MetricSample) -> Option<MetricSample> {
        let evicted = if self.samples.len() == self.capacity {
            self.samples.pop_front()
        } else {
            None
        };

        self.samples.push_back(sample);
        evicted
    }

    /// The newest sample.
    #[must_use]
    pub fn latest(&self) -> Option<&MetricSample> {
        self.samples.back()
    }

    /// Samples currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether no sample was pushed yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Maximum number of samples held.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Samples oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &MetricSample> {
        self.samples.iter()
    }

    /// Samples inside `range`, oldest first.
    #[must_use]
    pub fn range(&self, range: TimeRange) -> Vec<MetricSample> {
        self.samples
            .iter()
            .filter(|sample| range.contains(sample.timestamp))
            .cloned()
            .collect()
    }

    /// Statistics over the whole window, or `None` when it is empty.
    #[must_use]
    #[expect(clippy::cast_precision_loss, reason = "window sizes are far below 2^52")]
    pub fn summary(&self) -> Option<Summary> {
        let latest = self.samples.back()?.value;
        let (sum, min, peak) = self
            .samples
            .iter()
            .fold((0.0, f64::INFINITY, f64::NEG_INFINITY), |(sum, min, peak), sample| {
                (sum + sample.value, min.min(sample.value), peak.max(sample.value))
            });

        Some(Summary {
            count: self.samples.len(),
            mean: sum / self.samples.len() as f64,
            min,
            peak,
            latest,
        })
    }
}

/// Bounded history windows keyed by metric name.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    windows: HashMap<String, HistoryWindow>,
    capacity: usize,
}

impl HistoryStore {
    /// A store whose windows each hold `capacity` samples.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            windows: HashMap::new(),
            capacity,
        }
    }

    /// Appends `sample` to its metric's window.
    pub fn record(&mut self, sample: MetricSample) {
        let capacity = self.capacity;
        self.windows
            .entry(sample.metric.clone())
            .or_insert_with(|| HistoryWindow::new(capacity))
            .push(sample);
    }

    /// The window of `metric`, if any sample was recorded.
    #[must_use]
    pub fn window(&self, metric: &str) -> Option<&HistoryWindow> {
        self.windows.get(metric)
    }

    /// The newest sample of `metric`.
    #[must_use]
    pub fn latest(&self, metric: &str) -> Option<MetricSample> {
        self.windows.get(metric).and_then(HistoryWindow::latest).cloned()
    }

    /// Samples of `metric` inside `range`, oldest first.
    #[must_use]
    pub fn range(&self, metric: &str, range: TimeRange) -> Vec<MetricSample> {
        self.windows.get(metric).map(|window| window.range(range)).unwrap_or_default()
    }

    /// Statistics over the window of `metric`.
    #[must_use]
    pub fn summary(&self, metric: &str) -> Option<Summary> {
        self.windows.get(metric).and_then(HistoryWindow::summary)
    }

    /// Names of all metrics with at least one sample, sorted.
    #[must_use]
    pub fn metrics(&self) -> Vec<String> {
        let mut names: Vec<_> = self.windows.keys().cloned().collect();
        names.sort_unstable();
        names
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    fn at(second: i64) -> Timestamp {
        Timestamp::from_second(1_700_000_000 + second).unwrap()
    }

    fn cpu(second: i64, value: f64) -> MetricSample {
        MetricSample::new(at(second), "cpu_usage_percent", value, "%")
    }

    #[test]
    fn window_never_exceeds_capacity_and_evicts_oldest() {
        let mut window = HistoryWindow::new(3);
        for (i, value) in [10.0, 20.0, 30.0].into_iter().enumerate() {
            assert!(window.push(cpu(i64::try_from(i).unwrap(), value)).is_none());
        }

        let evicted = window.push(cpu(3, 40.0)).unwrap();

        assert_eq!(evicted.value(), 10.0);
        assert_eq!(window.len(), 3);
        let values: Vec<_> = window.iter().map(MetricSample::value).collect();
        assert_eq!(values, vec![20.0, 30.0, 40.0]);
        assert_eq!(window.latest().unwrap().value(), 40.0);
    }

    #[test]
    fn zero_capacity_keeps_one_sample() {
        let mut window = HistoryWindow::new(0);
        window.push(cpu(0, 1.0));
        window.push(cpu(1, 2.0));

        assert_eq!(window.capacity(), 1);
        assert_eq!(window.len(), 1);
    }

    #[test]
    fn summary_over_window() {
        let mut window = HistoryWindow::new(10);
        assert!(window.summary().is_none());

        for (second, value) in [(0, 70.0), (12, 90.0), (24, 92.0), (36, 80.0)] {
            window.push(cpu(second, value));
        }

        let summary = window.summary().unwrap();
        assert_eq!(summary.count, 4);
        assert_eq!(summary.mean, 83.0);
        assert_eq!(summary.min, 70.0);
        assert_eq!(summary.peak, 92.0);
        assert_eq!(summary.latest, 80.0);
    }

    #[test]
    fn range_is_inclusive() {
        let mut window = HistoryWindow::new(10);
        for second in [0, 12, 24, 36] {
            window.push(cpu(second, 1.0));
        }

        assert_eq!(window.range(TimeRange::between(at(12), at(24))).len(), 2);
        assert_eq!(window.range(TimeRange::since(at(13))).len(), 2);
        assert_eq!(window.range(TimeRange::until(at(0))).len(), 1);
        assert_eq!(window.range(TimeRange::all()).len(), 4);
    }

    #[test]
    fn store_keeps_metrics_apart() {
        let mut store = HistoryStore::new(2);
        store.record(cpu(0, 50.0));
        store.record(MetricSample::new(at(0), "memory_usage_percent", 40.0, "%"));
        store.record(cpu(12, 60.0));
        store.record(cpu(24, 70.0));

        assert_eq!(store.metrics(), vec!["cpu_usage_percent", "memory_usage_percent"]);
        assert_eq!(store.window("cpu_usage_percent").unwrap().len(), 2);
        assert_eq!(store.latest("cpu_usage_percent").unwrap().value(), 70.0);
        assert_eq!(store.summary("memory_usage_percent").unwrap().count, 1);
        assert!(store.latest("disk_usage_percent").is_none());
        assert!(store.range("disk_usage_percent", TimeRange::all()).is_empty());
    }
}
