//! Explicit metrics sink.
//!
//! Components receive an `Arc<dyn MetricsSink>` at construction instead of
//! reaching for a global registry. [`FacadeMetrics`] forwards to the
//! `metrics` crate (and from there to whatever recorder the binary
//! installed), [`NoopMetrics`] discards everything, and [`InMemoryMetrics`]
//! keeps values around so tests can assert on them.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use metrics::{Label, counter, gauge, histogram};

/// Label pairs attached to a metric sample.
pub type Labels<'a> = &'a [(&'static str, &'a str)];

/// Destination for counters, gauges and histograms.
pub trait MetricsSink: Send + Sync + std::fmt::Debug {
    /// Adds `value` to a counter.
    fn increment_counter(&self, name: &'static str, labels: Labels<'_>, value: u64);

    /// Records one histogram observation.
    fn record_histogram(&self, name: &'static str, labels: Labels<'_>, value: f64);

    /// Sets a gauge to `value`.
    fn set_gauge(&self, name: &'static str, labels: Labels<'_>, value: f64);
}

/// Returns the shared no-op sink.
#[must_use]
pub fn noop() -> Arc<dyn MetricsSink> {
    Arc::new(NoopMetrics)
}

/// Sink that drops every sample.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment_counter(&self, _: &'static str, _: Labels<'_>, _: u64) {}
    fn record_histogram(&self, _: &'static str, _: Labels<'_>, _: f64) {}
    fn set_gauge(&self, _: &'static str, _: Labels<'_>, _: f64) {}
}

/// Sink backed by the `metrics` crate facade.
#[derive(Debug, Clone, Copy, Default)]
pub struct FacadeMetrics;

fn to_labels(labels: Labels<'_>) -> Vec<Label> {
    labels
        .iter()
        .map(|(key, value)| Label::new(*key, (*value).to_string()))
        .collect()
}

impl MetricsSink for FacadeMetrics {
    fn increment_counter(&self, name: &'static str, labels: Labels<'_>, value: u64) {
        counter!(name, to_labels(labels)).increment(value);
    }

    fn record_histogram(&self, name: &'static str, labels: Labels<'_>, value: f64) {
        histogram!(name, to_labels(labels)).record(value);
    }

    fn set_gauge(&self, name: &'static str, labels: Labels<'_>, value: f64) {
        gauge!(name, to_labels(labels)).set(value);
    }
}

#[derive(Debug, Default)]
struct Recorded {
    counters: BTreeMap<String, u64>,
    gauges: BTreeMap<String, f64>,
    histograms: BTreeMap<String, Vec<f64>>,
}

/// Sink that records samples in memory, keyed by `name{k=v,...}`.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    recorded: Mutex<Recorded>,
}

fn series_key(name: &str, labels: Labels<'_>) -> String {
    if labels.is_empty() {
        return name.to_string();
    }
    let mut sorted: Vec<_> = labels.iter().collect();
    sorted.sort_unstable();
    let rendered: Vec<String> = sorted.iter().map(|(k, v)| format!("{k}={v}")).collect();
    format!("{name}{{{}}}", rendered.join(","))
}

impl InMemoryMetrics {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut Recorded) -> R) -> R {
        let mut guard = self.recorded.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Value of one counter series (0 if never incremented).
    #[must_use]
    pub fn counter(&self, name: &str, labels: Labels<'_>) -> u64 {
        let key = series_key(name, labels);
        self.with(|r| r.counters.get(&key).copied().unwrap_or(0))
    }

    /// Sum of a counter across all label sets.
    #[must_use]
    pub fn counter_total(&self, name: &str) -> u64 {
        self.with(|r| {
            r.counters
                .iter()
                .filter(|(key, _)| {
                    key.as_str() == name || key.strip_prefix(name).is_some_and(|rest| rest.starts_with('{'))
                })
                .map(|(_, value)| *value)
                .sum()
        })
    }

    /// Last value set on a gauge series.
    #[must_use]
    pub fn gauge(&self, name: &str, labels: Labels<'_>) -> Option<f64> {
        let key = series_key(name, labels);
        self.with(|r| r.gauges.get(&key).copied())
    }

    /// Number of observations recorded on a histogram series.
    #[must_use]
    pub fn histogram_count(&self, name: &str, labels: Labels<'_>) -> usize {
        let key = series_key(name, labels);
        self.with(|r| r.histograms.get(&key).map_or(0, Vec::len))
    }
}

impl MetricsSink for InMemoryMetrics {
    fn increment_counter(&self, name: &'static str, labels: Labels<'_>, value: u64) {
        let key = series_key(name, labels);
        self.with(|r| *r.counters.entry(key).or_default() += value);
    }

    fn record_histogram(&self, name: &'static str, labels: Labels<'_>, value: f64) {
        let key = series_key(name, labels);
        self.with(|r| r.histograms.entry(key).or_default().push(value));
    }

    fn set_gauge(&self, name: &'static str, labels: Labels<'_>, value: f64) {
        let key = series_key(name, labels);
        self.with(|r| {
            r.gauges.insert(key, value);
        });
    }
}
