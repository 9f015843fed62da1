//! Metric sinks and the observations that feed them.
//!
//! A sink is a named, thread-safe accumulator backed by an [`Aggregate`]. Two kinds
//! exist:
//!
//! - [`Rate`]: the fraction of boolean observations that are `true`.
//! - [`Trend`]: summary statistics (avg, min, max, median, percentiles) over numeric
//!   observations, typically latencies in milliseconds.
//!
//! Sinks are append-only. Reads go through snapshots ([`RateSnapshot`],
//! [`TrendSnapshot`]) that are consistent with every `add` that returned before the
//! snapshot was taken.
//!
//! # Percentiles
//!
//! Trends retain every sample, so percentiles are exact: the sorted samples are
//! interpolated linearly between the two closest ranks, `p(0)` is the minimum and
//! `p(100)` is the maximum. There is no approximation error; the cost is memory
//! proportional to the number of samples.
//!
//! Taking a [`TrendSnapshot`] copies every sample while the sink's lock is held, and
//! commits to that sink wait for the copy. Periodic `abortOnFail` checks snapshot their
//! metrics every threshold interval, so a trend with millions of samples under such a
//! threshold briefly stalls VU commits each interval. Prefer rate thresholds for
//! early aborts on long runs, or raise `thresholdInterval`.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::aggregate::{Aggregate, RateAggregate, TrendAggregate};

/// Names of the metrics the engine records on its own.
pub mod builtin {
    /// Wall time of every completed iteration, in milliseconds.
    pub const ITERATION_DURATION: &str = "iteration_duration";
    /// Latency of every HTTP request sent through [`crate::Vu::send`], in milliseconds.
    pub const HTTP_REQ_DURATION: &str = "http_req_duration";
    /// Whether an HTTP request failed (transport error or status >= 400).
    pub const HTTP_REQ_FAILED: &str = "http_req_failed";
    /// Outcome of every [`crate::Vu::check`].
    pub const CHECKS: &str = "checks";
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Rate,
    Trend,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricKind::Rate => f.write_str("rate"),
            MetricKind::Trend => f.write_str("trend"),
        }
    }
}

/// A single value emitted by a scenario unit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ObservedValue {
    Bool(bool),
    Number(f64),
}

impl ObservedValue {
    pub fn kind(&self) -> MetricKind {
        match self {
            ObservedValue::Bool(_) => MetricKind::Rate,
            ObservedValue::Number(_) => MetricKind::Trend,
        }
    }
}

/// An immutable `(metric, value, timestamp)` tuple.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub metric: String,
    pub value: ObservedValue,
    pub at: Instant,
}

impl Observation {
    pub fn rate(metric: impl Into<String>, value: bool) -> Self {
        Self {
            metric: metric.into(),
            value: ObservedValue::Bool(value),
            at: Instant::now(),
        }
    }

    pub fn trend(metric: impl Into<String>, value: f64) -> Self {
        Self {
            metric: metric.into(),
            value: ObservedValue::Number(value),
            at: Instant::now(),
        }
    }
}

/// Fraction of boolean observations that are `true`.
#[derive(Debug)]
pub struct Rate {
    name: String,
    inner: Mutex<RateAggregate>,
}

impl Rate {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(RateAggregate::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add(&self, value: bool) {
        self.inner.lock().consume(&value);
    }

    pub fn add_many(&self, values: &[bool]) {
        self.inner.lock().aggregate(values);
    }

    /// `trues / total`, or `0` without observations.
    pub fn value(&self) -> f64 {
        self.snapshot().value()
    }

    pub fn snapshot(&self) -> RateSnapshot {
        RateSnapshot::from(*self.inner.lock())
    }
}

/// Summary statistics over numeric observations.
#[derive(Debug)]
pub struct Trend {
    name: String,
    inner: Mutex<TrendAggregate>,
}

impl Trend {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(TrendAggregate::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add(&self, value: f64) {
        self.inner.lock().consume(&value);
    }

    pub fn add_many(&self, values: &[f64]) {
        self.inner.lock().aggregate(values);
    }

    pub fn count(&self) -> u64 {
        self.inner.lock().count()
    }

    pub fn stat(&self, stat: TrendStat) -> f64 {
        self.snapshot().stat(stat)
    }

    /// Copies the samples out under the lock and sorts them outside of it.
    pub fn snapshot(&self) -> TrendSnapshot {
        let agg = self.inner.lock().clone();
        TrendSnapshot::from(agg)
    }
}

/// A registered sink of either kind.
#[derive(Debug, Clone)]
pub enum Sink {
    Rate(Arc<Rate>),
    Trend(Arc<Trend>),
}

impl Sink {
    pub fn kind(&self) -> MetricKind {
        match self {
            Sink::Rate(_) => MetricKind::Rate,
            Sink::Trend(_) => MetricKind::Trend,
        }
    }

    pub fn snapshot(&self) -> MetricSnapshot {
        match self {
            Sink::Rate(rate) => MetricSnapshot::Rate(rate.snapshot()),
            Sink::Trend(trend) => MetricSnapshot::Trend(trend.snapshot()),
        }
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RateSnapshot {
    pub trues: u64,
    pub total: u64,
}

impl RateSnapshot {
    pub fn value(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.trues as f64 / self.total as f64
        }
    }
}

impl From<RateAggregate> for RateSnapshot {
    fn from(agg: RateAggregate) -> Self {
        Self {
            trues: agg.trues,
            total: agg.total,
        }
    }
}

/// A statistic that can be derived from a trend.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TrendStat {
    Avg,
    Min,
    Max,
    Med,
    Count,
    /// `p(q)` for `0 <= q <= 100`.
    Percentile(f64),
}

impl fmt::Display for TrendStat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrendStat::Avg => f.write_str("avg"),
            TrendStat::Min => f.write_str("min"),
            TrendStat::Max => f.write_str("max"),
            TrendStat::Med => f.write_str("med"),
            TrendStat::Count => f.write_str("count"),
            TrendStat::Percentile(q) => write!(f, "p({q})"),
        }
    }
}

/// Sorted samples of a trend. Every statistic of an empty trend is `0`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TrendSnapshot {
    sorted: Vec<f64>,
    sum: f64,
}

impl From<TrendAggregate> for TrendSnapshot {
    fn from(agg: TrendAggregate) -> Self {
        let mut sorted = agg.samples;
        sorted.sort_unstable_by(f64::total_cmp);
        Self {
            sorted,
            sum: agg.sum,
        }
    }
}

impl TrendSnapshot {
    pub fn count(&self) -> u64 {
        self.sorted.len() as u64
    }

    pub fn avg(&self) -> f64 {
        if self.sorted.is_empty() {
            0.0
        } else {
            self.sum / self.sorted.len() as f64
        }
    }

    pub fn min(&self) -> f64 {
        self.sorted.first().copied().unwrap_or(0.0)
    }

    pub fn max(&self) -> f64 {
        self.sorted.last().copied().unwrap_or(0.0)
    }

    pub fn med(&self) -> f64 {
        self.percentile(50.0)
    }

    /// Exact percentile with linear interpolation between the closest ranks.
    /// `q` is clamped to `[0, 100]`.
    pub fn percentile(&self, q: f64) -> f64 {
        let n = self.sorted.len();
        match n {
            0 => 0.0,
            1 => self.sorted[0],
            _ => {
                let rank = (q.clamp(0.0, 100.0) / 100.0) * (n - 1) as f64;
                let lo = rank.floor() as usize;
                let hi = rank.ceil() as usize;
                let weight = rank - lo as f64;
                self.sorted[lo] + (self.sorted[hi] - self.sorted[lo]) * weight
            }
        }
    }

    pub fn stat(&self, stat: TrendStat) -> f64 {
        match stat {
            TrendStat::Avg => self.avg(),
            TrendStat::Min => self.min(),
            TrendStat::Max => self.max(),
            TrendStat::Med => self.med(),
            TrendStat::Count => self.count() as f64,
            TrendStat::Percentile(q) => self.percentile(q),
        }
    }
}

/// Frozen view of a single metric.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricSnapshot {
    Rate(RateSnapshot),
    Trend(TrendSnapshot),
}

impl MetricSnapshot {
    pub fn kind(&self) -> MetricKind {
        match self {
            MetricSnapshot::Rate(_) => MetricKind::Rate,
            MetricSnapshot::Trend(_) => MetricKind::Trend,
        }
    }
}
