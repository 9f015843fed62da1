use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::MetricError;
use crate::metric::{
    MetricKind, MetricSnapshot, Observation, ObservedValue, Rate, Sink, Trend, builtin,
};

/// Owner of every metric sink in a run.
///
/// One registry is created per run and handed to every virtual user behind an
/// [`Arc`]. Metrics are created on first use and addressed by name; asking for an
/// existing name returns the existing sink. Once the run reaches its terminal state
/// the registry is [frozen](MetricsRegistry::freeze) and later commits are dropped.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    sinks: RwLock<BTreeMap<String, Sink>>,
    /// Held for reading by every commit, so freezing waits for in-flight commits.
    frozen: RwLock<bool>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the engine's own metrics already registered.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        for (name, kind) in [
            (builtin::ITERATION_DURATION, MetricKind::Trend),
            (builtin::HTTP_REQ_DURATION, MetricKind::Trend),
            (builtin::HTTP_REQ_FAILED, MetricKind::Rate),
            (builtin::CHECKS, MetricKind::Rate),
        ] {
            // fresh registry, names are distinct
            let _ = registry.register(name, kind);
        }
        registry
    }

    /// Returns the sink registered under `name`, creating it if needed.
    pub fn register(&self, name: &str, kind: MetricKind) -> Result<Sink, MetricError> {
        if let Some(sink) = self.sinks.read().get(name) {
            return check_kind(name, sink, kind);
        }

        let mut sinks = self.sinks.write();
        // another writer may have won the race between the two locks
        let sink = sinks.entry(name.to_string()).or_insert_with(|| {
            tracing::debug!("Registering {kind} metric `{name}`");
            match kind {
                MetricKind::Rate => Sink::Rate(Arc::new(Rate::new(name))),
                MetricKind::Trend => Sink::Trend(Arc::new(Trend::new(name))),
            }
        });
        check_kind(name, sink, kind)
    }

    pub fn rate(&self, name: &str) -> Result<Arc<Rate>, MetricError> {
        match self.register(name, MetricKind::Rate)? {
            Sink::Rate(rate) => Ok(rate),
            Sink::Trend(_) => unreachable!("register checks the kind"),
        }
    }

    pub fn trend(&self, name: &str) -> Result<Arc<Trend>, MetricError> {
        match self.register(name, MetricKind::Trend)? {
            Sink::Trend(trend) => Ok(trend),
            Sink::Rate(_) => unreachable!("register checks the kind"),
        }
    }

    pub fn kind_of(&self, name: &str) -> Option<MetricKind> {
        self.sinks.read().get(name).map(Sink::kind)
    }

    pub fn names(&self) -> Vec<String> {
        self.sinks.read().keys().cloned().collect()
    }

    /// Moves a batch of observations into their sinks, taking each sink's lock once.
    ///
    /// `observations` is left empty. Observations whose value kind does not match the
    /// registered sink are dropped with a warning.
    pub fn commit(&self, observations: &mut Vec<Observation>) {
        if observations.is_empty() {
            return;
        }
        let frozen = self.frozen.read();
        if *frozen {
            tracing::debug!(
                "Registry is frozen, dropping {} observations",
                observations.len()
            );
            observations.clear();
            return;
        }

        let mut rates: BTreeMap<&str, Vec<bool>> = BTreeMap::new();
        let mut trends: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
        for observation in observations.iter() {
            match observation.value {
                ObservedValue::Bool(v) => {
                    rates.entry(observation.metric.as_str()).or_default().push(v)
                }
                ObservedValue::Number(v) => {
                    trends.entry(observation.metric.as_str()).or_default().push(v)
                }
            }
        }

        for (name, values) in rates {
            match self.rate(name) {
                Ok(rate) => rate.add_many(&values),
                Err(err) => tracing::warn!("Dropping {} observations: {err}", values.len()),
            }
        }
        for (name, values) in trends {
            match self.trend(name) {
                Ok(trend) => trend.add_many(&values),
                Err(err) => tracing::warn!("Dropping {} observations: {err}", values.len()),
            }
        }

        observations.clear();
        drop(frozen);
    }

    /// Makes the registry read-only. Idempotent.
    ///
    /// Waits for commits already in progress; no observation lands after this returns.
    pub fn freeze(&self) {
        let mut frozen = self.frozen.write();
        if !*frozen {
            *frozen = true;
            tracing::debug!("Metrics registry frozen");
        }
    }

    pub fn is_frozen(&self) -> bool {
        *self.frozen.read()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let metrics = self
            .sinks
            .read()
            .iter()
            .map(|(name, sink)| (name.clone(), sink.snapshot()))
            .collect();
        MetricsSnapshot { metrics }
    }

    /// Like [`MetricsRegistry::snapshot`], restricted to `names`. Unknown names are skipped.
    pub fn snapshot_of<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> MetricsSnapshot {
        let sinks = self.sinks.read();
        names
            .into_iter()
            .filter_map(|name| {
                sinks
                    .get(name)
                    .map(|sink| (name.to_string(), sink.snapshot()))
            })
            .collect()
    }
}

fn check_kind(name: &str, sink: &Sink, requested: MetricKind) -> Result<Sink, MetricError> {
    if sink.kind() == requested {
        Ok(sink.clone())
    } else {
        Err(MetricError::KindMismatch {
            name: name.to_string(),
            existing: sink.kind(),
            requested,
        })
    }
}

/// Point-in-time view of every registered metric. Thresholds are evaluated against it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSnapshot {
    metrics: BTreeMap<String, MetricSnapshot>,
}

impl MetricsSnapshot {
    pub fn get(&self, name: &str) -> Option<&MetricSnapshot> {
        self.metrics.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &MetricSnapshot)> {
        self.metrics.iter()
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }
}

impl FromIterator<(String, MetricSnapshot)> for MetricsSnapshot {
    fn from_iter<I: IntoIterator<Item = (String, MetricSnapshot)>>(iter: I) -> Self {
        Self {
            metrics: iter.into_iter().collect(),
        }
    }
}
