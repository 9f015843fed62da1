use std::fmt::Debug;

/// The `Aggregate` trait defines how raw observations are collected into an
/// intermediate, mergeable representation that preserves the information needed
/// for later analysis.
///
/// **Important:** aggregates do **not** compute final statistics such as averages or
/// percentiles. Those derived values belong to the snapshot types in
/// [`crate::metric`], which are converted from an aggregate and do the final
/// processing. Aggregates only store compact, mergeable raw data.
///
/// # Role
///
/// - Back a metric sink: every sink is a lock around one aggregate.
/// - Absorb a whole iteration's worth of observations in one call
///   ([`Aggregate::aggregate`]), so a virtual user takes each sink lock once per
///   iteration rather than once per observation.
/// - Be cheaply mergeable so partial aggregates can be combined into a global view.
///
/// # Implementor notes
/// - `merge` must be **associative** and **commutative**; merge order is arbitrary.
/// - `consume` must never drop an observation it accepts.
pub trait Aggregate
where
    Self: PartialEq + Send + Sync + Debug + Clone,
{
    /// The observation type this aggregate summarizes.
    type Sample;

    /// Create a new, empty instance of the aggregate.
    fn new() -> Self;

    /// Aggregate multiple samples into the current instance.
    ///
    /// This default implementation calls [`Aggregate::consume`] for each sample.
    fn aggregate(&mut self, samples: &[Self::Sample]) {
        samples.iter().for_each(|s| self.consume(s));
    }

    /// Incorporate a single sample into the aggregate.
    fn consume(&mut self, sample: &Self::Sample);

    /// Combine two different aggregates into one.
    fn merge(&mut self, other: Self);

    /// Number of samples absorbed so far.
    fn count(&self) -> u64;
}

/// Raw counts behind a rate metric.
#[derive(PartialEq, Eq, Debug, Clone, Copy, Default)]
pub struct RateAggregate {
    pub trues: u64,
    pub total: u64,
}

impl Aggregate for RateAggregate {
    type Sample = bool;

    fn new() -> Self {
        Self::default()
    }

    fn consume(&mut self, sample: &bool) {
        self.trues += u64::from(*sample);
        self.total += 1;
    }

    fn merge(&mut self, other: Self) {
        self.trues += other.trues;
        self.total += other.total;
    }

    fn count(&self) -> u64 {
        self.total
    }
}

/// Every sample behind a trend metric, kept in arrival order.
///
/// Full retention is what makes trend percentiles exact. Non-finite samples are
/// rejected at the door: they would poison the sum and have no position in a sort.
#[derive(PartialEq, Debug, Clone, Default)]
pub struct TrendAggregate {
    pub samples: Vec<f64>,
    pub sum: f64,
}

impl Aggregate for TrendAggregate {
    type Sample = f64;

    fn new() -> Self {
        Self::default()
    }

    fn aggregate(&mut self, samples: &[f64]) {
        self.samples.reserve(samples.len());
        samples.iter().for_each(|s| self.consume(s));
    }

    fn consume(&mut self, sample: &f64) {
        if !sample.is_finite() {
            tracing::debug!("Dropping non-finite trend sample {sample}");
            return;
        }
        self.samples.push(*sample);
        self.sum += *sample;
    }

    fn merge(&mut self, mut other: Self) {
        self.samples.append(&mut other.samples);
        self.sum += other.sum;
    }

    fn count(&self) -> u64 {
        self.samples.len() as u64
    }
}
