use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use typed_builder::TypedBuilder;

use crate::error::ScenarioError;
use crate::executor::Stage;
use crate::metric::MetricKind;
use crate::vu::Vu;

/// A scenario unit: the body a virtual user runs once per iteration.
///
/// The unit performs its HTTP calls through the [`Vu`] and reports what it observed
/// with [`Vu::rate`], [`Vu::trend`] and [`Vu::check`]. Ordinary assertion failures are
/// observations, not errors. Return `Err` only for conditions that make it pointless
/// for this virtual user to continue; the executor will replace it.
///
/// The executor imposes no delay between iterations. Pacing is the unit's own job
/// ([`Vu::sleep`]).
///
/// # Example
/// ```rust
/// use rampload::{MetricKind, Scenario, ScenarioError, Vu};
///
/// struct Ping;
///
/// impl Scenario for Ping {
///     async fn iteration(&self, vu: &mut Vu) -> Result<(), ScenarioError> {
///         let request = vu.request(reqwest::Method::GET, "http://localhost:3000/ping")?;
///         let ok = match vu.send(request).await {
///             Ok(response) => response.status().is_success(),
///             Err(_) => false,
///         };
///         vu.rate("ping_fails", !ok);
///         Ok(())
///     }
///
///     fn declared_metrics(&self) -> &'static [(&'static str, MetricKind)] {
///         &[("ping_fails", MetricKind::Rate)]
///     }
/// }
/// ```
pub trait Scenario: Send + Sync + 'static {
    /// Runs one iteration.
    fn iteration(&self, vu: &mut Vu) -> impl Future<Output = Result<(), ScenarioError>> + Send;

    /// Custom metrics this unit emits. They are registered before the run starts so
    /// that thresholds may reference them.
    fn declared_metrics(&self) -> &'static [(&'static str, MetricKind)] {
        &[]
    }
}

/// Object-safe bridge over [`Scenario`] so units of different types can share a run.
trait DynScenario: Send + Sync {
    fn iteration_boxed<'a>(&'a self, vu: &'a mut Vu) -> BoxFuture<'a, Result<(), ScenarioError>>;

    fn declared_metrics(&self) -> &'static [(&'static str, MetricKind)];
}

impl<S: Scenario> DynScenario for S {
    fn iteration_boxed<'a>(&'a self, vu: &'a mut Vu) -> BoxFuture<'a, Result<(), ScenarioError>> {
        Box::pin(self.iteration(vu))
    }

    fn declared_metrics(&self) -> &'static [(&'static str, MetricKind)] {
        Scenario::declared_metrics(self)
    }
}

/// A type-erased, cheaply clonable scenario unit.
#[derive(Clone)]
pub struct ScenarioUnit {
    inner: Arc<dyn DynScenario>,
}

impl ScenarioUnit {
    pub fn new(scenario: impl Scenario) -> Self {
        Self {
            inner: Arc::new(scenario),
        }
    }

    pub fn iteration<'a>(&'a self, vu: &'a mut Vu) -> BoxFuture<'a, Result<(), ScenarioError>> {
        self.inner.iteration_boxed(vu)
    }

    pub fn declared_metrics(&self) -> &'static [(&'static str, MetricKind)] {
        self.inner.declared_metrics()
    }
}

impl fmt::Debug for ScenarioUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScenarioUnit")
            .field("declared_metrics", &self.declared_metrics())
            .finish()
    }
}

/// Named scenario units that a run configuration can refer to through `exec`.
#[derive(Debug, Clone, Default)]
pub struct ScenarioCatalog {
    units: BTreeMap<String, ScenarioUnit>,
}

impl ScenarioCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, scenario: impl Scenario) -> &mut Self {
        self.units.insert(name.into(), ScenarioUnit::new(scenario));
        self
    }

    pub fn get(&self, name: &str) -> Option<&ScenarioUnit> {
        self.units.get(name)
    }
}

/// Everything needed to run one scenario: its name, ramp profile, grace period and
/// the unit its virtual users execute. Immutable once the run starts.
#[derive(Debug, Clone, TypedBuilder)]
pub struct ScenarioConfig {
    /// Unique across a run.
    #[builder(setter(into))]
    pub name: String,
    /// VUs in effect when the first stage begins.
    #[builder(default)]
    pub start_vus: u64,
    pub stages: Vec<Stage>,
    /// How long a retiring VU may keep running its current iteration.
    #[builder(default = Duration::from_secs(30))]
    pub graceful_ramp_down: Duration,
    pub unit: ScenarioUnit,
}

impl ScenarioConfig {
    /// Sum of every stage's duration.
    pub fn duration(&self) -> Duration {
        self.stages.iter().map(|s| s.duration).sum()
    }

    pub fn max_vus(&self) -> u64 {
        self.stages
            .iter()
            .map(|s| s.target)
            .fold(self.start_vus, u64::max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MetricsRegistry;

    struct Emit;

    impl Scenario for Emit {
        async fn iteration(&self, vu: &mut Vu) -> Result<(), ScenarioError> {
            vu.rate("emit_fails", false);
            Ok(())
        }

        fn declared_metrics(&self) -> &'static [(&'static str, MetricKind)] {
            &[("emit_fails", MetricKind::Rate)]
        }
    }

    struct Boom;

    impl Scenario for Boom {
        async fn iteration(&self, _: &mut Vu) -> Result<(), ScenarioError> {
            Err(ScenarioError::other("target unreachable"))
        }
    }

    #[tokio::test]
    async fn erased_unit_runs_the_scenario() {
        let registry = Arc::new(MetricsRegistry::new());
        let mut vu = Vu::new(1, Arc::from("emit"), Arc::clone(&registry));
        let unit = ScenarioUnit::new(Emit);

        unit.iteration(&mut vu).await.unwrap();
        assert_eq!(vu.pending().len(), 1);
        assert_eq!(unit.declared_metrics(), &[("emit_fails", MetricKind::Rate)]);
    }

    #[tokio::test]
    async fn erased_unit_propagates_errors() {
        let registry = Arc::new(MetricsRegistry::new());
        let mut vu = Vu::new(1, Arc::from("boom"), registry);
        let err = ScenarioUnit::new(Boom).iteration(&mut vu).await.unwrap_err();
        assert_eq!(err.to_string(), "target unreachable");
    }

    #[test]
    fn catalog_lookup() {
        let mut catalog = ScenarioCatalog::new();
        catalog.register("emit", Emit).register("boom", Boom);
        assert!(catalog.get("emit").is_some());
        assert!(catalog.get("missing").is_none());
    }

    #[test]
    fn config_duration_and_peak() {
        let config = ScenarioConfig::builder()
            .name("auth_test")
            .stages(vec![
                Stage::new(Duration::from_secs(30), 50),
                Stage::new(Duration::from_secs(60), 50),
                Stage::new(Duration::from_secs(30), 0),
            ])
            .unit(ScenarioUnit::new(Emit))
            .build();

        assert_eq!(config.duration(), Duration::from_secs(120));
        assert_eq!(config.max_vus(), 50);
        assert_eq!(config.graceful_ramp_down, Duration::from_secs(30));
    }
}
