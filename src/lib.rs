//! rampload: a load-generation core for HTTP services, in the spirit of k6.
//!
//! A run is made of named scenarios. Each scenario drives a pool of virtual users (VUs)
//! along a staged ramp profile; every VU repeatedly executes a user-supplied scenario
//! unit that issues HTTP calls and records observations. Observations land in shared
//! metric sinks, and at the end of the run thresholds over those metrics decide
//! whether the run passed.
//!
//! # Architecture
//!
//! The main building blocks are:
//!
//! - [`Scenario`]: the unit of work a VU runs once per iteration.
//! - [`Vu`]: the per-virtual-user context: an isolated HTTP session plus the methods
//!   used to record observations.
//! - [`Executor`]: runs one scenario. The [`RampingExecutor`] keeps the live VU count on
//!   the interpolated ramp profile and retires VUs gracefully.
//! - [`MetricsRegistry`]: owns every metric sink of a run. Sinks are either a
//!   [`Rate`](metric::Rate) (fraction of `true` observations) or a
//!   [`Trend`](metric::Trend) (full distribution of numeric samples).
//! - [`Orchestrator`]: starts every scenario concurrently, propagates aborts, evaluates
//!   [`Threshold`]s and produces a [`RunResult`].
//! - [`Reporter`]: publishes a [`RunResult`] somewhere (stdout, a JSON file).
//!
//! Runs are usually described declaratively with [`RunConfig`], which resolves
//! scenario units by name from a [`ScenarioCatalog`].
//!
//! # Example
//!
//! ```rust,no_run
//! use rampload::{Orchestrator, RunConfig, Scenario, ScenarioCatalog, ScenarioError, Vu};
//! use std::time::Duration;
//!
//! struct Browse;
//!
//! impl Scenario for Browse {
//!     async fn iteration(&self, vu: &mut Vu) -> Result<(), ScenarioError> {
//!         let request = vu.request(reqwest::Method::GET, "http://localhost:8080/")?;
//!         let ok = vu.send(request).await.is_ok_and(|r| r.status().is_success());
//!         vu.check("status is 200", ok);
//!         vu.sleep(Duration::from_secs(1)).await;
//!         Ok(())
//!     }
//! }
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let mut catalog = ScenarioCatalog::new();
//! catalog.register("browse", Browse);
//!
//! let config = RunConfig::from_json_str(
//!     r#"{
//!         "scenarios": {
//!             "browse": { "stages": [{ "duration": "30s", "target": 10 }] }
//!         },
//!         "thresholds": { "checks": ["rate>0.99"] }
//!     }"#,
//! )?;
//! let result = Orchestrator::new(config.into_plan(&catalog)?)?.run().await;
//! println!("{result}");
//! # Ok(())
//! # }
//! ```
//!
//! # Feature flags
//! - `internals`: expose the executor's scheduling internals (ramp schedule, VU pool)

pub mod aggregate;
pub mod clock;
pub mod config;
pub mod error;
/// Executors that control the VUs of a scenario
pub mod executor;
/// Metric kinds, sinks and their snapshots
pub mod metric;
pub mod orchestrator;
pub mod progress;
pub mod registry;
/// Run results and reporters
pub mod report;
pub mod scenario;
pub mod threshold;
pub mod vu;

pub use aggregate::Aggregate;
pub use config::{RunConfig, RunOptions, RunPlan};
pub use error::{ConfigError, MetricError, ReportError, RunError, ScenarioError};
pub use executor::{ExecutionContext, Executor, RampingExecutor, Stage};
pub use metric::{MetricKind, builtin};
pub use orchestrator::{AbortReason, Orchestrator, RunHandle};
pub use progress::{RunProgress, ScenarioOutcome};
pub use registry::{MetricsRegistry, MetricsSnapshot};
pub use report::{JsonReporter, Reporter, RunResult, StdoutReporter};
pub use scenario::{Scenario, ScenarioCatalog, ScenarioConfig, ScenarioUnit};
pub use threshold::{Threshold, Verdict};
pub use vu::Vu;
