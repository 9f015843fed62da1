//! Executor: runtime control of one scenario's virtual users
//!
//! The `Executor` trait is the runtime hook that executes a scenario. rampload ships
//! a [`RampingExecutor`], which keeps the number of live virtual users (VUs) on a
//! staged ramp profile.
//!
//! # High-level flow
//! 1. The executor validates its profile and starts a control loop that wakes every
//!    `tick`.
//! 2. On each tick it computes the target VU count for the elapsed time, reaps VUs
//!    that have exited, then spawns VUs (when below target) or marks the most
//!    recently spawned VUs for retirement (when above).
//! 3. Every VU is its own Tokio task looping over the scenario unit. A retiring VU
//!    finishes its in-flight iteration and exits; one still running after
//!    `graceful_ramp_down` is aborted and its iteration discarded.
//! 4. When the last stage has elapsed (or an abort is requested) the target drops to
//!    0; once every VU is gone the executor returns the scenario's outcome.
//!
//! # Tuning knobs
//! - `tick` (Duration): resolution of the control loop. The live VU count tracks the
//!   profile within one tick. Default 100ms.
//! - `graceful_ramp_down` (Duration): how long a retiring VU may keep running.
//!
//! # Mathematical behavior of the schedule
//! For a stage going from `prev` (the previous stage's target, or `start_vus` for the
//! first stage) to `target` over `duration`, at `elapsed` time into the stage:
//!
//! ```text
//! t = elapsed / duration
//! vus(t) = floor(prev + (target - prev) * t)
//! ```
//!
//! A stage with a zero duration jumps straight to its target.
//!
//! # Common pitfalls & recommendations
//! - **Do not perform blocking I/O inside a scenario unit.** A blocked VU task stalls
//!   its worker thread and distorts every other VU scheduled there.
//! - **Pace explicitly.** The executor starts the next iteration as soon as the
//!   previous one returns; use [`crate::Vu::sleep`] for think time.
pub mod ramping;
pub use ramping::{RampingExecutor, Stage};

use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch::{self, Receiver, Sender};

use crate::progress::{ScenarioOutcome, ScenarioProgress};
use crate::registry::MetricsRegistry;

/// The runtime hook that executes one scenario.
///
/// An executor owns its scenario's VU pool exclusively; nothing is shared with other
/// executors besides the metrics registry.
pub trait Executor
where
    Self: Send + Sync + Sized,
{
    type Error;

    /// Run the scenario to completion (or until aborted) and report what it did.
    fn exec(
        &self,
        ctx: ExecutionContext,
    ) -> impl Future<Output = Result<ScenarioOutcome, Self::Error>> + Send;
}

/// Shared state handed to an executor by whoever runs it.
#[derive(Clone, Debug)]
pub struct ExecutionContext {
    pub registry: Arc<MetricsRegistry>,
    pub progress: Arc<ScenarioProgress>,
    /// Flips to `true` when the run is being aborted.
    pub abort: Receiver<bool>,
}

impl ExecutionContext {
    /// A context with its own abort channel.
    pub fn new(
        registry: Arc<MetricsRegistry>,
        progress: Arc<ScenarioProgress>,
    ) -> (Self, Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self::with_abort(registry, progress, rx), tx)
    }

    pub fn with_abort(
        registry: Arc<MetricsRegistry>,
        progress: Arc<ScenarioProgress>,
        abort: Receiver<bool>,
    ) -> Self {
        Self {
            registry,
            progress,
            abort,
        }
    }

    /// Resolves once an abort has been requested. Never resolves if the sending side is
    /// gone without having requested one.
    pub async fn aborted(&mut self) {
        if self.abort.wait_for(|aborted| *aborted).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
