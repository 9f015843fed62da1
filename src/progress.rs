//! Live counters describing a run while it is in progress.
//!
//! Executors and their virtual users update these with relaxed atomics; readers get
//! a best-effort view that never affects scheduling.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Counters for one scenario, shared by its executor and every VU it spawns.
#[derive(Debug, Default)]
pub struct ScenarioProgress {
    live_vus: AtomicU64,
    target_vus: AtomicU64,
    peak_vus: AtomicU64,
    iterations: AtomicU64,
    interrupted: AtomicU64,
    vu_failures: AtomicU64,
}

impl ScenarioProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set_vus(&self, live: u64, target: u64) {
        self.live_vus.store(live, Ordering::Relaxed);
        self.target_vus.store(target, Ordering::Relaxed);
        self.peak_vus.fetch_max(live, Ordering::Relaxed);
    }

    pub(crate) fn iteration_completed(&self) {
        self.iterations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn iterations_interrupted(&self, n: u64) {
        self.interrupted.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn vu_failed(&self) {
        self.vu_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn live_vus(&self) -> u64 {
        self.live_vus.load(Ordering::Relaxed)
    }

    pub fn target_vus(&self) -> u64 {
        self.target_vus.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> ScenarioOutcome {
        ScenarioOutcome {
            iterations: self.iterations.load(Ordering::Relaxed),
            interrupted_iterations: self.interrupted.load(Ordering::Relaxed),
            peak_vus: self.peak_vus.load(Ordering::Relaxed),
            vu_failures: self.vu_failures.load(Ordering::Relaxed),
        }
    }
}

/// What a scenario did over the whole run.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScenarioOutcome {
    /// Iterations that ran to completion.
    pub iterations: u64,
    /// Iterations cut off after their VU's grace period ran out.
    pub interrupted_iterations: u64,
    pub peak_vus: u64,
    /// VUs terminated by an unrecoverable error or a panic.
    pub vu_failures: u64,
}

/// Point-in-time progress of a single scenario.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ScenarioStatus {
    pub name: String,
    pub live_vus: u64,
    pub target_vus: u64,
    pub iterations: u64,
}

/// Point-in-time progress of a whole run.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct RunProgress {
    pub elapsed: Duration,
    pub scenarios: Vec<ScenarioStatus>,
}

impl RunProgress {
    pub fn live_vus(&self) -> u64 {
        self.scenarios.iter().map(|s| s.live_vus).sum()
    }
}

impl fmt::Display for RunProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:>6.1}s]", self.elapsed.as_secs_f64())?;
        for s in &self.scenarios {
            write!(
                f,
                " {}: {}/{} VUs, {} iters;",
                s.name, s.live_vus, s.target_vus, s.iterations
            )?;
        }
        Ok(())
    }
}
