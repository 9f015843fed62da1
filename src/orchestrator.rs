//! Runs every scenario of a plan concurrently and turns the outcome into a verdict.

use std::collections::BTreeMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::config::RunPlan;
use crate::error::{ConfigError, RunError};
use crate::executor::{ExecutionContext, Executor, RampingExecutor};
use crate::progress::{RunProgress, ScenarioOutcome, ScenarioProgress, ScenarioStatus};
use crate::registry::MetricsRegistry;
use crate::report::RunResult;
use crate::threshold::{self, Threshold, Verdict};

/// Why a run stopped before its scenarios finished on their own.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum AbortReason {
    /// Requested from outside through a [`RunHandle`].
    Signal,
    /// An executor returned an error or panicked.
    ScenarioFailed { scenario: String, error: String },
    /// An `abortOnFail` threshold failed during the run.
    ThresholdFailed {
        metric: String,
        threshold: String,
        observed: f64,
    },
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::Signal => f.write_str("interrupted"),
            AbortReason::ScenarioFailed { scenario, error } => {
                write!(f, "scenario {scenario} failed: {error}")
            }
            AbortReason::ThresholdFailed {
                metric,
                threshold,
                observed,
            } => write!(f, "threshold {threshold} on {metric} failed (observed {observed:.4})"),
        }
    }
}

/// A cheap, clonable handle to observe or abort a run from another task.
#[derive(Clone, Debug)]
pub struct RunHandle {
    abort: Arc<watch::Sender<bool>>,
    reason: Arc<Mutex<Option<AbortReason>>>,
    scenarios: Arc<Vec<(String, Arc<ScenarioProgress>)>>,
    started: Arc<OnceLock<Instant>>,
}

impl RunHandle {
    /// Asks every scenario to ramp down. Idempotent.
    pub fn abort(&self) {
        self.abort_with(AbortReason::Signal);
    }

    pub fn is_aborted(&self) -> bool {
        *self.abort.borrow()
    }

    /// Elapsed time plus live and target VUs and completed iterations per scenario.
    pub fn progress(&self) -> RunProgress {
        RunProgress {
            elapsed: self
                .started
                .get()
                .map(Instant::elapsed)
                .unwrap_or_default(),
            scenarios: self
                .scenarios
                .iter()
                .map(|(name, progress)| ScenarioStatus {
                    name: name.clone(),
                    live_vus: progress.live_vus(),
                    target_vus: progress.target_vus(),
                    iterations: progress.snapshot().iterations,
                })
                .collect(),
        }
    }

    /// The first reason recorded wins.
    fn abort_with(&self, reason: AbortReason) {
        {
            let mut slot = self.reason.lock();
            if slot.is_none() {
                tracing::warn!("Aborting run: {reason}");
                *slot = Some(reason);
            }
        }
        self.abort.send_replace(true);
    }

    fn reason(&self) -> Option<AbortReason> {
        self.reason.lock().clone()
    }
}

/// Drives a [`RunPlan`] from start to verdict.
///
/// Construction validates the plan, creates the run's metrics registry with the
/// built-in metrics and every metric the scenario units declare, then checks each
/// threshold against it. Nothing runs until [`Orchestrator::run`].
#[derive(Debug)]
pub struct Orchestrator {
    plan: RunPlan,
    registry: Arc<MetricsRegistry>,
    handle: RunHandle,
}

impl Orchestrator {
    pub fn new(plan: RunPlan) -> Result<Self, RunError> {
        plan.validate()?;

        let registry = Arc::new(MetricsRegistry::with_builtins());
        for scenario in &plan.scenarios {
            for (name, kind) in scenario.unit.declared_metrics() {
                registry.register(name, *kind)?;
            }
        }
        for threshold in &plan.thresholds {
            threshold.check_kind(registry.kind_of(&threshold.metric))?;
        }

        let (abort, _) = watch::channel(false);
        let scenarios = plan
            .scenarios
            .iter()
            .map(|s| (s.name.clone(), Arc::new(ScenarioProgress::new())))
            .collect();
        let handle = RunHandle {
            abort: Arc::new(abort),
            reason: Arc::new(Mutex::new(None)),
            scenarios: Arc::new(scenarios),
            started: Arc::new(OnceLock::new()),
        };

        Ok(Self {
            plan,
            registry,
            handle,
        })
    }

    pub fn handle(&self) -> RunHandle {
        self.handle.clone()
    }

    pub fn registry(&self) -> &Arc<MetricsRegistry> {
        &self.registry
    }

    pub fn progress(&self) -> RunProgress {
        self.handle.progress()
    }

    /// Runs every scenario to completion, or until aborted, and evaluates thresholds.
    ///
    /// There is no implicit timeout. After an abort, scenarios ramp down with their own
    /// grace periods; whatever is still running `forced_stop` later is cancelled.
    pub async fn run(self) -> RunResult {
        let Self {
            plan,
            registry,
            handle,
        } = self;
        let RunPlan {
            scenarios,
            thresholds,
            options,
        } = plan;
        let started = *handle.started.get_or_init(Instant::now);

        tracing::info!(
            "Starting run: {} scenarios, {} thresholds",
            scenarios.len(),
            thresholds.len()
        );

        let mut executors = JoinSet::new();
        for (scenario, (_, progress)) in scenarios.into_iter().zip(handle.scenarios.iter()) {
            let ctx = ExecutionContext::with_abort(
                Arc::clone(&registry),
                Arc::clone(progress),
                handle.abort.subscribe(),
            );
            let name = scenario.name.clone();
            let executor = RampingExecutor::builder()
                .scenario(scenario)
                .tick(options.tick)
                .build();
            executors.spawn(async move {
                let outcome = AssertUnwindSafe(executor.exec(ctx)).catch_unwind().await;
                (name, outcome)
            });
        }

        let watched: Vec<&Threshold> = thresholds.iter().filter(|t| t.abort_on_fail).collect();
        let mut progress_ticker = ticker(started, options.progress_interval);
        let mut threshold_ticker = if watched.is_empty() {
            None
        } else {
            ticker(started, options.threshold_interval)
        };
        let mut abort = handle.abort.subscribe();
        let mut deadline: Option<Instant> = None;
        let mut forced = false;
        let mut outcomes: BTreeMap<String, ScenarioOutcome> = BTreeMap::new();

        loop {
            tokio::select! {
                joined = executors.join_next() => {
                    let Some(joined) = joined else { break };
                    match joined {
                        Ok((name, outcome)) => match settle(name, outcome) {
                            Ok((name, outcome)) => {
                                tracing::info!("Scenario {name} finished");
                                outcomes.insert(name, outcome);
                            }
                            Err(reason) => {
                                tracing::error!("{reason}");
                                handle.abort_with(reason);
                            }
                        },
                        Err(err) => tracing::debug!("Executor task ended: {err}"),
                    }
                }
                _ = next_tick(&mut progress_ticker) => {
                    tracing::info!("{}", handle.progress());
                }
                _ = next_tick(&mut threshold_ticker) => {
                    let snapshot = registry.snapshot_of(watched.iter().map(|t| t.metric.as_str()));
                    for threshold in &watched {
                        if let Verdict::Fail { observed } = threshold.evaluate(&snapshot) {
                            handle.abort_with(AbortReason::ThresholdFailed {
                                metric: threshold.metric.clone(),
                                threshold: threshold.source.clone(),
                                observed,
                            });
                            break;
                        }
                    }
                }
                _ = async { let _ = abort.wait_for(|aborted| *aborted).await; }, if deadline.is_none() => {
                    tracing::info!(
                        "Waiting up to {:?} for {} scenarios to stop",
                        options.forced_stop,
                        executors.len()
                    );
                    deadline = Some(Instant::now() + options.forced_stop);
                }
                _ = sleep_until(deadline), if !forced => {
                    tracing::warn!(
                        "Forced stop: cancelling {} scenarios still running",
                        executors.len()
                    );
                    executors.abort_all();
                    forced = true;
                }
            }
        }

        registry.freeze();
        let scenarios: Vec<(String, ScenarioOutcome)> = handle
            .scenarios
            .iter()
            .map(|(name, progress)| {
                let outcome = match outcomes.remove(name) {
                    Some(outcome) => outcome,
                    None => {
                        // cancelled executors took their in-flight iterations with them
                        progress.iterations_interrupted(progress.live_vus());
                        progress.snapshot()
                    }
                };
                (name.clone(), outcome)
            })
            .collect();

        let snapshot = registry.snapshot();
        let verdicts = threshold::evaluate(&thresholds, &snapshot);
        let result = RunResult::new(
            started.elapsed(),
            handle.reason(),
            scenarios,
            snapshot,
            verdicts,
        );
        tracing::info!(
            "Run finished in {:?}: {}",
            result.duration,
            if result.passed { "passed" } else { "failed" }
        );
        result
    }
}

/// Maps how an executor task ended to its outcome, or to the reason the run must stop.
fn settle(
    name: String,
    outcome: std::thread::Result<Result<ScenarioOutcome, ConfigError>>,
) -> Result<(String, ScenarioOutcome), AbortReason> {
    match outcome {
        Ok(Ok(outcome)) => Ok((name, outcome)),
        Ok(Err(err)) => Err(AbortReason::ScenarioFailed {
            scenario: name,
            error: err.to_string(),
        }),
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown cause".to_string());
            Err(AbortReason::ScenarioFailed {
                scenario: name,
                error: format!("executor panicked: {message}"),
            })
        }
    }
}

/// First tick one period after `start`. A zero period disables the ticker.
fn ticker(start: Instant, period: Duration) -> Option<Interval> {
    if period.is_zero() {
        return None;
    }
    let mut interval = tokio::time::interval_at(start + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    Some(interval)
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
