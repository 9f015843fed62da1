//! The `RampingExecutor` and its components.
//!
//! The control loop recomputes the target VU count every `tick` from a
//! [`Schedule`] and reconciles a [`VuPool`] against it. VU iterations never block
//! the control loop: each VU is a separate Tokio task, and the loop only looks at
//! whether those tasks have finished.
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use typed_builder::TypedBuilder;

use super::{ExecutionContext, Executor};
use crate::clock::Timer;
use crate::error::{ConfigError, ScenarioError};
use crate::progress::{ScenarioOutcome, ScenarioProgress};
use crate::registry::MetricsRegistry;
use crate::scenario::{ScenarioConfig, ScenarioUnit};
use crate::vu::Vu;
use internals::*;

/// A stage defines a target VU count and how long to ramp to it.
///
/// Use `Stage::new(Duration::from_secs(30), 50)` to ramp to 50 VUs over 30s.
/// If `duration` is `Duration::ZERO` the target takes effect immediately.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Stage {
    pub duration: Duration,
    /// Virtual users
    pub target: u64,
}

impl Stage {
    pub fn new(duration: Duration, target: u64) -> Self {
        Self { duration, target }
    }
}

/// Executor that keeps a scenario's live VUs on its ramp profile.
///
/// - Below target, new VUs are spawned on the next tick.
/// - Above target, the most recently spawned VUs are asked to retire. They finish
///   their current iteration first; after `graceful_ramp_down` they are aborted and
///   that iteration is counted as interrupted, its observations discarded.
/// - A VU whose unit returns an error (or panics) is gone; the next tick replaces it
///   if the target still calls for it.
#[derive(Debug, TypedBuilder)]
pub struct RampingExecutor {
    pub scenario: ScenarioConfig,
    /// Resolution of the control loop.
    #[builder(default = Duration::from_millis(100))]
    pub tick: Duration,
}

impl RampingExecutor {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scenario.stages.is_empty() {
            return Err(ConfigError::EmptyProfile(self.scenario.name.clone()));
        }
        if self.tick.is_zero() {
            return Err(ConfigError::ZeroTick(self.tick));
        }
        Ok(())
    }
}

impl Executor for RampingExecutor {
    type Error = ConfigError;

    async fn exec(&self, mut ctx: ExecutionContext) -> Result<ScenarioOutcome, ConfigError> {
        self.validate()?;
        let scenario = &self.scenario;
        let schedule = Schedule::new(scenario.start_vus, scenario.stages.clone());
        let mut pool = VuPool::new(
            Arc::from(scenario.name.as_str()),
            scenario.unit.clone(),
            Arc::clone(&ctx.registry),
            Arc::clone(&ctx.progress),
        );

        tracing::info!(
            "Starting scenario {}: {} stages over {:?}, up to {} VUs",
            scenario.name,
            scenario.stages.len(),
            schedule.total_duration(),
            scenario.max_vus()
        );
        let started = Instant::now();
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stopping = false;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = ctx.aborted(), if !stopping => {
                    tracing::info!(
                        "Scenario {}: abort requested, retiring {} VUs",
                        scenario.name,
                        pool.len()
                    );
                    stopping = true;
                }
            }

            let now = Instant::now();
            let target = if stopping {
                0
            } else {
                match schedule.target_at(now.duration_since(started)) {
                    Some(target) => target,
                    None => {
                        tracing::info!(
                            "Scenario {}: profile complete, ramping down {} VUs",
                            scenario.name,
                            pool.len()
                        );
                        stopping = true;
                        0
                    }
                }
            };

            pool.reap().await;
            pool.scale_to(target, now);
            let interrupted = pool.enforce_grace(scenario.graceful_ramp_down, now);
            if interrupted > 0 {
                tracing::warn!(
                    "Scenario {}: {interrupted} VUs exceeded the {:?} graceful ramp-down and were stopped",
                    scenario.name,
                    scenario.graceful_ramp_down
                );
            }
            ctx.progress.set_vus(pool.len() as u64, target);

            if stopping && pool.is_empty() {
                break;
            }
        }

        let outcome = ctx.progress.snapshot();
        tracing::info!(
            "Done running scenario {}: {} iterations, {} interrupted",
            scenario.name,
            outcome.iterations,
            outcome.interrupted_iterations
        );
        Ok(outcome)
    }
}

#[cfg(feature = "internals")]
pub use internals::*;

/// Internal components for the `RampingExecutor`.
/// Encapsulated in a module to allow conditional exposure via `#[cfg(feature = "internals")]`.
mod internals {
    use super::*;

    /// A ramp profile anchored at `start_vus`.
    #[derive(Clone, Debug)]
    pub struct Schedule {
        start_vus: u64,
        stages: Vec<Stage>,
    }

    impl Schedule {
        pub fn new(start_vus: u64, stages: Vec<Stage>) -> Self {
            Self { start_vus, stages }
        }

        pub fn total_duration(&self) -> Duration {
            self.stages.iter().map(|s| s.duration).sum()
        }

        /// Target VU count `elapsed` into the profile, or `None` once every stage has
        /// elapsed.
        pub fn target_at(&self, elapsed: Duration) -> Option<u64> {
            let mut stage_start = Duration::ZERO;
            let mut prev = self.start_vus;

            for stage in &self.stages {
                let stage_end = stage_start + stage.duration;
                if elapsed < stage_end {
                    let progress = (elapsed - stage_start).as_secs_f64()
                        / stage.duration.as_secs_f64();
                    return Some(interpolate(prev, stage.target, progress));
                }
                stage_start = stage_end;
                prev = stage.target;
            }
            None
        }
    }

    /// Pure linear interpolation between two VU counts, floored to a whole VU.
    pub fn interpolate(from: u64, to: u64, progress: f64) -> u64 {
        let progress = progress.clamp(0.0, 1.0);
        let value = from as f64 + (to as f64 - from as f64) * progress;
        // absorb representation error so 2.9999999999999996 still counts as 3
        (value + 1e-9).floor().max(0.0) as u64
    }

    pub struct VuSlot {
        pub id: u64,
        retire: Arc<AtomicBool>,
        retiring_since: Option<Instant>,
        handle: JoinHandle<Result<(), ScenarioError>>,
    }

    impl VuSlot {
        pub fn is_retiring(&self) -> bool {
            self.retiring_since.is_some()
        }

        fn retire(&mut self, now: Instant) {
            self.retire.store(true, Ordering::Release);
            self.retiring_since = Some(now);
        }

        fn reactivate(&mut self) {
            self.retire.store(false, Ordering::Release);
            self.retiring_since = None;
        }
    }

    /// The live VUs of one scenario, in spawn order.
    ///
    /// Dropping the pool aborts every VU still in it, so no VU outlives its executor.
    pub struct VuPool {
        scenario: Arc<str>,
        unit: ScenarioUnit,
        registry: Arc<MetricsRegistry>,
        progress: Arc<ScenarioProgress>,
        slots: Vec<VuSlot>,
        next_id: u64,
    }

    impl VuPool {
        pub fn new(
            scenario: Arc<str>,
            unit: ScenarioUnit,
            registry: Arc<MetricsRegistry>,
            progress: Arc<ScenarioProgress>,
        ) -> Self {
            Self {
                scenario,
                unit,
                registry,
                progress,
                slots: Vec::new(),
                next_id: 0,
            }
        }

        pub fn len(&self) -> usize {
            self.slots.len()
        }

        pub fn is_empty(&self) -> bool {
            self.slots.is_empty()
        }

        /// VUs not asked to retire.
        pub fn active(&self) -> u64 {
            self.slots.iter().filter(|s| !s.is_retiring()).count() as u64
        }

        pub fn spawn(&mut self) {
            self.next_id += 1;
            let id = self.next_id;
            let retire = Arc::new(AtomicBool::new(false));
            let handle = tokio::spawn(vu_task(
                id,
                Arc::clone(&self.scenario),
                self.unit.clone(),
                Arc::clone(&self.registry),
                Arc::clone(&self.progress),
                Arc::clone(&retire),
            ));
            self.slots.push(VuSlot {
                id,
                retire,
                retiring_since: None,
                handle,
            });
        }

        /// Removes VUs whose task has ended, logging failures. Returns how many ended.
        pub async fn reap(&mut self) -> usize {
            let (finished, running): (Vec<_>, Vec<_>) = std::mem::take(&mut self.slots)
                .into_iter()
                .partition(|s| s.handle.is_finished());
            self.slots = running;

            let reaped = finished.len();
            for slot in finished {
                match slot.handle.await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        tracing::error!("VU {} of {} failed: {err}", slot.id, self.scenario);
                        self.progress.vu_failed();
                    }
                    Err(err) if err.is_cancelled() => {}
                    Err(err) => {
                        tracing::error!("VU {} of {} panicked: {err}", slot.id, self.scenario);
                        self.progress.vu_failed();
                    }
                }
            }
            reaped
        }

        /// Spawns or retires VUs so that `target` of them are active.
        ///
        /// Retiring VUs still in the pool are taken back, oldest first, before any new
        /// VU is spawned, so the pool never holds more VUs than the highest target.
        pub fn scale_to(&mut self, target: u64, now: Instant) {
            let active = self.active();
            if active < target {
                let mut missing = target - active;
                for slot in self.slots.iter_mut() {
                    if missing == 0 {
                        break;
                    }
                    if slot.is_retiring() && !slot.handle.is_finished() {
                        slot.reactivate();
                        missing -= 1;
                    }
                }
                for _ in 0..missing {
                    self.spawn();
                }
            } else if active > target {
                let mut excess = active - target;
                // newest first
                for slot in self.slots.iter_mut().rev() {
                    if excess == 0 {
                        break;
                    }
                    if !slot.is_retiring() {
                        slot.retire(now);
                        excess -= 1;
                    }
                }
            }
        }

        /// Aborts retiring VUs that are still running after `grace`. Returns how many.
        pub fn enforce_grace(&mut self, grace: Duration, now: Instant) -> u64 {
            let (overdue, keep): (Vec<_>, Vec<_>) = std::mem::take(&mut self.slots)
                .into_iter()
                .partition(|s| {
                    s.retiring_since
                        .is_some_and(|since| now.duration_since(since) >= grace)
                        && !s.handle.is_finished()
                });
            self.slots = keep;

            for slot in &overdue {
                tracing::debug!("Stopping VU {} of {} mid-iteration", slot.id, self.scenario);
                slot.handle.abort();
            }
            let interrupted = overdue.len() as u64;
            if interrupted > 0 {
                self.progress.iterations_interrupted(interrupted);
            }
            interrupted
        }
    }

    impl Drop for VuPool {
        fn drop(&mut self) {
            for slot in &self.slots {
                slot.handle.abort();
            }
        }
    }

    /// Body of a VU task: iterate until asked to retire.
    pub async fn vu_task(
        id: u64,
        scenario: Arc<str>,
        unit: ScenarioUnit,
        registry: Arc<MetricsRegistry>,
        progress: Arc<ScenarioProgress>,
        retire: Arc<AtomicBool>,
    ) -> Result<(), ScenarioError> {
        let mut vu = Vu::new(id, scenario, registry);
        tracing::debug!("VU {id} of {} started", vu.scenario());

        while !retire.load(Ordering::Acquire) {
            vu.begin_iteration();
            let timer = Timer::start();
            if let Err(err) = unit.iteration(&mut vu).await {
                vu.abandon_iteration();
                return Err(err);
            }
            vu.complete_iteration(timer.elapsed());
            progress.iteration_completed();
            // a unit that never awaits must not starve the control loop
            tokio::task::yield_now().await;
        }

        tracing::debug!(
            "VU {id} of {} retired after {} iterations",
            vu.scenario(),
            vu.iteration()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Scenario;
    use crate::metric::MetricSnapshot;
    use std::sync::atomic::AtomicU64;

    /// One-second iterations, the way paced scenario scripts behave.
    struct Paced;

    impl Scenario for Paced {
        async fn iteration(&self, vu: &mut Vu) -> Result<(), ScenarioError> {
            vu.sleep(Duration::from_secs(1)).await;
            vu.rate("paced_fails", false);
            Ok(())
        }
    }

    /// Fails on the very first call across all VUs, then behaves like `Paced`.
    #[derive(Default)]
    struct FailsOnce {
        calls: AtomicU64,
    }

    impl Scenario for FailsOnce {
        async fn iteration(&self, vu: &mut Vu) -> Result<(), ScenarioError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(ScenarioError::other("connection refused"));
            }
            vu.sleep(Duration::from_secs(1)).await;
            Ok(())
        }
    }

    /// Panics on the very first call across all VUs, then behaves like `Paced`.
    #[derive(Default)]
    struct PanicsOnce {
        calls: AtomicU64,
    }

    impl Scenario for PanicsOnce {
        async fn iteration(&self, vu: &mut Vu) -> Result<(), ScenarioError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("unit bug");
            }
            vu.sleep(Duration::from_secs(1)).await;
            Ok(())
        }
    }

    /// Ten-second iterations, long enough to still be running after a quick ramp-down.
    struct Slow;

    impl Scenario for Slow {
        async fn iteration(&self, vu: &mut Vu) -> Result<(), ScenarioError> {
            vu.sleep(Duration::from_secs(10)).await;
            Ok(())
        }
    }

    /// Records an observation and then never finishes.
    struct Stuck;

    impl Scenario for Stuck {
        async fn iteration(&self, vu: &mut Vu) -> Result<(), ScenarioError> {
            vu.rate("stuck_seen", true);
            vu.sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    fn executor(
        scenario: impl Scenario,
        start_vus: u64,
        stages: Vec<Stage>,
        grace: Duration,
    ) -> RampingExecutor {
        RampingExecutor::builder()
            .scenario(
                ScenarioConfig::builder()
                    .name("test")
                    .start_vus(start_vus)
                    .stages(stages)
                    .graceful_ramp_down(grace)
                    .unit(ScenarioUnit::new(scenario))
                    .build(),
            )
            .build()
    }

    fn context() -> (
        ExecutionContext,
        tokio::sync::watch::Sender<bool>,
        Arc<MetricsRegistry>,
        Arc<ScenarioProgress>,
    ) {
        let registry = Arc::new(MetricsRegistry::with_builtins());
        let progress = Arc::new(ScenarioProgress::new());
        let (ctx, abort) = ExecutionContext::new(Arc::clone(&registry), Arc::clone(&progress));
        (ctx, abort, registry, progress)
    }

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[tokio::test(start_paused = true)]
    async fn live_vus_follow_the_profile() {
        let (ctx, _abort, registry, progress) = context();
        let executor = executor(
            Paced,
            0,
            vec![
                Stage::new(secs(30), 50),
                Stage::new(secs(60), 50),
                Stage::new(secs(30), 0),
            ],
            secs(30),
        );

        let start = Instant::now();
        let handle = tokio::spawn(async move { executor.exec(ctx).await });

        tokio::time::sleep_until(start + Duration::from_millis(15_050)).await;
        let ramping_up = progress.live_vus();
        assert!((24..=26).contains(&ramping_up), "{ramping_up} VUs at 15s");

        tokio::time::sleep_until(start + secs(60)).await;
        assert_eq!(progress.live_vus(), 50);

        tokio::time::sleep_until(start + Duration::from_millis(95_050)).await;
        let early_ramp_down = progress.live_vus();
        tokio::time::sleep_until(start + Duration::from_millis(105_050)).await;
        let late_ramp_down = progress.live_vus();
        assert!(early_ramp_down < 50, "{early_ramp_down} VUs at 95s");
        assert!(
            late_ramp_down < early_ramp_down,
            "{late_ramp_down} VUs at 105s, {early_ramp_down} at 95s"
        );

        tokio::time::sleep_until(start + secs(150)).await;
        assert_eq!(progress.live_vus(), 0);
        assert!(handle.is_finished());

        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome.peak_vus, 50);
        assert_eq!(outcome.interrupted_iterations, 0);
        assert_eq!(outcome.vu_failures, 0);
        match registry.snapshot().get("paced_fails") {
            Some(MetricSnapshot::Rate(rate)) => assert_eq!(rate.total, outcome.iterations),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_vu_is_replaced() {
        let (ctx, _abort, _registry, progress) = context();
        let executor = executor(
            FailsOnce::default(),
            2,
            vec![Stage::new(secs(5), 2)],
            secs(1),
        );

        let start = Instant::now();
        let handle = tokio::spawn(async move { executor.exec(ctx).await });

        tokio::time::sleep_until(start + Duration::from_millis(2_050)).await;
        assert_eq!(progress.live_vus(), 2);

        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome.vu_failures, 1);
        assert!(outcome.iterations >= 6, "{} iterations", outcome.iterations);
    }

    #[tokio::test(start_paused = true)]
    async fn panicked_vu_is_replaced() {
        let (ctx, _abort, _registry, progress) = context();
        let executor = executor(
            PanicsOnce::default(),
            2,
            vec![Stage::new(secs(5), 2)],
            secs(1),
        );

        let start = Instant::now();
        let handle = tokio::spawn(async move { executor.exec(ctx).await });

        tokio::time::sleep_until(start + Duration::from_millis(2_050)).await;
        assert_eq!(progress.live_vus(), 2);

        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome.vu_failures, 1);
        assert_eq!(outcome.peak_vus, 2);
        assert!(outcome.iterations >= 6, "{} iterations", outcome.iterations);
    }

    #[tokio::test(start_paused = true)]
    async fn ramping_back_up_reuses_retiring_vus() {
        let (ctx, _abort, _registry, progress) = context();
        let executor = executor(
            Slow,
            10,
            vec![
                Stage::new(secs(2), 10),
                Stage::new(secs(2), 0),
                Stage::new(secs(2), 10),
                Stage::new(secs(20), 10),
            ],
            secs(30),
        );

        let start = Instant::now();
        let handle = tokio::spawn(async move { executor.exec(ctx).await });

        // every first iteration is still running, so retired VUs stay in the pool
        tokio::time::sleep_until(start + Duration::from_millis(4_050)).await;
        assert_eq!(progress.live_vus(), 10);

        for ms in (4_550..26_000).step_by(500) {
            tokio::time::sleep_until(start + Duration::from_millis(ms)).await;
            let live = progress.live_vus();
            assert!(live <= 10, "{live} VUs at {ms}ms");
            if ms == 6_050 {
                assert_eq!(live, 10);
            }
        }

        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome.peak_vus, 10);
        assert_eq!(outcome.interrupted_iterations, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn overdue_iteration_is_discarded() {
        let (ctx, _abort, registry, _progress) = context();
        let executor = executor(Stuck, 1, vec![Stage::new(secs(1), 1)], secs(2));

        let start = Instant::now();
        let outcome = executor.exec(ctx).await.unwrap();

        assert!(start.elapsed() < secs(4), "took {:?}", start.elapsed());
        assert_eq!(outcome.interrupted_iterations, 1);
        assert_eq!(outcome.iterations, 0);
        assert!(registry.snapshot().get("stuck_seen").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn abort_retires_every_vu() {
        let (ctx, abort, _registry, progress) = context();
        let executor = executor(Paced, 10, vec![Stage::new(secs(3600), 10)], secs(30));

        let start = Instant::now();
        let handle = tokio::spawn(async move { executor.exec(ctx).await });

        tokio::time::sleep(secs(5)).await;
        assert_eq!(progress.live_vus(), 10);
        abort.send(true).unwrap();

        let outcome = handle.await.unwrap().unwrap();
        assert!(start.elapsed() < secs(7), "took {:?}", start.elapsed());
        assert_eq!(outcome.interrupted_iterations, 0);
        assert_eq!(progress.live_vus(), 0);
    }

    #[tokio::test]
    async fn empty_profile_is_rejected() {
        let (ctx, _abort, _registry, _progress) = context();
        let err = executor(Paced, 0, vec![], secs(1)).exec(ctx).await.unwrap_err();
        assert!(matches!(err, ConfigError::EmptyProfile(name) if name == "test"));
    }

    mod target_at {
        use super::*;

        fn profile() -> Schedule {
            Schedule::new(
                0,
                vec![
                    Stage::new(secs(30), 50),
                    Stage::new(secs(60), 50),
                    Stage::new(secs(30), 0),
                ],
            )
        }

        #[test]
        fn ramp_up() {
            let schedule = profile();
            for s in 0..30 {
                let expected = (s * 50) / 30;
                assert_eq!(schedule.target_at(secs(s)), Some(expected), "at {s}s");
            }
            assert_eq!(schedule.target_at(secs(15)), Some(25));
        }

        #[test]
        fn hold_steady() {
            let schedule = profile();
            for s in 30..90 {
                assert_eq!(schedule.target_at(secs(s)), Some(50));
            }
        }

        #[test]
        fn ramp_down() {
            let schedule = profile();
            let mut last = 51;
            for s in 90..120 {
                let target = schedule.target_at(secs(s)).unwrap();
                assert!(target < last, "{target} at {s}s");
                last = target;
            }
            assert_eq!(schedule.target_at(Duration::from_millis(119_999)), Some(0));
        }

        #[test]
        fn finished_after_last_stage() {
            let schedule = profile();
            assert_eq!(schedule.total_duration(), secs(120));
            assert_eq!(schedule.target_at(secs(120)), None);
            assert_eq!(schedule.target_at(secs(500)), None);
        }

        #[test]
        fn zero_duration_stage_jumps() {
            let schedule = Schedule::new(
                0,
                vec![Stage::new(Duration::ZERO, 40), Stage::new(secs(10), 40)],
            );
            assert_eq!(schedule.target_at(Duration::ZERO), Some(40));
            assert_eq!(schedule.target_at(secs(5)), Some(40));
        }

        #[test]
        fn start_vus_is_the_initial_level() {
            let schedule = Schedule::new(10, vec![Stage::new(secs(10), 20)]);
            assert_eq!(schedule.target_at(Duration::ZERO), Some(10));
            assert_eq!(schedule.target_at(secs(5)), Some(15));
        }

        #[test]
        fn interpolation_absorbs_float_error() {
            assert_eq!(interpolate(0, 10, 0.3), 3);
            assert_eq!(interpolate(10, 0, 0.7), 3);
            assert_eq!(interpolate(5, 5, 0.42), 5);
            assert_eq!(interpolate(0, 10, 7.0), 10);
        }
    }
}
