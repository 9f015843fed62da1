//! Monotonic timing used for latency measurement.
//!
//! Everything is built on [`tokio::time::Instant`], so tests running with a paused
//! Tokio clock observe exact, deterministic durations.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

/// A running stopwatch.
#[derive(Debug, Clone, Copy)]
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn started_at(&self) -> Instant {
        self.start
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Elapsed time in fractional milliseconds, the unit trend metrics use for latencies.
    pub fn elapsed_ms(&self) -> f64 {
        millis(self.elapsed())
    }
}

/// Converts a duration into fractional milliseconds.
pub fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

/// Awaits `fut` and returns its output together with how long it took.
pub async fn timed<F: Future>(fut: F) -> (F::Output, Duration) {
    let timer = Timer::start();
    let output = fut.await;
    (output, timer.elapsed())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn timer_measures_paused_sleep_exactly() {
        let timer = Timer::start();
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(timer.elapsed(), Duration::from_millis(250));
        assert_eq!(timer.elapsed_ms(), 250.0);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_returns_output_and_duration() {
        let (value, took) = timed(async {
            tokio::time::sleep(Duration::from_secs(2)).await;
            7
        })
        .await;
        assert_eq!(value, 7);
        assert_eq!(took, Duration::from_secs(2));
    }

    #[test]
    fn millis_is_fractional() {
        assert_eq!(millis(Duration::from_millis(1500)), 1500.0);
        assert_eq!(millis(Duration::from_micros(500)), 0.5);
    }
}
