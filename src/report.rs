use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

use crate::error::ReportError;
use crate::metric::{MetricSnapshot, RateSnapshot, TrendSnapshot};
use crate::orchestrator::AbortReason;
use crate::progress::ScenarioOutcome;
use crate::registry::MetricsSnapshot;
use crate::threshold::{ThresholdVerdict, Verdict, all_passed};

/// The final outcome of a run.
#[derive(Serialize, Debug, Clone)]
pub struct RunResult {
    /// `true` only if the run was not aborted and every threshold passed.
    pub passed: bool,
    #[serde(rename = "duration_ms", serialize_with = "as_millis")]
    pub duration: Duration,
    pub aborted: Option<AbortReason>,
    pub scenarios: Vec<ScenarioReport>,
    pub metrics: BTreeMap<String, MetricSummary>,
    pub thresholds: Vec<ThresholdVerdict>,
    /// Every metric as frozen at the end of the run.
    #[serde(skip)]
    pub snapshot: MetricsSnapshot,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ScenarioReport {
    pub name: String,
    #[serde(flatten)]
    pub outcome: ScenarioOutcome,
}

/// The headline statistics of one metric.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetricSummary {
    Rate {
        rate: f64,
        passes: u64,
        fails: u64,
    },
    Trend {
        count: u64,
        avg: f64,
        min: f64,
        med: f64,
        max: f64,
        p90: f64,
        p95: f64,
        p99: f64,
    },
}

impl From<&RateSnapshot> for MetricSummary {
    fn from(rate: &RateSnapshot) -> Self {
        MetricSummary::Rate {
            rate: rate.value(),
            passes: rate.trues,
            fails: rate.total - rate.trues,
        }
    }
}

impl From<&TrendSnapshot> for MetricSummary {
    fn from(trend: &TrendSnapshot) -> Self {
        MetricSummary::Trend {
            count: trend.count(),
            avg: trend.avg(),
            min: trend.min(),
            med: trend.med(),
            max: trend.max(),
            p90: trend.percentile(90.0),
            p95: trend.percentile(95.0),
            p99: trend.percentile(99.0),
        }
    }
}

impl From<&MetricSnapshot> for MetricSummary {
    fn from(snapshot: &MetricSnapshot) -> Self {
        match snapshot {
            MetricSnapshot::Rate(rate) => rate.into(),
            MetricSnapshot::Trend(trend) => trend.into(),
        }
    }
}

impl fmt::Display for MetricSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricSummary::Rate {
                rate,
                passes,
                fails,
            } => write!(
                f,
                "{:.2}% ({passes} of {})",
                rate * 100.0,
                passes + fails
            ),
            MetricSummary::Trend {
                avg,
                min,
                med,
                max,
                p90,
                p95,
                ..
            } => write!(
                f,
                "avg={avg:.2} min={min:.2} med={med:.2} max={max:.2} p(90)={p90:.2} p(95)={p95:.2}"
            ),
        }
    }
}

impl RunResult {
    pub fn new(
        duration: Duration,
        aborted: Option<AbortReason>,
        scenarios: Vec<(String, ScenarioOutcome)>,
        snapshot: MetricsSnapshot,
        thresholds: Vec<ThresholdVerdict>,
    ) -> Self {
        Self {
            passed: aborted.is_none() && all_passed(&thresholds),
            duration,
            aborted,
            scenarios: scenarios
                .into_iter()
                .map(|(name, outcome)| ScenarioReport { name, outcome })
                .collect(),
            metrics: snapshot
                .iter()
                .map(|(name, metric)| (name.clone(), metric.into()))
                .collect(),
            thresholds,
            snapshot,
        }
    }

    /// 0 when the run passed, 1 when a threshold failed or the run was aborted.
    pub fn exit_code(&self) -> u8 {
        if self.passed { 0 } else { 1 }
    }

    /// Thresholds that did not pass.
    pub fn failed_thresholds(&self) -> impl Iterator<Item = &ThresholdVerdict> {
        self.thresholds.iter().filter(|t| !t.verdict.is_pass())
    }
}

impl fmt::Display for RunResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "scenarios:")?;
        for s in &self.scenarios {
            writeln!(
                f,
                "  {}: {} iterations, {} interrupted, peak {} VUs, {} VU failures",
                s.name,
                s.outcome.iterations,
                s.outcome.interrupted_iterations,
                s.outcome.peak_vus,
                s.outcome.vu_failures
            )?;
        }

        writeln!(f, "metrics:")?;
        for (name, summary) in &self.metrics {
            writeln!(f, "  {name:.<28}: {summary}")?;
        }

        if !self.thresholds.is_empty() {
            writeln!(f, "thresholds:")?;
            for verdict in &self.thresholds {
                writeln!(f, "  {verdict}")?;
            }
        }

        let status = if self.passed { "PASSED" } else { "FAILED" };
        write!(f, "result: {status} in {:.1}s", self.duration.as_secs_f64())?;
        if let Some(reason) = &self.aborted {
            write!(f, " (aborted: {reason})")?;
        }
        Ok(())
    }
}

fn as_millis<S: serde::Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64() * 1000.0)
}

/// Publishes a finished run somewhere.
pub trait Reporter {
    fn report(&self, result: &RunResult) -> impl Future<Output = Result<(), ReportError>> + Send;
}

/// Prints the human readable summary, and each failed threshold once more at the end.
pub struct StdoutReporter;

impl Reporter for StdoutReporter {
    async fn report(&self, result: &RunResult) -> Result<(), ReportError> {
        println!("{result}");
        for verdict in result.failed_thresholds() {
            if let Verdict::Fail { observed } = verdict.verdict {
                println!(
                    "threshold crossed: {} {} (observed {observed:.4})",
                    verdict.metric, verdict.threshold
                );
            }
        }
        Ok(())
    }
}

/// Writes the run result as pretty-printed JSON.
#[derive(Debug, Clone)]
pub struct JsonReporter {
    path: PathBuf,
}

impl JsonReporter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Reporter for JsonReporter {
    async fn report(&self, result: &RunResult) -> Result<(), ReportError> {
        let json = serde_json::to_vec_pretty(result)?;
        tokio::fs::write(&self.path, json).await?;
        tracing::info!("Wrote run summary to {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MetricsRegistry;

    fn result(aborted: Option<AbortReason>, verdicts: Vec<Verdict>) -> RunResult {
        let registry = MetricsRegistry::new();
        registry.rate("purchase_fails").unwrap().add_many(&[true, false, false, false]);
        registry.trend("purchase_latency").unwrap().add_many(&[10.0, 20.0, 30.0]);

        let thresholds = verdicts
            .into_iter()
            .map(|verdict| ThresholdVerdict {
                metric: "purchase_fails".into(),
                threshold: "rate<0.1".into(),
                abort_on_fail: false,
                verdict,
            })
            .collect();
        RunResult::new(
            Duration::from_millis(1500),
            aborted,
            vec![(
                "purchase_test".into(),
                ScenarioOutcome {
                    iterations: 4,
                    interrupted_iterations: 0,
                    peak_vus: 2,
                    vu_failures: 0,
                },
            )],
            registry.snapshot(),
            thresholds,
        )
    }

    #[test]
    fn passes_without_thresholds() {
        let result = result(None, vec![]);
        assert!(result.passed);
        assert_eq!(result.exit_code(), 0);
    }

    #[test]
    fn failing_threshold_or_abort_fails() {
        let failed = result(None, vec![Verdict::Fail { observed: 0.25 }]);
        assert!(!failed.passed);
        assert_eq!(failed.exit_code(), 1);
        assert_eq!(failed.failed_thresholds().count(), 1);

        let aborted = result(Some(AbortReason::Signal), vec![Verdict::Pass { observed: 0.0 }]);
        assert!(!aborted.passed);
        assert_eq!(aborted.exit_code(), 1);
    }

    #[test]
    fn summarizes_metrics() {
        let result = result(None, vec![]);
        assert_eq!(
            result.metrics["purchase_fails"],
            MetricSummary::Rate {
                rate: 0.25,
                passes: 1,
                fails: 3
            }
        );
        match &result.metrics["purchase_latency"] {
            MetricSummary::Trend {
                count, avg, med, ..
            } => {
                assert_eq!(*count, 3);
                assert_eq!(*avg, 20.0);
                assert_eq!(*med, 20.0);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn serializes_to_json() {
        let result = result(Some(AbortReason::Signal), vec![Verdict::Fail { observed: 0.25 }]);
        let json = serde_json::to_value(&result).unwrap();

        assert_eq!(json["passed"], false);
        assert_eq!(json["duration_ms"], 1500.0);
        assert_eq!(json["aborted"]["reason"], "signal");
        assert_eq!(json["scenarios"][0]["name"], "purchase_test");
        assert_eq!(json["scenarios"][0]["iterations"], 4);
        assert_eq!(json["metrics"]["purchase_fails"]["type"], "rate");
        assert_eq!(json["thresholds"][0]["verdict"], "fail");
        assert_eq!(json["thresholds"][0]["observed"], 0.25);
        assert!(json.get("snapshot").is_none());
    }

    #[test]
    fn display_ends_with_the_verdict() {
        let text = result(None, vec![Verdict::Fail { observed: 0.25 }]).to_string();
        assert!(text.contains("purchase_test: 4 iterations"));
        assert!(text.contains("FAIL purchase_fails: rate<0.1"));
        assert!(text.ends_with("result: FAILED in 1.5s"), "{text}");
    }

    #[tokio::test]
    async fn json_reporter_writes_the_file() {
        let path =
            std::env::temp_dir().join(format!("rampload-report-{}.json", std::process::id()));
        JsonReporter::new(&path)
            .report(&result(None, vec![]))
            .await
            .unwrap();

        let written: serde_json::Value =
            serde_json::from_slice(&tokio::fs::read(&path).await.unwrap()).unwrap();
        assert_eq!(written["passed"], true);
        tokio::fs::remove_file(&path).await.unwrap();
    }
}
