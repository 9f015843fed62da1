//! Pass/fail criteria over aggregated metrics.
//!
//! A threshold is written `<aggregation><operator><number>`, e.g. `p(95)<500` or
//! `rate<0.05`, and attached to a metric by name. Expressions are parsed once, when the
//! run is configured; evaluation against a [`MetricsSnapshot`] is pure.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::error::ConfigError;
use crate::metric::{MetricKind, MetricSnapshot, TrendStat};
use crate::registry::MetricsSnapshot;

/// The statistic a threshold compares.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Aggregation {
    /// Fraction of `true` observations on a rate metric.
    Rate,
    /// A statistic of a trend metric.
    Trend(TrendStat),
}

impl Aggregation {
    pub fn applies_to(&self, kind: MetricKind) -> bool {
        matches!(
            (self, kind),
            (Aggregation::Rate, MetricKind::Rate) | (Aggregation::Trend(_), MetricKind::Trend)
        )
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Aggregation::Rate => f.write_str("rate"),
            Aggregation::Trend(stat) => stat.fmt(f),
        }
    }
}

impl FromStr for Aggregation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let stat = match s {
            "rate" => return Ok(Aggregation::Rate),
            "avg" => TrendStat::Avg,
            "min" => TrendStat::Min,
            "max" => TrendStat::Max,
            "med" => TrendStat::Med,
            "count" => TrendStat::Count,
            _ => {
                let q = s
                    .strip_prefix("p(")
                    .and_then(|rest| rest.strip_suffix(')'))
                    .ok_or_else(|| format!("unknown aggregation `{s}`"))?;
                let q: f64 = q
                    .trim()
                    .parse::<f64>()
                    .map_err(|_| format!("invalid percentile `{q}`"))?;
                if !(0.0..=100.0).contains(&q) {
                    return Err(format!("percentile {q} is outside 0..=100"));
                }
                TrendStat::Percentile(q)
            }
        };
        Ok(Aggregation::Trend(stat))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
}

impl Comparison {
    pub fn symbol(&self) -> &'static str {
        match self {
            Comparison::Lt => "<",
            Comparison::Le => "<=",
            Comparison::Gt => ">",
            Comparison::Ge => ">=",
            Comparison::Eq => "==",
        }
    }

    pub fn holds(&self, observed: f64, bound: f64) -> bool {
        match self {
            Comparison::Lt => observed < bound,
            Comparison::Le => observed <= bound,
            Comparison::Gt => observed > bound,
            Comparison::Ge => observed >= bound,
            Comparison::Eq => observed == bound,
        }
    }
}

/// A parsed threshold expression.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdExpr {
    pub aggregation: Aggregation,
    pub comparison: Comparison,
    pub bound: f64,
}

impl FromStr for ThresholdExpr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let compact: String = s.chars().filter(|c| !c.is_whitespace()).collect();
        let at = compact
            .find(['<', '>', '='])
            .ok_or_else(|| "missing comparison operator".to_string())?;
        let (aggregation, rest) = compact.split_at(at);

        let (comparison, bound) = [
            ("<=", Comparison::Le),
            (">=", Comparison::Ge),
            ("==", Comparison::Eq),
            ("<", Comparison::Lt),
            (">", Comparison::Gt),
        ]
        .into_iter()
        .find_map(|(symbol, comparison)| rest.strip_prefix(symbol).map(|b| (comparison, b)))
        .ok_or_else(|| format!("unknown operator in `{rest}`"))?;

        let bound: f64 = bound
            .parse::<f64>()
            .map_err(|_| format!("invalid bound `{bound}`"))?;
        if !bound.is_finite() {
            return Err(format!("bound `{bound}` is not finite"));
        }

        Ok(Self {
            aggregation: aggregation.parse::<Aggregation>()?,
            comparison,
            bound,
        })
    }
}

impl fmt::Display for ThresholdExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.aggregation, self.comparison.symbol(), self.bound)
    }
}

/// A threshold attached to a metric.
#[derive(Debug, Clone, PartialEq)]
pub struct Threshold {
    pub metric: String,
    pub expr: ThresholdExpr,
    /// The expression as written in the configuration.
    pub source: String,
    /// Abort the run as soon as a periodic evaluation fails.
    pub abort_on_fail: bool,
}

impl Threshold {
    pub fn parse(
        metric: impl Into<String>,
        expression: &str,
        abort_on_fail: bool,
    ) -> Result<Self, ConfigError> {
        let metric = metric.into();
        let expr = expression
            .parse::<ThresholdExpr>()
            .map_err(|reason| ConfigError::InvalidThreshold {
                metric: metric.clone(),
                expression: expression.to_string(),
                reason,
            })?;
        Ok(Self {
            metric,
            expr,
            source: expression.trim().to_string(),
            abort_on_fail,
        })
    }

    /// Checks that the threshold can be evaluated against a metric of `kind`.
    pub fn check_kind(&self, kind: Option<MetricKind>) -> Result<(), ConfigError> {
        match kind {
            None => Err(ConfigError::UnknownMetric(self.metric.clone())),
            Some(kind) if !self.expr.aggregation.applies_to(kind) => {
                Err(ConfigError::AggregationMismatch {
                    metric: self.metric.clone(),
                    expression: self.source.clone(),
                    kind,
                })
            }
            Some(_) => Ok(()),
        }
    }

    pub fn evaluate(&self, snapshot: &MetricsSnapshot) -> Verdict {
        let observed = match (snapshot.get(&self.metric), self.expr.aggregation) {
            (None, _) => {
                return Verdict::Indeterminate {
                    reason: format!("metric `{}` was never registered", self.metric),
                };
            }
            (Some(MetricSnapshot::Rate(rate)), Aggregation::Rate) => rate.value(),
            (Some(MetricSnapshot::Trend(trend)), Aggregation::Trend(stat)) => trend.stat(stat),
            (Some(metric), aggregation) => {
                return Verdict::Indeterminate {
                    reason: format!("`{aggregation}` does not apply to a {} metric", metric.kind()),
                };
            }
        };

        if self.expr.comparison.holds(observed, self.expr.bound) {
            Verdict::Pass { observed }
        } else {
            Verdict::Fail { observed }
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "verdict", rename_all = "lowercase")]
pub enum Verdict {
    Pass { observed: f64 },
    Fail { observed: f64 },
    Indeterminate { reason: String },
}

impl Verdict {
    pub fn is_pass(&self) -> bool {
        matches!(self, Verdict::Pass { .. })
    }
}

/// The outcome of one threshold.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ThresholdVerdict {
    pub metric: String,
    pub threshold: String,
    pub abort_on_fail: bool,
    #[serde(flatten)]
    pub verdict: Verdict,
}

impl fmt::Display for ThresholdVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.verdict {
            Verdict::Pass { observed } => write!(
                f,
                "PASS {}: {} (observed {observed:.4})",
                self.metric, self.threshold
            ),
            Verdict::Fail { observed } => write!(
                f,
                "FAIL {}: {} (observed {observed:.4})",
                self.metric, self.threshold
            ),
            Verdict::Indeterminate { reason } => {
                write!(f, "???? {}: {} ({reason})", self.metric, self.threshold)
            }
        }
    }
}

/// Evaluates every threshold against the same snapshot.
pub fn evaluate(thresholds: &[Threshold], snapshot: &MetricsSnapshot) -> Vec<ThresholdVerdict> {
    thresholds
        .iter()
        .map(|threshold| ThresholdVerdict {
            metric: threshold.metric.clone(),
            threshold: threshold.source.clone(),
            abort_on_fail: threshold.abort_on_fail,
            verdict: threshold.evaluate(snapshot),
        })
        .collect()
}

/// `true` when every verdict passed. An empty set passes.
pub fn all_passed(verdicts: &[ThresholdVerdict]) -> bool {
    verdicts.iter().all(|v| v.verdict.is_pass())
}
