//! Declarative run configuration.
//!
//! A run is described in JSON using the same shape and key names as k6 `options`:
//!
//! ```json
//! {
//!   "scenarios": {
//!     "auth_test": {
//!       "executor": "ramping-vus",
//!       "startVUs": 0,
//!       "stages": [{ "duration": "30s", "target": 50 }, { "duration": "30s", "target": 0 }],
//!       "gracefulRampDown": "30s",
//!       "exec": "authScenario"
//!     }
//!   },
//!   "thresholds": { "auth_fails": ["rate<0.05"] },
//!   "options": { "tick": "100ms", "forcedStop": "5s" }
//! }
//! ```
//!
//! [`RunConfig`] mirrors the document; [`RunConfig::into_plan`] resolves it against a
//! [`ScenarioCatalog`] into a validated [`RunPlan`].

use std::collections::HashSet;
use std::fmt;
use std::marker::PhantomData;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::de::{Deserializer, MapAccess, Visitor};
use serde::Deserialize;
use typed_builder::TypedBuilder;

use crate::error::ConfigError;
use crate::executor::Stage;
use crate::scenario::{ScenarioCatalog, ScenarioConfig};
use crate::threshold::Threshold;

const DEFAULT_GRACEFUL_RAMP_DOWN: Duration = Duration::from_secs(30);

/// The run configuration document as written.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunConfig {
    /// In document order. Duplicated names are kept so they can be reported.
    #[serde(deserialize_with = "ordered_entries")]
    pub scenarios: Vec<(String, ScenarioSpec)>,
    #[serde(default, deserialize_with = "ordered_entries")]
    pub thresholds: Vec<(String, Vec<ThresholdSpec>)>,
    #[serde(default)]
    pub options: OptionsSpec,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioSpec {
    #[serde(default = "default_executor")]
    pub executor: String,
    #[serde(default, rename = "startVUs")]
    pub start_vus: u64,
    #[serde(default)]
    pub stages: Vec<StageSpec>,
    /// constant-vus only
    #[serde(default)]
    pub vus: Option<u64>,
    /// constant-vus only
    #[serde(default)]
    pub duration: Option<String>,
    #[serde(default)]
    pub graceful_ramp_down: Option<String>,
    /// Catalog name of the unit to run. Defaults to the scenario name.
    #[serde(default)]
    pub exec: Option<String>,
}

fn default_executor() -> String {
    ExecutorKind::RampingVus.to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct StageSpec {
    pub duration: String,
    pub target: u64,
}

/// A threshold is either a bare expression or an object with flags.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ThresholdSpec {
    Expression(String),
    Detailed(DetailedThreshold),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetailedThreshold {
    pub threshold: String,
    #[serde(default)]
    pub abort_on_fail: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptionsSpec {
    pub tick: Option<String>,
    pub forced_stop: Option<String>,
    pub progress_interval: Option<String>,
    pub threshold_interval: Option<String>,
}

/// Executors a scenario can name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorKind {
    /// Follow a staged ramp profile.
    RampingVus,
    /// Hold `vus` VUs for `duration`.
    ConstantVus,
}

impl fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutorKind::RampingVus => f.write_str("ramping-vus"),
            ExecutorKind::ConstantVus => f.write_str("constant-vus"),
        }
    }
}

impl FromStr for ExecutorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ramping-vus" => Ok(ExecutorKind::RampingVus),
            "constant-vus" => Ok(ExecutorKind::ConstantVus),
            other => Err(other.to_string()),
        }
    }
}

/// Run-wide knobs.
#[derive(Debug, Clone, TypedBuilder)]
pub struct RunOptions {
    /// Resolution of every executor's control loop.
    #[builder(default = Duration::from_millis(100))]
    pub tick: Duration,
    /// How long an aborted run waits for executors before cancelling them.
    #[builder(default = Duration::from_secs(5))]
    pub forced_stop: Duration,
    /// Period of progress log lines. Zero disables them.
    #[builder(default = Duration::from_secs(10))]
    pub progress_interval: Duration,
    /// Period of `abortOnFail` threshold checks. Zero disables them.
    #[builder(default = Duration::from_secs(1))]
    pub threshold_interval: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// A validated, ready-to-run description of a test.
#[derive(Debug, Clone, TypedBuilder)]
pub struct RunPlan {
    pub scenarios: Vec<ScenarioConfig>,
    #[builder(default)]
    pub thresholds: Vec<Threshold>,
    #[builder(default)]
    pub options: RunOptions,
}

impl RunPlan {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scenarios.is_empty() {
            return Err(ConfigError::NoScenarios);
        }
        if self.options.tick.is_zero() {
            return Err(ConfigError::ZeroTick(self.options.tick));
        }

        let mut seen = HashSet::new();
        for scenario in &self.scenarios {
            if !seen.insert(scenario.name.as_str()) {
                return Err(ConfigError::DuplicateScenario(scenario.name.clone()));
            }
            if scenario.stages.is_empty() {
                return Err(ConfigError::EmptyProfile(scenario.name.clone()));
            }
        }
        Ok(())
    }
}

impl RunConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = tokio::fs::read_to_string(path).await?;
        Self::from_json_str(&json)
    }

    /// Resolves every scenario's `exec` against `catalog` and validates the result.
    pub fn into_plan(self, catalog: &ScenarioCatalog) -> Result<RunPlan, ConfigError> {
        let mut seen = HashSet::new();
        let mut scenarios = Vec::with_capacity(self.scenarios.len());
        for (name, spec) in self.scenarios {
            if !seen.insert(name.clone()) {
                return Err(ConfigError::DuplicateScenario(name));
            }
            scenarios.push(spec.resolve(name, catalog)?);
        }

        let mut thresholds = Vec::new();
        for (metric, specs) in self.thresholds {
            for spec in specs {
                let (expression, abort_on_fail) = match &spec {
                    ThresholdSpec::Expression(expression) => (expression.as_str(), false),
                    ThresholdSpec::Detailed(detailed) => {
                        (detailed.threshold.as_str(), detailed.abort_on_fail)
                    }
                };
                thresholds.push(Threshold::parse(metric.as_str(), expression, abort_on_fail)?);
            }
        }

        let plan = RunPlan::builder()
            .scenarios(scenarios)
            .thresholds(thresholds)
            .options(self.options.resolve()?)
            .build();
        plan.validate()?;
        Ok(plan)
    }
}

impl ScenarioSpec {
    fn resolve(
        self,
        name: String,
        catalog: &ScenarioCatalog,
    ) -> Result<ScenarioConfig, ConfigError> {
        let kind = self
            .executor
            .parse::<ExecutorKind>()
            .map_err(|executor| ConfigError::UnknownExecutor {
                scenario: name.clone(),
                executor,
            })?;
        let invalid = |reason: &str| ConfigError::InvalidScenario {
            scenario: name.clone(),
            reason: reason.to_string(),
        };

        let (start_vus, stages) = match kind {
            ExecutorKind::RampingVus => {
                if self.vus.is_some() || self.duration.is_some() {
                    return Err(invalid("`vus` and `duration` only apply to constant-vus"));
                }
                let stages = self
                    .stages
                    .iter()
                    .map(|stage| Ok(Stage::new(parse_duration(&stage.duration)?, stage.target)))
                    .collect::<Result<Vec<_>, ConfigError>>()?;
                if stages.is_empty() {
                    return Err(ConfigError::EmptyProfile(name));
                }
                (self.start_vus, stages)
            }
            ExecutorKind::ConstantVus => {
                if !self.stages.is_empty() {
                    return Err(invalid("`stages` only apply to ramping-vus"));
                }
                let duration = self
                    .duration
                    .as_deref()
                    .ok_or_else(|| invalid("constant-vus requires a `duration`"))?;
                let vus = self.vus.unwrap_or(1);
                (vus, vec![Stage::new(parse_duration(duration)?, vus)])
            }
        };

        let graceful_ramp_down = self
            .graceful_ramp_down
            .as_deref()
            .map(parse_duration)
            .transpose()?
            .unwrap_or(DEFAULT_GRACEFUL_RAMP_DOWN);

        let exec = self.exec.unwrap_or_else(|| name.clone());
        let unit = catalog
            .get(&exec)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownUnit {
                scenario: name.clone(),
                exec,
            })?;

        Ok(ScenarioConfig::builder()
            .name(name)
            .start_vus(start_vus)
            .stages(stages)
            .graceful_ramp_down(graceful_ramp_down)
            .unit(unit)
            .build())
    }
}

impl OptionsSpec {
    fn resolve(&self) -> Result<RunOptions, ConfigError> {
        let defaults = RunOptions::default();
        let or = |value: &Option<String>, default: Duration| {
            value.as_deref().map(parse_duration).transpose().map(|d| d.unwrap_or(default))
        };
        Ok(RunOptions {
            tick: or(&self.tick, defaults.tick)?,
            forced_stop: or(&self.forced_stop, defaults.forced_stop)?,
            progress_interval: or(&self.progress_interval, defaults.progress_interval)?,
            threshold_interval: or(&self.threshold_interval, defaults.threshold_interval)?,
        })
    }
}

/// Deserializes a JSON object into its entries, keeping order and duplicate keys.
fn ordered_entries<'de, D, V>(deserializer: D) -> Result<Vec<(String, V)>, D::Error>
where
    D: Deserializer<'de>,
    V: Deserialize<'de>,
{
    struct Entries<V>(PhantomData<V>);

    impl<'de, V: Deserialize<'de>> Visitor<'de> for Entries<V> {
        type Value = Vec<(String, V)>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a map")
        }

        fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
            let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
            while let Some(entry) = map.next_entry()? {
                entries.push(entry);
            }
            Ok(entries)
        }
    }

    deserializer.deserialize_map(Entries(PhantomData))
}

/// Parses a Go-style duration such as `500ms`, `30s`, `1m30s` or `1.5h`.
///
/// Units are `ns`, `us` (or `µs`), `ms`, `s`, `m` and `h`. A bare `0` is accepted.
pub fn parse_duration(input: &str) -> Result<Duration, ConfigError> {
    let invalid = || ConfigError::InvalidDuration(input.to_string());
    let s = input.trim();
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    if s.is_empty() {
        return Err(invalid());
    }

    let mut rest = s;
    let mut total: u128 = 0;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(invalid)?;
        let (number, tail) = rest.split_at(number_len);
        let unit_len = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_len);

        let unit_nanos: u128 = match unit {
            "ns" => 1,
            "us" | "µs" => 1_000,
            "ms" => 1_000_000,
            "s" => 1_000_000_000,
            "m" => 60 * 1_000_000_000,
            "h" => 3_600 * 1_000_000_000,
            _ => return Err(invalid()),
        };

        let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
        if whole.is_empty() && fraction.is_empty() {
            return Err(invalid());
        }
        let whole: u128 = if whole.is_empty() {
            0
        } else {
            whole.parse::<u128>().map_err(|_| invalid())?
        };
        let fraction_nanos = if fraction.is_empty() {
            0
        } else {
            // nanosecond precision needs no more than 18 fractional digits
            let digits = &fraction[..fraction.len().min(18)];
            let value: u128 = digits.parse::<u128>().map_err(|_| invalid())?;
            value * unit_nanos / 10u128.pow(digits.len() as u32)
        };

        total = whole
            .checked_mul(unit_nanos)
            .and_then(|n| n.checked_add(fraction_nanos))
            .and_then(|n| n.checked_add(total))
            .ok_or_else(invalid)?;
        rest = tail;
    }

    let secs = u64::try_from(total / 1_000_000_000).map_err(|_| invalid())?;
    Ok(Duration::new(secs, (total % 1_000_000_000) as u32))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Scenario, ScenarioError, Vu};
    use rstest::rstest;

    struct Noop;

    impl Scenario for Noop {
        async fn iteration(&self, _: &mut Vu) -> Result<(), ScenarioError> {
            Ok(())
        }
    }

    fn catalog() -> ScenarioCatalog {
        let mut catalog = ScenarioCatalog::new();
        catalog
            .register("authScenario", Noop)
            .register("purchaseScenario", Noop)
            .register("smoke", Noop);
        catalog
    }

    fn plan(json: &str) -> Result<RunPlan, ConfigError> {
        RunConfig::from_json_str(json)?.into_plan(&catalog())
    }

    #[rstest]
    #[case("0", Duration::ZERO)]
    #[case("500ms", Duration::from_millis(500))]
    #[case("30s", Duration::from_secs(30))]
    #[case("1m", Duration::from_secs(60))]
    #[case("1m30s", Duration::from_secs(90))]
    #[case("1h", Duration::from_secs(3600))]
    #[case("1.5s", Duration::from_millis(1500))]
    #[case(".5m", Duration::from_secs(30))]
    #[case("2h45m", Duration::from_secs(9900))]
    #[case("250us", Duration::from_micros(250))]
    #[case("250µs", Duration::from_micros(250))]
    #[case("10ns", Duration::from_nanos(10))]
    #[case(" 5s ", Duration::from_secs(5))]
    fn parses_go_durations(#[case] input: &str, #[case] expected: Duration) {
        assert_eq!(parse_duration(input).unwrap(), expected);
    }

    #[rstest]
    #[case("")]
    #[case("30")]
    #[case("s")]
    #[case("1d")]
    #[case("-5s")]
    #[case("1..5s")]
    #[case("5 s")]
    #[case("thirty seconds")]
    fn rejects_malformed_durations(#[case] input: &str) {
        assert!(
            matches!(parse_duration(input), Err(ConfigError::InvalidDuration(s)) if s == input),
            "{input:?} parsed"
        );
    }

    #[test]
    fn full_document() {
        let plan = plan(
            r#"{
                "scenarios": {
                    "auth_test": {
                        "executor": "ramping-vus",
                        "startVUs": 0,
                        "stages": [
                            { "duration": "30s", "target": 50 },
                            { "duration": "1m", "target": 50 },
                            { "duration": "30s", "target": 0 }
                        ],
                        "gracefulRampDown": "10s",
                        "exec": "authScenario"
                    },
                    "smoke": { "executor": "constant-vus", "vus": 3, "duration": "20s" }
                },
                "thresholds": {
                    "http_req_duration": ["p(95)<500"],
                    "auth_fails": [{ "threshold": "rate<0.05", "abortOnFail": true }]
                },
                "options": { "tick": "50ms", "forcedStop": "2s" }
            }"#,
        )
        .unwrap();

        assert_eq!(plan.scenarios.len(), 2);
        let auth = &plan.scenarios[0];
        assert_eq!(auth.name, "auth_test");
        assert_eq!(auth.stages.len(), 3);
        assert_eq!(auth.duration(), Duration::from_secs(120));
        assert_eq!(auth.graceful_ramp_down, Duration::from_secs(10));

        let smoke = &plan.scenarios[1];
        assert_eq!(smoke.start_vus, 3);
        assert_eq!(smoke.stages, vec![Stage::new(Duration::from_secs(20), 3)]);
        assert_eq!(smoke.graceful_ramp_down, DEFAULT_GRACEFUL_RAMP_DOWN);

        assert_eq!(plan.thresholds.len(), 2);
        assert!(!plan.thresholds[0].abort_on_fail);
        assert!(plan.thresholds[1].abort_on_fail);
        assert_eq!(plan.thresholds[1].metric, "auth_fails");

        assert_eq!(plan.options.tick, Duration::from_millis(50));
        assert_eq!(plan.options.forced_stop, Duration::from_secs(2));
        assert_eq!(plan.options.progress_interval, Duration::from_secs(10));
    }

    #[test]
    fn duplicate_scenarios_are_rejected() {
        let err = plan(
            r#"{ "scenarios": {
                "smoke": { "executor": "constant-vus", "duration": "1s" },
                "smoke": { "executor": "constant-vus", "duration": "2s" }
            } }"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateScenario(name) if name == "smoke"));
    }

    #[rstest]
    #[case(r#"{ "scenarios": {} }"#, "no scenarios")]
    #[case(r#"{ "scenarios": { "smoke": { "stages": [] } } }"#, "empty ramp profile")]
    #[case(
        r#"{ "scenarios": { "smoke": { "executor": "shared-iterations" } } }"#,
        "unknown executor"
    )]
    #[case(
        r#"{ "scenarios": { "other": { "stages": [{ "duration": "1s", "target": 1 }] } } }"#,
        "not in the catalog"
    )]
    #[case(
        r#"{ "scenarios": { "smoke": { "stages": [{ "duration": "1x", "target": 1 }] } } }"#,
        "invalid duration"
    )]
    #[case(
        r#"{ "scenarios": { "smoke": { "executor": "constant-vus" } } }"#,
        "requires a `duration`"
    )]
    #[case(
        r#"{ "scenarios": { "smoke": { "vus": 2, "stages": [{ "duration": "1s", "target": 1 }] } } }"#,
        "only apply to constant-vus"
    )]
    #[case(
        r#"{ "scenarios": { "smoke": { "executor": "constant-vus", "duration": "1s" } }, "options": { "tick": "0s" } }"#,
        "greater than zero"
    )]
    #[case(
        r#"{ "scenarios": { "smoke": { "executor": "constant-vus", "duration": "1s" } }, "thresholds": { "checks": ["rate<<1"] } }"#,
        "invalid threshold"
    )]
    #[case(r#"{ "scenarios": [] }"#, "invalid run configuration")]
    fn rejects_invalid_documents(#[case] json: &str, #[case] message: &str) {
        let err = plan(json).unwrap_err();
        assert!(err.to_string().contains(message), "{err}");
    }

    #[tokio::test]
    async fn missing_file_is_an_io_error() {
        let err = RunConfig::from_path("/definitely/not/here.json").await.unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
