//! Error types for rampload.
//!
//! Configuration problems are detected before any virtual user starts and are kept
//! apart from the failures that can happen while a run is in progress.

use std::time::Duration;

use thiserror::Error;

use crate::metric::MetricKind;

/// A problem with the run configuration. A run that fails with one of these never starts.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid run configuration: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to read run configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid duration `{0}`")]
    InvalidDuration(String),

    #[error("the run has no scenarios")]
    NoScenarios,

    #[error("scenario `{0}` is defined more than once")]
    DuplicateScenario(String),

    #[error("scenario `{0}` has an empty ramp profile")]
    EmptyProfile(String),

    #[error("scenario `{scenario}`: {reason}")]
    InvalidScenario { scenario: String, reason: String },

    #[error("scenario `{scenario}` uses unknown executor `{executor}`")]
    UnknownExecutor { scenario: String, executor: String },

    #[error("scenario `{scenario}` executes `{exec}`, which is not in the catalog")]
    UnknownUnit { scenario: String, exec: String },

    #[error("control tick must be greater than zero, got {0:?}")]
    ZeroTick(Duration),

    #[error("invalid threshold `{expression}` on `{metric}`: {reason}")]
    InvalidThreshold {
        metric: String,
        expression: String,
        reason: String,
    },

    #[error("threshold references unknown metric `{0}`")]
    UnknownMetric(String),

    #[error("threshold `{expression}` does not apply to {kind} metric `{metric}`")]
    AggregationMismatch {
        metric: String,
        expression: String,
        kind: MetricKind,
    },
}

/// Registering a metric under a name that already holds a different kind of sink.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MetricError {
    #[error("metric `{name}` is already registered as a {existing} metric, not a {requested} one")]
    KindMismatch {
        name: String,
        existing: MetricKind,
        requested: MetricKind,
    },
}

/// An unrecoverable failure inside a scenario unit. It terminates the virtual user
/// that raised it, never the scenario or the run.
#[derive(Error, Debug)]
pub enum ScenarioError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{0}")]
    Other(String),
}

impl ScenarioError {
    pub fn other(message: impl Into<String>) -> Self {
        ScenarioError::Other(message.into())
    }
}

/// Errors surfaced by [`crate::Orchestrator::new`].
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Metric(#[from] MetricError),
}

/// Errors raised while publishing a run result.
#[derive(Error, Debug)]
pub enum ReportError {
    #[error("failed to serialize report: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to write report: {0}")]
    Io(#[from] std::io::Error),
}
