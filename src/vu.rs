//! The per-virtual-user context handed to a scenario unit on every iteration.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::HeaderMap;
use reqwest::{Client, Method, RequestBuilder, Response};

use crate::clock::{Timer, millis};
use crate::error::ScenarioError;
use crate::metric::{Observation, builtin};
use crate::registry::MetricsRegistry;

/// An independent simulated client.
///
/// Each `Vu` owns its session state: an HTTP client with its own cookie jar and a
/// header map applied to every request built through [`Vu::request`]. Nothing here is
/// shared with other virtual users, so an auth token stored by one VU never leaks into
/// another VU's requests.
///
/// Observations emitted during an iteration are buffered inside the `Vu` and committed
/// to the registry only when the iteration completes. An iteration that is cancelled
/// past its grace period therefore leaves no trace in the metrics.
pub struct Vu {
    id: u64,
    scenario: Arc<str>,
    iteration: u64,
    registry: Arc<MetricsRegistry>,
    pending: Vec<Observation>,
    headers: HeaderMap,
    client: Option<Client>,
}

impl Vu {
    pub fn new(id: u64, scenario: Arc<str>, registry: Arc<MetricsRegistry>) -> Self {
        Self {
            id,
            scenario,
            iteration: 0,
            registry,
            pending: Vec::new(),
            headers: HeaderMap::new(),
            client: None,
        }
    }

    /// 1-based id, unique within the scenario.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn scenario(&self) -> &str {
        &self.scenario
    }

    /// 0-based index of the current iteration of this VU.
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    /// Records a boolean observation on a rate metric.
    pub fn rate(&mut self, metric: &str, value: bool) {
        self.pending.push(Observation::rate(metric, value));
    }

    /// Records a numeric observation on a trend metric.
    pub fn trend(&mut self, metric: &str, value: f64) {
        self.pending.push(Observation::trend(metric, value));
    }

    /// Records the outcome of a named check on the `checks` rate and returns it.
    pub fn check(&mut self, name: &str, ok: bool) -> bool {
        if !ok {
            tracing::debug!(scenario = %self.scenario, vu = self.id, "Check failed: {name}");
        }
        self.rate(builtin::CHECKS, ok);
        ok
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// The VU's own HTTP client, built on first use.
    pub fn http(&mut self) -> Result<&Client, ScenarioError> {
        let client = match self.client.take() {
            Some(client) => client,
            None => Client::builder().cookie_store(true).build()?,
        };
        Ok(self.client.insert(client))
    }

    /// Starts a request carrying this VU's headers.
    pub fn request(&mut self, method: Method, url: &str) -> Result<RequestBuilder, ScenarioError> {
        let headers = self.headers.clone();
        Ok(self.http()?.request(method, url).headers(headers))
    }

    /// Sends a request, recording `http_req_duration` and `http_req_failed`.
    ///
    /// A response with a status of 400 or above is returned as `Ok` but counted as a
    /// failed request. Whether a transport error is fatal for the VU is up to the caller.
    pub async fn send(&mut self, request: RequestBuilder) -> Result<Response, reqwest::Error> {
        let timer = Timer::start();
        let result = request.send().await;
        self.trend(builtin::HTTP_REQ_DURATION, timer.elapsed_ms());

        let failed = match &result {
            Ok(response) => response.status().as_u16() >= 400,
            Err(_) => true,
        };
        self.rate(builtin::HTTP_REQ_FAILED, failed);
        result
    }

    /// Explicit pacing between steps of an iteration.
    pub async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    pub(crate) fn pending(&self) -> &[Observation] {
        &self.pending
    }

    /// Drops anything left over from an iteration that did not complete.
    pub(crate) fn begin_iteration(&mut self) {
        self.pending.clear();
    }

    /// Records the iteration's duration and commits its observations.
    pub(crate) fn complete_iteration(&mut self, took: Duration) {
        self.trend(builtin::ITERATION_DURATION, millis(took));
        self.registry.commit(&mut self.pending);
        self.iteration += 1;
    }

    /// Commits what a failing iteration emitted before it gave up.
    pub(crate) fn abandon_iteration(&mut self) {
        self.registry.commit(&mut self.pending);
    }
}
