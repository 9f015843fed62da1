//! Load test for the shop API: sign-in, merch purchases and coin transfers.
//!
//! ```text
//! BASE_URL=http://localhost:8080/api cargo run --example shop -- [config.json] [summary.json]
//! ```
//!
//! Without a config file the three scenarios below run with their built-in profile.
//! The process exits with 0 if every threshold passed, 1 if one failed or the run was
//! interrupted, and 2 if the configuration is invalid.

use std::process::ExitCode;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rampload::clock::{millis, timed};
use rampload::{
    JsonReporter, MetricKind, Orchestrator, Reporter, RunConfig, RunError, Scenario,
    ScenarioCatalog, ScenarioError, StdoutReporter, Vu,
};
use reqwest::header::{AUTHORIZATION, HeaderValue};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing_subscriber::EnvFilter;

const DEFAULT_BASE_URL: &str = "http://localhost:8080/api";
const PASSWORD: &str = "password123";
const ITEMS: [&str; 4] = ["t-shirt", "cup", "pen", "book"];

const CONFIG: &str = r#"{
    "scenarios": {
        "auth_test": {
            "executor": "ramping-vus",
            "startVUs": 0,
            "stages": [
                { "duration": "30s", "target": 50 },
                { "duration": "1m", "target": 50 },
                { "duration": "30s", "target": 0 }
            ],
            "gracefulRampDown": "30s",
            "exec": "authScenario"
        },
        "purchase_test": {
            "executor": "ramping-vus",
            "startVUs": 0,
            "stages": [
                { "duration": "30s", "target": 30 },
                { "duration": "1m", "target": 30 },
                { "duration": "30s", "target": 0 }
            ],
            "gracefulRampDown": "30s",
            "exec": "purchaseScenario"
        },
        "transfer_test": {
            "executor": "ramping-vus",
            "startVUs": 0,
            "stages": [
                { "duration": "30s", "target": 40 },
                { "duration": "1m", "target": 40 },
                { "duration": "30s", "target": 0 }
            ],
            "gracefulRampDown": "30s",
            "exec": "transferScenario"
        }
    },
    "thresholds": {
        "http_req_duration": ["p(95)<500"],
        "purchase_fails": ["rate<0.1"],
        "transfer_fails": ["rate<0.1"],
        "auth_fails": ["rate<0.05"]
    }
}"#;

#[derive(Deserialize)]
struct TokenBody {
    token: Option<String>,
}

#[derive(Deserialize)]
struct MessageBody {
    message: Option<String>,
}

/// Shared by every scenario: where the API lives and how to name fresh users.
#[derive(Clone)]
struct Shop {
    base: String,
    run: u128,
}

impl Shop {
    /// Unique per run, VU and iteration.
    fn username(&self, prefix: &str, vu: &Vu) -> String {
        format!(
            "{prefix}_{:x}_{}_{}_{}",
            self.run,
            vu.scenario(),
            vu.id(),
            vu.iteration()
        )
    }

    /// Signs in (registering on first use). `None` on a transport error.
    async fn authenticate(
        &self,
        vu: &mut Vu,
        username: &str,
    ) -> Result<Option<(StatusCode, Option<String>)>, ScenarioError> {
        let request = vu
            .request(Method::POST, &format!("{}/auth", self.base))?
            .json(&json!({ "username": username, "password": PASSWORD }));
        let response = match vu.send(request).await {
            Ok(response) => response,
            Err(err) => {
                tracing::debug!("auth request failed: {err}");
                return Ok(None);
            }
        };
        let status = response.status();
        let token = response
            .json::<TokenBody>()
            .await
            .ok()
            .and_then(|body| body.token);
        Ok(Some((status, token)))
    }

    /// Signs in and stores the bearer token on the VU. Returns whether it worked.
    async fn sign_in(&self, vu: &mut Vu, username: &str) -> Result<bool, ScenarioError> {
        let token = match self.authenticate(vu, username).await? {
            Some((status, Some(token))) if status == StatusCode::OK => token,
            _ => return Ok(false),
        };
        match HeaderValue::from_str(&format!("Bearer {token}")) {
            Ok(value) => {
                vu.headers_mut().insert(AUTHORIZATION, value);
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    /// Sends a request and reads its `message` field, recording the call's latency.
    async fn call(
        &self,
        vu: &mut Vu,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
        latency: &str,
    ) -> Result<Option<(StatusCode, Option<String>)>, ScenarioError> {
        let mut request = vu.request(method, &format!("{}{path}", self.base))?;
        if let Some(body) = body {
            request = request.json(&body);
        }
        let (response, took) = timed(vu.send(request)).await;
        vu.trend(latency, millis(took));

        let Ok(response) = response else {
            return Ok(None);
        };
        let status = response.status();
        let message = match response.json::<MessageBody>().await {
            Ok(body) => body.message,
            Err(err) => {
                tracing::debug!("failed to parse response: {err}");
                None
            }
        };
        Ok(Some((status, message)))
    }
}

struct AuthScenario(Shop);

impl Scenario for AuthScenario {
    async fn iteration(&self, vu: &mut Vu) -> Result<(), ScenarioError> {
        let username = self.0.username("user", vu);
        let (login, took) = timed(self.0.authenticate(vu, &username)).await;
        let login = login?;
        vu.trend("auth_latency", millis(took));

        let status_ok = vu.check(
            "auth status is 200",
            matches!(&login, Some((status, _)) if *status == StatusCode::OK),
        );
        let has_token = vu.check("has token", matches!(login, Some((_, Some(_)))));
        vu.rate("auth_fails", !(status_ok && has_token));

        vu.sleep(Duration::from_secs(1)).await;
        Ok(())
    }

    fn declared_metrics(&self) -> &'static [(&'static str, MetricKind)] {
        &[
            ("auth_fails", MetricKind::Rate),
            ("auth_latency", MetricKind::Trend),
        ]
    }
}

struct PurchaseScenario(Shop);

impl Scenario for PurchaseScenario {
    async fn iteration(&self, vu: &mut Vu) -> Result<(), ScenarioError> {
        let username = self.0.username("user", vu);
        self.0.sign_in(vu, &username).await?;

        let item = ITEMS[((vu.id() + vu.iteration()) % ITEMS.len() as u64) as usize];
        let purchase = self
            .0
            .call(vu, Method::GET, &format!("/buy/{item}"), None, "purchase_latency")
            .await?;

        let status_ok = vu.check(
            "purchase status is 200",
            matches!(&purchase, Some((status, _)) if *status == StatusCode::OK),
        );
        let bought = vu.check(
            "purchase successful",
            matches!(&purchase, Some((_, Some(m))) if m == "purchase successful"),
        );
        vu.rate("purchase_fails", !(status_ok && bought));

        vu.sleep(Duration::from_secs(1)).await;
        Ok(())
    }

    fn declared_metrics(&self) -> &'static [(&'static str, MetricKind)] {
        &[
            ("purchase_fails", MetricKind::Rate),
            ("purchase_latency", MetricKind::Trend),
        ]
    }
}

struct TransferScenario(Shop);

impl Scenario for TransferScenario {
    async fn iteration(&self, vu: &mut Vu) -> Result<(), ScenarioError> {
        let sender = self.0.username("sender", vu);
        let receiver = self.0.username("receiver", vu);

        // the receiver has to exist before coins can be sent to it
        self.0.authenticate(vu, &receiver).await?;
        self.0.sign_in(vu, &sender).await?;

        let transfer = self
            .0
            .call(
                vu,
                Method::POST,
                "/sendCoin",
                Some(json!({ "toUser": receiver, "amount": 100 })),
                "transfer_latency",
            )
            .await?;

        let status_ok = vu.check(
            "transfer status is 200",
            matches!(&transfer, Some((status, _)) if *status == StatusCode::OK),
        );
        let sent = vu.check(
            "transfer successful",
            matches!(&transfer, Some((_, Some(m))) if m == "transfer successful"),
        );
        vu.rate("transfer_fails", !(status_ok && sent));

        vu.sleep(Duration::from_secs(1)).await;
        Ok(())
    }

    fn declared_metrics(&self) -> &'static [(&'static str, MetricKind)] {
        &[
            ("transfer_fails", MetricKind::Rate),
            ("transfer_latency", MetricKind::Trend),
        ]
    }
}

fn catalog(shop: Shop) -> ScenarioCatalog {
    let mut catalog = ScenarioCatalog::new();
    catalog
        .register("authScenario", AuthScenario(shop.clone()))
        .register("purchaseScenario", PurchaseScenario(shop.clone()))
        .register("transferScenario", TransferScenario(shop));
    catalog
}

async fn orchestrator(config: Option<&String>, shop: Shop) -> Result<Orchestrator, RunError> {
    let config = match config {
        Some(path) => RunConfig::from_path(path).await?,
        None => RunConfig::from_json_str(CONFIG)?,
    };
    Orchestrator::new(config.into_plan(&catalog(shop))?)
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let shop = Shop {
        base: std::env::var("BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string()),
        run: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default(),
    };

    let orchestrator = match orchestrator(args.first(), shop).await {
        Ok(orchestrator) => orchestrator,
        Err(err) => {
            tracing::error!("{err}");
            return ExitCode::from(2);
        }
    };

    let handle = orchestrator.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.abort();
        }
    });

    let result = orchestrator.run().await;
    if let Err(err) = StdoutReporter.report(&result).await {
        tracing::error!("{err}");
    }
    if let Some(path) = args.get(1) {
        if let Err(err) = JsonReporter::new(path).report(&result).await {
            tracing::error!("{err}");
        }
    }
    ExitCode::from(result.exit_code())
}
