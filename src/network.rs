use futures::future::BoxFuture;
use reqwest::header::{CACHE_CONTROL, PRAGMA};
use reqwest::StatusCode;
use serde_json::Value;

const HEALTH_PATH: &str = "/health";

/// `status` values that count as reachable.
const ACCEPTED_STATUSES: [&str; 3] = ["ok", "initializing", "degraded"];

/// Fields read from the backend's health body. Both are optional and anything
/// that is not a string is treated as missing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthReport {
    pub status: Option<String>,
    pub mongodb: Option<String>,
}

impl HealthReport {
    pub fn from_value(body: &Value) -> Self {
        let field = |name: &str| body.get(name).and_then(Value::as_str).map(str::to_string);
        HealthReport {
            status: field("status"),
            mongodb: field("mongodb"),
        }
    }

    /// Acceptance predicate for a successful HTTP response.
    ///
    /// "degraded" is accepted as reachable, so a backend reporting partial
    /// failure still shows as online.
    pub fn is_reachable(&self) -> bool {
        let status_ok = self
            .status
            .as_deref()
            .map(|s| ACCEPTED_STATUSES.contains(&s))
            .unwrap_or(false);
        status_ok || self.mongodb.as_deref() == Some("connected")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("health request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("health endpoint returned HTTP {0}")]
    Status(StatusCode),
    #[error("health body is not valid JSON: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("health body not recognised (status={status:?}, mongodb={mongodb:?})")]
    Unrecognized {
        status: Option<String>,
        mongodb: Option<String>,
    },
}

impl From<HealthReport> for ProbeError {
    fn from(report: HealthReport) -> Self {
        ProbeError::Unrecognized {
            status: report.status,
            mongodb: report.mongodb,
        }
    }
}

/// One reachability attempt against the backend.
///
/// `Ok` means the attempt passed the acceptance predicate; every other outcome
/// is an `Err`.
pub trait HealthProbe: Send + Sync {
    fn probe(&self) -> BoxFuture<'_, Result<HealthReport, ProbeError>>;
}

#[derive(Clone)]
pub struct HttpHealthProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpHealthProbe {
    /// No request timeout is configured; a hung request is bounded only by the
    /// transport and by the monitor cutting the attempt off at the next tick.
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: reqwest::Client, base_url: &str) -> Self {
        let url = format!("{}{}", base_url.trim_end_matches('/'), HEALTH_PATH);
        HttpHealthProbe { client, url }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn check(&self) -> Result<HealthReport, ProbeError> {
        let resp = self
            .client
            .get(&self.url)
            .header(CACHE_CONTROL, "no-cache")
            .header(PRAGMA, "no-cache")
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ProbeError::Status(status));
        }

        let bytes = resp.bytes().await?;
        let body: Value = serde_json::from_slice(&bytes)?;
        let report = HealthReport::from_value(&body);
        if report.is_reachable() {
            Ok(report)
        } else {
            Err(report.into())
        }
    }
}

impl HealthProbe for HttpHealthProbe {
    fn probe(&self) -> BoxFuture<'_, Result<HealthReport, ProbeError>> {
        Box::pin(self.check())
    }
}
