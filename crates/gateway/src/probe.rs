use crate::config::{probe_target, GatewayConfig, ProbeTarget};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;
use url::Url;

pub const LOCAL_GATEWAY_URL: &str = "http://localhost:18789";
pub const PING_PATH: &str = "/api/ping";
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(5000);
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_millis(3000);

/// Outcome of a single probe. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthProbeResult {
    pub reachable: bool,
    pub status: Option<u16>,
    pub message: Option<String>,
}

impl HealthProbeResult {
    fn reachable(status: u16) -> Self {
        Self {
            reachable: true,
            status: Some(status),
            message: None,
        }
    }

    fn rejected(status: reqwest::StatusCode) -> Self {
        Self {
            reachable: false,
            status: Some(status.as_u16()),
            message: Some(format!(
                "Gateway returned {}: {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("Unknown")
            )),
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            reachable: false,
            status: None,
            message: Some(message.into()),
        }
    }

    /// Human-readable reason for an unreachable result.
    pub fn failure_reason(&self) -> String {
        self.message
            .clone()
            .unwrap_or_else(|| "Connection test failed".to_string())
    }
}

/// Reachability checks the setup flow and status poller depend on.
#[async_trait]
pub trait GatewayProbe: Send + Sync {
    /// `None` (or an unconfigured gateway) probes the same-origin ping path.
    async fn check(&self, config: Option<&GatewayConfig>) -> bool;

    /// Probes an in-progress URL/token pair and reports why it failed.
    async fn test(&self, url: &str, token: &str) -> HealthProbeResult;

    /// Is a gateway answering on the well-known loopback address?
    async fn detect_local(&self) -> bool;

    /// Unauthenticated loopback probe: `Some("")` when no credential is
    /// needed, `None` when one is required or the gateway is unreachable.
    async fn detect_local_token(&self) -> Option<String>;

    fn local_url(&self) -> &str;
}

#[derive(Clone)]
pub struct HealthProber {
    http: Client,
    origin: Url,
    local_url: String,
    timeout: Duration,
}

impl HealthProber {
    /// `origin` is this service's own base URL, used to resolve the ping path.
    pub fn new(origin: Url) -> Self {
        let http = Client::builder()
            .connect_timeout(DISCOVERY_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            http,
            origin,
            local_url: LOCAL_GATEWAY_URL.to_string(),
            timeout: PROBE_TIMEOUT,
        }
    }

    pub fn with_local_url(mut self, url: impl Into<String>) -> Self {
        self.local_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn probe(&self, url: Option<&str>, token: Option<&str>) -> bool {
        self.probe_detailed(url, token).await.reachable
    }

    pub async fn probe_detailed(&self, url: Option<&str>, token: Option<&str>) -> HealthProbeResult {
        let target = match url.map(str::trim).filter(|u| !u.is_empty()) {
            Some(url) => probe_target(url),
            None => ProbeTarget::Literal(PING_PATH.to_string()),
        };

        let (target_url, expects_ok_body) = match target {
            ProbeTarget::Health(url) => (url, false),
            ProbeTarget::Literal(path) => match self.origin.join(&path) {
                Ok(url) => (url.to_string(), true),
                Err(e) => return HealthProbeResult::failed(format!("Invalid URL {}: {}", path, e)),
            },
        };

        let mut request = self.http.get(&target_url).timeout(self.timeout);
        if let Some(token) = token.map(str::trim).filter(|t| !t.is_empty()) {
            request = request.header("Authorization", format!("Bearer {}", token));
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                debug!("Health probe {} failed: {}", target_url, e);
                return HealthProbeResult::failed(e.to_string());
            }
        };

        let status = response.status();
        if !status.is_success() {
            debug!("Health probe {} returned {}", target_url, status);
            return HealthProbeResult::rejected(status);
        }
        if !expects_ok_body {
            return HealthProbeResult::reachable(status.as_u16());
        }

        match response.json::<PingBody>().await {
            Ok(PingBody { ok: Some(true) }) => HealthProbeResult::reachable(status.as_u16()),
            Ok(_) => HealthProbeResult {
                reachable: false,
                status: Some(status.as_u16()),
                message: Some("Gateway ping reported not ok".to_string()),
            },
            Err(e) => {
                debug!("Health probe {} returned malformed body: {}", target_url, e);
                HealthProbeResult::failed(e.to_string())
            }
        }
    }

    async fn local_health(&self) -> Result<reqwest::StatusCode, reqwest::Error> {
        let response = self
            .http
            .get(format!("{}/health", self.local_url))
            .timeout(DISCOVERY_TIMEOUT)
            .send()
            .await?;
        Ok(response.status())
    }
}

#[derive(Deserialize)]
struct PingBody {
    #[serde(default)]
    ok: Option<bool>,
}

#[async_trait]
impl GatewayProbe for HealthProber {
    async fn check(&self, config: Option<&GatewayConfig>) -> bool {
        match config.filter(|c| c.is_configured()) {
            Some(config) => self.probe(Some(&config.url), config.bearer()).await,
            None => self.probe(None, None).await,
        }
    }

    async fn test(&self, url: &str, token: &str) -> HealthProbeResult {
        self.probe_detailed(Some(url), Some(token)).await
    }

    async fn detect_local(&self) -> bool {
        match self.local_health().await {
            Ok(status) => status.is_success(),
            Err(e) => {
                debug!("No local gateway at {}: {}", self.local_url, e);
                false
            }
        }
    }

    async fn detect_local_token(&self) -> Option<String> {
        match self.local_health().await {
            Ok(status) if status.is_success() => Some(String::new()),
            Ok(status) => {
                debug!("Local gateway requires a credential ({})", status);
                None
            }
            Err(_) => None,
        }
    }

    fn local_url(&self) -> &str {
        &self.local_url
    }
}
