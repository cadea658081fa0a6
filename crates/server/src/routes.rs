use crate::bridge::{Body, BoxError, Handler, Request, Response};
use crate::setup::{SettingsStore, SetupOrchestrator};
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use http::header::{HeaderMap, HeaderValue, AUTHORIZATION, CACHE_CONTROL, CONTENT_TYPE};
use http::{Method, StatusCode};
use portico_client::{FetchRequest, Fetcher, HttpFetcher, OfflineCache, RequestMode, Served};
use portico_gateway::{
    ping, redact_url, ConnectionState, GatewayConfig, GatewayProbe, GatewayStatus, HealthProber,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};
use url::Url;

const GATEWAY_PREFIX: &str = "/gateway";
const DIAGNOSTICS_VERSION: u32 = 1;
const HOP_BY_HOP: &[&str] = &[
    "host",
    "connection",
    "keep-alive",
    "content-length",
    "transfer-encoding",
    "upgrade",
];

#[derive(Deserialize)]
struct ValueBody {
    value: String,
}

/// Routes served behind the bridge: service health, gateway ping/status,
/// setup operations, and cached forwarding to the gateway.
pub struct App<P = HealthProber, F = HttpFetcher> {
    setup: Arc<SetupOrchestrator<P>>,
    settings: SettingsStore,
    status: watch::Receiver<GatewayStatus>,
    cache: Arc<OfflineCache<F>>,
    fallback_gateway: GatewayConfig,
    ping_timeout: Duration,
}

impl<P, F> App<P, F>
where
    P: GatewayProbe + 'static,
    F: Fetcher + 'static,
{
    pub fn new(
        setup: Arc<SetupOrchestrator<P>>,
        status: watch::Receiver<GatewayStatus>,
        cache: Arc<OfflineCache<F>>,
        ping_timeout: Duration,
    ) -> Self {
        let settings = setup.settings().clone();
        let fallback_gateway = GatewayConfig::new(setup.local_url(), "");
        Self {
            setup,
            settings,
            status,
            cache,
            fallback_gateway,
            ping_timeout,
        }
    }

    /// Persisted gateway, or the local default when nothing is saved yet.
    fn effective_gateway(&self) -> GatewayConfig {
        let config = self.settings.load_config();
        if config.is_configured() {
            config
        } else {
            self.fallback_gateway.clone()
        }
    }

    async fn ping(&self) -> Response {
        match ping::connect_check(&self.effective_gateway(), self.ping_timeout).await {
            Ok(()) => Response::json(StatusCode::OK, &json!({ "ok": true })),
            Err(e) => {
                debug!("Gateway ping failed: {:#}", e);
                Response::json(
                    StatusCode::SERVICE_UNAVAILABLE,
                    &json!({ "ok": false, "error": e.to_string() }),
                )
            }
        }
    }

    fn status_json(&self) -> Result<Response> {
        let status = self.status.borrow().clone();
        Ok(Response::json(StatusCode::OK, &serde_json::to_value(status)?))
    }

    /// Shareable connectivity report. Credentials never appear in it.
    fn diagnostics(&self, user_agent: Option<&str>) -> Response {
        let config = self.settings.load_config();
        let state = self.status.borrow().state;
        let gateway = if config.is_configured() {
            let status = match state {
                ConnectionState::Connected => "connected",
                ConnectionState::Offline => "disconnected",
                ConnectionState::Connecting => "unknown",
            };
            json!({ "status": status, "url": redact_url(config.url.trim()), "uptime": null })
        } else {
            json!({ "status": "unknown", "url": "Not configured", "uptime": null })
        };

        Response::json(
            StatusCode::OK,
            &json!({
                "version": DIAGNOSTICS_VERSION,
                "generatedAt": Utc::now().to_rfc3339(),
                "environment": {
                    "appVersion": env!("CARGO_PKG_VERSION"),
                    "os": format!("{} {}", std::env::consts::OS, std::env::consts::ARCH),
                    "userAgent": user_agent.unwrap_or("Unknown"),
                },
                "gateway": gateway,
            }),
        )
    }

    fn status_stream(&self) -> Response {
        let rx = self.status.clone();
        let events = stream::unfold((rx, true), |(mut rx, first)| async move {
            if !first && rx.changed().await.is_err() {
                return None;
            }
            let status = rx.borrow_and_update().clone();
            let payload = serde_json::to_string(&status).ok()?;
            let event = Bytes::from(format!("event: status\ndata: {}\n\n", payload));
            Some((Ok::<_, BoxError>(event), (rx, false)))
        });

        Response::stream(StatusCode::OK, events.boxed())
            .with_header(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"))
            .with_header(CACHE_CONTROL, HeaderValue::from_static("no-cache"))
    }

    async fn setup_action(&self, action: &str, body: Option<&Bytes>) -> Result<Response> {
        match action {
            "initialize" => self.setup.initialize().await,
            "test" => {
                self.setup.test_connection().await;
            }
            "save" => self.setup.save_and_proceed(),
            "skip" => self.setup.skip(),
            "complete" => self.setup.complete(),
            "reset" => self.setup.reset(),
            "open" => self.setup.open(),
            "url" | "token" => {
                let value = match body.map(|b| serde_json::from_slice::<ValueBody>(b)) {
                    Some(Ok(parsed)) => parsed.value,
                    _ => {
                        return Ok(Response::json(
                            StatusCode::BAD_REQUEST,
                            &json!({ "error": "expected {\"value\": string}" }),
                        ))
                    }
                };
                if action == "url" {
                    self.setup.set_url(value);
                } else {
                    self.setup.set_token(value);
                }
            }
            _ => return Ok(not_found()),
        }
        Ok(Response::json(StatusCode::OK, &serde_json::to_value(self.setup.snapshot())?))
    }

    async fn forward(&self, request: &Request, rest: &str) -> Result<Response> {
        let config = self.settings.load_config();
        if !config.is_configured() {
            return Ok(Response::json(
                StatusCode::SERVICE_UNAVAILABLE,
                &json!({ "error": "Gateway is not configured" }),
            ));
        }

        let mut target = Url::parse(&format!("{}{}", config.http_base(), rest))?;
        target.set_query(request.url.query());

        let mut headers = strip_hop_by_hop(&request.headers);
        if let Some(bearer) = config.bearer() {
            if !headers.contains_key(AUTHORIZATION) {
                headers.insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {}", bearer))?);
            }
        }
        let mode = request
            .header("sec-fetch-mode")
            .map(RequestMode::from_header)
            .unwrap_or_default();

        let mut outbound = FetchRequest::get(target)
            .with_method(request.method.clone())
            .with_mode(mode)
            .with_headers(headers);
        if let Some(body) = request.body.clone() {
            outbound = outbound.with_body(body);
        }

        match self.cache.serve(&outbound).await {
            Ok(Served::Streamed(upstream)) => {
                let body = upstream.body.map(|chunk| chunk.map_err(BoxError::from)).boxed();
                let mut response = Response::stream(upstream.status, body);
                response.headers = strip_hop_by_hop(&upstream.headers);
                Ok(response)
            }
            Ok(Served::Buffered(Some(upstream))) => {
                let mut response = Response::new(upstream.status, Body::Full(upstream.body));
                response.headers = strip_hop_by_hop(&upstream.headers);
                Ok(response)
            }
            Ok(Served::Buffered(None)) => Ok(Response::json(
                StatusCode::GATEWAY_TIMEOUT,
                &json!({ "error": "Gateway unreachable and no cached response" }),
            )),
            Err(e) => {
                warn!("Forward to {} failed: {}", outbound.url, e);
                Ok(Response::json(
                    StatusCode::BAD_GATEWAY,
                    &json!({ "error": e.user_message() }),
                ))
            }
        }
    }
}

fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let mut out = headers.clone();
    for name in HOP_BY_HOP {
        out.remove(*name);
    }
    out
}

fn not_found() -> Response {
    Response::json(StatusCode::NOT_FOUND, &json!({ "error": "Not found" }))
}

#[async_trait]
impl<P, F> Handler for App<P, F>
where
    P: GatewayProbe + 'static,
    F: Fetcher + 'static,
{
    async fn handle(&self, request: Request) -> Result<Response> {
        let path = request.url.path().to_string();

        if path == GATEWAY_PREFIX || path.starts_with("/gateway/") {
            let rest = match &path[GATEWAY_PREFIX.len()..] {
                "" => "/",
                rest => rest,
            };
            return self.forward(&request, rest).await;
        }

        match (&request.method, path.as_str()) {
            (&Method::GET, "/health") => Ok(Response::json(
                StatusCode::OK,
                &json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }),
            )),
            (&Method::GET, "/api/ping") => Ok(self.ping().await),
            (&Method::GET, "/api/status") => self.status_json(),
            (&Method::GET, "/api/status/stream") => Ok(self.status_stream()),
            (&Method::GET, "/api/diagnostics") => Ok(self.diagnostics(request.header("user-agent"))),
            (&Method::GET, "/api/setup") => Ok(Response::json(
                StatusCode::OK,
                &serde_json::to_value(self.setup.snapshot())?,
            )),
            (&Method::POST, p) if p.starts_with("/api/setup/") => {
                let action = &p["/api/setup/".len()..];
                self.setup_action(action, request.body.as_ref()).await
            }
            _ => Ok(not_found()),
        }
    }
}
