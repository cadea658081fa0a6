use crate::error::{ClientError, ClientResult};
use async_trait::async_trait;
use bytes::Bytes;
use futures::future;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::header::HeaderMap;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use std::time::Duration;
use tracing::debug;
use url::Url;

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// How the request was initiated. Only `Navigate` changes caching behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    Navigate,
    SameOrigin,
    #[default]
    Cors,
    NoCors,
}

impl RequestMode {
    /// Maps a `Sec-Fetch-Mode` header value.
    pub fn from_header(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "navigate" => RequestMode::Navigate,
            "same-origin" => RequestMode::SameOrigin,
            "no-cors" => RequestMode::NoCors,
            _ => RequestMode::Cors,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub mode: RequestMode,
    pub body: Option<Bytes>,
}

impl FetchRequest {
    pub fn get(url: Url) -> Self {
        Self {
            method: Method::GET,
            url,
            headers: HeaderMap::new(),
            mode: RequestMode::default(),
            body: None,
        }
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn with_mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_body(mut self, body: Bytes) -> Self {
        self.body = Some(body);
        self
    }

    /// Cache identity: method plus the absolute URL.
    pub fn cache_key(&self) -> String {
        format!("{} {}", self.method, self.url)
    }
}

#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Set when the final URL differs from the requested one.
    pub redirected: bool,
    pub url: Url,
}

impl FetchResponse {
    pub fn new(url: Url, status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
            redirected: false,
            url,
        }
    }

    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    /// Only successful, non-redirected responses are worth keeping.
    pub fn is_cacheable(&self) -> bool {
        self.ok() && !self.redirected
    }
}

pub type ByteStream = BoxStream<'static, ClientResult<Bytes>>;

/// A response whose body is read as it arrives.
pub struct StreamedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ByteStream,
}

impl From<FetchResponse> for StreamedResponse {
    fn from(response: FetchResponse) -> Self {
        Self {
            status: response.status,
            headers: response.headers,
            body: stream::once(future::ready(Ok(response.body))).boxed(),
        }
    }
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: &FetchRequest) -> ClientResult<FetchResponse>;

    /// Like `fetch`, but hands back the body unread. Used for responses that
    /// are never cached, such as event streams.
    async fn open(&self, request: &FetchRequest) -> ClientResult<StreamedResponse> {
        self.fetch(request).await.map(StreamedResponse::from)
    }
}

#[async_trait]
impl<F: Fetcher + ?Sized> Fetcher for std::sync::Arc<F> {
    async fn fetch(&self, request: &FetchRequest) -> ClientResult<FetchResponse> {
        (**self).fetch(request).await
    }

    async fn open(&self, request: &FetchRequest) -> ClientResult<StreamedResponse> {
        (**self).open(request).await
    }
}

#[derive(Clone)]
pub struct HttpFetcher {
    http: Client,
    /// No overall deadline; bodies may stay open indefinitely.
    streaming: Client,
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpFetcher {
    pub fn new() -> Self {
        let http = Client::builder()
            .timeout(FETCH_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());
        let streaming = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { http, streaming }
    }
}

fn build(client: &Client, request: &FetchRequest) -> RequestBuilder {
    let builder = client
        .request(request.method.clone(), request.url.clone())
        .headers(request.headers.clone());
    match request.body {
        Some(ref body) => builder.body(body.clone()),
        None => builder,
    }
}

fn send_failed(request: &FetchRequest, e: reqwest::Error) -> ClientError {
    debug!("Fetch {} failed: {}", request.url, e);
    if e.is_timeout() {
        ClientError::Timeout(e.to_string())
    } else {
        ClientError::Network(e)
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &FetchRequest) -> ClientResult<FetchResponse> {
        let response = build(&self.http, request)
            .send()
            .await
            .map_err(|e| send_failed(request, e))?;

        let status = response.status();
        let headers = response.headers().clone();
        let final_url = response.url().clone();
        let body = response.bytes().await?;

        Ok(FetchResponse {
            status,
            headers,
            body,
            redirected: final_url != request.url,
            url: final_url,
        })
    }

    async fn open(&self, request: &FetchRequest) -> ClientResult<StreamedResponse> {
        let response = build(&self.streaming, request)
            .send()
            .await
            .map_err(|e| send_failed(request, e))?;

        Ok(StreamedResponse {
            status: response.status(),
            headers: response.headers().clone(),
            body: response.bytes_stream().map(|chunk| chunk.map_err(ClientError::from)).boxed(),
        })
    }
}
