//! Adapts raw hyper connections to a portable request/response pair.
//!
//! Request bodies are buffered (control-plane sized); response bodies may be
//! streams and are written chunk by chunk as they arrive.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use http::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, HOST};
use http::{Method, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt as _, Empty, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
type WireBody = UnsyncBoxBody<Bytes, Infallible>;

const FAILURE_BODY: &str = "Internal Server Error";

#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

pub enum Body {
    Empty,
    Full(Bytes),
    Stream(BoxStream<'static, Result<Bytes, BoxError>>),
}

pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Body,
}

impl Response {
    pub fn new(status: StatusCode, body: Body) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body,
        }
    }

    pub fn text(status: StatusCode, text: impl Into<String>) -> Self {
        Self::new(status, Body::Full(Bytes::from(text.into())))
            .with_header(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"))
    }

    pub fn json(status: StatusCode, value: &serde_json::Value) -> Self {
        Self::new(status, Body::Full(Bytes::from(value.to_string())))
            .with_header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
    }

    pub fn stream(status: StatusCode, stream: BoxStream<'static, Result<Bytes, BoxError>>) -> Self {
        Self::new(status, Body::Stream(stream))
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }
}

#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, request: Request) -> anyhow::Result<Response>;
}

/// Accepts connections until `shutdown` fires. Each connection is served on
/// its own task; accept and connection errors are logged and never end the loop.
pub async fn serve<H: Handler>(listener: TcpListener, handler: Arc<H>, shutdown: CancellationToken) {
    if let Ok(addr) = listener.local_addr() {
        info!("Listening on http://{}", addr);
    }

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Listener stopping");
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let io = TokioIo::new(stream);
                        let handler = handler.clone();
                        tokio::spawn(async move {
                            let svc = service_fn(move |req| {
                                let handler = handler.clone();
                                async move { Ok::<_, Infallible>(dispatch(handler.as_ref(), req, peer).await) }
                            });
                            if let Err(e) = http1::Builder::new().serve_connection(io, svc).await {
                                debug!("Connection from {} ended with error: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => warn!("Accept error: {}", e),
                }
            }
        }
    }
}

async fn dispatch<H: Handler + ?Sized>(
    handler: &H,
    req: hyper::Request<Incoming>,
    peer: SocketAddr,
) -> hyper::Response<WireBody> {
    let request = match into_portable(req).await {
        Ok(request) => request,
        Err(response) => return response,
    };

    let method = request.method.clone();
    let path = request.url.path().to_string();
    match handler.handle(request).await {
        Ok(response) => {
            debug!("{} {} {} -> {}", peer, method, path, response.status);
            into_wire(response)
        }
        Err(e) => {
            error!("Request error: {} {}: {:#}", method, path, e);
            failure_response()
        }
    }
}

async fn into_portable(req: hyper::Request<Incoming>) -> Result<Request, hyper::Response<WireBody>> {
    let (parts, incoming) = req.into_parts();

    let headers = flatten_headers(&parts.headers);
    let host = headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = match Url::parse(&format!("http://{}{}", host, path)) {
        Ok(url) => url,
        Err(e) => {
            warn!("Rejecting request with unparseable URL {}{}: {}", host, path, e);
            return Err(plain(StatusCode::BAD_REQUEST, "Bad Request"));
        }
    };

    let body = if parts.method == Method::GET || parts.method == Method::HEAD {
        None
    } else {
        match incoming.collect().await {
            Ok(collected) => Some(collected.to_bytes()),
            Err(e) => {
                warn!("Failed to read request body: {}", e);
                return Err(plain(StatusCode::BAD_REQUEST, "Bad Request"));
            }
        }
    };

    Ok(Request {
        method: parts.method,
        url,
        headers,
        body,
    })
}

/// Joins repeated header values into one comma-separated value.
pub fn flatten_headers(headers: &HeaderMap) -> HeaderMap {
    let mut flat = HeaderMap::with_capacity(headers.keys_len());
    for name in headers.keys() {
        let values: Vec<&[u8]> = headers.get_all(name).iter().map(|v| v.as_bytes()).collect();
        let joined = values.join(&b", "[..]);
        if let Ok(value) = HeaderValue::from_bytes(&joined) {
            flat.insert(name.clone(), value);
        }
    }
    flat
}

fn into_wire(response: Response) -> hyper::Response<WireBody> {
    let body = match response.body {
        Body::Empty => Empty::<Bytes>::new().boxed_unsync(),
        Body::Full(bytes) => Full::new(bytes).boxed_unsync(),
        Body::Stream(stream) => StreamBody::new(pump(stream)).boxed_unsync(),
    };

    let mut wire = hyper::Response::new(body);
    *wire.status_mut() = response.status;
    *wire.headers_mut() = response.headers;
    wire
}

/// Forwards chunks until the source ends or fails. A failure is logged and
/// ends the output; nothing after it is written.
fn pump(
    stream: BoxStream<'static, Result<Bytes, BoxError>>,
) -> BoxStream<'static, Result<Frame<Bytes>, Infallible>> {
    stream
        .scan((), |_, chunk| {
            let next = match chunk {
                Ok(bytes) => Some(Ok(Frame::data(bytes))),
                Err(e) => {
                    error!("Stream error: {}", e);
                    None
                }
            };
            futures::future::ready(next)
        })
        .boxed()
}

fn plain(status: StatusCode, text: &'static str) -> hyper::Response<WireBody> {
    let mut wire = hyper::Response::new(Full::new(Bytes::from_static(text.as_bytes())).boxed_unsync());
    *wire.status_mut() = status;
    wire
}

fn failure_response() -> hyper::Response<WireBody> {
    plain(StatusCode::INTERNAL_SERVER_ERROR, FAILURE_BODY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use futures::stream;
    use std::time::Duration;

    const SLOW_HANDLER: Duration = Duration::from_millis(300);

    struct TestHandler;

    #[async_trait]
    impl Handler for TestHandler {
        async fn handle(&self, request: Request) -> anyhow::Result<Response> {
            match request.url.path() {
                "/echo" => {
                    let body = request.body.unwrap_or_default();
                    Ok(Response::new(StatusCode::OK, Body::Full(body)))
                }
                "/info" => Ok(Response::json(
                    StatusCode::OK,
                    &serde_json::json!({
                        "method": request.method.as_str(),
                        "url": request.url.as_str(),
                        "accept": request.header("accept"),
                        "has_body": request.body.is_some(),
                    }),
                )),
                "/chunks" => {
                    let chunks = stream::iter(vec![
                        Ok::<_, BoxError>(Bytes::from_static(b"one,")),
                        Ok(Bytes::from_static(b"two,")),
                        Ok(Bytes::from_static(b"three")),
                    ]);
                    Ok(Response::stream(StatusCode::OK, chunks.boxed()))
                }
                "/broken-stream" => {
                    let chunks = stream::iter(vec![
                        Ok::<_, BoxError>(Bytes::from_static(b"partial")),
                        Err("upstream went away".into()),
                        Ok(Bytes::from_static(b"never sent")),
                    ]);
                    Ok(Response::stream(StatusCode::OK, chunks.boxed()))
                }
                "/empty" => Ok(Response::new(StatusCode::NO_CONTENT, Body::Empty)),
                "/slow" => {
                    tokio::time::sleep(SLOW_HANDLER).await;
                    Ok(Response::text(StatusCode::OK, "done"))
                }
                "/fail" => Err(anyhow!("handler exploded")),
                _ => Ok(Response::text(StatusCode::NOT_FOUND, "not found")),
            }
        }
    }

    async fn start() -> (String, CancellationToken) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(serve(listener, Arc::new(TestHandler), shutdown.clone()));
        (format!("http://{}", addr), shutdown)
    }

    #[tokio::test]
    async fn post_body_is_buffered_and_forwarded() {
        let (base, _shutdown) = start().await;
        let response = reqwest::Client::new()
            .post(format!("{}/echo", base))
            .body("hello bridge")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.text().await.unwrap(), "hello bridge");
    }

    #[tokio::test]
    async fn request_carries_absolute_url_and_headers() {
        let (base, _shutdown) = start().await;
        let info: serde_json::Value = reqwest::Client::new()
            .get(format!("{}/info?x=1", base))
            .header("accept", "application/json")
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(info["method"], "GET");
        assert_eq!(info["url"], format!("{}/info?x=1", base));
        assert_eq!(info["accept"], "application/json");
        assert_eq!(info["has_body"], false);
    }

    #[tokio::test]
    async fn streamed_body_arrives_in_full() {
        let (base, _shutdown) = start().await;
        let text = reqwest::get(format!("{}/chunks", base))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(text, "one,two,three");
    }

    #[tokio::test]
    async fn stream_error_terminates_output_after_partial_delivery() {
        let (base, _shutdown) = start().await;
        let response = reqwest::get(format!("{}/broken-stream", base)).await.unwrap();
        assert_eq!(response.status(), 200);
        let text = response.text().await.unwrap();
        assert_eq!(text, "partial");
    }

    #[tokio::test]
    async fn handler_error_becomes_500_and_listener_survives() {
        let (base, _shutdown) = start().await;
        let failed = reqwest::get(format!("{}/fail", base)).await.unwrap();
        assert_eq!(failed.status(), 500);
        assert_eq!(failed.text().await.unwrap(), "Internal Server Error");

        let next = reqwest::get(format!("{}/chunks", base)).await.unwrap();
        assert_eq!(next.status(), 200);
    }

    #[tokio::test]
    async fn slow_requests_are_served_concurrently() {
        let (base, _shutdown) = start().await;
        let client = reqwest::Client::new();
        let started = std::time::Instant::now();

        let requests = (0..5).map(|_| {
            let client = client.clone();
            let url = format!("{}/slow", base);
            async move { client.get(url).send().await?.text().await }
        });
        let bodies = futures::future::join_all(requests).await;

        assert!(bodies.iter().all(|b| b.as_deref().ok() == Some("done")));
        assert!(started.elapsed() < SLOW_HANDLER * 3, "took {:?}", started.elapsed());
    }

    #[tokio::test]
    async fn empty_body_response() {
        let (base, _shutdown) = start().await;
        let response = reqwest::get(format!("{}/empty", base)).await.unwrap();
        assert_eq!(response.status(), 204);
        assert!(response.bytes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn shutdown_stops_accepting() {
        let (base, shutdown) = start().await;
        shutdown.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(500))
            .build()
            .unwrap();
        assert!(client.get(format!("{}/chunks", base)).send().await.is_err());
    }

    #[test]
    fn repeated_headers_are_joined() {
        let mut headers = HeaderMap::new();
        headers.append("accept", HeaderValue::from_static("text/html"));
        headers.append("accept", HeaderValue::from_static("application/json"));
        headers.insert("x-single", HeaderValue::from_static("1"));

        let flat = flatten_headers(&headers);
        assert_eq!(flat.get("accept").unwrap(), "text/html, application/json");
        assert_eq!(flat.get_all("accept").iter().count(), 1);
        assert_eq!(flat.get("x-single").unwrap(), "1");
    }
}
