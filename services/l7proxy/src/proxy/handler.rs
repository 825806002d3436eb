//! Per-request proxy orchestration.
//!
//! The handler parses the sticky cookie, spools the request body to disk so
//! a dial failure can be retried safely, hands dispatch to the upstream
//! client, and stamps the sticky cookie onto successful responses before any
//! body bytes reach the client.

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use futures::TryStreamExt;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use http::request::Parts;
use http::uri::PathAndQuery;
use hyper::body::{Body, Frame, Incoming};
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, COOKIE, HOST, SET_COOKIE};
use hyper::{Request, Response, StatusCode, Version};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::warn;

use super::store::RoutingStore;
use super::upstream::{RequestTemplate, UpstreamClient, UpstreamError};

/// Cookie carrying the backend identity a client should return to.
pub const STICKY_COOKIE: &str = "gravity";

const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Headers that describe a single hop and must not cross the proxy.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub type ProxyBody = BoxBody<Bytes, io::Error>;

pub(crate) fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

fn full_body(message: String) -> ProxyBody {
    Full::new(Bytes::from(message))
        .map_err(|never| match never {})
        .boxed()
}

#[derive(Debug, Error)]
enum ProxyError {
    #[error("unsupported protocol")]
    UnsupportedProtocol,

    #[error("failed to buffer request body")]
    Spool(#[source] io::Error),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),
}

impl ProxyError {
    fn status(&self) -> StatusCode {
        match self {
            ProxyError::UnsupportedProtocol => StatusCode::BAD_REQUEST,
            ProxyError::Spool(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Upstream(UpstreamError::NoBackends { attempts: 0, .. }) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

/// Request entry point shared by every listener.
pub struct ProxyHandler {
    store: Arc<RoutingStore>,
    upstream: UpstreamClient,
    spool_dir: PathBuf,
}

impl ProxyHandler {
    pub fn new(store: Arc<RoutingStore>, spool_dir: PathBuf) -> Self {
        Self {
            store,
            upstream: UpstreamClient::new(),
            spool_dir,
        }
    }

    /// Serve one request. Failures are mapped to status codes here; nothing
    /// propagates out of the connection task.
    pub async fn handle(&self, request: Request<Incoming>, peer: SocketAddr) -> Response<ProxyBody> {
        match self.proxy(request, peer).await {
            Ok(response) => response,
            Err(error) => {
                let message = error_chain(&error);
                warn!(peer = %peer, error = %message, "request failed");
                let mut response = full_response(message);
                *response.status_mut() = error.status();
                response
            }
        }
    }

    async fn proxy(
        &self,
        request: Request<Incoming>,
        peer: SocketAddr,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        if !matches!(request.version(), Version::HTTP_10 | Version::HTTP_11) {
            return Err(ProxyError::UnsupportedProtocol);
        }

        let host = request
            .headers()
            .get(HOST)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .or_else(|| request.uri().authority().map(|a| a.to_string()))
            .unwrap_or_default();
        let sticky_id = sticky_cookie_value(request.headers());

        let (parts, body) = request.into_parts();
        let template = upstream_template(&parts, peer);

        // The spool file is removed when the guard drops, on every path out
        // of this function.
        let spool = BodySpool::capture(&self.spool_dir, body)
            .await
            .map_err(ProxyError::Spool)?;

        let (mut response, backend) = self
            .upstream
            .dispatch(&self.store, &host, &sticky_id, &template, spool.as_ref())
            .await?;

        strip_hop_headers(response.headers_mut());
        let cookie = format!("{STICKY_COOKIE}={}; HttpOnly", backend.id);
        if let Ok(value) = HeaderValue::from_str(&cookie) {
            response.headers_mut().append(SET_COOKIE, value);
        }

        Ok(response.map(|body| body.map_err(io::Error::other).boxed()))
    }
}

fn full_response(message: String) -> Response<ProxyBody> {
    Response::new(full_body(message))
}

/// Render an error with its cause chain, innermost last.
fn error_chain(error: &dyn std::error::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// A request body spooled to a temp file so it can be replayed across retry
/// attempts without holding it in memory.
pub struct BodySpool {
    path: tempfile::TempPath,
}

impl BodySpool {
    /// Drain `body` to a fresh temp file under `dir`. Bodies that are already
    /// at end-of-stream (no payload) spool nothing.
    pub(crate) async fn capture<B>(dir: &Path, body: B) -> io::Result<Option<Self>>
    where
        B: Body<Data = Bytes> + Unpin,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let mut body = body;
        if body.is_end_stream() {
            return Ok(None);
        }

        let (file, path) = tempfile::Builder::new()
            .prefix("gantry-body")
            .tempfile_in(dir)?
            .into_parts();
        let mut file = tokio::fs::File::from_std(file);

        while let Some(frame) = body.frame().await {
            let frame = frame.map_err(io::Error::other)?;
            if let Some(data) = frame.data_ref() {
                file.write_all(data).await?;
            }
        }
        file.flush().await?;

        Ok(Some(Self { path }))
    }

    /// Open a fresh read of the spooled bytes for the next attempt.
    pub(crate) async fn replay(&self) -> io::Result<ProxyBody> {
        let file = tokio::fs::File::open(&self.path).await?;
        let stream = ReaderStream::new(file).map_ok(Frame::data);
        Ok(BodyExt::boxed(StreamBody::new(stream)))
    }
}

/// The attempt-independent parts of the upstream request: method, the
/// verbatim request target, and the filtered header set.
fn upstream_template(parts: &Parts, peer: SocketAddr) -> RequestTemplate {
    let path_and_query = parts
        .uri
        .path_and_query()
        .cloned()
        .unwrap_or_else(|| PathAndQuery::from_static("/"));

    let mut headers = parts.headers.clone();
    strip_hop_headers(&mut headers);
    append_forwarded_for(&mut headers, peer);

    RequestTemplate {
        method: parts.method.clone(),
        path_and_query,
        headers,
    }
}

fn strip_hop_headers(headers: &mut HeaderMap) {
    let connection_named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| name.trim().parse::<HeaderName>().ok())
        .collect();
    for name in connection_named {
        headers.remove(&name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, peer: SocketAddr) {
    let entry = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(existing) => format!("{existing}, {}", peer.ip()),
        None => peer.ip().to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&entry) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}

/// Value of the sticky cookie, or empty when the request carries none.
fn sticky_cookie_value(headers: &HeaderMap) -> String {
    for header in headers.get_all(COOKIE) {
        let Ok(raw) = header.to_str() else { continue };
        for pair in raw.split(';') {
            if let Some((name, value)) = pair.trim().split_once('=') {
                if name.trim() == STICKY_COOKIE {
                    return value.trim().to_string();
                }
            }
        }
    }
    String::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with_cookie(raw: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_str(raw).unwrap());
        headers
    }

    #[test]
    fn sticky_cookie_parsed_from_cookie_header() {
        let headers = headers_with_cookie("theme=dark; gravity=backend-1; lang=en");
        assert_eq!(sticky_cookie_value(&headers), "backend-1");
    }

    #[test]
    fn missing_sticky_cookie_is_empty() {
        assert_eq!(sticky_cookie_value(&HeaderMap::new()), "");
        let headers = headers_with_cookie("theme=dark");
        assert_eq!(sticky_cookie_value(&headers), "");
    }

    #[test]
    fn hop_by_hop_headers_are_stripped() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("close, x-session-id"));
        headers.insert("x-session-id", HeaderValue::from_static("abc"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert(HOST, HeaderValue::from_static("example.test"));

        strip_hop_headers(&mut headers);

        assert!(headers.get(CONNECTION).is_none());
        assert!(headers.get("x-session-id").is_none());
        assert!(headers.get("transfer-encoding").is_none());
        assert_eq!(headers.get(HOST).unwrap(), "example.test");
    }

    #[test]
    fn forwarded_for_appends_to_existing_chain() {
        let peer: SocketAddr = "192.0.2.7:4000".parse().unwrap();

        let mut headers = HeaderMap::new();
        append_forwarded_for(&mut headers, peer);
        assert_eq!(headers.get(X_FORWARDED_FOR).unwrap(), "192.0.2.7");

        let mut headers = HeaderMap::new();
        headers.insert(X_FORWARDED_FOR, HeaderValue::from_static("10.1.1.1"));
        append_forwarded_for(&mut headers, peer);
        assert_eq!(headers.get(X_FORWARDED_FOR).unwrap(), "10.1.1.1, 192.0.2.7");
    }

    #[tokio::test]
    async fn spool_roundtrips_body_bytes_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();

        let body = Full::new(Bytes::from_static(b"hello upstream"));
        let spool = BodySpool::capture(dir.path(), body)
            .await
            .unwrap()
            .expect("body should spool");

        for _ in 0..2 {
            let replayed = spool.replay().await.unwrap();
            let bytes = replayed.collect().await.unwrap().to_bytes();
            assert_eq!(&bytes[..], b"hello upstream");
        }

        drop(spool);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn empty_body_spools_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let spool = BodySpool::capture(dir.path(), Empty::<Bytes>::new())
            .await
            .unwrap();
        assert!(spool.is_none());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
