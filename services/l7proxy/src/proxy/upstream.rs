//! Upstream dispatch: one round-trip per attempt, failing over across
//! backends on dial-phase errors.
//!
//! A connect-phase failure guarantees no request bytes reached the upstream,
//! so replaying is safe even for non-idempotent methods. Anything that fails
//! after the connection is established is surfaced as-is. Connection pooling
//! is disabled so a retry can never land on a half-closed pooled connection.

use std::time::Duration;

use http::uri::PathAndQuery;
use hyper::body::Incoming;
use hyper::header::HeaderMap;
use hyper::{Method, Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use thiserror::Error;
use tracing::{debug, warn};

use super::handler::{empty_body, BodySpool, ProxyBody};
use super::selector::{pick_backend, SkipSet};
use super::store::{BackendRecord, RoutingStore};

/// Total dial attempts per request, the first included.
pub const MAX_ATTEMPTS: usize = 4;
/// Upstream TCP connect budget per attempt.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(3);

const TCP_KEEPALIVE: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("no backends available for host {host:?} ({attempts} attempted)")]
    NoBackends { host: String, attempts: usize },

    #[error("giving up on host {host:?} after {attempts} failed dials")]
    Exhausted {
        host: String,
        attempts: usize,
        #[source]
        last: hyper_util::client::legacy::Error,
    },

    #[error("upstream request failed")]
    Request(#[source] hyper_util::client::legacy::Error),

    #[error("failed to replay spooled body")]
    Spool(#[source] std::io::Error),

    #[error("backend endpoint {endpoint:?} is not a valid authority")]
    InvalidEndpoint {
        endpoint: String,
        #[source]
        source: http::Error,
    },
}

/// The parts of the incoming request replayed on every attempt. The
/// path-and-query is carried verbatim so non-canonical encodings survive the
/// proxy byte-for-byte; only the authority changes per backend.
pub struct RequestTemplate {
    pub method: Method,
    pub path_and_query: PathAndQuery,
    pub headers: HeaderMap,
}

impl RequestTemplate {
    async fn build(
        &self,
        backend: &BackendRecord,
        spool: Option<&BodySpool>,
    ) -> Result<Request<ProxyBody>, UpstreamError> {
        let uri = Uri::builder()
            .scheme("http")
            .authority(backend.endpoint.as_str())
            .path_and_query(self.path_and_query.clone())
            .build()
            .map_err(|source| UpstreamError::InvalidEndpoint {
                endpoint: backend.endpoint.clone(),
                source,
            })?;

        let body = match spool {
            Some(spool) => spool.replay().await.map_err(UpstreamError::Spool)?,
            None => empty_body(),
        };

        let mut request = Request::new(body);
        *request.method_mut() = self.method.clone();
        *request.uri_mut() = uri;
        *request.headers_mut() = self.headers.clone();
        Ok(request)
    }
}

/// Shared upstream HTTP client. Every request gets a fresh connection with a
/// bounded connect timeout and TCP keep-alive on the dialer.
pub struct UpstreamClient {
    client: Client<HttpConnector, ProxyBody>,
}

impl UpstreamClient {
    pub fn new() -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(DIAL_TIMEOUT));
        connector.set_keepalive(Some(TCP_KEEPALIVE));

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(0)
            .build(connector);
        Self { client }
    }

    /// Run the select/dial/retry loop until a backend answers, a non-dial
    /// error surfaces, or the attempt budget is spent. The routing record is
    /// looked up fresh on every attempt so mid-request sync updates apply.
    pub async fn dispatch(
        &self,
        store: &RoutingStore,
        host: &str,
        sticky_id: &str,
        template: &RequestTemplate,
        spool: Option<&BodySpool>,
    ) -> Result<(Response<Incoming>, BackendRecord), UpstreamError> {
        let mut skip = SkipSet::new();
        let mut attempts = 0usize;

        loop {
            let backend = if host.is_empty() {
                None
            } else {
                store
                    .service_by_host(host)
                    .and_then(|service| pick_backend(&service, sticky_id, &skip))
            };
            let Some(backend) = backend else {
                return Err(UpstreamError::NoBackends {
                    host: host.to_string(),
                    attempts,
                });
            };

            let request = template.build(&backend, spool).await?;
            attempts += 1;

            match self.client.request(request).await {
                Ok(response) => {
                    debug!(
                        host,
                        backend = %backend.endpoint,
                        status = response.status().as_u16(),
                        attempt = attempts,
                        "upstream responded"
                    );
                    return Ok((response, backend));
                }
                Err(error) if error.is_connect() && attempts < MAX_ATTEMPTS => {
                    warn!(
                        host,
                        backend = %backend.endpoint,
                        attempt = attempts,
                        %error,
                        "dial failed, excluding backend and retrying"
                    );
                    skip.insert(backend.id.clone());
                }
                Err(error) if error.is_connect() => {
                    return Err(UpstreamError::Exhausted {
                        host: host.to_string(),
                        attempts,
                        last: error,
                    });
                }
                Err(error) => return Err(UpstreamError::Request(error)),
            }
        }
    }
}

impl Default for UpstreamClient {
    fn default() -> Self {
        Self::new()
    }
}
