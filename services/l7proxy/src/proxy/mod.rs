//! L7 reverse proxy: routing state, certificate selection, and the request
//! path.
//!
//! ## Architecture
//!
//! ```text
//! watch events -> sync -> RoutingStore <- CertResolver <- TLS handshake
//!                              ^
//! client -> Listener -> ProxyHandler -> UpstreamClient -> backend
//!                            |                |
//!                       body spool      pick_backend + skip set
//! ```
//!
//! The store is the only shared mutable state; requests read immutable
//! record snapshots and never block each other.

mod handler;
mod listener;
mod selector;
mod store;
mod tls;
mod upstream;

pub use handler::{BodySpool, ProxyBody, ProxyHandler, STICKY_COOKIE};
pub use listener::{Listener, ListenerPool};
pub use selector::{pick_backend, SkipSet};
pub use store::{
    BackendRecord, CertificateRecord, RoutingStore, ServiceRecord, CERT_CN_ANNOTATION, HOST_KEY,
};
pub use tls::{generate_placeholder, server_config, CertResolver, CertificateError, PlaceholderCert};
pub use upstream::{UpstreamClient, UpstreamError, DIAL_TIMEOUT, MAX_ATTEMPTS};
