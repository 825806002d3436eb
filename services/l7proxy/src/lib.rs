//! gantry L7 proxy library.
//!
//! The binary in `main.rs` wires these pieces together; integration tests
//! drive them directly.

pub mod config;
pub mod proxy;
pub mod source;
pub mod sync;

pub use proxy::{
    pick_backend, BackendRecord, CertResolver, Listener, ListenerPool, ProxyHandler,
    RoutingStore, ServiceRecord, SkipSet, CERT_CN_ANNOTATION, HOST_KEY, STICKY_COOKIE,
};
