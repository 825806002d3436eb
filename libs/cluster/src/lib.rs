//! Cluster resource model and watch-event plumbing.
//!
//! The proxy keeps its routing table in sync with an external cluster
//! control plane. This crate defines the three resource kinds the proxy
//! consumes (services, endpoint sets, TLS secrets) and the event channels
//! a watch source uses to deliver add/update/delete notifications to the
//! consumers.
//!
//! A watch source is anything that can feed an [`EventSink`]: the
//! control-plane list poller in the proxy service, or a test fixture that
//! injects events directly.

mod error;
mod types;
mod watch;

pub use error::WatchError;
pub use types::{
    ClusterObject, EndpointAddress, EndpointPort, EndpointSet, EndpointSubset, ObjectKey,
    ObjectMeta, Secret, Service, TargetRef,
};
pub use watch::{event_channels, EventSink, EventStreams, WatchEvent, DEFAULT_CHANNEL_CAPACITY};
