//! Watch-event consumers that keep the routing store current.
//!
//! One task per resource kind, each draining its stream strictly in order so
//! events for a given object apply in the order the source observed them.
//! The store computes its own diffs, so replayed events (resyncs) are cheap
//! no-ops and the old value carried by updates is not needed.

use std::sync::Arc;

use gantry_cluster::{EndpointSet, EventStreams, Secret, Service, WatchEvent};
use tokio::sync::mpsc;
use tracing::info;

use crate::proxy::RoutingStore;

/// Spawn the three consumers. They run until their source closes the
/// channels; the store then keeps serving its last synced state.
pub fn spawn_consumers(store: Arc<RoutingStore>, streams: EventStreams) {
    let EventStreams {
        services,
        endpoints,
        secrets,
    } = streams;

    {
        let store = store.clone();
        tokio::spawn(consume(services, "services", move |event| {
            apply_service(&store, event)
        }));
    }
    {
        let store = store.clone();
        tokio::spawn(consume(endpoints, "endpoints", move |event| {
            apply_endpoints(&store, event)
        }));
    }
    tokio::spawn(consume(secrets, "secrets", move |event| {
        apply_secret(&store, event)
    }));
}

async fn consume<T>(
    mut stream: mpsc::Receiver<WatchEvent<T>>,
    kind: &'static str,
    mut apply: impl FnMut(WatchEvent<T>),
) {
    while let Some(event) = stream.recv().await {
        apply(event);
    }
    info!(kind, "watch stream closed");
}

fn apply_service(store: &RoutingStore, event: WatchEvent<Service>) {
    match event {
        WatchEvent::Added(service) | WatchEvent::Updated { new: service, .. } => {
            store.apply_service(
                &service.metadata.namespace,
                &service.metadata.name,
                Some(&service),
            );
        }
        WatchEvent::Deleted(service) => {
            store.apply_service(&service.metadata.namespace, &service.metadata.name, None);
        }
    }
}

fn apply_endpoints(store: &RoutingStore, event: WatchEvent<EndpointSet>) {
    match event {
        WatchEvent::Added(endpoints) | WatchEvent::Updated { new: endpoints, .. } => {
            store.apply_endpoints(
                &endpoints.metadata.namespace,
                &endpoints.metadata.name,
                Some(&endpoints),
            );
        }
        WatchEvent::Deleted(endpoints) => {
            store.apply_endpoints(&endpoints.metadata.namespace, &endpoints.metadata.name, None);
        }
    }
}

fn apply_secret(store: &RoutingStore, event: WatchEvent<Secret>) {
    match event {
        WatchEvent::Added(secret) | WatchEvent::Updated { new: secret, .. } => {
            store.apply_secret(&secret.metadata.namespace, &secret.metadata.name, Some(&secret));
        }
        WatchEvent::Deleted(secret) => {
            store.apply_secret(&secret.metadata.namespace, &secret.metadata.name, None);
        }
    }
}
