//! Watch-event channels between a source and its consumers.
//!
//! Each resource kind has its own ordered stream; within one stream, events
//! for the same object arrive in source order. A source recovering from a
//! lost watch re-lists and re-sends everything as `Added`, which consumers
//! must treat as idempotent.

use tokio::sync::mpsc;

use crate::error::WatchError;
use crate::types::{EndpointSet, Secret, Service};

/// Default buffer for each event channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// A change notification for one cluster object.
#[derive(Debug, Clone)]
pub enum WatchEvent<T> {
    Added(T),
    Updated { old: T, new: T },
    Deleted(T),
}

impl<T> WatchEvent<T> {
    /// The object as of this event (the new value for updates).
    pub fn latest(&self) -> &T {
        match self {
            WatchEvent::Added(obj) | WatchEvent::Deleted(obj) => obj,
            WatchEvent::Updated { new, .. } => new,
        }
    }
}

/// Producer half handed to a watch source.
#[derive(Clone)]
pub struct EventSink {
    services: mpsc::Sender<WatchEvent<Service>>,
    endpoints: mpsc::Sender<WatchEvent<EndpointSet>>,
    secrets: mpsc::Sender<WatchEvent<Secret>>,
}

impl EventSink {
    pub async fn send_service(&self, event: WatchEvent<Service>) -> Result<(), WatchError> {
        self.services
            .send(event)
            .await
            .map_err(|_| WatchError::ChannelClosed("services"))
    }

    pub async fn send_endpoints(&self, event: WatchEvent<EndpointSet>) -> Result<(), WatchError> {
        self.endpoints
            .send(event)
            .await
            .map_err(|_| WatchError::ChannelClosed("endpoints"))
    }

    pub async fn send_secret(&self, event: WatchEvent<Secret>) -> Result<(), WatchError> {
        self.secrets
            .send(event)
            .await
            .map_err(|_| WatchError::ChannelClosed("secrets"))
    }
}

/// Consumer half: one receiver per resource kind.
pub struct EventStreams {
    pub services: mpsc::Receiver<WatchEvent<Service>>,
    pub endpoints: mpsc::Receiver<WatchEvent<EndpointSet>>,
    pub secrets: mpsc::Receiver<WatchEvent<Secret>>,
}

/// Create the channel pair connecting a watch source to its consumers.
pub fn event_channels(capacity: usize) -> (EventSink, EventStreams) {
    let (services_tx, services_rx) = mpsc::channel(capacity);
    let (endpoints_tx, endpoints_rx) = mpsc::channel(capacity);
    let (secrets_tx, secrets_rx) = mpsc::channel(capacity);

    (
        EventSink {
            services: services_tx,
            endpoints: endpoints_tx,
            secrets: secrets_tx,
        },
        EventStreams {
            services: services_rx,
            endpoints: endpoints_rx,
            secrets: secrets_rx,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ObjectMeta;

    #[tokio::test]
    async fn events_arrive_in_send_order() {
        let (sink, mut streams) = event_channels(8);

        let service = Service {
            metadata: ObjectMeta {
                namespace: "default".to_string(),
                name: "web".to_string(),
                ..Default::default()
            },
        };

        sink.send_service(WatchEvent::Added(service.clone()))
            .await
            .unwrap();
        sink.send_service(WatchEvent::Deleted(service.clone()))
            .await
            .unwrap();

        assert!(matches!(
            streams.services.recv().await,
            Some(WatchEvent::Added(_))
        ));
        assert!(matches!(
            streams.services.recv().await,
            Some(WatchEvent::Deleted(_))
        ));
    }

    #[tokio::test]
    async fn closed_consumer_surfaces_as_error() {
        let (sink, streams) = event_channels(1);
        drop(streams);

        let err = sink
            .send_secret(WatchEvent::Added(Secret::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, WatchError::ChannelClosed("secrets")));
    }
}
