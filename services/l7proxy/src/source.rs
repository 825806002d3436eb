//! Control-plane list source.
//!
//! Polls the control plane's list endpoints and converts the results into
//! watch events by diffing against the previously observed set. Every resync
//! interval the full current set is re-sent as `Added` events, so consumers
//! heal from any notification they missed; the store makes replays no-ops.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use gantry_cluster::{
    ClusterObject, EndpointAddress, EndpointPort, EndpointSet, EndpointSubset, EventSink,
    ObjectKey, ObjectMeta, Secret, Service, TargetRef, WatchEvent,
};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::Config;
use crate::proxy::HOST_KEY;

#[derive(Debug, Deserialize)]
struct ListResponse<T> {
    items: Vec<T>,
}

/// Long-running poller feeding the event channels.
pub struct ControlPlaneSource {
    client: reqwest::Client,
    base_url: String,
    poll_interval: Duration,
    resync_interval: Duration,
    sink: EventSink,
    services: BTreeMap<ObjectKey, Service>,
    endpoints: BTreeMap<ObjectKey, EndpointSet>,
    secrets: BTreeMap<ObjectKey, Secret>,
}

impl ControlPlaneSource {
    pub fn new(config: &Config, sink: EventSink) -> Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(token) = &config.control_plane_token {
            let raw = token.expose().trim();
            let bearer = if raw.starts_with("Bearer ") || raw.starts_with("bearer ") {
                raw.to_string()
            } else {
                format!("Bearer {raw}")
            };
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&bearer).context("invalid control-plane token format")?,
            );
        }

        let client = reqwest::Client::builder()
            .user_agent(concat!("gantry-l7proxy/", env!("CARGO_PKG_VERSION")))
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            base_url: config.control_plane_url.clone(),
            poll_interval: config.poll_interval,
            resync_interval: config.resync_interval,
            sink,
            services: BTreeMap::new(),
            endpoints: BTreeMap::new(),
            secrets: BTreeMap::new(),
        })
    }

    /// Poll until the consumers go away. List failures are logged and
    /// retried on the next tick; a closed event channel ends the source.
    pub async fn run(mut self) -> Result<()> {
        let mut last_resync = Instant::now();
        loop {
            let resync = last_resync.elapsed() >= self.resync_interval;
            match self.list_all().await {
                Ok((services, endpoints, secrets)) => {
                    if resync {
                        last_resync = Instant::now();
                        debug!("resync: re-sending full state");
                    }

                    for event in diff(&mut self.services, index(services), resync) {
                        self.sink.send_service(event).await?;
                    }
                    for event in diff(&mut self.endpoints, index(endpoints), resync) {
                        self.sink.send_endpoints(event).await?;
                    }
                    for event in diff(&mut self.secrets, index(secrets), resync) {
                        self.sink.send_secret(event).await?;
                    }
                }
                Err(error) => {
                    warn!(error = %error, "control plane list failed; retrying");
                }
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn list_all(&self) -> Result<(Vec<Service>, Vec<EndpointSet>, Vec<Secret>)> {
        Ok((
            self.list("v1/services").await?,
            self.list("v1/endpoints").await?,
            self.list("v1/secrets").await?,
        ))
    }

    async fn list<T: DeserializeOwned>(&self, path: &str) -> Result<Vec<T>> {
        let base = self.base_url.trim_end_matches('/');
        let url = format!("{base}/{path}");

        let resp = self.client.get(url.as_str()).send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!(
                "list query {url} failed (status={status}): {body}"
            ));
        }

        Ok(resp.json::<ListResponse<T>>().await?.items)
    }
}

fn index<T: ClusterObject>(items: Vec<T>) -> BTreeMap<ObjectKey, T> {
    items.into_iter().map(|item| (item.key(), item)).collect()
}

/// Turn the previous and current object sets into watch events, replacing
/// `prev` with the current set. With `resync` set, unchanged objects are
/// re-sent as `Added`.
fn diff<T: Clone + PartialEq>(
    prev: &mut BTreeMap<ObjectKey, T>,
    next: BTreeMap<ObjectKey, T>,
    resync: bool,
) -> Vec<WatchEvent<T>> {
    let mut events = Vec::new();

    for (key, new) in &next {
        match prev.get(key) {
            None => events.push(WatchEvent::Added(new.clone())),
            Some(old) if old != new => events.push(WatchEvent::Updated {
                old: old.clone(),
                new: new.clone(),
            }),
            Some(_) if resync => events.push(WatchEvent::Added(new.clone())),
            Some(_) => {}
        }
    }
    for (key, old) in prev.iter() {
        if !next.contains_key(key) {
            events.push(WatchEvent::Deleted(old.clone()));
        }
    }

    *prev = next;
    events
}

/// Feed a fixed routing table into the event channels (dev mode and tests;
/// no control plane involved).
pub async fn publish_static_routes(sink: &EventSink, routes: &[(String, String)]) -> Result<()> {
    for (index, (host, endpoint)) in routes.iter().enumerate() {
        let name = format!("static-{index}");
        let (ip, port) = endpoint
            .rsplit_once(':')
            .with_context(|| format!("static endpoint {endpoint:?} is not ip:port"))?;
        let port: u16 = port
            .parse()
            .with_context(|| format!("static endpoint {endpoint:?} has a bad port"))?;

        let mut metadata = ObjectMeta {
            namespace: "static".to_string(),
            name,
            ..Default::default()
        };
        metadata
            .annotations
            .insert(HOST_KEY.to_string(), host.clone());

        let service = Service {
            metadata: metadata.clone(),
        };
        let endpoints = EndpointSet {
            metadata,
            subsets: vec![EndpointSubset {
                addresses: vec![EndpointAddress {
                    ip: ip.to_string(),
                    target_ref: Some(TargetRef {
                        uid: format!("static-{index}"),
                    }),
                }],
                ports: vec![EndpointPort {
                    name: "http".to_string(),
                    port,
                }],
            }],
        };

        sink.send_service(WatchEvent::Added(service)).await?;
        sink.send_endpoints(WatchEvent::Added(endpoints)).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(name: &str, host: &str) -> Service {
        let mut service = Service {
            metadata: ObjectMeta {
                namespace: "default".to_string(),
                name: name.to_string(),
                ..Default::default()
            },
        };
        service
            .metadata
            .annotations
            .insert(HOST_KEY.to_string(), host.to_string());
        service
    }

    #[test]
    fn diff_emits_add_update_delete() {
        let mut prev = BTreeMap::new();

        let events = diff(&mut prev, index(vec![service("web", "a.test")]), false);
        assert!(matches!(events.as_slice(), [WatchEvent::Added(_)]));

        // Same state again: nothing to report.
        let events = diff(&mut prev, index(vec![service("web", "a.test")]), false);
        assert!(events.is_empty());

        let events = diff(&mut prev, index(vec![service("web", "b.test")]), false);
        match events.as_slice() {
            [WatchEvent::Updated { old, new }] => {
                assert_eq!(old.metadata.label_or_annotation(HOST_KEY), Some("a.test"));
                assert_eq!(new.metadata.label_or_annotation(HOST_KEY), Some("b.test"));
            }
            other => panic!("expected update, got {other:?}"),
        }

        let events = diff(&mut prev, BTreeMap::new(), false);
        assert!(matches!(events.as_slice(), [WatchEvent::Deleted(_)]));
        assert!(prev.is_empty());
    }

    #[test]
    fn resync_resends_unchanged_objects() {
        let mut prev = BTreeMap::new();
        diff(&mut prev, index(vec![service("web", "a.test")]), false);

        let events = diff(&mut prev, index(vec![service("web", "a.test")]), true);
        assert!(matches!(events.as_slice(), [WatchEvent::Added(_)]));
    }

    #[tokio::test]
    async fn static_routes_become_service_and_endpoints() {
        let (sink, mut streams) = gantry_cluster::event_channels(8);
        publish_static_routes(
            &sink,
            &[("example.test".to_string(), "127.0.0.1:9000".to_string())],
        )
        .await
        .unwrap();

        match streams.services.recv().await {
            Some(WatchEvent::Added(service)) => {
                assert_eq!(
                    service.metadata.label_or_annotation(HOST_KEY),
                    Some("example.test")
                );
            }
            other => panic!("expected service add, got {other:?}"),
        }
        match streams.endpoints.recv().await {
            Some(WatchEvent::Added(endpoints)) => {
                assert_eq!(endpoints.subsets[0].addresses[0].ip, "127.0.0.1");
                assert_eq!(endpoints.subsets[0].ports[0].port, 9000);
            }
            other => panic!("expected endpoints add, got {other:?}"),
        }
    }
}
