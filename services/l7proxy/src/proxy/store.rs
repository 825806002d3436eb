//! Routing and certificate store, kept in sync from cluster watch events.
//!
//! The store holds one record per `(namespace, name)` for services and for
//! TLS secrets, plus secondary indices by virtual host and by certificate
//! common name. All writes go through the `apply_*` operations, which diff
//! against the current record and publish a replacement only when something
//! actually changed; a resync that re-sends the current state is a no-op.
//!
//! Records are immutable once published. Writers build a fresh record and
//! swap the `Arc` under the store mutex, so readers may hold a record past
//! lock release (including across upstream I/O) without seeing torn state.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use gantry_cluster::{EndpointSet, ObjectKey, Secret, Service};
use parking_lot::Mutex;
use rustls::sign::CertifiedKey;
use tracing::{debug, warn};

use super::tls::{parse_certified_key, CertificateError};

/// Label or annotation naming the virtual host a service serves.
pub const HOST_KEY: &str = "http.host";
/// Annotation naming the subject of a TLS secret's certificate.
pub const CERT_CN_ANNOTATION: &str = "cert-cn";

const CERT_SUFFIX: &str = ".crt";
const KEY_SUFFIX: &str = ".key";

/// One upstream server instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendRecord {
    /// Stable identity from the cluster (a workload instance UID). May be
    /// empty, in which case the backend is reachable but never sticky.
    pub id: String,
    /// `host:port` dial target.
    pub endpoint: String,
}

/// Everything the proxy knows about one virtual host.
#[derive(Debug, Default)]
pub struct ServiceRecord {
    pub host: String,
    pub backends: Vec<BackendRecord>,
    /// The non-empty-id members of `backends`, for sticky lookups.
    pub backends_by_id: HashMap<String, BackendRecord>,
}

/// TLS material for one certificate common name.
pub struct CertificateRecord {
    pub common_name: String,
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
    parsed: Mutex<ParseCache>,
}

#[derive(Clone, Default)]
enum ParseCache {
    #[default]
    Unparsed,
    Parsed(Arc<CertifiedKey>),
    Failed(String),
}

impl CertificateRecord {
    /// Parse the PEM payloads into key material, at most once per raw-byte
    /// version. Parse errors are cached the same way.
    pub fn certified_key(&self) -> Result<Arc<CertifiedKey>, CertificateError> {
        let mut cache = self.parsed.lock();
        match &*cache {
            ParseCache::Parsed(key) => Ok(key.clone()),
            ParseCache::Failed(reason) => Err(CertificateError::Parse(reason.clone())),
            ParseCache::Unparsed => match parse_certified_key(&self.cert_pem, &self.key_pem) {
                Ok(key) => {
                    let key = Arc::new(key);
                    *cache = ParseCache::Parsed(key.clone());
                    Ok(key)
                }
                Err(CertificateError::Parse(reason)) => {
                    *cache = ParseCache::Failed(reason.clone());
                    Err(CertificateError::Parse(reason))
                }
            },
        }
    }

    fn cache_snapshot(&self) -> ParseCache {
        self.parsed.lock().clone()
    }
}

impl fmt::Debug for CertificateRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateRecord")
            .field("common_name", &self.common_name)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct StoreState {
    services: HashMap<ObjectKey, Arc<ServiceRecord>>,
    services_by_host: HashMap<String, Arc<ServiceRecord>>,
    secrets: HashMap<ObjectKey, Arc<CertificateRecord>>,
    secrets_by_cn: HashMap<String, Arc<CertificateRecord>>,
}

/// Thread-safe routing state. One mutex covers both primary maps and both
/// secondary indices, so readers always observe a consistent pair.
#[derive(Default)]
pub struct RoutingStore {
    state: Mutex<StoreState>,
}

impl RoutingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a service add/update (`Some`) or delete (`None`).
    pub fn apply_service(&self, namespace: &str, name: &str, service: Option<&Service>) {
        let key = ObjectKey::new(namespace, name);
        let host = service
            .and_then(|s| s.metadata.label_or_annotation(HOST_KEY))
            .unwrap_or_default()
            .to_string();

        let mut state = self.state.lock();
        let old = state.services.get(&key).cloned();

        match &old {
            None if host.is_empty() => return,
            Some(old) if old.host == host => return,
            _ => {}
        }
        debug!(object = %key, host = %host, "service host updated");

        let record = ServiceRecord {
            host,
            backends: old.as_ref().map(|r| r.backends.clone()).unwrap_or_default(),
            backends_by_id: old
                .as_ref()
                .map(|r| r.backends_by_id.clone())
                .unwrap_or_default(),
        };
        publish_service(&mut state, key, old, record);
    }

    /// Apply an endpoint-set add/update (`Some`) or delete (`None`).
    pub fn apply_endpoints(&self, namespace: &str, name: &str, endpoints: Option<&EndpointSet>) {
        let key = ObjectKey::new(namespace, name);
        let backends = endpoints.map(collect_backends).unwrap_or_default();

        let mut state = self.state.lock();
        let old = state.services.get(&key).cloned();

        let current: &[BackendRecord] = old.as_ref().map(|r| r.backends.as_slice()).unwrap_or(&[]);
        if backends == current {
            return;
        }
        debug!(object = %key, backends = backends.len(), "endpoints updated");

        let record = ServiceRecord {
            host: old.as_ref().map(|r| r.host.clone()).unwrap_or_default(),
            backends_by_id: index_by_id(&backends),
            backends,
        };
        publish_service(&mut state, key, old, record);
    }

    /// Apply a secret add/update (`Some`) or delete (`None`).
    pub fn apply_secret(&self, namespace: &str, name: &str, secret: Option<&Secret>) {
        let key = ObjectKey::new(namespace, name);

        let cert_pem = secret.map(|s| data_with_suffix(s, CERT_SUFFIX)).unwrap_or_default();
        let key_pem = secret.map(|s| data_with_suffix(s, KEY_SUFFIX)).unwrap_or_default();
        let common_name = secret
            .and_then(|s| s.metadata.annotations.get(CERT_CN_ANNOTATION))
            .map(|cn| cn.to_ascii_lowercase())
            .unwrap_or_default();

        let mut state = self.state.lock();
        let old = state.secrets.get(&key).cloned();

        let bytes_changed = old
            .as_ref()
            .map(|o| o.cert_pem != cert_pem || o.key_pem != key_pem)
            .unwrap_or(!cert_pem.is_empty() || !key_pem.is_empty());
        let cn_changed = old.as_ref().map(|o| o.common_name != common_name).unwrap_or(!common_name.is_empty());
        if !bytes_changed && !cn_changed {
            return;
        }
        debug!(object = %key, common_name = %common_name, "secret updated");

        // A byte change invalidates the parse cache; a CN-only change keeps
        // the already-parsed material.
        let parsed = if bytes_changed {
            ParseCache::Unparsed
        } else {
            old.as_ref().map(|o| o.cache_snapshot()).unwrap_or_default()
        };

        let gone = cert_pem.is_empty() && key_pem.is_empty() && common_name.is_empty();
        let record = (!gone).then(|| {
            Arc::new(CertificateRecord {
                common_name,
                cert_pem,
                key_pem,
                parsed: Mutex::new(parsed),
            })
        });

        match &record {
            Some(record) => {
                state.secrets.insert(key, record.clone());
            }
            None => {
                state.secrets.remove(&key);
            }
        }

        let old_cn = old.as_ref().map(|o| o.common_name.as_str()).unwrap_or("");
        let new_cn = record.as_ref().map(|r| r.common_name.as_str()).unwrap_or("");
        if !old_cn.is_empty() && old_cn != new_cn {
            if let (Some(current), Some(old)) = (state.secrets_by_cn.get(old_cn), &old) {
                if Arc::ptr_eq(current, old) {
                    state.secrets_by_cn.remove(old_cn);
                }
            }
        }
        if let Some(record) = record {
            if !record.common_name.is_empty() {
                state
                    .secrets_by_cn
                    .insert(record.common_name.clone(), record);
            }
        }
    }

    pub fn service_by_host(&self, host: &str) -> Option<Arc<ServiceRecord>> {
        self.state.lock().services_by_host.get(host).cloned()
    }

    pub fn certificate_by_cn(&self, cn: &str) -> Option<Arc<CertificateRecord>> {
        self.state.lock().secrets_by_cn.get(cn).cloned()
    }
}

/// Install a replacement service record and keep the host index consistent.
/// A record left with neither host nor backends is dropped entirely.
fn publish_service(
    state: &mut StoreState,
    key: ObjectKey,
    old: Option<Arc<ServiceRecord>>,
    record: ServiceRecord,
) {
    let record = (!record.host.is_empty() || !record.backends.is_empty()).then(|| Arc::new(record));

    match &record {
        Some(record) => {
            state.services.insert(key, record.clone());
        }
        None => {
            debug!(object = %key, "service record dropped");
            state.services.remove(&key);
        }
    }

    let old_host = old.as_ref().map(|r| r.host.as_str()).unwrap_or("");
    let new_host = record.as_ref().map(|r| r.host.as_str()).unwrap_or("");
    if !old_host.is_empty() && old_host != new_host {
        if let (Some(current), Some(old)) = (state.services_by_host.get(old_host), &old) {
            if Arc::ptr_eq(current, old) {
                state.services_by_host.remove(old_host);
            }
        }
    }
    if let Some(record) = record {
        if !record.host.is_empty() {
            state.services_by_host.insert(record.host.clone(), record);
        }
    }
}

/// Flatten an endpoint set into backend records, one per address in each
/// subset that exposes a usable HTTP port.
fn collect_backends(endpoints: &EndpointSet) -> Vec<BackendRecord> {
    let mut backends = Vec::new();
    for subset in &endpoints.subsets {
        // A lone port is taken as-is; among several, a port named "http"
        // wins, then "http-server". Subsets with no candidate are skipped.
        let mut http_port = 0u16;
        if subset.ports.len() == 1 {
            http_port = subset.ports[0].port;
        } else {
            for port in &subset.ports {
                if port.name == "http" {
                    http_port = port.port;
                } else if port.name == "http-server" && http_port == 0 {
                    http_port = port.port;
                }
            }
        }
        if http_port == 0 {
            continue;
        }

        for address in &subset.addresses {
            let id = address
                .target_ref
                .as_ref()
                .map(|r| r.uid.clone())
                .unwrap_or_default();
            backends.push(BackendRecord {
                id,
                endpoint: format!("{}:{}", address.ip, http_port),
            });
        }
    }
    backends
}

fn index_by_id(backends: &[BackendRecord]) -> HashMap<String, BackendRecord> {
    let mut by_id = HashMap::new();
    for backend in backends {
        if backend.id.is_empty() {
            warn!(
                endpoint = %backend.endpoint,
                "backend has no stable id; it will not participate in sticky sessions"
            );
            continue;
        }
        by_id.insert(backend.id.clone(), backend.clone());
    }
    by_id
}

/// First data payload whose key carries the given suffix; empty when absent.
fn data_with_suffix(secret: &Secret, suffix: &str) -> Vec<u8> {
    secret
        .data
        .iter()
        .find(|(key, _)| key.ends_with(suffix))
        .map(|(_, value)| value.clone())
        .unwrap_or_default()
}
