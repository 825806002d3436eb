//! Resource types mirrored from the cluster control plane.
//!
//! These are the subsets of the control-plane objects the proxy actually
//! reads. Unknown fields on the wire are ignored by serde.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity and metadata shared by every cluster object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl ObjectMeta {
    pub fn key(&self) -> ObjectKey {
        ObjectKey {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }

    /// Look up a key in labels and annotations; an annotation wins when both
    /// carry the key.
    pub fn label_or_annotation(&self, key: &str) -> Option<&str> {
        self.annotations
            .get(key)
            .or_else(|| self.labels.get(key))
            .map(String::as_str)
    }
}

/// `(namespace, name)` routing key for a cluster object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A named service. The proxy reads the virtual host it serves from the
/// `http.host` label or annotation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub metadata: ObjectMeta,
}

/// The set of ready endpoints backing a service, grouped into subsets that
/// share a port list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointSet {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub subsets: Vec<EndpointSubset>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointSubset {
    #[serde(default)]
    pub addresses: Vec<EndpointAddress>,
    #[serde(default)]
    pub ports: Vec<EndpointPort>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointAddress {
    pub ip: String,
    #[serde(default)]
    pub target_ref: Option<TargetRef>,
}

/// Reference to the workload instance behind an endpoint address. The UID is
/// the stable identity used for sticky sessions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetRef {
    pub uid: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointPort {
    #[serde(default)]
    pub name: String,
    pub port: u16,
}

/// An opaque secret. TLS secrets carry PEM payloads under keys suffixed
/// `.crt` / `.key` and name their certificate subject in the `cert-cn`
/// annotation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Secret {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub data: BTreeMap<String, Vec<u8>>,
}

/// Common access to object identity, used by generic watch-source code.
pub trait ClusterObject {
    fn metadata(&self) -> &ObjectMeta;

    fn key(&self) -> ObjectKey {
        self.metadata().key()
    }
}

impl ClusterObject for Service {
    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }
}

impl ClusterObject for EndpointSet {
    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }
}

impl ClusterObject for Secret {
    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn annotation_wins_over_label() {
        let mut meta = ObjectMeta {
            namespace: "default".to_string(),
            name: "web".to_string(),
            ..Default::default()
        };
        meta.labels
            .insert("http.host".to_string(), "label.example.test".to_string());

        assert_eq!(
            meta.label_or_annotation("http.host"),
            Some("label.example.test")
        );

        meta.annotations.insert(
            "http.host".to_string(),
            "annotation.example.test".to_string(),
        );
        assert_eq!(
            meta.label_or_annotation("http.host"),
            Some("annotation.example.test")
        );
    }

    #[test]
    fn endpoint_set_deserializes_with_missing_fields() {
        let raw = r#"{
            "metadata": {"namespace": "default", "name": "web"},
            "subsets": [{"addresses": [{"ip": "10.0.0.1"}], "ports": [{"port": 8080}]}]
        }"#;

        let endpoints: EndpointSet = serde_json::from_str(raw).unwrap();
        assert_eq!(endpoints.subsets.len(), 1);
        assert_eq!(endpoints.subsets[0].addresses[0].ip, "10.0.0.1");
        assert!(endpoints.subsets[0].addresses[0].target_ref.is_none());
        assert_eq!(endpoints.subsets[0].ports[0].name, "");
        assert_eq!(endpoints.subsets[0].ports[0].port, 8080);
    }
}
