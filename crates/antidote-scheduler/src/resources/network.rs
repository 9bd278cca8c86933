//! Multus virtual networks
//!
//! Each lesson connection becomes one bridge network with host-local IPAM.
//! Addresses come out of the pool in the order pods attach, which is why
//! pods are always created in the lesson's declared endpoint order.
//!
//! Bridges live in the node's network namespace, shared by every lab
//! scheduled there. Device names are therefore hashed from the lab
//! namespace and the network name.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};

use antidote_common::kube_utils::HasApiResource;
use antidote_common::models::Lesson;
use antidote_common::Result;

use super::lab_labels;

/// Pod annotation listing the networks a pod joins
pub const NETWORKS_ANNOTATION: &str = "k8s.v1.cni.cncf.io/networks";

/// Multus NetworkAttachmentDefinition
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkAttachmentDefinition {
    /// API version
    pub api_version: String,
    /// Resource kind
    pub kind: String,
    /// Metadata
    pub metadata: ObjectMeta,
    /// Spec
    pub spec: NetworkAttachmentDefinitionSpec,
}

impl HasApiResource for NetworkAttachmentDefinition {
    const API_VERSION: &'static str = "k8s.cni.cncf.io/v1";
    const KIND: &'static str = "NetworkAttachmentDefinition";
}

/// NetworkAttachmentDefinition spec
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct NetworkAttachmentDefinitionSpec {
    /// CNI configuration as a JSON string
    pub config: String,
}

impl NetworkAttachmentDefinition {
    /// Create a bridge network with host-local IPAM on `subnet`
    pub fn bridge(name: &str, namespace: &str, subnet: &str, live_lesson_id: &str) -> Self {
        let config = json!({
            "cniVersion": "0.3.1",
            "name": format!("{}-{}", namespace, name),
            "type": "bridge",
            "bridge": bridge_device(namespace, name),
            "ipam": {
                "type": "host-local",
                "subnet": subnet,
            },
        });

        Self {
            api_version: Self::API_VERSION.to_string(),
            kind: Self::KIND.to_string(),
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                labels: Some(lab_labels(live_lesson_id)),
                ..Default::default()
            },
            spec: NetworkAttachmentDefinitionSpec {
                config: config.to_string(),
            },
        }
    }
}

/// Prefix of every lab bridge device
const BRIDGE_PREFIX: &str = "br";

/// Hex digits kept from the hash; prefix plus digest fills the 15-byte
/// Linux interface name limit
const BRIDGE_HASH_LEN: usize = 13;

/// Node-unique bridge device for `name` in lab `namespace`
fn bridge_device(namespace: &str, name: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(namespace.as_bytes());
    hasher.update([0u8]);
    hasher.update(name.as_bytes());
    let mut digest = hex::encode(hasher.finalize());
    digest.truncate(BRIDGE_HASH_LEN);
    format!("{}{}", BRIDGE_PREFIX, digest)
}

/// One network per lesson connection, in connection order
///
/// Fails when a connection without an explicit subnet falls outside the
/// default pool.
pub fn build_networks(
    lesson: &Lesson,
    namespace: &str,
    live_lesson_id: &str,
) -> Result<Vec<NetworkAttachmentDefinition>> {
    lesson
        .connections
        .iter()
        .enumerate()
        .map(|(index, conn)| {
            Ok(NetworkAttachmentDefinition::bridge(
                &conn.network_name(),
                namespace,
                &conn.subnet_or_default(index)?,
                live_lesson_id,
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use antidote_common::models::Connection;

    #[test]
    fn one_network_per_connection() {
        let lesson = Lesson {
            connections: vec![
                Connection {
                    a: "vqfx1".into(),
                    b: "vqfx2".into(),
                    subnet: None,
                },
                Connection {
                    a: "vqfx2".into(),
                    b: "vqfx3".into(),
                    subnet: Some("172.16.0.0/24".into()),
                },
            ],
            ..Default::default()
        };

        let nets = build_networks(&lesson, "prod-ll-1", "ll-1").unwrap();
        assert_eq!(nets.len(), 2);
        assert_eq!(nets[0].metadata.name.as_deref(), Some("vqfx1-vqfx2-net"));
        assert_eq!(nets[0].api_version, "k8s.cni.cncf.io/v1");

        let cni: serde_json::Value = serde_json::from_str(&nets[0].spec.config).unwrap();
        assert_eq!(cni["type"], "bridge");
        assert_eq!(cni["ipam"]["subnet"], "10.10.0.0/24");
        assert_eq!(cni["name"], "prod-ll-1-vqfx1-vqfx2-net");
        assert_eq!(cni["bridge"], bridge_device("prod-ll-1", "vqfx1-vqfx2-net"));

        let cni: serde_json::Value = serde_json::from_str(&nets[1].spec.config).unwrap();
        assert_eq!(cni["ipam"]["subnet"], "172.16.0.0/24");
    }

    #[test]
    fn bridge_device_fits_interface_name_limit() {
        let dev = bridge_device("antidote-ll-1", "averyveryverylongname-other-net");
        assert_eq!(dev.len(), 15);
        assert!(dev.starts_with("br"));
        assert!(dev[2..].chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(dev, bridge_device("antidote-ll-1", "averyveryverylongname-other-net"));
    }

    fn bridges(namespace: &str, lesson: &Lesson) -> Vec<String> {
        build_networks(lesson, namespace, "ll")
            .unwrap()
            .iter()
            .map(|nad| {
                let cni: serde_json::Value = serde_json::from_str(&nad.spec.config).unwrap();
                cni["bridge"].as_str().unwrap().to_string()
            })
            .collect()
    }

    /// Story: labs sharing a node never share a bridge, even when the
    /// lesson is the same or the link names only differ past 15 bytes
    #[test]
    fn story_bridges_are_unique_across_labs_and_links() {
        let lesson = Lesson {
            connections: vec![
                Connection {
                    a: "server01".into(),
                    b: "switch01".into(),
                    subnet: None,
                },
                Connection {
                    a: "server01".into(),
                    b: "switch02".into(),
                    subnet: None,
                },
            ],
            ..Default::default()
        };

        let mut all = bridges("antidote-ll-1", &lesson);
        all.extend(bridges("antidote-ll-2", &lesson));
        let distinct: std::collections::BTreeSet<_> = all.iter().collect();
        assert_eq!(distinct.len(), 4, "{:?}", all);
    }

    #[test]
    fn exhausted_subnet_pool_fails_the_build() {
        let lesson = Lesson {
            connections: (0..62_977)
                .map(|i| Connection {
                    a: format!("a{}", i),
                    b: format!("b{}", i),
                    subnet: None,
                })
                .collect(),
            ..Default::default()
        };
        assert!(build_networks(&lesson, "ns", "ll").is_err());
    }

    #[test]
    fn serializes_with_kube_field_names() {
        let nad = NetworkAttachmentDefinition::bridge("a-b-net", "ns", "10.10.0.0/24", "ll");
        let value = serde_json::to_value(&nad).unwrap();
        assert_eq!(value["apiVersion"], "k8s.cni.cncf.io/v1");
        assert_eq!(value["kind"], "NetworkAttachmentDefinition");
        assert_eq!(value["metadata"]["namespace"], "ns");
    }
}
