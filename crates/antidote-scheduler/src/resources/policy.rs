//! Egress isolation
//!
//! Lab pods may talk to each other and to cluster DNS, nothing else.
//! Configuration job pods carry [`LABEL_CONFIG_POD`] and are left out of the
//! policy's pod selector so they can reach external config sources.

use k8s_openapi::api::networking::v1::{
    NetworkPolicy, NetworkPolicyEgressRule, NetworkPolicyPeer, NetworkPolicyPort,
    NetworkPolicySpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{
    LabelSelector, LabelSelectorRequirement, ObjectMeta,
};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use antidote_common::LABEL_CONFIG_POD;

use super::lab_labels;

/// Name of the per-lab egress policy
pub const EGRESS_POLICY_NAME: &str = "isolate-egress";

/// Build the egress isolation policy for a lab namespace
pub fn build_network_policy(namespace: &str, live_lesson_id: &str) -> NetworkPolicy {
    let dns_port = |protocol: &str| NetworkPolicyPort {
        port: Some(IntOrString::Int(53)),
        protocol: Some(protocol.to_string()),
        ..Default::default()
    };

    NetworkPolicy {
        metadata: ObjectMeta {
            name: Some(EGRESS_POLICY_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(lab_labels(live_lesson_id)),
            ..Default::default()
        },
        spec: Some(NetworkPolicySpec {
            pod_selector: LabelSelector {
                match_expressions: Some(vec![LabelSelectorRequirement {
                    key: LABEL_CONFIG_POD.to_string(),
                    operator: "NotIn".to_string(),
                    values: Some(vec!["true".to_string()]),
                }]),
                ..Default::default()
            },
            policy_types: Some(vec!["Egress".to_string()]),
            egress: Some(vec![
                // Same namespace
                NetworkPolicyEgressRule {
                    to: Some(vec![NetworkPolicyPeer {
                        pod_selector: Some(LabelSelector::default()),
                        ..Default::default()
                    }]),
                    ..Default::default()
                },
                NetworkPolicyEgressRule {
                    ports: Some(vec![dns_port("UDP"), dns_port("TCP")]),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}
