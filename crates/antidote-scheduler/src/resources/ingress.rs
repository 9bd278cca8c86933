use std::collections::BTreeMap;

use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, IngressTLS, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use antidote_common::models::Presentation;

use super::endpoint_labels;
use crate::config::SchedulerConfig;

const INGRESS_CLASS: &str = "nginx";

/// Ingress object name for an endpoint presentation
pub fn ingress_name(endpoint: &str, presentation: &str) -> String {
    format!("{}-{}", endpoint, presentation)
}

/// Public path of an HTTP presentation
pub fn ingress_path(live_lesson_id: &str, endpoint: &str, presentation: &str) -> String {
    format!("/{}-{}-{}", live_lesson_id, endpoint, presentation)
}

/// Route an HTTP presentation from the public host to its endpoint service
pub fn build_ingress(
    config: &SchedulerConfig,
    endpoint: &str,
    presentation: &Presentation,
    namespace: &str,
    live_lesson_id: &str,
) -> Ingress {
    let annotations = BTreeMap::from([
        (
            "nginx.ingress.kubernetes.io/rewrite-target".to_string(),
            "/".to_string(),
        ),
        (
            "nginx.ingress.kubernetes.io/ssl-redirect".to_string(),
            "true".to_string(),
        ),
    ]);

    Ingress {
        metadata: ObjectMeta {
            name: Some(ingress_name(endpoint, &presentation.name)),
            namespace: Some(namespace.to_string()),
            labels: Some(endpoint_labels(live_lesson_id, endpoint)),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(IngressSpec {
            ingress_class_name: Some(INGRESS_CLASS.to_string()),
            tls: Some(vec![IngressTLS {
                hosts: Some(vec![config.ingress_host.clone()]),
                secret_name: Some(config.tls_secret_name.clone()),
            }]),
            rules: Some(vec![IngressRule {
                host: Some(config.ingress_host.clone()),
                http: Some(HTTPIngressRuleValue {
                    paths: vec![HTTPIngressPath {
                        path: Some(ingress_path(live_lesson_id, endpoint, &presentation.name)),
                        path_type: "Prefix".to_string(),
                        backend: IngressBackend {
                            service: Some(IngressServiceBackend {
                                name: endpoint.to_string(),
                                port: Some(ServiceBackendPort {
                                    number: Some(i32::from(presentation.port)),
                                    ..Default::default()
                                }),
                            }),
                            ..Default::default()
                        },
                    }],
                }),
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}
