use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use antidote_common::models::LessonEndpoint;

use super::endpoint_labels;

/// Cluster-local service for an endpoint; `None` when it exposes no ports
pub fn build_service(
    endpoint: &LessonEndpoint,
    namespace: &str,
    live_lesson_id: &str,
) -> Option<Service> {
    let ports: Vec<ServicePort> = endpoint
        .ports()
        .into_iter()
        .map(|port| ServicePort {
            name: Some(format!("port-{}", port)),
            port: i32::from(port),
            target_port: Some(IntOrString::Int(i32::from(port))),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        })
        .collect();

    if ports.is_empty() {
        return None;
    }

    let labels = endpoint_labels(live_lesson_id, &endpoint.name);
    Some(Service {
        metadata: ObjectMeta {
            name: Some(endpoint.name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(labels),
            ports: Some(ports),
            ..Default::default()
        }),
        ..Default::default()
    })
}
