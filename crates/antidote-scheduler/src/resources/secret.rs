use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use super::lab_labels;

/// Copy of a shared secret, placed in a lab namespace
///
/// Server-populated metadata (uid, resourceVersion, owner references) is
/// dropped so the copy can be created fresh.
pub fn copy_secret(source: &Secret, namespace: &str, live_lesson_id: &str) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: source.metadata.name.clone(),
            namespace: Some(namespace.to_string()),
            labels: Some(lab_labels(live_lesson_id)),
            ..Default::default()
        },
        data: source.data.clone(),
        string_data: source.string_data.clone(),
        type_: source.type_.clone(),
        immutable: source.immutable,
    }
}
