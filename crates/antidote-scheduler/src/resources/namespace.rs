use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use antidote_common::kube_utils::{label_selector, timestamp_label};
use antidote_common::models::LiveLesson;
use antidote_common::{
    LABEL_CREATED, LABEL_INSTANCE_ID, LABEL_LAST_ACCESSED, LABEL_LESSON, LABEL_LIVE_LESSON,
    LABEL_LIVE_SESSION, LABEL_MANAGED_BY, LABEL_MANAGED_BY_ANTIDOTE,
};

/// Name of the namespace holding every resource of one lab
///
/// Pure in both arguments; distinct lab IDs under one instance never collide.
pub fn namespace_name(instance_id: &str, live_lesson_id: &str) -> String {
    format!("{}-{}", instance_id, live_lesson_id)
}

/// Label selector matching every lab namespace owned by an instance
pub fn instance_selector(instance_id: &str) -> String {
    label_selector(&BTreeMap::from([
        (
            LABEL_MANAGED_BY.to_string(),
            LABEL_MANAGED_BY_ANTIDOTE.to_string(),
        ),
        (LABEL_INSTANCE_ID.to_string(), instance_id.to_string()),
    ]))
}

/// Build the namespace for a lab
pub fn build_namespace(instance_id: &str, ll: &LiveLesson, now: DateTime<Utc>) -> Namespace {
    let labels = BTreeMap::from([
        (
            LABEL_MANAGED_BY.to_string(),
            LABEL_MANAGED_BY_ANTIDOTE.to_string(),
        ),
        (LABEL_INSTANCE_ID.to_string(), instance_id.to_string()),
        (LABEL_LIVE_LESSON.to_string(), ll.id.clone()),
        (LABEL_LIVE_SESSION.to_string(), ll.session_id.clone()),
        (LABEL_LESSON.to_string(), ll.lesson_slug.clone()),
        (LABEL_CREATED.to_string(), timestamp_label(ll.created_time)),
        (LABEL_LAST_ACCESSED.to_string(), timestamp_label(now)),
    ]);

    Namespace {
        metadata: ObjectMeta {
            name: Some(namespace_name(instance_id, &ll.id)),
            labels: Some(labels),
            ..Default::default()
        },
        ..Default::default()
    }
}
