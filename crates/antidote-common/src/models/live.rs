//! Runtime state of labs and sessions

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::lesson::{Lesson, Presentation};
use super::request::LessonScheduleRequest;

/// Provisioning status of a LiveLesson
///
/// Variants are declared in transition order so `Ord` follows the lifecycle.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LiveLessonStatus {
    /// Record exists, no cluster resources yet
    #[default]
    Initialized,
    /// Resources created, waiting for endpoints to become reachable
    Booting,
    /// Configuration jobs running
    Configuration,
    /// Lab is usable
    Ready,
}

impl LiveLessonStatus {
    /// Whether moving from `self` to `next` is a legal transition
    ///
    /// Forward moves may not skip a step. The only backward move is
    /// `Ready -> Configuration`, taken when a stage change reconfigures a lab.
    pub fn can_transition_to(self, next: LiveLessonStatus) -> bool {
        use LiveLessonStatus::*;
        matches!(
            (self, next),
            (Initialized, Booting)
                | (Booting, Configuration)
                | (Configuration, Ready)
                | (Ready, Configuration)
        )
    }
}

impl std::fmt::Display for LiveLessonStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initialized => write!(f, "INITIALIZED"),
            Self::Booting => write!(f, "BOOTING"),
            Self::Configuration => write!(f, "CONFIGURATION"),
            Self::Ready => write!(f, "READY"),
        }
    }
}

/// One running lab instance
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LiveLesson {
    /// Unique ID
    pub id: String,
    /// Owning session
    #[serde(rename = "sessionID")]
    pub session_id: String,
    /// Lesson this lab instantiates
    pub lesson_slug: String,
    /// Current content stage
    pub stage: u32,
    /// Provisioning status
    pub status: LiveLessonStatus,
    /// Set when any workflow step failed
    pub error: bool,
    /// Endpoints by name
    pub live_endpoints: BTreeMap<String, LiveEndpoint>,
    /// When the record was created
    pub created_time: DateTime<Utc>,
    /// Last CREATE/MODIFY/BOOP for this lab
    pub last_active_time: DateTime<Utc>,
    /// Reachability tests passed so far
    pub healthy_test_count: u32,
    /// Reachability tests in total
    pub total_test_count: u32,
}

impl LiveLesson {
    /// Build a fresh INITIALIZED record for a CREATE request
    pub fn from_request(
        request: &LessonScheduleRequest,
        lesson: &Lesson,
        now: DateTime<Utc>,
    ) -> Self {
        let live_endpoints = lesson
            .ordered_endpoints()
            .into_iter()
            .map(|ep| {
                let live = LiveEndpoint {
                    name: ep.name.clone(),
                    image: ep.image.clone(),
                    ports: ep.ports(),
                    presentations: ep.presentations.clone(),
                    configuration_type: ep.configuration_type.clone(),
                    host: String::new(),
                };
                (ep.name, live)
            })
            .collect();

        Self {
            id: request.live_lesson_id.clone(),
            session_id: request.live_session_id.clone(),
            lesson_slug: request.lesson_slug.clone(),
            stage: request.stage,
            status: LiveLessonStatus::Initialized,
            error: false,
            live_endpoints,
            created_time: now,
            last_active_time: now,
            healthy_test_count: 0,
            total_test_count: 0,
        }
    }
}

/// One workload unit within a lab
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LiveEndpoint {
    /// Endpoint name
    pub name: String,
    /// Image reference
    pub image: String,
    /// Exposed ports, in declared order
    pub ports: Vec<u16>,
    /// Protocol exposures
    pub presentations: Vec<Presentation>,
    /// Configuration mechanism, if the endpoint is configured
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration_type: Option<String>,
    /// Service address, populated once the backing service exists
    #[serde(default)]
    pub host: String,
}

/// A user's interaction session
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LiveSession {
    /// Unique ID
    pub id: String,
    /// Client address the session was opened from
    #[serde(rename = "sourceIP")]
    pub source_ip: String,
    /// Persistent sessions are never garbage-collected
    pub persistent: bool,
    /// When the session was created
    pub created_time: DateTime<Utc>,
}
