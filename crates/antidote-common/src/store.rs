//! Data store interface for lesson, lab and session records
//!
//! The store is the single source of truth for LiveLesson and LiveSession
//! state. The scheduler never caches lab state across workflow steps; it
//! re-reads through this trait before acting.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::models::{Image, Lesson, LiveLesson, LiveLessonStatus, LiveSession};
use crate::{Error, Result};

/// Persistence operations consumed by the scheduler
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Get a lesson definition by slug
    async fn get_lesson(&self, slug: &str) -> Result<Lesson>;

    /// Get an image catalog entry by name
    async fn get_image(&self, name: &str) -> Result<Image>;

    /// Insert a new LiveLesson record
    async fn create_live_lesson(&self, ll: LiveLesson) -> Result<()>;

    /// Get a LiveLesson by ID
    async fn get_live_lesson(&self, id: &str) -> Result<LiveLesson>;

    /// List every LiveLesson
    async fn list_live_lessons(&self) -> Result<Vec<LiveLesson>>;

    /// Set the provisioning status of a LiveLesson
    async fn update_live_lesson_status(&self, id: &str, status: LiveLessonStatus) -> Result<()>;

    /// Set or clear the error flag of a LiveLesson
    async fn update_live_lesson_error(&self, id: &str, error: bool) -> Result<()>;

    /// Record the service address of one endpoint
    async fn update_live_lesson_endpoint_ip(&self, id: &str, endpoint: &str, addr: &str)
        -> Result<()>;

    /// Publish reachability progress
    async fn update_live_lesson_tests(&self, id: &str, healthy: u32, total: u32) -> Result<()>;

    /// Set the current content stage
    async fn update_live_lesson_stage(&self, id: &str, stage: u32) -> Result<()>;

    /// Refresh the last-activity timestamp
    async fn touch_live_lesson(&self, id: &str, now: DateTime<Utc>) -> Result<()>;

    /// Delete a LiveLesson record; deleting a missing record succeeds
    async fn delete_live_lesson(&self, id: &str) -> Result<()>;

    /// Insert a new LiveSession record
    async fn create_live_session(&self, session: LiveSession) -> Result<()>;

    /// Get a LiveSession by ID
    async fn get_live_session(&self, id: &str) -> Result<LiveSession>;

    /// List every LiveSession
    async fn list_live_sessions(&self) -> Result<Vec<LiveSession>>;

    /// Delete a LiveSession record; deleting a missing record succeeds
    async fn delete_live_session(&self, id: &str) -> Result<()>;

    /// LiveLessons owned by a session
    async fn get_live_lessons_for_session(&self, session_id: &str) -> Result<Vec<LiveLesson>>;
}

/// In-process data store backed by concurrent maps
///
/// Used by tests and by the bundled binary when no external store is wired.
/// Status updates are also appended to a per-lab history so observers can
/// replay the transitions a lab went through.
#[derive(Default)]
pub struct InMemoryDataStore {
    lessons: DashMap<String, Lesson>,
    images: DashMap<String, Image>,
    live_lessons: DashMap<String, LiveLesson>,
    live_sessions: DashMap<String, LiveSession>,
    status_history: Mutex<HashMap<String, Vec<LiveLessonStatus>>>,
}

impl InMemoryDataStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a lesson definition
    pub fn insert_lesson(&self, lesson: Lesson) {
        self.lessons.insert(lesson.slug.clone(), lesson);
    }

    /// Register an image catalog entry
    pub fn insert_image(&self, image: Image) {
        self.images.insert(image.name.clone(), image);
    }

    /// Every status recorded for a lab, in the order it was written
    pub fn status_history(&self, id: &str) -> Vec<LiveLessonStatus> {
        self.status_history
            .lock()
            .map(|h| h.get(id).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    fn record_status(&self, id: &str, status: LiveLessonStatus) {
        if let Ok(mut history) = self.status_history.lock() {
            history.entry(id.to_string()).or_default().push(status);
        }
    }

    fn with_live_lesson<F>(&self, id: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut LiveLesson),
    {
        let mut entry = self
            .live_lessons
            .get_mut(id)
            .ok_or_else(|| Error::not_found("LiveLesson", id))?;
        f(entry.value_mut());
        Ok(())
    }
}

#[async_trait]
impl DataStore for InMemoryDataStore {
    async fn get_lesson(&self, slug: &str) -> Result<Lesson> {
        self.lessons
            .get(slug)
            .map(|l| l.value().clone())
            .ok_or_else(|| Error::not_found("Lesson", slug))
    }

    async fn get_image(&self, name: &str) -> Result<Image> {
        self.images
            .get(name)
            .map(|i| i.value().clone())
            .ok_or_else(|| Error::not_found("Image", name))
    }

    async fn create_live_lesson(&self, ll: LiveLesson) -> Result<()> {
        if self.live_lessons.contains_key(&ll.id) {
            return Err(Error::already_exists("LiveLesson", &ll.id));
        }
        self.record_status(&ll.id, ll.status);
        self.live_lessons.insert(ll.id.clone(), ll);
        Ok(())
    }

    async fn get_live_lesson(&self, id: &str) -> Result<LiveLesson> {
        self.live_lessons
            .get(id)
            .map(|l| l.value().clone())
            .ok_or_else(|| Error::not_found("LiveLesson", id))
    }

    async fn list_live_lessons(&self) -> Result<Vec<LiveLesson>> {
        Ok(self.live_lessons.iter().map(|l| l.value().clone()).collect())
    }

    async fn update_live_lesson_status(&self, id: &str, status: LiveLessonStatus) -> Result<()> {
        self.with_live_lesson(id, |ll| ll.status = status)?;
        self.record_status(id, status);
        Ok(())
    }

    async fn update_live_lesson_error(&self, id: &str, error: bool) -> Result<()> {
        self.with_live_lesson(id, |ll| ll.error = error)
    }

    async fn update_live_lesson_endpoint_ip(
        &self,
        id: &str,
        endpoint: &str,
        addr: &str,
    ) -> Result<()> {
        let mut entry = self
            .live_lessons
            .get_mut(id)
            .ok_or_else(|| Error::not_found("LiveLesson", id))?;
        let ep = entry
            .live_endpoints
            .get_mut(endpoint)
            .ok_or_else(|| Error::not_found("LiveEndpoint", endpoint))?;
        ep.host = addr.to_string();
        Ok(())
    }

    async fn update_live_lesson_tests(&self, id: &str, healthy: u32, total: u32) -> Result<()> {
        self.with_live_lesson(id, |ll| {
            ll.healthy_test_count = healthy;
            ll.total_test_count = total;
        })
    }

    async fn update_live_lesson_stage(&self, id: &str, stage: u32) -> Result<()> {
        self.with_live_lesson(id, |ll| ll.stage = stage)
    }

    async fn touch_live_lesson(&self, id: &str, now: DateTime<Utc>) -> Result<()> {
        self.with_live_lesson(id, |ll| ll.last_active_time = now)
    }

    async fn delete_live_lesson(&self, id: &str) -> Result<()> {
        self.live_lessons.remove(id);
        Ok(())
    }

    async fn create_live_session(&self, session: LiveSession) -> Result<()> {
        if self.live_sessions.contains_key(&session.id) {
            return Err(Error::already_exists("LiveSession", &session.id));
        }
        self.live_sessions.insert(session.id.clone(), session);
        Ok(())
    }

    async fn get_live_session(&self, id: &str) -> Result<LiveSession> {
        self.live_sessions
            .get(id)
            .map(|s| s.value().clone())
            .ok_or_else(|| Error::not_found("LiveSession", id))
    }

    async fn list_live_sessions(&self) -> Result<Vec<LiveSession>> {
        Ok(self
            .live_sessions
            .iter()
            .map(|s| s.value().clone())
            .collect())
    }

    async fn delete_live_session(&self, id: &str) -> Result<()> {
        self.live_sessions.remove(id);
        Ok(())
    }

    async fn get_live_lessons_for_session(&self, session_id: &str) -> Result<Vec<LiveLesson>> {
        Ok(self
            .live_lessons
            .iter()
            .filter(|l| l.session_id == session_id)
            .map(|l| l.value().clone())
            .collect())
    }
}
