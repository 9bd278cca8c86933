//! Request dispatch
//!
//! Lifecycle requests arrive on [`SUBJECT_REQUESTS`]. Each one runs in its
//! own task, under a span parented on the trace context the request carried.
//! At most `max_in_flight` requests run at once; the rest wait in the
//! subscription channel. A successful CREATE is announced on
//! [`SUBJECT_COMPLETED`] with the original payload.
//!
//! On shutdown the dispatcher stops taking requests and drains what is
//! running. DELETEs always run to completion. CREATE, MODIFY and BOOP get a
//! grace period, after which they are aborted and the next startup orphan
//! sweep reclaims whatever they left behind.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use tracing_opentelemetry::OpenTelemetrySpanExt;

use antidote_common::models::{LessonScheduleRequest, OperationType};
use antidote_common::tracing::{extract_context, inject_context_from};
use antidote_common::transport::{Envelope, Transport};
use antidote_common::{Error, Result, SUBJECT_COMPLETED, SUBJECT_REQUESTS};

use crate::backend::AntidoteBackend;

/// How long in-flight CREATE, MODIFY and BOOP requests get to finish on shutdown
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Routes inbound requests to the backend
pub struct Dispatcher {
    backend: Arc<AntidoteBackend>,
    transport: Arc<dyn Transport>,
    permits: Arc<Semaphore>,
    shutdown_grace: Duration,
}

impl Dispatcher {
    /// Create a dispatcher allowing `max_in_flight` concurrent requests
    pub fn new(
        backend: Arc<AntidoteBackend>,
        transport: Arc<dyn Transport>,
        max_in_flight: usize,
    ) -> Self {
        Self {
            backend,
            transport,
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    /// Override how long non-DELETE requests may run after shutdown starts
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Subscribe to the request subject and serve until cancelled
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let inbound = self.transport.subscribe(SUBJECT_REQUESTS).await?;
        info!(subject = SUBJECT_REQUESTS, "dispatcher listening");
        self.serve(inbound, cancel).await
    }

    /// Serve requests from an existing subscription until cancelled or closed
    pub async fn serve(
        &self,
        mut inbound: mpsc::Receiver<Envelope>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut tasks = JoinSet::new();
        let mut deletions = JoinSet::new();

        loop {
            let envelope = tokio::select! {
                _ = cancel.cancelled() => break,
                msg = inbound.recv() => match msg {
                    Some(envelope) => envelope,
                    None => {
                        warn!("request subscription closed");
                        break;
                    }
                },
            };

            let req: LessonScheduleRequest = match envelope.decode() {
                Ok(req) => req,
                Err(e) => {
                    warn!(error = %e, "dropping undecodable request");
                    continue;
                }
            };

            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = self.permits.clone().acquire_owned() => permit
                    .map_err(|e| Error::internal_with_context("dispatcher", e.to_string()))?,
            };

            let backend = self.backend.clone();
            let transport = self.transport.clone();
            let set = if req.operation == OperationType::Delete {
                &mut deletions
            } else {
                &mut tasks
            };
            set.spawn(async move {
                let _permit = permit;
                dispatch(&backend, transport.as_ref(), req, envelope).await;
            });

            // Reap finished handlers so the sets do not grow unbounded
            while tasks.try_join_next().is_some() {}
            while deletions.try_join_next().is_some() {}
        }

        self.drain(tasks, deletions).await;
        info!("dispatcher stopped");
        Ok(())
    }

    /// Let in-flight requests finish: deletions unconditionally, the rest
    /// within the shutdown grace
    async fn drain(&self, mut tasks: JoinSet<()>, mut deletions: JoinSet<()>) {
        if !tasks.is_empty() || !deletions.is_empty() {
            info!(
                in_flight = tasks.len(),
                deletions = deletions.len(),
                grace = ?self.shutdown_grace,
                "draining in-flight requests"
            );
        }

        let finish_rest = async { while tasks.join_next().await.is_some() {} };
        let rest_finished = tokio::join!(
            tokio::time::timeout(self.shutdown_grace, finish_rest),
            async { while deletions.join_next().await.is_some() {} },
        )
        .0
        .is_ok();

        if !rest_finished {
            warn!(aborted = tasks.len(), "shutdown grace elapsed, aborting in-flight requests");
            tasks.shutdown().await;
        }
    }
}

/// Handle one decoded request end to end
async fn dispatch(
    backend: &AntidoteBackend,
    transport: &dyn Transport,
    req: LessonScheduleRequest,
    envelope: Envelope,
) {
    let parent = extract_context(&envelope);

    let span = info_span!(
        "lesson_schedule_request",
        operation = %req.operation,
        live_lesson = %req.live_lesson_id,
        session = %req.live_session_id,
    );
    span.set_parent(parent);

    async move {
        match backend.handle(&req).await {
            Ok(()) if req.operation == OperationType::Create => {
                let mut completed = envelope;
                inject_context_from(&tracing::Span::current().context(), &mut completed);
                match transport.publish(SUBJECT_COMPLETED, completed).await {
                    Ok(()) => debug!("completion published"),
                    Err(e) => error!(error = %e, "failed to publish completion"),
                }
            }
            Ok(()) => debug!("request handled"),
            Err(e) => error!(error = %e, "request failed"),
        }
    }
    .instrument(span)
    .await
}
