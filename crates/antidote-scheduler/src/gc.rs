//! Garbage collection of idle labs and sessions

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::backend::AntidoteBackend;

/// Whether something last touched at `reference` has outlived `ttl`
///
/// Strictly past the boundary: an age exactly equal to the TTL is kept.
pub fn is_expired(reference: DateTime<Utc>, now: DateTime<Utc>, ttl: Duration) -> bool {
    match chrono::Duration::from_std(ttl) {
        Ok(ttl) => now.signed_duration_since(reference) > ttl,
        // A TTL too large to represent never expires
        Err(_) => false,
    }
}

/// Start the periodic lab and session expiry loop
///
/// Runs one sweep per `interval` until `cancel` fires. Errors are logged and
/// the next tick retries.
pub fn start_gc_loop(
    backend: Arc<AntidoteBackend>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // first tick fires immediately

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("garbage collector stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }

            debug!("garbage collection sweep");
            if let Err(e) = backend.prune_old_live_lessons().await {
                error!(error = %e, "pruning old live lessons failed");
            }
            if let Err(e) = backend.prune_old_live_sessions().await {
                error!(error = %e, "pruning old live sessions failed");
            }
        }
    })
}
