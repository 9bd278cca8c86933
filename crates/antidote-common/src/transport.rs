//! Message transport used to receive lifecycle requests and announce completions
//!
//! Messages travel as an [`Envelope`]: a header map (which carries W3C trace
//! context) plus an opaque JSON payload. The transport itself is an external
//! collaborator; [`InMemoryTransport`] provides subject-based fan-out inside
//! one process.

use std::collections::BTreeMap;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::mpsc;
use tracing::trace;

use crate::{Error, Result};

/// Buffer size of each in-memory subscription
pub const SUBSCRIPTION_BUFFER: usize = 1024;

/// One message on the transport
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Envelope {
    /// Transport headers (trace context lives here)
    pub headers: BTreeMap<String, String>,
    /// Encoded payload
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Encode a payload as JSON with no headers
    pub fn from_json<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Self {
            headers: BTreeMap::new(),
            payload: serde_json::to_vec(value)?,
        })
    }

    /// Decode the payload as JSON
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// Publish/subscribe transport
#[async_trait]
pub trait Transport: Send + Sync {
    /// Subscribe to a subject; messages published afterwards are delivered to the receiver
    async fn subscribe(&self, subject: &str) -> Result<mpsc::Receiver<Envelope>>;

    /// Publish a message on a subject
    async fn publish(&self, subject: &str, envelope: Envelope) -> Result<()>;
}

/// Subject-based fan-out transport within a single process
///
/// Like a broker subject, a publish with no subscribers is dropped.
#[derive(Default)]
pub struct InMemoryTransport {
    subscribers: DashMap<String, Vec<mpsc::Sender<Envelope>>>,
}

impl InMemoryTransport {
    /// Create a transport with no subscribers
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn subscribe(&self, subject: &str) -> Result<mpsc::Receiver<Envelope>> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        self.subscribers
            .entry(subject.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn publish(&self, subject: &str, envelope: Envelope) -> Result<()> {
        // Clone the senders out so no map guard is held across an await
        let senders: Vec<_> = self
            .subscribers
            .get(subject)
            .map(|s| s.value().clone())
            .unwrap_or_default();

        if senders.is_empty() {
            trace!(subject, "no subscribers, dropping message");
            return Ok(());
        }

        let mut delivered = 0;
        for tx in &senders {
            if tx.send(envelope.clone()).await.is_ok() {
                delivered += 1;
            }
        }

        if let Some(mut subs) = self.subscribers.get_mut(subject) {
            subs.retain(|tx| !tx.is_closed());
        }

        if delivered == 0 {
            return Err(Error::transport(format!(
                "all subscribers of {} have gone away",
                subject
            )));
        }
        Ok(())
    }
}
