//! Endpoint reachability
//!
//! Each endpoint presentation gets one test: SSH presentations must complete
//! a key exchange and answer an authentication request, everything else must
//! accept a TCP connection. Endpoints without presentations get a single TCP test on their
//! first port. A test that passes once stays passed; a lab is reachable when
//! every test has passed. Progress is published to the data store each time
//! the healthy count changes.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use russh::client;
use russh::Disconnect;
use russh_keys::key::PublicKey;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, info, instrument, trace};

#[cfg(test)]
use mockall::automock;

use antidote_common::models::{LiveLesson, PresentationType};
use antidote_common::store::DataStore;
use antidote_common::{Error, Result};

use crate::config::Timings;

/// User named in the authentication request; the answer is never used
const SSH_CHECK_USER: &str = "antidote";

/// Protocol a reachability test speaks
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TestKind {
    /// Expect an SSH server to finish its handshake
    Ssh,
    /// Expect a TCP connection to be accepted
    Tcp,
}

/// One reachability test
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ReachabilityTest {
    /// Endpoint under test
    pub endpoint: String,
    /// Address to dial
    pub host: String,
    /// Port to dial
    pub port: u16,
    /// Protocol to check
    pub kind: TestKind,
}

/// Tests for every endpoint of a lab
///
/// Endpoints are dialled at their recorded service address, or by name
/// when none is recorded.
pub fn tests_for(ll: &LiveLesson) -> Vec<ReachabilityTest> {
    let mut tests = Vec::new();
    for ep in ll.live_endpoints.values() {
        let host = if ep.host.is_empty() {
            ep.name.clone()
        } else {
            ep.host.clone()
        };

        if ep.presentations.is_empty() {
            if let Some(port) = ep.ports.first() {
                tests.push(ReachabilityTest {
                    endpoint: ep.name.clone(),
                    host,
                    port: *port,
                    kind: TestKind::Tcp,
                });
            }
            continue;
        }

        for pres in &ep.presentations {
            tests.push(ReachabilityTest {
                endpoint: ep.name.clone(),
                host: host.clone(),
                port: pres.port,
                kind: match pres.type_ {
                    PresentationType::Ssh => TestKind::Ssh,
                    _ => TestKind::Tcp,
                },
            });
        }
    }
    tests
}

/// Runs a single reachability test
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HealthChecker: Send + Sync {
    /// True if the test passed this attempt
    async fn check(&self, test: &ReachabilityTest) -> bool;
}

/// [`HealthChecker`] that dials endpoints over the network
#[derive(Clone, Debug)]
pub struct NetworkHealthChecker {
    ssh_timeout: Duration,
    tcp_timeout: Duration,
}

impl NetworkHealthChecker {
    /// Create a checker using the per-test timeouts from `timings`
    pub fn new(timings: &Timings) -> Self {
        Self {
            ssh_timeout: timings.ssh_test_timeout,
            tcp_timeout: timings.tcp_test_timeout,
        }
    }
}

/// Accepts whatever host key the endpoint presents
///
/// Lab endpoints are booted from images with keys nobody has pinned.
struct AnyHostKey;

#[async_trait]
impl client::Handler for AnyHostKey {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Run an SSH key exchange and one authentication attempt
///
/// sshd is up once it answers the attempt, whether it accepts or rejects
/// it. An identification line alone is not enough: network OSes print it
/// long before their SSH service can finish a handshake.
async fn ssh_handshake(host: &str, port: u16) -> std::result::Result<(), russh::Error> {
    let config = Arc::new(client::Config::default());
    let mut session = client::connect(config, (host, port), AnyHostKey).await?;
    let accepted = session.authenticate_none(SSH_CHECK_USER).await?;
    trace!(host, port, accepted, "ssh authentication answered");
    if let Err(e) = session
        .disconnect(Disconnect::ByApplication, "", "en")
        .await
    {
        trace!(host, port, error = %e, "ssh disconnect failed");
    }
    Ok(())
}

#[async_trait]
impl HealthChecker for NetworkHealthChecker {
    async fn check(&self, test: &ReachabilityTest) -> bool {
        let host = test.host.as_str();
        let result = match test.kind {
            TestKind::Ssh => tokio::time::timeout(self.ssh_timeout, ssh_handshake(host, test.port))
                .await
                .map(|r| r.is_ok()),
            TestKind::Tcp => {
                tokio::time::timeout(self.tcp_timeout, TcpStream::connect((host, test.port)))
                    .await
                    .map(|r| r.is_ok())
            }
        };
        let ok = result.unwrap_or(false);
        trace!(endpoint = %test.endpoint, host, port = test.port, ok, "reachability test");
        ok
    }
}

/// Waits for a lab's endpoints to become reachable
pub struct Prober {
    checker: Arc<dyn HealthChecker>,
    store: Arc<dyn DataStore>,
    poll_interval: Duration,
    timeout: Duration,
}

impl Prober {
    /// Create a prober
    pub fn new(checker: Arc<dyn HealthChecker>, store: Arc<dyn DataStore>, timings: &Timings) -> Self {
        Self {
            checker,
            store,
            poll_interval: timings.reachability_poll,
            timeout: timings.reachability_timeout,
        }
    }

    /// Run rounds of tests until all have passed or the ceiling expires
    ///
    /// Returns [`Error::Unreachable`] naming the endpoints that never passed.
    #[instrument(skip(self, ll), fields(live_lesson = %ll.id))]
    pub async fn wait_until_reachable(&self, ll: &LiveLesson) -> Result<()> {
        let tests = tests_for(ll);
        let total = tests.len() as u32;
        let mut passed = vec![false; tests.len()];
        let mut published = None;
        let deadline = Instant::now() + self.timeout;

        loop {
            let pending: Vec<usize> = (0..tests.len()).filter(|i| !passed[*i]).collect();
            let results = join_all(pending.iter().map(|i| self.checker.check(&tests[*i]))).await;
            for (i, ok) in pending.into_iter().zip(results) {
                passed[i] |= ok;
            }

            let healthy = passed.iter().filter(|p| **p).count() as u32;
            if published != Some(healthy) {
                self.store
                    .update_live_lesson_tests(&ll.id, healthy, total)
                    .await?;
                published = Some(healthy);
                debug!(healthy, total, "reachability progress");
            }

            if healthy == total {
                info!(total, "all endpoints reachable");
                return Ok(());
            }

            if Instant::now() + self.poll_interval > deadline {
                let endpoints: BTreeSet<String> = tests
                    .iter()
                    .zip(&passed)
                    .filter(|(_, ok)| !**ok)
                    .map(|(t, _)| t.endpoint.clone())
                    .collect();
                return Err(Error::Unreachable {
                    live_lesson: ll.id.clone(),
                    endpoints: endpoints.into_iter().collect(),
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
