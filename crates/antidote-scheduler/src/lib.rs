//! Lab lifecycle orchestration for Antidote
//!
//! Turns lifecycle requests into running labs:
//! - The provisioner lays down one namespace per lab with its networks,
//!   pods, services, ingress routes, secrets and egress policy
//! - The prober waits until every endpoint presentation answers
//! - The configurator applies stage configuration through batch jobs
//! - The backend sequences the above and records status transitions
//! - The garbage collector expires idle labs and sessions
//!
//! The dispatcher feeds requests from the transport into the backend.

#![deny(missing_docs)]

pub mod backend;
pub mod cluster;
pub mod config;
pub mod configurator;
pub mod dispatcher;
pub mod gc;
pub mod health;
pub mod locks;
pub mod provisioner;
pub mod resources;

pub use backend::AntidoteBackend;
pub use cluster::{ClusterClient, KubeClusterClient};
pub use config::{CurriculumConfig, ImageConfig, SchedulerConfig, Timings};
pub use dispatcher::Dispatcher;
pub use gc::start_gc_loop;
pub use health::{HealthChecker, NetworkHealthChecker};
