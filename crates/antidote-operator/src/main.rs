//! Antidote scheduler - runs lab lifecycles on a Kubernetes cluster

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use kube::Client;
use tokio_util::sync::CancellationToken;

use antidote_common::store::InMemoryDataStore;
use antidote_common::telemetry::{init_telemetry, shutdown_telemetry, TelemetryConfig};
use antidote_common::transport::InMemoryTransport;
use antidote_scheduler::{
    start_gc_loop, AntidoteBackend, CurriculumConfig, Dispatcher, ImageConfig,
    KubeClusterClient, NetworkHealthChecker, SchedulerConfig, Timings,
};

/// Antidote lab scheduler
#[derive(Parser, Debug)]
#[command(name = "antidote-scheduler", version, about, long_about = None)]
struct Cli {
    /// Identifies this deployment; prefixes lab namespaces
    #[arg(long, env = "ANTIDOTE_INSTANCE_ID", default_value = "antidote")]
    instance_id: String,

    /// Host name ingress routes are published under
    #[arg(long, env = "ANTIDOTE_INGRESS_HOST", default_value = "labs.example.com")]
    ingress_host: String,

    /// Namespace holding the secrets copied into every lab
    #[arg(long, env = "ANTIDOTE_SECRETS_NAMESPACE", default_value = "prod")]
    secrets_namespace: String,

    /// TLS secret used by ingress routes
    #[arg(long, env = "ANTIDOTE_TLS_SECRET", default_value = "tls-certificate")]
    tls_secret_name: String,

    /// Registry pull secret for private images
    #[arg(long, env = "ANTIDOTE_PULL_SECRET")]
    pull_secret_name: Option<String>,

    /// Do not isolate lab egress
    #[arg(long, env = "ANTIDOTE_ALLOW_EGRESS")]
    allow_egress: bool,

    /// Git remote of the curriculum
    #[arg(
        long,
        env = "ANTIDOTE_CURRICULUM_REPO",
        default_value = "https://github.com/nre-learning/nrelabs-curriculum.git"
    )]
    curriculum_repo: String,

    /// Curriculum branch to check out
    #[arg(long, env = "ANTIDOTE_CURRICULUM_BRANCH", default_value = "master")]
    curriculum_branch: String,

    /// Image cloning the curriculum into lab pods
    #[arg(long, env = "ANTIDOTE_CURRICULUM_SYNC_IMAGE", default_value = "alpine/git:latest")]
    curriculum_sync_image: String,

    /// Image running configuration jobs
    #[arg(
        long,
        env = "ANTIDOTE_CONFIGURATOR_IMAGE",
        default_value = "antidotelabs/configurator:latest"
    )]
    configurator_image: String,

    /// Image serving Jupyter lab guides
    #[arg(long, env = "ANTIDOTE_JUPYTER_IMAGE", default_value = "antidotelabs/jupyter:latest")]
    jupyter_image: String,

    /// Minutes of inactivity before a lab is pruned
    #[arg(long, env = "ANTIDOTE_LIVE_LESSON_TTL_MINUTES", default_value_t = 30)]
    live_lesson_ttl_minutes: u64,

    /// Minutes after which a session without labs is pruned
    #[arg(long, env = "ANTIDOTE_LIVE_SESSION_TTL_MINUTES", default_value_t = 1440)]
    live_session_ttl_minutes: u64,

    /// Seconds between garbage collection sweeps
    #[arg(long, env = "ANTIDOTE_GC_INTERVAL_SECONDS", default_value_t = 60)]
    gc_interval_seconds: u64,

    /// Lifecycle requests handled at once
    #[arg(long, env = "ANTIDOTE_MAX_IN_FLIGHT", default_value_t = 64)]
    max_in_flight: usize,
}

impl Cli {
    fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            instance_id: self.instance_id.clone(),
            ingress_host: self.ingress_host.clone(),
            secrets_namespace: self.secrets_namespace.clone(),
            tls_secret_name: self.tls_secret_name.clone(),
            pull_secret_name: self.pull_secret_name.clone(),
            allow_egress: self.allow_egress,
            curriculum: CurriculumConfig {
                repo_remote: self.curriculum_repo.clone(),
                repo_branch: self.curriculum_branch.clone(),
            },
            images: ImageConfig {
                curriculum_sync: self.curriculum_sync_image.clone(),
                configurator: self.configurator_image.clone(),
                jupyter: self.jupyter_image.clone(),
            },
            live_lesson_ttl: Duration::from_secs(self.live_lesson_ttl_minutes * 60),
            live_session_ttl: Duration::from_secs(self.live_session_ttl_minutes * 60),
            gc_interval: Duration::from_secs(self.gc_interval_seconds),
            max_in_flight: self.max_in_flight,
            timings: Timings::default(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_telemetry(TelemetryConfig {
        instance_id: Some(cli.instance_id.clone()),
        ..Default::default()
    })
    .map_err(|e| anyhow::anyhow!("Failed to initialize telemetry: {}", e))?;

    let result = run(cli.scheduler_config()).await;
    if let Err(e) = &result {
        tracing::error!(error = %e, "scheduler exited with error");
    }
    shutdown_telemetry();
    result
}

async fn run(config: SchedulerConfig) -> anyhow::Result<()> {
    let config = Arc::new(config);
    tracing::info!(instance_id = %config.instance_id, "starting antidote scheduler");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let store = Arc::new(InMemoryDataStore::new());
    let transport = Arc::new(InMemoryTransport::new());
    let backend = Arc::new(AntidoteBackend::new(
        Arc::new(KubeClusterClient::new(client)),
        Arc::new(NetworkHealthChecker::new(&config.timings)),
        store,
        config.clone(),
    ));

    // Labs are re-created on demand, so anything left by a previous run goes
    tracing::info!("Sweeping orphaned lab namespaces...");
    backend
        .prune_orphans()
        .await
        .map_err(|e| anyhow::anyhow!("Startup orphan sweep failed: {}", e))?;

    let cancel = CancellationToken::new();
    let gc = start_gc_loop(backend.clone(), config.gc_interval, cancel.clone());

    let dispatcher = Dispatcher::new(backend, transport, config.max_in_flight);
    let serve = {
        let cancel = cancel.clone();
        tokio::spawn(async move { dispatcher.run(cancel).await })
    };

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to listen for shutdown signal: {}", e))?;
    tracing::info!("Shutdown signal received");
    cancel.cancel();

    serve
        .await
        .map_err(|e| anyhow::anyhow!("Dispatcher task panicked: {}", e))?
        .map_err(|e| anyhow::anyhow!("Dispatcher failed: {}", e))?;
    gc.await
        .map_err(|e| anyhow::anyhow!("Garbage collector task panicked: {}", e))?;

    tracing::info!("Scheduler stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_scheduler_defaults() {
        let cli = Cli::try_parse_from(["antidote-scheduler"]).unwrap();
        assert_eq!(cli.scheduler_config(), SchedulerConfig::default());
    }

    #[test]
    fn durations_are_given_in_minutes_and_seconds() {
        let cli = Cli::try_parse_from([
            "antidote-scheduler",
            "--instance-id",
            "ptr",
            "--live-lesson-ttl-minutes",
            "5",
            "--gc-interval-seconds",
            "10",
            "--pull-secret-name",
            "docker",
            "--allow-egress",
        ])
        .unwrap();
        let config = cli.scheduler_config();
        assert_eq!(config.instance_id, "ptr");
        assert_eq!(config.live_lesson_ttl, Duration::from_secs(300));
        assert_eq!(config.gc_interval, Duration::from_secs(10));
        assert_eq!(config.pull_secret_name.as_deref(), Some("docker"));
        assert!(config.allow_egress);
    }
}
