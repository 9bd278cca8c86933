//! Scheduler configuration
//!
//! Everything the scheduler needs to know about its deployment: instance
//! identity, where shared secrets live, which helper images to run, TTLs for
//! garbage collection and every bounded wait in the lab lifecycle.

use std::time::Duration;

/// Poll intervals and ceilings for every bounded wait
#[derive(Clone, Debug, PartialEq)]
pub struct Timings {
    /// Interval between namespace existence checks during deletion
    pub namespace_deletion_poll: Duration,
    /// Ceiling for a namespace to disappear
    pub namespace_deletion_timeout: Duration,
    /// Interval between pod status checks
    pub pod_ready_poll: Duration,
    /// Ceiling for a single pod to start
    pub pod_ready_timeout: Duration,
    /// Interval between reachability rounds
    pub reachability_poll: Duration,
    /// Ceiling for every endpoint of a lab to become reachable
    pub reachability_timeout: Duration,
    /// Per-attempt timeout of an SSH reachability test
    pub ssh_test_timeout: Duration,
    /// Per-attempt timeout of a TCP reachability test
    pub tcp_test_timeout: Duration,
    /// Interval between configuration job status checks
    pub job_poll_interval: Duration,
    /// Number of job status checks before giving up
    pub job_poll_iterations: u32,
    /// Interval between checks that old configuration jobs are gone
    pub job_deletion_poll: Duration,
    /// Ceiling for old configuration jobs to disappear
    pub job_deletion_timeout: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            namespace_deletion_poll: Duration::from_secs(5),
            namespace_deletion_timeout: Duration::from_secs(120),
            pod_ready_poll: Duration::from_secs(2),
            pod_ready_timeout: Duration::from_secs(300),
            reachability_poll: Duration::from_secs(1),
            reachability_timeout: Duration::from_secs(600),
            ssh_test_timeout: Duration::from_secs(5),
            tcp_test_timeout: Duration::from_secs(2),
            job_poll_interval: Duration::from_secs(1),
            job_poll_iterations: 600,
            job_deletion_poll: Duration::from_secs(1),
            job_deletion_timeout: Duration::from_secs(60),
        }
    }
}

impl Timings {
    /// Total time a configuration phase may spend polling
    pub fn job_poll_ceiling(&self) -> Duration {
        self.job_poll_interval * self.job_poll_iterations
    }
}

/// Where lesson content comes from
#[derive(Clone, Debug, PartialEq)]
pub struct CurriculumConfig {
    /// Git remote of the curriculum repository
    pub repo_remote: String,
    /// Branch to check out
    pub repo_branch: String,
}

impl Default for CurriculumConfig {
    fn default() -> Self {
        Self {
            repo_remote: "https://github.com/nre-learning/nrelabs-curriculum.git".to_string(),
            repo_branch: "master".to_string(),
        }
    }
}

/// Helper images run by the scheduler itself
#[derive(Clone, Debug, PartialEq)]
pub struct ImageConfig {
    /// Init container that clones the curriculum
    pub curriculum_sync: String,
    /// Image carrying python, ansible and napalm for configuration jobs
    pub configurator: String,
    /// Image serving Jupyter lab guides
    pub jupyter: String,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            curriculum_sync: "alpine/git:latest".to_string(),
            configurator: "antidotelabs/configurator:latest".to_string(),
            jupyter: "antidotelabs/jupyter:latest".to_string(),
        }
    }
}

/// Complete scheduler configuration
#[derive(Clone, Debug, PartialEq)]
pub struct SchedulerConfig {
    /// Identifies this deployment; prefixes namespaces and scopes the orphan sweep
    pub instance_id: String,
    /// Host name ingress routes are published under
    pub ingress_host: String,
    /// Namespace holding the secrets copied into every lab
    pub secrets_namespace: String,
    /// TLS secret used by ingress routes
    pub tls_secret_name: String,
    /// Registry pull secret, if images are private
    pub pull_secret_name: Option<String>,
    /// Skip the egress isolation policy
    pub allow_egress: bool,
    /// Curriculum location
    pub curriculum: CurriculumConfig,
    /// Helper images
    pub images: ImageConfig,
    /// Idle time after which a lab is pruned
    pub live_lesson_ttl: Duration,
    /// Age after which an empty session is pruned
    pub live_session_ttl: Duration,
    /// How often the garbage collector runs
    pub gc_interval: Duration,
    /// Maximum lifecycle requests handled at once
    pub max_in_flight: usize,
    /// Bounded waits
    pub timings: Timings,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            instance_id: "antidote".to_string(),
            ingress_host: "labs.example.com".to_string(),
            secrets_namespace: "prod".to_string(),
            tls_secret_name: "tls-certificate".to_string(),
            pull_secret_name: None,
            allow_egress: false,
            curriculum: CurriculumConfig::default(),
            images: ImageConfig::default(),
            live_lesson_ttl: Duration::from_secs(30 * 60),
            live_session_ttl: Duration::from_secs(24 * 60 * 60),
            gc_interval: Duration::from_secs(60),
            max_in_flight: 64,
            timings: Timings::default(),
        }
    }
}

#[cfg(test)]
impl Timings {
    /// Short waits for unit tests
    pub(crate) fn fast() -> Self {
        let ms = Duration::from_millis;
        Self {
            namespace_deletion_poll: ms(1),
            namespace_deletion_timeout: ms(50),
            pod_ready_poll: ms(1),
            pod_ready_timeout: ms(50),
            reachability_poll: ms(5),
            reachability_timeout: ms(300),
            ssh_test_timeout: ms(200),
            tcp_test_timeout: ms(200),
            job_poll_interval: ms(1),
            job_poll_iterations: 50,
            job_deletion_poll: ms(1),
            job_deletion_timeout: ms(50),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_timings_match_documented_ceilings() {
        let t = Timings::default();
        assert_eq!(t.namespace_deletion_poll, Duration::from_secs(5));
        assert_eq!(t.namespace_deletion_timeout, Duration::from_secs(120));
        assert_eq!(t.pod_ready_timeout, Duration::from_secs(300));
        assert_eq!(t.reachability_timeout, Duration::from_secs(600));
        assert_eq!(t.job_poll_ceiling(), Duration::from_secs(600));
    }

    #[test]
    fn defaults_isolate_labs() {
        let config = SchedulerConfig::default();
        assert!(!config.allow_egress);
        assert_eq!(config.max_in_flight, 64);
        assert!(config.pull_secret_name.is_none());
    }
}
