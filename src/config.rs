//! Runtime configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address the Docker API facade listens on.
    pub listen_addr: String,
    /// Kubernetes namespace workloads are scheduled into.
    pub namespace: String,
    /// Seconds to wait for a workload to become ready after submission.
    pub start_timeout_secs: u64,
    /// Skip creating alias services entirely.
    pub disable_services: bool,
    /// Skip port-forwarding; endpoints are then not reachable locally.
    pub disable_port_forward: bool,
    /// Disable the post-start copy path. With this set, directory mounts
    /// and oversized files fail at planning time.
    pub disable_exec_copy: bool,
    /// Gate the Running signal on post-start mount copies having finished.
    pub ready_requires_mounts: bool,
    /// Service account for created pods, if not the namespace default.
    pub service_account: Option<String>,
    /// Default image pull policy label value (e.g. "always", "never").
    pub pull_policy: Option<String>,
    /// Seconds after which the reaper removes containers and exec
    /// sessions that a crashed or forgotten test run left behind.
    pub reap_max_age_secs: u64,
    /// Log level used when RUST_LOG is not set.
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:2475".to_string(),
            namespace: "default".to_string(),
            start_timeout_secs: 60,
            disable_services: false,
            disable_port_forward: false,
            disable_exec_copy: false,
            ready_requires_mounts: true,
            service_account: None,
            pull_policy: None,
            reap_max_age_secs: 300,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Start timeout as a [`Duration`].
    #[must_use]
    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    /// Reaper max age as a [`Duration`].
    #[must_use]
    pub fn reap_max_age(&self) -> Duration {
        Duration::from_secs(self.reap_max_age_secs)
    }
}

/// Initializes logging with the specified level.
pub fn init_logging(level: &str) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.namespace, "default");
        assert_eq!(config.start_timeout(), Duration::from_secs(60));
        assert!(config.ready_requires_mounts);
        assert!(!config.disable_exec_copy);
        assert_eq!(config.reap_max_age(), Duration::from_secs(300));
    }
}
