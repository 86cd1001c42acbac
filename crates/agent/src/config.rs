//! Agent configuration

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// Exports how far behind running container images are from the newest
/// eligible tags in their registries.
#[derive(Parser, Debug, Clone)]
#[command(name = "drift-agent", version, about)]
pub struct AgentConfig {
    /// Use the in-cluster connection configuration instead of kubeconfig
    #[arg(
        long,
        env = "DRIFT_AGENT_IN_CLUSTER",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub in_cluster: bool,

    /// How often the pod watch cache re-enqueues every known pod, in seconds
    #[arg(long, env = "DRIFT_AGENT_RESYNC_INTERVAL", default_value_t = 300)]
    pub resync_interval_secs: u64,

    /// How often to check for new image versions, in seconds. Configuring
    /// this to a lower interval will eat up your registry request quota
    /// faster.
    #[arg(long, env = "DRIFT_AGENT_CHECK_INTERVAL", default_value_t = 3600)]
    pub check_interval_secs: u64,

    /// Path to a registry credentials file in the docker config format.
    /// This is the same format as imagePullSecret contents. Defaults to
    /// ~/.docker/config.json
    #[arg(long, env = "DRIFT_AGENT_REGISTRY_CREDENTIALS")]
    pub registry_credentials: Option<PathBuf>,

    /// The address to listen on for metrics requests
    #[arg(long, env = "DRIFT_AGENT_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: String,

    /// Container technology used: [kubernetes, docker]
    #[arg(long, env = "DRIFT_AGENT_SOURCE", default_value = "kubernetes")]
    pub source: String,

    /// Log level: [trace, debug, info, warn, error]
    #[arg(long, env = "DRIFT_AGENT_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl AgentConfig {
    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    /// Explicit credentials path, or the conventional docker config
    /// location when the home directory is known.
    pub fn credentials_path(&self) -> Option<PathBuf> {
        self.registry_credentials.clone().or_else(|| {
            dirs_next::home_dir().map(|home| home.join(".docker").join("config.json"))
        })
    }
}
