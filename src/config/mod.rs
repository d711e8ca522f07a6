//! Process-wide configuration (spec §6 "Configuration"), layered as
//! env > flag > default via `clap`'s `env` feature, the same way the
//! teacher wires its config (see the discarded `headwind::config` module
//! this replaces in spirit — values below match spec §6's option table).

use std::path::PathBuf;

use clap::Parser;
use thiserror::Error;

use crate::registry::{Platform, RegistryError};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("CONTROLLER_WATCH_KEY must not be empty")]
    EmptyWatchKey,

    #[error("IMAGE_DEFAULT_PLATFORM is invalid: {0}")]
    InvalidPlatform(RegistryError),
}

#[derive(Debug, Clone, Parser)]
#[command(name = "kube-image-deployer", about = "Rolls workloads to the latest matching registry image digest")]
pub struct Config {
    /// Path to a kubeconfig file. Unset uses in-cluster config or the
    /// default kubeconfig discovery chain.
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    #[arg(long, env = "OFF_DEPLOYMENTS", default_value_t = false)]
    pub off_deployments: bool,

    #[arg(long, env = "OFF_STATEFULSETS", default_value_t = false)]
    pub off_statefulsets: bool,

    #[arg(long, env = "OFF_DAEMONSETS", default_value_t = false)]
    pub off_daemonsets: bool,

    #[arg(long, env = "OFF_CRONJOBS", default_value_t = false)]
    pub off_cronjobs: bool,

    #[arg(long, env = "IMAGE_HASH_CACHE_TTL_SEC", default_value_t = 60)]
    pub image_hash_cache_ttl_sec: u64,

    #[arg(long, env = "IMAGE_CHECK_INTERVAL_SEC", default_value_t = 10)]
    pub image_check_interval_sec: u64,

    #[arg(long, env = "CONTROLLER_WATCH_KEY", default_value = "kube-image-deployer")]
    pub controller_watch_key: String,

    /// Empty (the default) watches every namespace.
    #[arg(long, env = "CONTROLLER_WATCH_NAMESPACE")]
    pub controller_watch_namespace: Option<String>,

    #[arg(long, env = "IMAGE_DEFAULT_PLATFORM", default_value = "linux/amd64")]
    pub image_default_platform: String,

    /// Ambient: metrics/health HTTP bind address, carried regardless of
    /// the core's metrics non-goal (spec Non-goals exclude metrics
    /// *semantics*, not the serving surface).
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:9090")]
    pub metrics_addr: String,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config = Config::parse();
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.controller_watch_key.trim().is_empty() {
            return Err(ConfigError::EmptyWatchKey);
        }
        self.default_platform()?;
        Ok(())
    }

    pub fn default_platform(&self) -> Result<Platform, ConfigError> {
        Platform::parse(&self.image_default_platform, &Platform::default_platform()).map_err(ConfigError::InvalidPlatform)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse_from_empty_args() {
        let config = Config::parse_from(["kube-image-deployer"]);
        assert_eq!(config.controller_watch_key, "kube-image-deployer");
        assert_eq!(config.image_hash_cache_ttl_sec, 60);
        assert_eq!(config.image_check_interval_sec, 10);
        assert!(!config.off_deployments);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn malformed_platform_fails_validation() {
        let config = Config::parse_from(["kube-image-deployer", "--image-default-platform", "linux"]);
        assert!(matches!(config.validate(), Err(ConfigError::InvalidPlatform(_))));
    }

    #[test]
    fn empty_watch_key_fails_validation() {
        let config = Config::parse_from(["kube-image-deployer", "--controller-watch-key", ""]);
        assert!(matches!(config.validate(), Err(ConfigError::EmptyWatchKey)));
    }
}
