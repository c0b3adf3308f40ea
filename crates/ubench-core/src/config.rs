//! ubench.toml: workspace configuration.
//!
//! Every field has a default, so the file is optional. Values are resolved
//! in order: built-in defaults, then `ubench.toml`, then environment
//! variables (`SLURM_ACCOUNT`, `SLURM_PARTITION`, `SLURM_QOS`,
//! `SLURM_TIME_LIMIT`, `UBENCH_STATE_DIR`, `UBENCH_RECIPES_DIR`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::duration::{is_slurm_time_limit, parse_duration};
use crate::error::ConfigError;

/// File name looked up in the working directory when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "ubench.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UbenchConfig {
    pub slurm: SlurmSettings,
    pub paths: PathSettings,
    pub placement: PlacementSettings,
    pub containers: ContainerSettings,
}

/// Defaults applied to every submitted batch script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlurmSettings {
    /// Billing account. Omitted from the script when unset.
    pub account: Option<String>,
    pub partition: String,
    pub qos: String,
    pub time_limit: String,
    /// Limit on any single `sbatch`, `squeue`, `sacct` or `scancel` call.
    pub command_timeout: String,
}

impl Default for SlurmSettings {
    fn default() -> Self {
        Self {
            account: None,
            partition: "cpu".to_string(),
            qos: "default".to_string(),
            time_limit: "04:00:00".to_string(),
            command_timeout: "30s".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathSettings {
    /// Recipe catalog root.
    pub recipes: PathBuf,
    /// Instance store, discovery registry and generated collector configs.
    pub state: PathBuf,
    /// Batch job logs and metric exports.
    pub output: PathBuf,
}

impl Default for PathSettings {
    fn default() -> Self {
        let state = std::env::var_os("HOME")
            .map(|home| PathBuf::from(home).join(".ubench"))
            .unwrap_or_else(|| PathBuf::from(".ubench"));
        Self {
            recipes: PathBuf::from("recipes"),
            state,
            output: PathBuf::from("logs"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlacementSettings {
    /// How long a blocking deploy waits for a host.
    pub timeout: String,
    pub poll_interval: String,
}

impl Default for PlacementSettings {
    fn default() -> Self {
        Self {
            timeout: "10m".to_string(),
            poll_interval: "5s".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerSettings {
    /// Environment module loaded before any container command, e.g. `Env/Default`.
    pub module_env: Option<String>,
    /// Module providing the `apptainer` binary, e.g. `Apptainer/1.2.4`.
    pub apptainer_module: Option<String>,
    /// Where pulled container images are cached.
    pub image_cache: PathBuf,
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            module_env: None,
            apptainer_module: None,
            image_cache: PathBuf::from("containers"),
        }
    }
}

impl UbenchConfig {
    /// Load configuration.
    ///
    /// An explicit `path` must exist. Without one, `./ubench.toml` is used
    /// when present and defaults otherwise. Environment overrides are applied
    /// last.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default = Path::new(DEFAULT_CONFIG_FILE);
                if default.is_file() {
                    Self::from_file(default)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: UbenchConfig = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.message().to_string(),
        })?;
        debug!(path = %path.display(), "config loaded");
        Ok(config)
    }

    /// Apply environment overrides read through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(account) = non_empty("SLURM_ACCOUNT") {
            self.slurm.account = Some(account);
        }
        if let Some(partition) = non_empty("SLURM_PARTITION") {
            self.slurm.partition = partition;
        }
        if let Some(qos) = non_empty("SLURM_QOS") {
            self.slurm.qos = qos;
        }
        if let Some(limit) = non_empty("SLURM_TIME_LIMIT") {
            self.slurm.time_limit = limit;
        }
        if let Some(state) = non_empty("UBENCH_STATE_DIR") {
            self.paths.state = PathBuf::from(state);
        }
        if let Some(recipes) = non_empty("UBENCH_RECIPES_DIR") {
            self.paths.recipes = PathBuf::from(recipes);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_slurm_time_limit(&self.slurm.time_limit) {
            return Err(invalid("slurm.time_limit", &self.slurm.time_limit));
        }
        self.placement_timeout()?;
        self.poll_interval()?;
        self.command_timeout()?;
        Ok(())
    }

    pub fn command_timeout(&self) -> Result<Duration, ConfigError> {
        parse_duration(&self.slurm.command_timeout)
            .filter(|d| !d.is_zero())
            .ok_or_else(|| invalid("slurm.command_timeout", &self.slurm.command_timeout))
    }

    pub fn placement_timeout(&self) -> Result<Duration, ConfigError> {
        parse_duration(&self.placement.timeout)
            .ok_or_else(|| invalid("placement.timeout", &self.placement.timeout))
    }

    pub fn poll_interval(&self) -> Result<Duration, ConfigError> {
        parse_duration(&self.placement.poll_interval)
            .filter(|d| !d.is_zero())
            .ok_or_else(|| invalid("placement.poll_interval", &self.placement.poll_interval))
    }

    pub fn instances_db(&self) -> PathBuf {
        self.paths.state.join("instances.redb")
    }

    pub fn discovery_db(&self) -> PathBuf {
        self.paths.state.join("discovery.redb")
    }

    /// Directory holding generated files for one monitor instance.
    pub fn monitor_dir(&self, instance_id: &str) -> PathBuf {
        self.paths.state.join("monitors").join(instance_id)
    }
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_are_valid() {
        let config = UbenchConfig::default();
        config.validate().unwrap();
        assert_eq!(config.slurm.partition, "cpu");
        assert_eq!(config.placement_timeout().unwrap(), Duration::from_secs(600));
        assert_eq!(config.poll_interval().unwrap(), Duration::from_secs(5));
        assert_eq!(config.command_timeout().unwrap(), Duration::from_secs(30));
    }

    #[test]
    fn parse_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ubench.toml");
        std::fs::write(
            &path,
            r#"
[slurm]
account = "p200981"
partition = "gpu"

command_timeout = "1m"

[placement]
timeout = "2m"
"#,
        )
        .unwrap();
        let config = UbenchConfig::from_file(&path).unwrap();
        assert_eq!(config.slurm.account.as_deref(), Some("p200981"));
        assert_eq!(config.slurm.partition, "gpu");
        assert_eq!(config.slurm.qos, "default");
        assert_eq!(config.placement_timeout().unwrap(), Duration::from_secs(120));
        assert_eq!(config.command_timeout().unwrap(), Duration::from_secs(60));
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = UbenchConfig::load(Some(&dir.path().join("absent.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn env_overrides_file_values() {
        let env: HashMap<&str, &str> = [
            ("SLURM_ACCOUNT", "p1"),
            ("SLURM_PARTITION", "gpu"),
            ("SLURM_QOS", ""),
            ("UBENCH_STATE_DIR", "/tmp/ubench-state"),
        ]
        .into_iter()
        .collect();
        let mut config = UbenchConfig::default();
        config.apply_env(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.slurm.account.as_deref(), Some("p1"));
        assert_eq!(config.slurm.partition, "gpu");
        // Empty values leave the default alone.
        assert_eq!(config.slurm.qos, "default");
        assert_eq!(config.instances_db(), PathBuf::from("/tmp/ubench-state/instances.redb"));
        assert_eq!(config.discovery_db(), PathBuf::from("/tmp/ubench-state/discovery.redb"));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut config = UbenchConfig::default();
        config.placement.poll_interval = "0s".to_string();
        assert!(config.validate().is_err());

        let mut config = UbenchConfig::default();
        config.slurm.command_timeout = "0s".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("slurm.command_timeout"));

        let mut config = UbenchConfig::default();
        config.slurm.time_limit = "forever".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("slurm.time_limit"));
    }
}
