//! Engine configuration
//!
//! Where registrations and cached payloads live, which programs run the
//! installer technologies, how long to wait on the elevation pipe and what
//! to do about restarts. Loaded from an optional JSON file; every field has a
//! default so an empty object `{}` is a valid configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use strum::{Display, EnumString};

/// Environment variable that relocates registration and cache roots.
pub const DATA_DIR_ENV: &str = "BURN_DATA_DIR";

/// What the engine does when a package requests a restart.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum RestartPolicy {
    /// Never restart; report 3010 and leave it to the caller
    Never,
    /// Ask the UX through `on_restart_required`
    #[default]
    Prompt,
    /// Restart without asking
    Always,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// One subdirectory per bundle id holding its registration record
    pub registration_root: PathBuf,
    /// One subdirectory per bundle id holding cached payloads
    pub cache_root: PathBuf,
    /// msiexec/wusa write verbose logs here when set
    pub installer_log_dir: Option<PathBuf>,
    /// Longest wait for a reply on the elevation pipe
    pub pipe_timeout_secs: u64,
    /// Command prefix used to start the elevated companion (e.g. `["sudo", "-n"]`)
    pub elevation_launcher: Vec<String>,
    pub msiexec: PathBuf,
    pub wusa: PathBuf,
    pub restart: RestartPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            registration_root: data_dir.join("registration"),
            cache_root: data_dir.join("cache"),
            installer_log_dir: None,
            pipe_timeout_secs: 300,
            elevation_launcher: vec![
                "sudo".to_string(),
                "-n".to_string(),
                format!("--preserve-env={}", crate::elevation::SECRET_ENV),
            ],
            msiexec: PathBuf::from("msiexec"),
            wusa: PathBuf::from("wusa"),
            restart: RestartPolicy::Prompt,
        }
    }
}

fn default_data_dir() -> PathBuf {
    match std::env::var_os(DATA_DIR_ENV) {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => std::env::temp_dir().join("burn"),
    }
}

impl EngineConfig {
    /// Save configuration to a JSON file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .context("Failed to serialize engine configuration to JSON")?;

        fs::write(&path, json)
            .with_context(|| format!("Failed to write configuration to {:?}", path.as_ref()))?;

        Ok(())
    }

    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read configuration from {:?}", path.as_ref()))?;

        let config: Self =
            serde_json::from_str(&content).context("Failed to parse configuration JSON")?;

        config.validate()?;
        Ok(config)
    }

    /// Load `path` if given, otherwise the defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from_file(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.registration_root.as_os_str().is_empty() {
            anyhow::bail!("registration_root must be specified");
        }
        if self.cache_root.as_os_str().is_empty() {
            anyhow::bail!("cache_root must be specified");
        }
        if self.pipe_timeout_secs == 0 {
            anyhow::bail!("pipe_timeout_secs must be greater than zero");
        }
        if self.msiexec.as_os_str().is_empty() || self.wusa.as_os_str().is_empty() {
            anyhow::bail!("installer program paths cannot be empty");
        }
        if self.elevation_launcher.iter().any(|arg| arg.trim().is_empty()) {
            anyhow::bail!("elevation_launcher entries cannot be empty");
        }
        Ok(())
    }

    pub fn pipe_timeout(&self) -> Duration {
        Duration::from_secs(self.pipe_timeout_secs)
    }

    /// Registration directory of one bundle.
    pub fn registration_dir(&self, bundle_id: &str) -> PathBuf {
        self.registration_root.join(bundle_id)
    }

    /// Payload cache directory of one bundle.
    pub fn cache_dir(&self, bundle_id: &str) -> PathBuf {
        self.cache_root.join(bundle_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_empty_object_is_default() {
        let config: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.pipe_timeout_secs, 300);
        assert_eq!(config.restart, RestartPolicy::Prompt);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("engine.json");

        let config = EngineConfig {
            registration_root: dir.path().join("reg"),
            cache_root: dir.path().join("cache"),
            installer_log_dir: Some(dir.path().join("logs")),
            pipe_timeout_secs: 30,
            elevation_launcher: Vec::new(),
            restart: RestartPolicy::Never,
            ..EngineConfig::default()
        };
        config.save_to_file(&path).unwrap();

        let loaded = EngineConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.registration_dir("B"), dir.path().join("reg").join("B"));
    }

    #[test]
    fn test_rejects_zero_timeout_and_unknown_fields() {
        let config = EngineConfig {
            pipe_timeout_secs: 0,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());

        assert!(serde_json::from_str::<EngineConfig>(r#"{"pipe_timeout": 5}"#).is_err());
    }

    #[test]
    fn test_restart_policy_strings() {
        assert_eq!("NEVER".parse::<RestartPolicy>().unwrap(), RestartPolicy::Never);
        assert_eq!(RestartPolicy::Always.to_string(), "always");
    }
}
