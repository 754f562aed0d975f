//! Runtime configuration
//!
//! Loaded from a TOML file (every section optional) and then overridden by
//! `RAIDBOOK_*` environment variables.

use crate::pressure::PressureConfig;
use raidbook_cache::CacheConfig;
use raidbook_scheduler::{FrameBudgetConfig, SchedulerConfig};
use raidbook_storage::StoreConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub const ENV_MAX_CONCURRENCY: &str = "RAIDBOOK_MAX_CONCURRENCY";
pub const ENV_WARNING_MB: &str = "RAIDBOOK_WARNING_MB";
pub const ENV_CRITICAL_MB: &str = "RAIDBOOK_CRITICAL_MB";
pub const ENV_STORE_PATH: &str = "RAIDBOOK_STORE_PATH";
pub const ENV_TARGET_FPS: &str = "RAIDBOOK_TARGET_FPS";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: String, value: String },
}

impl ConfigError {
    fn invalid(key: &str, value: impl ToString) -> Self {
        ConfigError::InvalidValue { key: key.to_string(), value: value.to_string() }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub cache: CacheConfig,
    pub frame_budget: FrameBudgetConfig,
    pub pressure: PressureConfig,
    pub scheduler: SchedulerConfig,
    pub store: StoreConfig,
}

impl RuntimeConfig {
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Read a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let source = fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        Self::from_toml_str(&source)
    }

    /// Read a TOML file if present, apply environment overrides
    pub fn load_with_env(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) if path.exists() => Self::load(path)?,
            Some(path) => {
                tracing::debug!(
                    target: "raidbook.config",
                    path = %path.display(),
                    "config file not found, using defaults"
                );
                Self::default()
            }
            None => Self::default(),
        };
        config.apply_env()?;
        Ok(config)
    }

    /// Apply `RAIDBOOK_*` overrides from the process environment
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_MAX_CONCURRENCY) {
            self.scheduler.max_concurrency = parse(ENV_MAX_CONCURRENCY, &value)?;
        }
        if let Some(value) = lookup(ENV_WARNING_MB) {
            self.pressure.warning_mb = parse(ENV_WARNING_MB, &value)?;
        }
        if let Some(value) = lookup(ENV_CRITICAL_MB) {
            self.pressure.critical_mb = parse(ENV_CRITICAL_MB, &value)?;
        }
        if let Some(value) = lookup(ENV_STORE_PATH) {
            if value.trim().is_empty() {
                return Err(ConfigError::invalid(ENV_STORE_PATH, value));
            }
            self.store.path = PathBuf::from(value);
        }
        if let Some(value) = lookup(ENV_TARGET_FPS) {
            let fps: u32 = parse(ENV_TARGET_FPS, &value)?;
            self.frame_budget = self.frame_budget.with_target_fps(fps);
        }
        self.validate()
    }

    /// Reject combinations the runtime cannot operate with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.max_concurrency == 0 {
            return Err(ConfigError::invalid("scheduler.max_concurrency", 0));
        }
        if self.pressure.critical_mb < self.pressure.warning_mb {
            return Err(ConfigError::invalid("pressure.critical_mb", self.pressure.critical_mb));
        }
        if !(self.pressure.squeeze_factor > 0.0 && self.pressure.squeeze_factor <= 1.0) {
            return Err(ConfigError::invalid(
                "pressure.squeeze_factor",
                self.pressure.squeeze_factor,
            ));
        }
        if self.frame_budget.target_fps == 0 {
            return Err(ConfigError::invalid("frame_budget.target_fps", 0));
        }
        Ok(())
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::invalid(key, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::collections::HashMap;

    /// Restores the touched environment variables on drop
    struct EnvGuard {
        saved: Vec<(&'static str, Option<String>)>,
    }

    impl EnvGuard {
        fn set(vars: &[(&'static str, &str)]) -> Self {
            let saved = vars.iter().map(|(key, _)| (*key, std::env::var(key).ok())).collect();
            for (key, value) in vars {
                std::env::set_var(key, value);
            }
            Self { saved }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in &self.saved {
                match value {
                    Some(value) => std::env::set_var(key, value),
                    None => std::env::remove_var(key),
                }
            }
        }
    }

    #[test]
    fn test_defaults_match_constrained_target() {
        let config = RuntimeConfig::default();
        assert_eq!(config.pressure.warning_mb, 400);
        assert_eq!(config.pressure.critical_mb, 500);
        assert_eq!(config.frame_budget.target_fps, 60);
        assert!(config.scheduler.max_concurrency >= 1);
        config.validate().expect("defaults should be valid");
    }

    #[test]
    fn test_partial_toml() {
        let config = RuntimeConfig::from_toml_str(
            r#"
            [pressure]
            warning_mb = 300
            critical_mb = 380

            [scheduler]
            max_concurrency = 2

            [store]
            path = "/var/lib/raidbook/store.json"
            "#,
        )
        .expect("config should parse");

        assert_eq!(config.pressure.warning_mb, 300);
        assert_eq!(config.pressure.critical_mb, 380);
        assert_eq!(config.pressure.clear_samples, 2);
        assert_eq!(config.scheduler.max_concurrency, 2);
        assert_eq!(config.store.path, PathBuf::from("/var/lib/raidbook/store.json"));
        assert_eq!(config.cache.entities.count, 512);
    }

    #[test]
    fn test_invalid_toml() {
        let err = RuntimeConfig::from_toml_str("[pressure\nwarning_mb = ").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));

        let err = RuntimeConfig::from_toml_str("[pressure]\nwarning_mb = 600\ncritical_mb = 500")
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "pressure.critical_mb"));
    }

    #[test]
    fn test_overrides_from_lookup() {
        let vars: HashMap<&str, &str> = HashMap::from([
            (ENV_MAX_CONCURRENCY, "2"),
            (ENV_WARNING_MB, "350"),
            (ENV_TARGET_FPS, "120"),
        ]);
        let mut config = RuntimeConfig::default();
        config
            .apply_overrides(|key| vars.get(key).map(|v| v.to_string()))
            .expect("overrides should apply");

        assert_eq!(config.scheduler.max_concurrency, 2);
        assert_eq!(config.pressure.warning_mb, 350);
        assert_eq!(config.frame_budget.target_fps, 120);
    }

    #[test]
    fn test_invalid_override_names_key() {
        let mut config = RuntimeConfig::default();
        let err = config
            .apply_overrides(|key| (key == ENV_CRITICAL_MB).then(|| "lots".to_string()))
            .unwrap_err();
        match err {
            ConfigError::InvalidValue { key, value } => {
                assert_eq!(key, ENV_CRITICAL_MB);
                assert_eq!(value, "lots");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("raidbook.toml");
        fs::write(&path, "[scheduler]\nmax_concurrency = 4\n").unwrap();

        let _guard = EnvGuard::set(&[
            (ENV_MAX_CONCURRENCY, "2"),
            (ENV_STORE_PATH, "/tmp/raidbook-env.json"),
        ]);
        let config = RuntimeConfig::load_with_env(Some(&path)).expect("config should load");

        assert_eq!(config.scheduler.max_concurrency, 2);
        assert_eq!(config.store.path, PathBuf::from("/tmp/raidbook-env.json"));
    }

    #[test]
    #[serial]
    fn test_missing_file_uses_defaults() {
        let temp = tempfile::tempdir().unwrap();
        let _guard = EnvGuard::set(&[(ENV_WARNING_MB, "420")]);

        let config = RuntimeConfig::load_with_env(Some(&temp.path().join("absent.toml")))
            .expect("defaults should load");
        assert_eq!(config.pressure.warning_mb, 420);
        assert_eq!(config.pressure.critical_mb, 500);
    }

    #[test]
    fn test_load_reports_io_error() {
        let err = RuntimeConfig::load(Path::new("/nonexistent/raidbook.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
