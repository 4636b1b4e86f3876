//! Runtime configuration.
//!
//! # Load order
//!
//! 1. Defaults
//! 2. JSON config file (`--config`), if given
//! 3. Environment variables (`PORTWEAVE_*`)
//! 4. Command-line flags, applied by the binary
//!
//! Each layer overrides the previous one. The result is checked by
//! [`RuntimeConfig::validate`].

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Storage root override.
pub const ENV_ROOT: &str = "PORTWEAVE_ROOT";
/// System id override.
pub const ENV_SYSTEM_ID: &str = "PORTWEAVE_SYSTEM_ID";
/// Checkpoint interval override, in seconds.
pub const ENV_CHECKPOINT_INTERVAL: &str = "PORTWEAVE_CHECKPOINT_INTERVAL_SECS";
/// Checkpoint retention override.
pub const ENV_CHECKPOINT_RETENTION: &str = "PORTWEAVE_CHECKPOINT_RETENTION";

/// Settings of the harness and its stores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
  /// Storage root for checkpoints, idempotency records and status files.
  pub root: PathBuf,
  /// Overrides the topology's system id.
  pub system_id: Option<String>,
  /// Seconds between periodic checkpoints; 0 disables the ticker.
  pub checkpoint_interval_secs: u64,
  /// Checkpoints kept per system.
  pub checkpoint_retention: usize,
  /// Age after which idempotency records are pruned, in seconds.
  pub idempotency_retention_secs: u64,
  /// Bound on reaching the global pause, in seconds.
  pub pause_timeout_secs: u64,
  /// Envelopes kept in memory by the error collector.
  pub error_log_capacity: usize,
}

impl Default for RuntimeConfig {
  fn default() -> Self {
    Self {
      root: PathBuf::from(".portweave"),
      system_id: None,
      checkpoint_interval_secs: 60,
      checkpoint_retention: 10,
      idempotency_retention_secs: 7 * 24 * 60 * 60,
      pause_timeout_secs: 30,
      error_log_capacity: 1024,
    }
  }
}

impl RuntimeConfig {
  /// Reads a JSON config file. Missing fields take their defaults.
  ///
  /// # Errors
  ///
  /// [`ConfigError::Read`] if the file cannot be read,
  /// [`ConfigError::Parse`] if it is not a valid config document.
  pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
      path: path.display().to_string(),
      source,
    })?;
    let config = serde_json::from_str(&raw)?;
    debug!(path = %path.display(), "loaded config file");
    Ok(config)
  }

  /// Defaults, then `path` if given, then the process environment.
  pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
    let mut config = match path {
      Some(path) => Self::from_file(path)?,
      None => Self::default(),
    };
    config.apply_env(|key| std::env::var(key).ok())?;
    Ok(config)
  }

  /// Applies `PORTWEAVE_*` overrides read through `lookup`.
  pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
  where
    F: Fn(&str) -> Option<String>,
  {
    if let Some(root) = lookup(ENV_ROOT) {
      self.root = PathBuf::from(root);
    }
    if let Some(system_id) = lookup(ENV_SYSTEM_ID) {
      self.system_id = Some(system_id);
    }
    if let Some(raw) = lookup(ENV_CHECKPOINT_INTERVAL) {
      self.checkpoint_interval_secs = parse_env(ENV_CHECKPOINT_INTERVAL, &raw)?;
    }
    if let Some(raw) = lookup(ENV_CHECKPOINT_RETENTION) {
      self.checkpoint_retention = parse_env(ENV_CHECKPOINT_RETENTION, &raw)?;
    }
    Ok(())
  }

  /// Rejects values the runtime cannot work with.
  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.checkpoint_retention == 0 {
      return Err(ConfigError::Invalid("checkpoint_retention must be at least 1".into()));
    }
    if self.pause_timeout_secs == 0 {
      return Err(ConfigError::Invalid("pause_timeout_secs must be at least 1".into()));
    }
    if self.error_log_capacity == 0 {
      return Err(ConfigError::Invalid("error_log_capacity must be at least 1".into()));
    }
    if self.system_id.as_deref().is_some_and(|id| !is_valid_system_id(id)) {
      return Err(ConfigError::Invalid(format!(
        "system_id '{}' must be non-empty and use only letters, digits, '-', '_' or '.'",
        self.system_id.as_deref().unwrap_or_default()
      )));
    }
    Ok(())
  }

  /// Periodic checkpoint interval; `None` when disabled.
  pub fn checkpoint_interval(&self) -> Option<Duration> {
    (self.checkpoint_interval_secs > 0).then(|| Duration::from_secs(self.checkpoint_interval_secs))
  }

  /// Bound on reaching the global pause.
  pub fn pause_timeout(&self) -> Duration {
    Duration::from_secs(self.pause_timeout_secs)
  }

  /// Idempotency record retention window.
  pub fn idempotency_retention(&self) -> Duration {
    Duration::from_secs(self.idempotency_retention_secs)
  }

  /// `<root>/checkpoints/<system>`
  pub fn checkpoint_dir(&self, system: &str) -> PathBuf {
    self.root.join("checkpoints").join(system)
  }

  /// `<root>/state/<system>/idempotency.sqlite3`
  pub fn idempotency_path(&self, system: &str) -> PathBuf {
    self.root.join("state").join(system).join("idempotency.sqlite3")
  }

  /// `<root>/status/<system>.json`
  pub fn status_path(&self, system: &str) -> PathBuf {
    self.root.join("status").join(format!("{system}.json"))
  }
}

/// System ids become directory names.
pub fn is_valid_system_id(id: &str) -> bool {
  !id.is_empty()
    && id != "."
    && id != ".."
    && id
      .chars()
      .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
  raw.trim().parse().map_err(|_| ConfigError::Env {
    key: key.to_string(),
    value: raw.to_string(),
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashMap;

  fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
      .iter()
      .map(|(k, v)| (k.to_string(), v.to_string()))
      .collect();
    move |key| map.get(key).cloned()
  }

  #[test]
  fn defaults_are_valid() {
    let config = RuntimeConfig::default();
    config.validate().unwrap();
    assert_eq!(config.checkpoint_interval(), Some(Duration::from_secs(60)));
    assert_eq!(config.checkpoint_retention, 10);
    assert_eq!(config.idempotency_retention(), Duration::from_secs(604_800));
  }

  #[test]
  fn file_then_env_layering() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("portweave.json");
    std::fs::write(&path, r#"{"checkpoint_interval_secs": 5, "root": "/from/file"}"#).unwrap();

    let mut config = RuntimeConfig::from_file(&path).unwrap();
    assert_eq!(config.checkpoint_interval_secs, 5);
    assert_eq!(config.checkpoint_retention, 10);

    config
      .apply_env(env(&[(ENV_ROOT, "/from/env"), (ENV_CHECKPOINT_RETENTION, "3")]))
      .unwrap();
    assert_eq!(config.root, PathBuf::from("/from/env"));
    assert_eq!(config.checkpoint_retention, 3);
    assert_eq!(config.checkpoint_interval_secs, 5);
  }

  #[test]
  fn unknown_fields_and_bad_env_are_rejected() {
    assert!(serde_json::from_str::<RuntimeConfig>(r#"{"colour": 1}"#).is_err());

    let mut config = RuntimeConfig::default();
    let err = config
      .apply_env(env(&[(ENV_CHECKPOINT_INTERVAL, "soon")]))
      .unwrap_err();
    assert!(matches!(err, ConfigError::Env { key, .. } if key == ENV_CHECKPOINT_INTERVAL));
  }

  #[test]
  fn validation_rejects_zero_limits() {
    let config = RuntimeConfig {
      checkpoint_retention: 0,
      ..RuntimeConfig::default()
    };
    assert!(config.validate().is_err());

    let config = RuntimeConfig {
      system_id: Some("../escape".into()),
      ..RuntimeConfig::default()
    };
    assert!(config.validate().is_err());

    let disabled = RuntimeConfig {
      checkpoint_interval_secs: 0,
      ..RuntimeConfig::default()
    };
    assert_eq!(disabled.checkpoint_interval(), None);
  }

  #[test]
  fn paths_follow_the_storage_layout() {
    let config = RuntimeConfig {
      root: PathBuf::from("/data"),
      ..RuntimeConfig::default()
    };
    assert_eq!(config.checkpoint_dir("orders"), PathBuf::from("/data/checkpoints/orders"));
    assert_eq!(
      config.idempotency_path("orders"),
      PathBuf::from("/data/state/orders/idempotency.sqlite3")
    );
    assert_eq!(config.status_path("orders"), PathBuf::from("/data/status/orders.json"));
  }
}
