//! Engine settings.
//!
//! Settings come from an optional TOML file, then environment overrides:
//!
//! ```toml
//! state_dir = "/var/lib/converge/state"
//! operation_timeout = "90s"
//!
//! [replace_strategy]
//! db_instance = "create_before_destroy"
//! ```
//!
//! | Variable                     | Overrides           |
//! |------------------------------|---------------------|
//! | `CONVERGE_STATE_DIR`         | `state_dir`         |
//! | `CONVERGE_OPERATION_TIMEOUT` | `operation_timeout` |

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::consts::{DEFAULT_OPERATION_TIMEOUT, OPERATION_TIMEOUT_ENV, STATE_DIR_ENV};
use crate::execute::ApplyOptions;
use crate::platform::paths;
use crate::schema::ReplaceStrategy;

#[derive(Debug, Error)]
pub enum SettingsError {
  #[error("failed to read settings file {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to parse settings file {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: toml::de::Error,
  },

  #[error("invalid duration '{value}' for {field}: {source}")]
  InvalidDuration {
    field: String,
    value: String,
    #[source]
    source: humantime::DurationError,
  },
}

/// On-disk form. Durations stay strings until validated.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SettingsFile {
  state_dir: Option<PathBuf>,
  operation_timeout: Option<String>,
  #[serde(default)]
  replace_strategy: BTreeMap<String, ReplaceStrategy>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
  /// Root of the file state store.
  pub state_dir: PathBuf,

  /// Upper bound for a single provider call.
  pub operation_timeout: Duration,

  /// Replacement order per resource type, overriding provider schemas.
  pub replace_strategy: BTreeMap<String, ReplaceStrategy>,
}

impl Default for Settings {
  fn default() -> Self {
    Self {
      state_dir: paths::state_dir(),
      operation_timeout: DEFAULT_OPERATION_TIMEOUT,
      replace_strategy: BTreeMap::new(),
    }
  }
}

impl Settings {
  /// Load settings from `path`, then apply environment overrides.
  pub fn load(path: &Path) -> Result<Self, SettingsError> {
    let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    let file: SettingsFile = toml::from_str(&content).map_err(|source| SettingsError::Parse {
      path: path.to_path_buf(),
      source,
    })?;
    Self::from_file(file)?.with_env_overrides()
  }

  /// Load from the default location if it exists, otherwise use defaults.
  /// Environment overrides apply either way.
  pub fn load_default() -> Result<Self, SettingsError> {
    let path = paths::settings_path();
    if path.exists() {
      Self::load(&path)
    } else {
      Self::default().with_env_overrides()
    }
  }

  fn from_file(file: SettingsFile) -> Result<Self, SettingsError> {
    let mut settings = Self::default();
    if let Some(dir) = file.state_dir {
      settings.state_dir = dir;
    }
    if let Some(value) = file.operation_timeout {
      settings.operation_timeout = parse_duration("operation_timeout", &value)?;
    }
    settings.replace_strategy = file.replace_strategy;
    Ok(settings)
  }

  fn with_env_overrides(mut self) -> Result<Self, SettingsError> {
    if let Some(dir) = std::env::var_os(STATE_DIR_ENV).filter(|d| !d.is_empty()) {
      self.state_dir = PathBuf::from(dir);
    }
    if let Ok(value) = std::env::var(OPERATION_TIMEOUT_ENV)
      && !value.is_empty()
    {
      self.operation_timeout = parse_duration(OPERATION_TIMEOUT_ENV, &value)?;
    }
    Ok(self)
  }

  pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
    self.state_dir = dir.into();
    self
  }

  pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
    self.operation_timeout = timeout;
    self
  }

  pub fn with_replace_strategy(mut self, resource_type: impl Into<String>, strategy: ReplaceStrategy) -> Self {
    self.replace_strategy.insert(resource_type.into(), strategy);
    self
  }

  /// Execution options carrying the configured timeout and a fresh cancel flag.
  pub fn apply_options(&self) -> ApplyOptions {
    ApplyOptions::default().with_timeout(self.operation_timeout)
  }
}

fn parse_duration(field: &str, value: &str) -> Result<Duration, SettingsError> {
  humantime::parse_duration(value).map_err(|source| SettingsError::InvalidDuration {
    field: field.to_string(),
    value: value.to_string(),
    source,
  })
}
