//! Process settings loaded from YAML

use crate::core::StepDefaults;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

const APP_DIR: &str = "campaign-pipeline";

/// Top-level settings
///
/// Every section is optional; a missing file means all defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Throttle key -> maximum concurrent holders
    pub throttles: BTreeMap<String, usize>,

    /// Defaults for steps that don't set their own
    pub step_defaults: StepDefaults,

    pub scheduler: SchedulerSettings,

    /// Job database path (defaults to the user's data directory)
    pub database: Option<PathBuf>,

    /// Platform name -> publisher program
    pub publishers: BTreeMap<String, PublisherSettings>,
}

/// Scheduler runtime settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// How often the job store is scanned
    pub tick_interval_ms: u64,

    /// Grace applied to jobs scheduled without one; unset means run however late
    pub default_misfire_grace_secs: Option<u64>,

    /// Runs later than this are logged as late
    pub late_threshold_secs: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
            default_misfire_grace_secs: None,
            late_threshold_secs: 60,
        }
    }
}

/// External program that publishes to one platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublisherSettings {
    /// Program and arguments
    pub command: Vec<String>,

    /// Throttle key held while publishing
    #[serde(default)]
    pub throttle: Option<String>,

    /// Upper bound on one publish call, in seconds
    #[serde(default = "default_publish_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_publish_timeout_secs() -> u64 {
    30
}

impl Settings {
    /// Load settings from `path`, or from the default location
    ///
    /// An explicit path must exist. The default location may be absent, in
    /// which case defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => {
                let path = Self::default_path();
                if path.exists() {
                    Self::from_file(&path)
                } else {
                    debug!("No settings at {}, using defaults", path.display());
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings {}", path.display()))?;
        Self::from_yaml(&content)
            .with_context(|| format!("Invalid settings in {}", path.display()))
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let settings: Settings = serde_yaml::from_str(yaml)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        for (key, capacity) in &self.throttles {
            if *capacity == 0 {
                anyhow::bail!("Throttle '{}' must have a capacity of at least 1", key);
            }
        }
        for (platform, publisher) in &self.publishers {
            if publisher.command.is_empty() {
                anyhow::bail!("Publisher '{}' has an empty command", platform);
            }
            if publisher.timeout_secs == 0 {
                anyhow::bail!("Publisher '{}' must have a timeout of at least 1s", platform);
            }
            if let Some(key) = &publisher.throttle {
                if !self.throttles.contains_key(key) {
                    anyhow::bail!(
                        "Publisher '{}' uses unknown throttle key '{}'",
                        platform,
                        key
                    );
                }
            }
        }
        if self.step_defaults.max_attempts == 0 {
            anyhow::bail!("step_defaults.max_attempts must be at least 1");
        }
        Ok(())
    }

    /// `<data dir>/campaign-pipeline/settings.yaml`
    pub fn default_path() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
            .join("settings.yaml")
    }

    /// Job database path, configured or default
    pub fn database_path(&self) -> PathBuf {
        self.database.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(APP_DIR)
                .join("jobs.db")
        })
    }
}
