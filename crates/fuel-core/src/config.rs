//! Runtime configuration for the consume daemon.
//!
//! Read from `<project>/.fuel/config.yaml`; CLI flags override file values.
//! Every key has a default so a missing or partial file is fine.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{FuelError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Consecutive failures before an agent is put in cool-down
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Initial cool-down; doubles on repeat, capped at one hour
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_seconds: default_cooldown_seconds(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumeConfig {
    /// Tick period in milliseconds
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Hard cap on simultaneous children (task runs and review runs share it)
    #[serde(default = "default_concurrency_cap")]
    pub concurrency_cap: usize,
    #[serde(default)]
    pub review_enabled: bool,
    #[serde(default = "default_review_agent")]
    pub review_agent: String,
    #[serde(default = "default_agent")]
    pub default_agent: String,
    #[serde(default)]
    pub epic_mirrors_enabled: bool,
    #[serde(default)]
    pub health: HealthConfig,
    /// Wall-clock limit for one agent run
    #[serde(default = "default_agent_timeout_seconds")]
    pub agent_timeout_seconds: u64,
    /// How long shutdown waits after SIGTERM before SIGKILL
    #[serde(default = "default_shutdown_grace_seconds")]
    pub shutdown_grace_seconds: u64,
    /// Ceiling on self-guided re-dispatches of one task
    #[serde(default = "default_selfguided_max_iterations")]
    pub selfguided_max_iterations: u32,
}

fn default_interval_ms() -> u64 {
    5_000
}

fn default_concurrency_cap() -> usize {
    1
}

fn default_review_agent() -> String {
    "claude".to_string()
}

fn default_agent() -> String {
    "claude".to_string()
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_cooldown_seconds() -> u64 {
    300
}

fn default_agent_timeout_seconds() -> u64 {
    30 * 60
}

fn default_shutdown_grace_seconds() -> u64 {
    10
}

fn default_selfguided_max_iterations() -> u32 {
    25
}

impl Default for ConsumeConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            concurrency_cap: default_concurrency_cap(),
            review_enabled: false,
            review_agent: default_review_agent(),
            default_agent: default_agent(),
            epic_mirrors_enabled: false,
            health: HealthConfig::default(),
            agent_timeout_seconds: default_agent_timeout_seconds(),
            shutdown_grace_seconds: default_shutdown_grace_seconds(),
            selfguided_max_iterations: default_selfguided_max_iterations(),
        }
    }
}

/// Flag-level overrides collected by the CLI. `None` keeps the file value.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub interval_ms: Option<u64>,
    pub concurrency_cap: Option<usize>,
    pub review_enabled: Option<bool>,
    pub epic_mirrors_enabled: Option<bool>,
}

impl ConsumeConfig {
    /// Load `<fuel_dir>/config.yaml`, falling back to defaults when the
    /// file is absent. A present-but-unreadable file is a hard error.
    pub fn load(fuel_dir: &Path) -> Result<Self> {
        let path = fuel_dir.join("config.yaml");
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)?;
        serde_yaml::from_str(&content)
            .map_err(|e| FuelError::InvalidConfig(format!("{}: {e}", path.display())))
    }

    pub fn apply_overrides(mut self, overrides: &ConfigOverrides) -> Self {
        if let Some(interval) = overrides.interval_ms {
            self.interval_ms = interval;
        }
        if let Some(cap) = overrides.concurrency_cap {
            self.concurrency_cap = cap;
        }
        if let Some(review) = overrides.review_enabled {
            self.review_enabled = review;
        }
        if let Some(mirrors) = overrides.epic_mirrors_enabled {
            self.epic_mirrors_enabled = mirrors;
        }
        self
    }
}
