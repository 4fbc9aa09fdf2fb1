//! Configuration loaded from `windsite.toml`, with defaults for every
//! field so a missing file is valid.
//!
//! Example:
//!
//! ```toml
//! sync_budget_secs = 30
//! poll_interval_secs = 3
//! sweep_after_secs = 600
//!
//! [runners.terrain]
//! command = ["windsite-terrain", "--format", "json"]
//! expected_duration_secs = 20
//!
//! [runners.simulation]
//! command = ["windsite-wake", "run"]
//! expected_duration_secs = 75
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::workflow::WorkflowAction;

fn default_sync_budget_secs() -> u64 {
    30
}

fn default_poll_interval_secs() -> u64 {
    3
}

fn default_sweep_after_secs() -> u64 {
    600
}

fn default_expected_duration_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Command and arguments; the invocation JSON is written to stdin and
    /// the result JSON is read from stdout.
    pub command: Vec<String>,
    /// Declared duration, compared against the sync budget to choose
    /// between sync and fire-and-track dispatch.
    #[serde(default = "default_expected_duration_secs")]
    pub expected_duration_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindsiteConfig {
    /// Longest task the orchestrator will block the request path for.
    #[serde(default = "default_sync_budget_secs")]
    pub sync_budget_secs: u64,

    /// Default polling cadence handed to the polling controller.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Age after which an abandoned in-flight turn is force-finalized.
    #[serde(default = "default_sweep_after_secs")]
    pub sweep_after_secs: u64,

    /// Task runner command per workflow action name.
    #[serde(default)]
    pub runners: HashMap<String, RunnerConfig>,
}

impl Default for WindsiteConfig {
    fn default() -> Self {
        Self {
            sync_budget_secs: default_sync_budget_secs(),
            poll_interval_secs: default_poll_interval_secs(),
            sweep_after_secs: default_sweep_after_secs(),
            runners: HashMap::new(),
        }
    }
}

impl WindsiteConfig {
    /// Load from a toml file; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config at {}", path.display()))?;
        let config: Self = toml::from_str(&raw)
            .with_context(|| format!("Invalid config at {}", path.display()))?;
        Ok(config)
    }

    /// Non-fatal configuration problems, reported at startup.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.sync_budget_secs == 0 {
            warnings.push("sync_budget_secs is 0; every dispatch will be fire-and-track".into());
        }
        for (name, runner) in &self.runners {
            if WorkflowAction::from_str(name).is_err() {
                warnings.push(format!(
                    "runner '{}' does not match any workflow action and will be ignored",
                    name
                ));
            }
            if runner.command.is_empty() {
                warnings.push(format!("runner '{}' has an empty command", name));
            }
        }
        warnings
    }
}
