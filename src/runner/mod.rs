//! Task runner boundary.
//!
//! Runners are opaque computations with a fixed contract: they receive the
//! invocation payload (parameters plus a project-context snapshot), return
//! a structured result or a typed failure, and never touch the stores.

pub mod process;

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::WindsiteConfig;
use crate::errors::OrchestrateError;
use crate::workflow::WorkflowAction;

pub use process::ProcessRunner;

/// Whether the orchestrator blocks for the runner's return or detaches a
/// completion task that delivers the result itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationMode {
    Sync,
    FireAndTrack,
}

/// The call-boundary payload. Exists only for the duration of one
/// dispatch; never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub tool: WorkflowAction,
    /// Parameters extracted from the query.
    pub parameters: Value,
    /// Subset of project state relevant to this step, not the whole
    /// conversation.
    pub project_context: Value,
}

/// Wire result of a task runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerOutput {
    pub success: bool,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub error_kind: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl RunnerOutput {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error_kind: None,
            message: None,
        }
    }

    pub fn failure(error_kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error_kind: Some(error_kind.into()),
            message: Some(message.into()),
        }
    }

    /// Convert the wire result into the step's data, surfacing declared
    /// failures verbatim. Failures are never retried and never replaced
    /// with synthetic data.
    pub fn into_data(self, tool: WorkflowAction) -> Result<Value, OrchestrateError> {
        if self.success {
            Ok(self.data.unwrap_or(Value::Null))
        } else {
            Err(OrchestrateError::TaskRunnerFailure {
                tool: tool.as_str().to_string(),
                kind: self.error_kind.unwrap_or_else(|| "unspecified".to_string()),
                message: self
                    .message
                    .unwrap_or_else(|| "runner reported failure without a message".to_string()),
            })
        }
    }
}

/// Abstraction over task execution for testability.
/// Real implementation: `ProcessRunner`. Tests use in-process doubles.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    /// Declared duration, compared against the sync budget.
    fn expected_duration(&self) -> Duration;

    /// Execute the step. `Err` means the runner could not be reached or
    /// produced garbage (transport failure); a clean domain failure comes
    /// back as `RunnerOutput { success: false, .. }`.
    async fn run(&self, invocation: &ToolInvocation) -> Result<RunnerOutput>;
}

/// Routing table from workflow action to runner. Analysis types without an
/// entry are rejected at dispatch; there is no implicit fallback.
#[derive(Default)]
pub struct RunnerRegistry {
    runners: HashMap<WorkflowAction, Arc<dyn TaskRunner>>,
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build process runners from configuration, skipping entries that
    /// name no workflow action (already warned about at startup).
    pub fn from_config(config: &WindsiteConfig) -> Self {
        let mut registry = Self::new();
        for (name, runner_config) in &config.runners {
            if runner_config.command.is_empty() {
                continue;
            }
            if let Ok(action) = WorkflowAction::from_str(name) {
                registry.insert(
                    action,
                    Arc::new(ProcessRunner::new(
                        runner_config.command.clone(),
                        Duration::from_secs(runner_config.expected_duration_secs),
                    )),
                );
            }
        }
        registry
    }

    pub fn insert(&mut self, action: WorkflowAction, runner: Arc<dyn TaskRunner>) {
        self.runners.insert(action, runner);
    }

    pub fn get(&self, action: WorkflowAction) -> Option<Arc<dyn TaskRunner>> {
        self.runners.get(&action).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunnerConfig;

    #[test]
    fn output_success_yields_data() {
        let out = RunnerOutput::ok(serde_json::json!({"turbines": 12}));
        let data = out.into_data(WorkflowAction::Layout).unwrap();
        assert_eq!(data["turbines"], 12);
    }

    #[test]
    fn output_failure_surfaces_verbatim() {
        let out = RunnerOutput::failure("timeout", "solver exceeded 90s");
        let err = out.into_data(WorkflowAction::Simulation).unwrap_err();
        match err {
            OrchestrateError::TaskRunnerFailure { tool, kind, message } => {
                assert_eq!(tool, "simulation");
                assert_eq!(kind, "timeout");
                assert_eq!(message, "solver exceeded 90s");
            }
            other => panic!("Expected TaskRunnerFailure, got {other}"),
        }
    }

    #[test]
    fn wire_format_round_trips() {
        let raw = r#"{"success": false, "error_kind": "bad_input", "message": "no layout"}"#;
        let out: RunnerOutput = serde_json::from_str(raw).unwrap();
        assert!(!out.success);
        assert_eq!(out.error_kind.as_deref(), Some("bad_input"));

        let ok_raw = r#"{"success": true, "data": {"aep_gwh": 101.3}}"#;
        let out: RunnerOutput = serde_json::from_str(ok_raw).unwrap();
        assert!(out.success);
        assert_eq!(out.data.unwrap()["aep_gwh"], 101.3);
    }

    #[test]
    fn registry_from_config_skips_unknown_and_empty() {
        let mut config = WindsiteConfig::default();
        config.runners.insert(
            "terrain".into(),
            RunnerConfig {
                command: vec!["terrain-cli".into()],
                expected_duration_secs: 20,
            },
        );
        config.runners.insert(
            "bathymetry".into(),
            RunnerConfig {
                command: vec!["nope".into()],
                expected_duration_secs: 5,
            },
        );
        config.runners.insert(
            "layout".into(),
            RunnerConfig {
                command: vec![],
                expected_duration_secs: 5,
            },
        );
        let registry = RunnerRegistry::from_config(&config);
        assert!(registry.get(WorkflowAction::Terrain).is_some());
        assert!(registry.get(WorkflowAction::Layout).is_none());
        assert!(registry.get(WorkflowAction::Simulation).is_none());
    }
}
