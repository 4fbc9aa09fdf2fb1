//! External task runner invoked as a subprocess.
//!
//! The invocation JSON is written to the child's stdin; the result is the
//! last JSON object line on stdout. A hard timeout of three times the
//! declared duration bounds hung runners.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{RunnerOutput, TaskRunner, ToolInvocation};

pub struct ProcessRunner {
    command: Vec<String>,
    expected: Duration,
}

impl ProcessRunner {
    pub fn new(command: Vec<String>, expected: Duration) -> Self {
        Self { command, expected }
    }

    fn hard_timeout(&self) -> Duration {
        self.expected.saturating_mul(3).max(Duration::from_secs(10))
    }
}

#[async_trait]
impl TaskRunner for ProcessRunner {
    fn expected_duration(&self) -> Duration {
        self.expected
    }

    async fn run(&self, invocation: &ToolInvocation) -> Result<RunnerOutput> {
        let (program, args) = self
            .command
            .split_first()
            .context("Runner command is empty")?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn runner '{}'", program))?;

        let payload = serde_json::to_vec(invocation)?;
        {
            let mut stdin = child
                .stdin
                .take()
                .context("Runner stdin unavailable")?;
            stdin
                .write_all(&payload)
                .await
                .context("Failed to write invocation to runner stdin")?;
            // Dropping stdin closes the pipe so the runner sees EOF.
        }

        let output = tokio::time::timeout(self.hard_timeout(), child.wait_with_output())
            .await
            .map_err(|_| {
                anyhow::anyhow!(
                    "Runner '{}' exceeded hard timeout of {:?}",
                    program,
                    self.hard_timeout()
                )
            })?
            .context("Failed to collect runner output")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "Runner '{}' exited with {}: {}",
                program,
                output.status,
                stderr.trim()
            );
        }

        let stdout = String::from_utf8(output.stdout).context("Runner stdout was not UTF-8")?;
        parse_result_line(&stdout)
            .with_context(|| format!("Runner '{}' produced no result object", program))
    }
}

/// Last line on stdout that parses as a result object wins; runners are
/// free to log plain text above it.
fn parse_result_line(stdout: &str) -> Result<RunnerOutput> {
    stdout
        .lines()
        .rev()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .find_map(|line| serde_json::from_str::<RunnerOutput>(line).ok())
        .context("No parseable result line on stdout")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::WorkflowAction;

    #[test]
    fn parses_last_result_line_past_log_noise() {
        let stdout = "loading elevation tiles\n{\"progress\": 50}\n{\"success\": true, \"data\": {\"usable_area_km2\": 9.1}}\n";
        let out = parse_result_line(stdout).unwrap();
        assert!(out.success);
        assert_eq!(out.data.unwrap()["usable_area_km2"], 9.1);
    }

    #[test]
    fn no_result_line_is_an_error() {
        assert!(parse_result_line("all plain text\nno json here\n").is_err());
    }

    #[tokio::test]
    async fn missing_binary_is_a_transport_error() {
        let runner = ProcessRunner::new(
            vec!["windsite-test-binary-that-does-not-exist".into()],
            Duration::from_secs(1),
        );
        let invocation = ToolInvocation {
            tool: WorkflowAction::Terrain,
            parameters: serde_json::json!({}),
            project_context: serde_json::json!({}),
        };
        assert!(runner.run(&invocation).await.is_err());
    }

    #[tokio::test]
    async fn shell_echo_round_trip() {
        // `cat`-like runner: sh reads nothing, emits a fixed success line.
        let runner = ProcessRunner::new(
            vec![
                "sh".into(),
                "-c".into(),
                r#"cat > /dev/null; echo '{"success": true, "data": {"ok": 1}}'"#.into(),
            ],
            Duration::from_secs(5),
        );
        let invocation = ToolInvocation {
            tool: WorkflowAction::Terrain,
            parameters: serde_json::json!({"radius_km": 5.0}),
            project_context: serde_json::json!({"project_id": "p1"}),
        };
        let out = runner.run(&invocation).await.unwrap();
        assert!(out.success);
        assert_eq!(out.data.unwrap()["ok"], 1);
    }
}
