//! The workflow orchestrator.
//!
//! `handle` is the single entry point: given a classified intent and a
//! session, it opens an ai turn in the message log, resolves the target
//! project, validates prerequisites, dispatches the task runner (blocking
//! for short tasks, fire-and-track for long ones), merges the result into
//! the project store, and finalizes the turn. Every outcome — success or
//! failure — ends in exactly one finalized turn; a stuck incomplete turn
//! would strand the polling consumer indefinitely.

pub mod context;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value, json};
use tracing::{debug, error, info, warn};

use crate::errors::{KIND_SUPERSEDED, OrchestrateError};
use crate::intent::{Intent, IntentKind, IntentParams};
use crate::runner::{InvocationMode, RunnerRegistry, TaskRunner, ToolInvocation};
use crate::store::DbHandle;
use crate::store::models::{MessageRole, Project};
use crate::stream::ThoughtStreamer;
use crate::workflow::{self, WorkflowAction};

/// How a turn's terminal state gets delivered.
enum TurnOutcome {
    /// Finalized before `handle` returned.
    Finalized,
    /// A spawned completion task owns the merge and finalization.
    Detached,
}

#[derive(Clone)]
pub struct Orchestrator {
    db: DbHandle,
    runners: Arc<RunnerRegistry>,
    sync_budget: Duration,
}

impl Orchestrator {
    pub fn new(db: DbHandle, runners: Arc<RunnerRegistry>, sync_budget: Duration) -> Self {
        Self {
            db,
            runners,
            sync_budget,
        }
    }

    /// Run one turn. Returns the id of the ai message created at dispatch;
    /// all effects are delivered through the message log.
    pub async fn handle(
        &self,
        intent: Intent,
        session_id: &str,
    ) -> Result<i64, OrchestrateError> {
        self.supersede_open_turns(session_id).await?;

        let session = session_id.to_string();
        let message_id = self
            .db
            .write(move |db| db.append_message(&session, MessageRole::AiStream, "", false))
            .await?;
        let streamer = ThoughtStreamer::new(self.db.clone(), message_id);

        info!(session_id, message_id, kind = ?intent.kind, "handling intent");

        match self.run_turn(&intent, session_id, &streamer).await {
            Ok(TurnOutcome::Finalized) | Ok(TurnOutcome::Detached) => {}
            Err(err) => {
                error!(session_id, message_id, error = %err, kind = err.kind(), "turn failed");
                finalize_error(&streamer, &err).await;
            }
        }

        Ok(message_id)
    }

    /// At most one ai turn per session may be incomplete. Any open turn
    /// left behind by an earlier request is closed before a new one opens.
    async fn supersede_open_turns(&self, session_id: &str) -> Result<(), OrchestrateError> {
        let session = session_id.to_string();
        let superseded = self
            .db
            .write(move |db| {
                let ids = db.open_ai_messages(&session, None)?;
                for id in &ids {
                    db.finalize_message(
                        *id,
                        "This analysis was superseded by a newer request.",
                        None,
                        Some(KIND_SUPERSEDED),
                    )?;
                }
                Ok(ids)
            })
            .await?;
        if !superseded.is_empty() {
            warn!(session_id, ?superseded, "closed superseded open turns");
        }
        Ok(())
    }

    async fn run_turn(
        &self,
        intent: &Intent,
        session_id: &str,
        streamer: &ThoughtStreamer,
    ) -> Result<TurnOutcome, OrchestrateError> {
        streamer
            .append(
                "Understanding request",
                Some(format!("intent: {}", intent_label(intent.kind))),
            )
            .await?;

        match intent.kind {
            IntentKind::Unknown => Err(OrchestrateError::ClassificationAmbiguous),
            IntentKind::ProjectList => self.finish_project_list(streamer).await,
            IntentKind::Dashboard => {
                self.finish_dashboard(intent, session_id, streamer).await
            }
            _ => self.run_analysis(intent, session_id, streamer).await,
        }
    }

    // ── Read-only intents ─────────────────────────────────────────────

    async fn finish_project_list(
        &self,
        streamer: &ThoughtStreamer,
    ) -> Result<TurnOutcome, OrchestrateError> {
        let projects = self.db.call(|db| db.list_projects()).await?;
        let artifact = json!({
            "action": "project_list",
            "projects": projects.iter().map(project_summary).collect::<Vec<_>>(),
        });
        let content = format!("You have {} project(s).", projects.len());
        streamer.finalize(&content, Some(artifact), None).await?;
        Ok(TurnOutcome::Finalized)
    }

    async fn finish_dashboard(
        &self,
        intent: &Intent,
        session_id: &str,
        streamer: &ThoughtStreamer,
    ) -> Result<TurnOutcome, OrchestrateError> {
        let project = self.resolve_project(intent, session_id, streamer).await?;
        let artifact = json!({
            "action": WorkflowAction::Dashboard.as_str(),
            "project": project_summary(&project),
            "next_actions": workflow::next_actions(project.status),
        });
        let content = format!(
            "{} is at the {} stage.",
            project.name,
            project.status.as_str()
        );
        streamer.finalize(&content, Some(artifact), None).await?;
        Ok(TurnOutcome::Finalized)
    }

    // ── Analysis dispatch ─────────────────────────────────────────────

    async fn run_analysis(
        &self,
        intent: &Intent,
        session_id: &str,
        streamer: &ThoughtStreamer,
    ) -> Result<TurnOutcome, OrchestrateError> {
        let action = intent
            .kind
            .action()
            .ok_or(OrchestrateError::ClassificationAmbiguous)?;

        let project = self.resolve_project(intent, session_id, streamer).await?;
        let project_context = context::build_project_context(&project, action);

        streamer
            .append(
                "Checking prerequisites",
                Some(format!("step: {}", action.as_str())),
            )
            .await?;
        if let Some(prereq) = workflow::prerequisite(action)
            && !context::prerequisite_satisfied(&project_context, &prereq, &intent.params)
        {
            // Never substitute synthetic results for a missing upstream step.
            return Err(OrchestrateError::MissingPrerequisite {
                step: prereq.step.as_str().to_string(),
            });
        }

        let runner = self.runners.get(action).ok_or_else(|| {
            OrchestrateError::TaskRunnerFailure {
                tool: action.as_str().to_string(),
                kind: "unavailable".to_string(),
                message: format!("no task runner configured for {}", action.as_str()),
            }
        })?;

        let invocation = ToolInvocation {
            tool: action,
            parameters: params_to_json(&intent.params),
            project_context,
        };

        let mode = if runner.expected_duration() <= self.sync_budget {
            InvocationMode::Sync
        } else {
            InvocationMode::FireAndTrack
        };
        streamer
            .append(
                &format!("Dispatching {} analysis", action.as_str()),
                Some(format!("mode: {:?}", mode)),
            )
            .await?;

        match mode {
            InvocationMode::Sync => {
                let output = runner
                    .run(&invocation)
                    .await
                    .map_err(|e| transport_failure(action, e))?;
                let data = output.into_data(action)?;
                self.complete_turn(streamer, &project.id, action, data)
                    .await?;
                Ok(TurnOutcome::Finalized)
            }
            InvocationMode::FireAndTrack => {
                // The request path returns now; the spawned completion task
                // is the sole owner of this turn's merge and finalization.
                let orchestrator = self.clone();
                let streamer = streamer.clone();
                let project_id = project.id.clone();
                tokio::spawn(async move {
                    let delivery = async {
                        let output = runner
                            .run(&invocation)
                            .await
                            .map_err(|e| transport_failure(action, e))?;
                        let data = output.into_data(action)?;
                        orchestrator
                            .complete_turn(&streamer, &project_id, action, data)
                            .await
                    }
                    .await;
                    if let Err(err) = delivery {
                        error!(
                            message_id = streamer.message_id(),
                            project_id,
                            tool = action.as_str(),
                            error = %err,
                            "fire-and-track delivery failed"
                        );
                        finalize_error(&streamer, &err).await;
                    }
                });
                Ok(TurnOutcome::Detached)
            }
        }
    }

    /// Resolution order: explicit id → most-recent project in the session
    /// → newly created (terrain with fresh coordinates only).
    async fn resolve_project(
        &self,
        intent: &Intent,
        session_id: &str,
        streamer: &ThoughtStreamer,
    ) -> Result<Project, OrchestrateError> {
        if let Some(id) = &intent.params.project_id {
            let id_owned = id.clone();
            let found = self.db.call(move |db| db.get_project(&id_owned)).await?;
            return found.ok_or_else(|| OrchestrateError::ProjectNotFound { id: id.clone() });
        }

        let session = session_id.to_string();
        let recent = self
            .db
            .call(move |db| db.latest_project_for_session(&session))
            .await?;

        // Fresh coordinates on a terrain request start a new site even when
        // the session already has a project.
        let wants_new_site = intent.kind == IntentKind::TerrainAnalysis
            && intent.params.coordinates.is_some()
            && recent.as_ref().map_or(true, |p| {
                let coords = intent.params.coordinates.unwrap();
                p.lat != Some(coords.lat) || p.lon != Some(coords.lon)
            });

        if wants_new_site {
            let coords = intent.params.coordinates.unwrap();
            let name = format!("Site at {:.4},{:.4}", coords.lat, coords.lon);
            streamer
                .append("Creating project", Some(name.clone()))
                .await?;
            let session = session_id.to_string();
            let capacity = intent.params.capacity_mw;
            let project = self
                .db
                .write(move |db| {
                    db.create_project(&session, &name, Some(coords.lat), Some(coords.lon), capacity)
                })
                .await?;
            debug!(project_id = %project.id, "created project");
            return Ok(project);
        }

        if let Some(project) = recent {
            return Ok(project);
        }

        if intent.kind == IntentKind::TerrainAnalysis {
            // Terrain without coordinates and no existing project: there is
            // nothing to analyze yet.
            return Err(OrchestrateError::MissingPrerequisite {
                step: "coordinates".to_string(),
            });
        }
        Err(OrchestrateError::MissingPrerequisite {
            step: WorkflowAction::Terrain.as_str().to_string(),
        })
    }

    /// Merge the result with its status transition, build the artifact,
    /// and finalize the turn.
    ///
    /// The merge never depends on the turn still being open: a superseded
    /// turn only silences the live feed, while the dispatched runner's
    /// result must persist for later reads regardless.
    async fn complete_turn(
        &self,
        streamer: &ThoughtStreamer,
        project_id: &str,
        action: WorkflowAction,
        data: Value,
    ) -> Result<(), OrchestrateError> {
        if let Err(err) = streamer
            .append("Merging results", Some(format!("project: {}", project_id)))
            .await
        {
            warn!(
                message_id = streamer.message_id(),
                error = %err,
                "thought step dropped, continuing result delivery"
            );
        }

        let new_status = workflow::status_after(action)
            .ok_or_else(|| anyhow::anyhow!("{} merges no result", action.as_str()))?;
        let id = project_id.to_string();
        let result = data.clone();
        let merged = self
            .db
            .write(move |db| db.merge_step_result(&id, action, &result, new_status))
            .await?;

        let artifact = json!({
            "action": action.as_str(),
            "project": project_summary(&merged),
            "result": data,
            "next_actions": workflow::next_actions(merged.status),
        });
        let content = format!(
            "{} analysis complete for {}.",
            action.as_str(),
            merged.name
        );
        let finalized = streamer.finalize(&content, Some(artifact), None).await?;
        if !finalized {
            warn!(
                message_id = streamer.message_id(),
                "turn was already finalized before result delivery"
            );
        }
        Ok(())
    }
}

/// Finalize a failed turn. Failures here are logged, not propagated: the
/// background sweeper is the last-resort backstop, but under normal
/// operation this write is what keeps pollers from hanging.
async fn finalize_error(streamer: &ThoughtStreamer, err: &OrchestrateError) {
    match streamer
        .finalize(&err.user_message(), None, Some(err.kind()))
        .await
    {
        Ok(true) => {}
        Ok(false) => warn!(
            message_id = streamer.message_id(),
            "error turn was already finalized"
        ),
        Err(finalize_err) => error!(
            message_id = streamer.message_id(),
            error = %finalize_err,
            "failed to finalize error turn"
        ),
    }
}

fn transport_failure(action: WorkflowAction, err: anyhow::Error) -> OrchestrateError {
    OrchestrateError::TaskRunnerFailure {
        tool: action.as_str().to_string(),
        kind: "transport".to_string(),
        message: format!("{err:#}"),
    }
}

fn intent_label(kind: IntentKind) -> &'static str {
    match kind {
        IntentKind::TerrainAnalysis => "terrain_analysis",
        IntentKind::LayoutOptimization => "layout_optimization",
        IntentKind::WakeSimulation => "wake_simulation",
        IntentKind::WindRose => "wind_rose",
        IntentKind::ReportGeneration => "report_generation",
        IntentKind::Dashboard => "dashboard",
        IntentKind::ProjectList => "project_list",
        IntentKind::Unknown => "unknown",
    }
}

fn params_to_json(params: &IntentParams) -> Value {
    let raw = serde_json::to_value(params).unwrap_or(Value::Null);
    match raw {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(_, v)| !v.is_null())
                .collect::<Map<_, _>>(),
        ),
        other => other,
    }
}

fn project_summary(project: &Project) -> Value {
    let completed: Vec<&str> = [
        WorkflowAction::Terrain,
        WorkflowAction::Layout,
        WorkflowAction::Simulation,
        WorkflowAction::WindRose,
        WorkflowAction::Report,
    ]
    .iter()
    .filter(|a| project.step_results(**a).is_some())
    .map(|a| a.as_str())
    .collect();

    json!({
        "id": project.id,
        "name": project.name,
        "status": project.status.as_str(),
        "coordinates": project.lat.zip(project.lon).map(|(lat, lon)| json!({"lat": lat, "lon": lon})),
        "capacity_mw": project.capacity_mw,
        "completed_steps": completed,
    })
}
