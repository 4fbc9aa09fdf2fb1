use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::workflow::WorkflowAction;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    New,
    TerrainDone,
    LayoutDone,
    SimulationDone,
    WindroseDone,
    ReportDone,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::TerrainDone => "terrain_done",
            Self::LayoutDone => "layout_done",
            Self::SimulationDone => "simulation_done",
            Self::WindroseDone => "windrose_done",
            Self::ReportDone => "report_done",
        }
    }
}

impl FromStr for ProjectStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(Self::New),
            "terrain_done" => Ok(Self::TerrainDone),
            "layout_done" => Ok(Self::LayoutDone),
            "simulation_done" => Ok(Self::SimulationDone),
            "windrose_done" => Ok(Self::WindroseDone),
            "report_done" => Ok(Self::ReportDone),
            _ => Err(format!("Invalid project status: {}", s)),
        }
    }
}

/// One site assessment, accumulating results across sequential steps.
/// The orchestrator is the sole writer; task runners only return data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    /// Session that created the project, used for "most recent project
    /// in this conversation" resolution.
    pub session_id: String,
    pub name: String,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub capacity_mw: Option<f64>,
    pub status: ProjectStatus,
    pub terrain_results: Option<Value>,
    pub layout_results: Option<Value>,
    pub simulation_results: Option<Value>,
    pub wind_rose_results: Option<Value>,
    pub report_results: Option<Value>,
    pub created_at: String,
    pub updated_at: String,
}

impl Project {
    /// Stored result for an analysis step, if present.
    pub fn step_results(&self, action: WorkflowAction) -> Option<&Value> {
        match action {
            WorkflowAction::Terrain => self.terrain_results.as_ref(),
            WorkflowAction::Layout => self.layout_results.as_ref(),
            WorkflowAction::Simulation => self.simulation_results.as_ref(),
            WorkflowAction::WindRose => self.wind_rose_results.as_ref(),
            WorkflowAction::Report => self.report_results.as_ref(),
            WorkflowAction::Dashboard => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Ai,
    AiStream,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Ai => "ai",
            Self::AiStream => "ai_stream",
        }
    }

    pub fn is_ai(&self) -> bool {
        matches!(self, Self::Ai | Self::AiStream)
    }
}

impl FromStr for MessageRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "ai" => Ok(Self::Ai),
            "ai_stream" => Ok(Self::AiStream),
            _ => Err(format!("Invalid message role: {}", s)),
        }
    }
}

/// Incremental progress entry appended to a turn while a request is in
/// flight. Ordered within the turn; visible to pollers as soon as written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThoughtStep {
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
}

impl ThoughtStep {
    pub fn new(label: impl Into<String>, detail: Option<String>) -> Self {
        Self {
            label: label.into(),
            detail,
            at: Utc::now(),
        }
    }
}

/// One conversation turn. Created incomplete at dispatch, mutated in place
/// as thought steps append, finalized exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub session_id: String,
    pub role: MessageRole,
    pub content: String,
    pub artifacts: Option<Value>,
    pub thought_steps: Vec<ThoughtStep>,
    pub response_complete: bool,
    pub error_kind: Option<String>,
    pub created_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            ProjectStatus::New,
            ProjectStatus::TerrainDone,
            ProjectStatus::LayoutDone,
            ProjectStatus::SimulationDone,
            ProjectStatus::WindroseDone,
            ProjectStatus::ReportDone,
        ] {
            assert_eq!(status.as_str().parse::<ProjectStatus>().unwrap(), status);
        }
    }

    #[test]
    fn role_ai_stream_counts_as_ai() {
        assert!(MessageRole::Ai.is_ai());
        assert!(MessageRole::AiStream.is_ai());
        assert!(!MessageRole::User.is_ai());
    }

    #[test]
    fn step_results_maps_action_to_column() {
        let mut project = Project {
            id: "p1".into(),
            session_id: "s1".into(),
            name: "Test Site".into(),
            lat: Some(40.7),
            lon: Some(-74.0),
            capacity_mw: None,
            status: ProjectStatus::TerrainDone,
            terrain_results: Some(serde_json::json!({"usable_area_km2": 12.5})),
            layout_results: None,
            simulation_results: None,
            wind_rose_results: None,
            report_results: None,
            created_at: String::new(),
            updated_at: String::new(),
        };
        assert!(project.step_results(WorkflowAction::Terrain).is_some());
        assert!(project.step_results(WorkflowAction::Layout).is_none());
        project.layout_results = Some(serde_json::json!({"turbines": 14}));
        assert!(project.step_results(WorkflowAction::Layout).is_some());
    }
}
