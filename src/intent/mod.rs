//! Intent types and the rule-based classifier.
//!
//! An intent is constructed per query and never persisted; it carries the
//! routing decision and whatever parameters the query text yielded.

pub mod classifier;

use serde::{Deserialize, Serialize};

use crate::workflow::WorkflowAction;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentKind {
    TerrainAnalysis,
    LayoutOptimization,
    WakeSimulation,
    WindRose,
    ReportGeneration,
    Dashboard,
    ProjectList,
    Unknown,
}

impl IntentKind {
    /// Workflow action this intent routes to. `None` for `ProjectList`
    /// and `Unknown`, which never reach a task runner.
    pub fn action(&self) -> Option<WorkflowAction> {
        match self {
            Self::TerrainAnalysis => Some(WorkflowAction::Terrain),
            Self::LayoutOptimization => Some(WorkflowAction::Layout),
            Self::WakeSimulation => Some(WorkflowAction::Simulation),
            Self::WindRose => Some(WorkflowAction::WindRose),
            Self::ReportGeneration => Some(WorkflowAction::Report),
            Self::Dashboard => Some(WorkflowAction::Dashboard),
            Self::ProjectList | Self::Unknown => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lon: f64,
}

/// Parameters extracted from the query text.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntentParams {
    pub coordinates: Option<Coordinates>,
    pub project_id: Option<String>,
    pub radius_km: Option<f64>,
    pub turbine_model: Option<String>,
    pub mean_wind_speed: Option<f64>,
    pub capacity_mw: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct Intent {
    pub kind: IntentKind,
    pub params: IntentParams,
}

impl Intent {
    pub fn unknown() -> Self {
        Self {
            kind: IntentKind::Unknown,
            params: IntentParams::default(),
        }
    }
}
