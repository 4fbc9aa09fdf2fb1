//! The assessment workflow as data.
//!
//! The step ordering (terrain → layout → simulation → wind rose → report),
//! the prerequisite each step declares, and the "next step" suggestions
//! shown after a step completes all live in the tables below, so the state
//! machine is testable without running any orchestration.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::store::models::ProjectStatus;

/// Action vocabulary shared between intent routing and UI "next step"
/// labels. These identifiers are stable; they appear in runner
/// configuration, artifacts, and suggestion lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowAction {
    Terrain,
    Layout,
    Simulation,
    WindRose,
    Report,
    Dashboard,
}

impl WorkflowAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Terrain => "terrain",
            Self::Layout => "layout",
            Self::Simulation => "simulation",
            Self::WindRose => "wind_rose",
            Self::Report => "report",
            Self::Dashboard => "dashboard",
        }
    }

    /// True for actions that dispatch a task runner and merge a result.
    /// `Dashboard` is a read-only view over the project store.
    pub fn is_analysis(&self) -> bool {
        !matches!(self, Self::Dashboard)
    }
}

impl FromStr for WorkflowAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "terrain" => Ok(Self::Terrain),
            "layout" => Ok(Self::Layout),
            "simulation" => Ok(Self::Simulation),
            "wind_rose" => Ok(Self::WindRose),
            "report" => Ok(Self::Report),
            "dashboard" => Ok(Self::Dashboard),
            _ => Err(format!("Invalid workflow action: {}", s)),
        }
    }
}

/// Prerequisite declared by an analysis step.
///
/// `field` is the canonical snake_case name of the project-context entry
/// that must be present; `legacy_field` is the historical camelCase name
/// the same producer used before the rename. Prerequisite checks read
/// both, so a half-migrated producer never silently loses a result.
#[derive(Debug, Clone, Copy)]
pub struct Prerequisite {
    pub field: &'static str,
    pub legacy_field: &'static str,
    /// Step that produces the required result, for the error message.
    pub step: WorkflowAction,
    /// Whether explicit coordinates in the request satisfy the check.
    pub coords_override: bool,
}

/// Prerequisite for each analysis step. `Terrain` is the entry step.
pub fn prerequisite(action: WorkflowAction) -> Option<Prerequisite> {
    match action {
        WorkflowAction::Terrain | WorkflowAction::Dashboard => None,
        WorkflowAction::Layout => Some(Prerequisite {
            field: "terrain_results",
            legacy_field: "terrainResults",
            step: WorkflowAction::Terrain,
            coords_override: true,
        }),
        WorkflowAction::Simulation => Some(Prerequisite {
            field: "layout_results",
            legacy_field: "layoutResults",
            step: WorkflowAction::Layout,
            coords_override: false,
        }),
        WorkflowAction::WindRose => Some(Prerequisite {
            field: "simulation_results",
            legacy_field: "simulationResults",
            step: WorkflowAction::Simulation,
            coords_override: true,
        }),
        WorkflowAction::Report => Some(Prerequisite {
            field: "wind_rose_results",
            legacy_field: "windRoseResults",
            step: WorkflowAction::WindRose,
            coords_override: true,
        }),
    }
}

/// Status a project transitions to when a step's result merges.
pub fn status_after(action: WorkflowAction) -> Option<ProjectStatus> {
    match action {
        WorkflowAction::Terrain => Some(ProjectStatus::TerrainDone),
        WorkflowAction::Layout => Some(ProjectStatus::LayoutDone),
        WorkflowAction::Simulation => Some(ProjectStatus::SimulationDone),
        WorkflowAction::WindRose => Some(ProjectStatus::WindroseDone),
        WorkflowAction::Report => Some(ProjectStatus::ReportDone),
        WorkflowAction::Dashboard => None,
    }
}

/// Project-store column a step's result merges into.
pub fn result_column(action: WorkflowAction) -> Option<&'static str> {
    match action {
        WorkflowAction::Terrain => Some("terrain_results"),
        WorkflowAction::Layout => Some("layout_results"),
        WorkflowAction::Simulation => Some("simulation_results"),
        WorkflowAction::WindRose => Some("wind_rose_results"),
        WorkflowAction::Report => Some("report_results"),
        WorkflowAction::Dashboard => None,
    }
}

/// "Next step" suggestions attached to the artifact after a step completes.
pub fn next_actions(status: ProjectStatus) -> &'static [WorkflowAction] {
    match status {
        ProjectStatus::New => &[WorkflowAction::Terrain],
        ProjectStatus::TerrainDone => &[WorkflowAction::Layout],
        ProjectStatus::LayoutDone => &[WorkflowAction::Simulation, WorkflowAction::Dashboard],
        ProjectStatus::SimulationDone => &[WorkflowAction::WindRose, WorkflowAction::Dashboard],
        ProjectStatus::WindroseDone => &[WorkflowAction::Report, WorkflowAction::Dashboard],
        ProjectStatus::ReportDone => &[WorkflowAction::Dashboard],
    }
}
