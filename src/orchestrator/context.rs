//! Project-context snapshot building and dual-name field access.
//!
//! The context handed to a task runner is the subset of project state
//! relevant to that step, not the whole conversation. Field names went
//! through a camelCase → snake_case rename; consumers read both spellings
//! so a half-migrated producer never silently drops a prerequisite.

use serde_json::{Map, Value, json};

use crate::intent::IntentParams;
use crate::store::models::Project;
use crate::workflow::{self, Prerequisite, WorkflowAction};

/// Canonical snake_case name → historical camelCase name.
const LEGACY_ALIASES: &[(&str, &str)] = &[
    ("terrain_results", "terrainResults"),
    ("layout_results", "layoutResults"),
    ("simulation_results", "simulationResults"),
    ("wind_rose_results", "windRoseResults"),
    ("report_results", "reportResults"),
    ("project_id", "projectId"),
    ("capacity_mw", "capacityMw"),
];

/// Look up a context field under its canonical name, falling back to the
/// legacy spelling. Null values count as absent.
pub fn context_field<'a>(context: &'a Value, canonical: &str) -> Option<&'a Value> {
    let direct = context.get(canonical).filter(|v| !v.is_null());
    if direct.is_some() {
        return direct;
    }
    LEGACY_ALIASES
        .iter()
        .find(|(snake, _)| *snake == canonical)
        .and_then(|(_, camel)| context.get(*camel))
        .filter(|v| !v.is_null())
}

/// Build the project-context snapshot for one step.
///
/// Base identity fields always travel; result fields are limited to the
/// step's own upstream chain (the report gets everything accumulated).
pub fn build_project_context(project: &Project, action: WorkflowAction) -> Value {
    let mut context = Map::new();
    context.insert("project_id".into(), json!(project.id));
    context.insert("name".into(), json!(project.name));
    context.insert("status".into(), json!(project.status.as_str()));
    if let (Some(lat), Some(lon)) = (project.lat, project.lon) {
        context.insert("coordinates".into(), json!({"lat": lat, "lon": lon}));
    }
    if let Some(capacity) = project.capacity_mw {
        context.insert("capacity_mw".into(), json!(capacity));
    }

    for upstream in upstream_steps(action) {
        if let Some(result) = project.step_results(*upstream)
            && let Some(column) = workflow::result_column(*upstream)
        {
            context.insert(column.to_string(), result.clone());
        }
    }

    Value::Object(context)
}

/// Upstream steps whose results are relevant input for a given step.
fn upstream_steps(action: WorkflowAction) -> &'static [WorkflowAction] {
    match action {
        WorkflowAction::Terrain | WorkflowAction::Dashboard => &[],
        WorkflowAction::Layout => &[WorkflowAction::Terrain],
        WorkflowAction::Simulation => &[WorkflowAction::Terrain, WorkflowAction::Layout],
        WorkflowAction::WindRose => &[WorkflowAction::Layout, WorkflowAction::Simulation],
        WorkflowAction::Report => &[
            WorkflowAction::Terrain,
            WorkflowAction::Layout,
            WorkflowAction::Simulation,
            WorkflowAction::WindRose,
        ],
    }
}

/// Whether a step's prerequisite is satisfied by the context snapshot or
/// by an explicit override in the request parameters.
pub fn prerequisite_satisfied(
    context: &Value,
    prereq: &Prerequisite,
    params: &IntentParams,
) -> bool {
    if context_field(context, prereq.field).is_some() {
        return true;
    }
    prereq.coords_override && params.coordinates.is_some()
}
