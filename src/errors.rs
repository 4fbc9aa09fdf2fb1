//! Typed error hierarchy for the Windsite orchestrator.
//!
//! One enum covers the orchestration path. Recoverable variants
//! (`ClassificationAmbiguous`, `MissingPrerequisite`) end the turn with a
//! question or a named missing step; the rest surface as failed turns.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestrateError {
    #[error("Could not determine which analysis was requested")]
    ClassificationAmbiguous,

    #[error("Missing prerequisite: the {step} step has not been run for this project")]
    MissingPrerequisite { step: String },

    #[error("Task runner '{tool}' failed ({kind}): {message}")]
    TaskRunnerFailure {
        tool: String,
        kind: String,
        message: String,
    },

    #[error("Project {id} not found")]
    ProjectNotFound { id: String },

    #[error("Store write failed after retry: {0}")]
    StoreWrite(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// `error_kind` recorded when a newer request on the same session closes a
/// still-open turn. Not a failure of the turn's own pipeline, so it has no
/// enum variant; kept beside `kind()` so the message-log `error_kind`
/// vocabulary lives in one place.
pub const KIND_SUPERSEDED: &str = "superseded";

/// `error_kind` for turns force-finalized by the background sweeper and
/// for uncategorized failures (`Other`).
pub const KIND_INTERNAL: &str = "internal";

impl OrchestrateError {
    /// Stable identifier recorded on failed turns (`messages.error_kind`).
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ClassificationAmbiguous => "classification_ambiguous",
            Self::MissingPrerequisite { .. } => "missing_prerequisite",
            Self::TaskRunnerFailure { .. } => "task_runner_failure",
            Self::ProjectNotFound { .. } => "project_not_found",
            Self::StoreWrite(_) => "store_write_failure",
            Self::Other(_) => KIND_INTERNAL,
        }
    }

    /// Text shown to the user when this error finalizes a turn.
    ///
    /// `MissingPrerequisite` must name the missing step; a generic
    /// "something went wrong" is deliberately not produced for it.
    pub fn user_message(&self) -> String {
        match self {
            Self::ClassificationAmbiguous => {
                "I couldn't tell which analysis you want. You can ask for a terrain \
                 analysis, a turbine layout, a wake simulation, a wind rose, or a report."
                    .to_string()
            }
            Self::MissingPrerequisite { step } => format!(
                "The {step} step hasn't been run for this project yet. Run it first, \
                 or provide explicit coordinates.",
            ),
            Self::TaskRunnerFailure { tool, message, .. } => {
                format!("The {tool} analysis failed: {message}")
            }
            Self::ProjectNotFound { id } => format!("Project {id} was not found."),
            Self::StoreWrite(_) => "Could not save the analysis result.".to_string(),
            Self::Other(_) => "An internal error interrupted the analysis.".to_string(),
        }
    }
}
