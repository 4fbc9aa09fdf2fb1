//! Thought-step streaming.
//!
//! Each append is a durable, awaited write to the turn's row: the step is
//! externally visible to pollers before the orchestrator moves to its next
//! phase. Steps are never buffered and flushed at the end — the live
//! "thinking" feed is the contract, and a fire-and-forget write would
//! break it without ever raising an error.

use serde_json::Value;

use crate::errors::OrchestrateError;
use crate::store::DbHandle;
use crate::store::models::ThoughtStep;

#[derive(Clone)]
pub struct ThoughtStreamer {
    db: DbHandle,
    message_id: i64,
}

impl ThoughtStreamer {
    pub fn new(db: DbHandle, message_id: i64) -> Self {
        Self { db, message_id }
    }

    pub fn message_id(&self) -> i64 {
        self.message_id
    }

    /// Append one step. Returns only after the write committed.
    pub async fn append(
        &self,
        label: &str,
        detail: Option<String>,
    ) -> Result<(), OrchestrateError> {
        let step = ThoughtStep::new(label, detail);
        let message_id = self.message_id;
        tracing::debug!(message_id, label = %step.label, "thought step");
        self.db
            .write(move |db| db.push_thought_step(message_id, &step))
            .await
    }

    /// Terminal write: content, artifact, and completion flag in one
    /// update. Returns false if the turn was already finalized, which
    /// callers treat as "someone else delivered the terminal state".
    pub async fn finalize(
        &self,
        content: &str,
        artifacts: Option<Value>,
        error_kind: Option<&str>,
    ) -> Result<bool, OrchestrateError> {
        let message_id = self.message_id;
        let content = content.to_string();
        let error_kind = error_kind.map(str::to_string);
        self.db
            .write(move |db| {
                db.finalize_message(
                    message_id,
                    &content,
                    artifacts.as_ref(),
                    error_kind.as_deref(),
                )
            })
            .await
    }
}
