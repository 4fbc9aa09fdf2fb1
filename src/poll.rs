//! Client-side polling controller.
//!
//! The completion signal is the `response_complete` flag on the newest ai
//! message, nothing else. The controller polls at a fixed cadence, treats
//! read failures as transient (retry next tick, never abort the session),
//! and stops cleanly on cancellation.

use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::store::DbHandle;
use crate::store::models::Message;

/// Outcome of a single poll tick.
#[derive(Debug)]
pub enum PollTick {
    /// Newest ai message id unchanged since the last tick.
    Unchanged,
    /// A new or still-open turn is in flight; thought steps may be showing.
    Processing { message_id: i64, steps: usize },
    /// The turn finalized. Terminal for this poll session.
    Complete(Box<Message>),
    /// The read failed; retry on the next tick.
    TransientError,
}

pub struct PollController {
    db: DbHandle,
    session_id: String,
    interval: Duration,
    last_seen: Option<i64>,
}

impl PollController {
    pub fn new(db: DbHandle, session_id: impl Into<String>, interval: Duration) -> Self {
        Self {
            db,
            session_id: session_id.into(),
            interval,
            last_seen: None,
        }
    }

    /// One tick of the poll loop. Re-reading after completion is
    /// idempotent: the same terminal message comes back every time.
    pub async fn tick(&mut self) -> PollTick {
        let session = self.session_id.clone();
        let newest = match self.db.call(move |db| db.latest_ai_message(&session)).await {
            Ok(newest) => newest,
            Err(err) => {
                warn!(session_id = %self.session_id, error = %err, "poll read failed, retrying next tick");
                return PollTick::TransientError;
            }
        };

        let Some(message) = newest else {
            return PollTick::Unchanged;
        };

        if message.response_complete {
            self.last_seen = Some(message.id);
            return PollTick::Complete(Box::new(message));
        }
        if self.last_seen == Some(message.id) {
            // Same open turn; step count may still have grown.
            return PollTick::Processing {
                message_id: message.id,
                steps: message.thought_steps.len(),
            };
        }
        self.last_seen = Some(message.id);
        PollTick::Processing {
            message_id: message.id,
            steps: message.thought_steps.len(),
        }
    }

    /// Poll until a complete turn appears or the token is cancelled.
    /// Returns `None` on cancellation; no timer outlives this call.
    pub async fn wait_for_completion(
        &mut self,
        cancel: &CancellationToken,
    ) -> Option<Message> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(session_id = %self.session_id, "poll cancelled");
                    return None;
                }
                _ = ticker.tick() => match self.tick().await {
                    PollTick::Complete(message) => return Some(*message),
                    PollTick::Processing { message_id, steps } => {
                        debug!(message_id, steps, "turn in flight");
                    }
                    PollTick::Unchanged | PollTick::TransientError => {}
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::store::SiteDb;
    use crate::store::models::MessageRole;

    fn handle() -> DbHandle {
        DbHandle::new(SiteDb::new_in_memory().unwrap())
    }

    #[tokio::test]
    async fn empty_session_is_unchanged() {
        let mut poller = PollController::new(handle(), "s1", Duration::from_millis(10));
        assert!(matches!(poller.tick().await, PollTick::Unchanged));
    }

    #[tokio::test]
    async fn open_turn_reports_processing() {
        let db = handle();
        let id = db
            .call(|db| db.append_message("s1", MessageRole::AiStream, "", false))
            .await
            .unwrap();
        let mut poller = PollController::new(db, "s1", Duration::from_millis(10));
        match poller.tick().await {
            PollTick::Processing { message_id, .. } => assert_eq!(message_id, id),
            other => panic!("Expected Processing, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn repolling_after_completion_is_idempotent() {
        let db = handle();
        let id = db
            .call(|db| db.append_message("s1", MessageRole::AiStream, "", false))
            .await
            .unwrap();
        db.call(move |db| {
            db.finalize_message(id, "done", Some(&json!({"action": "terrain"})), None)
        })
        .await
        .unwrap();

        let mut poller = PollController::new(db, "s1", Duration::from_millis(10));
        for _ in 0..3 {
            match poller.tick().await {
                PollTick::Complete(msg) => {
                    assert_eq!(msg.id, id);
                    assert_eq!(msg.artifacts.as_ref().unwrap()["action"], "terrain");
                }
                other => panic!("Expected Complete, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn wait_for_completion_sees_late_finalization() {
        let db = handle();
        let id = db
            .call(|db| db.append_message("s1", MessageRole::AiStream, "", false))
            .await
            .unwrap();

        let finisher = db.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(40)).await;
            finisher
                .call(move |db| db.finalize_message(id, "done", None, None))
                .await
                .unwrap();
        });

        let mut poller = PollController::new(db, "s1", Duration::from_millis(10));
        let cancel = CancellationToken::new();
        let message = poller.wait_for_completion(&cancel).await.unwrap();
        assert_eq!(message.id, id);
        assert!(message.response_complete);
    }

    #[tokio::test]
    async fn cancellation_stops_the_loop() {
        let db = handle();
        db.call(|db| db.append_message("s1", MessageRole::AiStream, "", false))
            .await
            .unwrap();

        let mut poller = PollController::new(db, "s1", Duration::from_millis(10));
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            canceller.cancel();
        });
        assert!(poller.wait_for_completion(&cancel).await.is_none());
    }
}
