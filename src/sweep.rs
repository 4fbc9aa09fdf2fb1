//! Background sweep for stranded turns.
//!
//! A turn must never stay incomplete forever; the dispatch path finalizes
//! on every outcome it can observe, but a process crash between dispatch
//! and delivery can still strand one. The sweeper is the backstop: any ai
//! turn still open past the threshold gets finalized as an internal error
//! so pollers stop waiting.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::errors::KIND_INTERNAL;
use crate::store::DbHandle;

pub struct TurnSweeper {
    db: DbHandle,
    older_than: Duration,
}

impl TurnSweeper {
    pub fn new(db: DbHandle, older_than: Duration) -> Self {
        Self { db, older_than }
    }

    /// Finalize every turn open longer than the threshold. Returns the ids
    /// swept.
    pub async fn sweep_once(&self) -> anyhow::Result<Vec<i64>> {
        let older_than_secs = self.older_than.as_secs() as i64;
        let stale = self
            .db
            .call(move |db| db.stale_incomplete_messages(older_than_secs))
            .await?;

        let mut swept = Vec::new();
        for id in stale {
            let finalized = self
                .db
                .write(move |db| {
                    db.finalize_message(
                        id,
                        "The analysis was interrupted and did not complete.",
                        None,
                        Some(KIND_INTERNAL),
                    )
                })
                .await?;
            if finalized {
                warn!(message_id = id, "swept stranded turn");
                swept.push(id);
            }
        }
        Ok(swept)
    }

    /// Run the sweep on an interval until cancelled.
    pub async fn run(self, interval: Duration, cancel: CancellationToken) {
        info!(interval_secs = interval.as_secs(), "turn sweeper started");
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("turn sweeper stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.sweep_once().await {
                        warn!(error = %err, "sweep pass failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SiteDb;
    use crate::store::models::MessageRole;

    #[tokio::test]
    async fn sweeps_only_old_open_turns() {
        let db = DbHandle::new(SiteDb::new_in_memory().unwrap());
        let old_open = db
            .call(|db| db.append_message("s1", MessageRole::AiStream, "", false))
            .await
            .unwrap();
        let fresh_open = db
            .call(|db| db.append_message("s1", MessageRole::AiStream, "", false))
            .await
            .unwrap();
        let closed = db
            .call(|db| db.append_message("s1", MessageRole::Ai, "done", true))
            .await
            .unwrap();
        // Backdate the first turn past the threshold.
        db.call(move |db| db.backdate_message(old_open, "-1 hour"))
            .await
            .unwrap();

        let sweeper = TurnSweeper::new(db.clone(), Duration::from_secs(600));
        let swept = sweeper.sweep_once().await.unwrap();
        assert_eq!(swept, vec![old_open]);

        let msg = db.call(move |db| db.get_message(old_open)).await.unwrap().unwrap();
        assert!(msg.response_complete);
        assert_eq!(msg.error_kind.as_deref(), Some("internal"));

        let msg = db.call(move |db| db.get_message(fresh_open)).await.unwrap().unwrap();
        assert!(!msg.response_complete);
        let msg = db.call(move |db| db.get_message(closed)).await.unwrap().unwrap();
        assert_eq!(msg.content, "done");
    }

    #[tokio::test]
    async fn sweep_is_a_noop_when_nothing_is_stale() {
        let db = DbHandle::new(SiteDb::new_in_memory().unwrap());
        let sweeper = TurnSweeper::new(db, Duration::from_secs(600));
        assert!(sweeper.sweep_once().await.unwrap().is_empty());
    }
}
