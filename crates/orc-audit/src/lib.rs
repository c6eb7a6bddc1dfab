//! Append-only audit trail (spec §4.8).
//!
//! Durable storage is delegated to the `Store`'s outbox-pattern
//! `append_audit` (the caller commits it inside the same transaction as the
//! state change it describes). This crate adds the bounded in-memory tail
//! buffer tandem's `tool_proxy::OperationJournal` uses for fast recent-first
//! reads, so a status endpoint doesn't have to hit the store for the common
//! case of "what just happened on this run".

use std::collections::VecDeque;
use std::sync::Arc;

use orc_store::{Store, StoreError};
use orc_types::AuditEvent;
use tokio::sync::RwLock;

const DEFAULT_TAIL_CAPACITY: usize = 200;

pub struct AuditRecorder {
    store: Arc<dyn Store>,
    tail: RwLock<VecDeque<AuditEvent>>,
    tail_capacity: usize,
}

impl AuditRecorder {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self::with_tail_capacity(store, DEFAULT_TAIL_CAPACITY)
    }

    pub fn with_tail_capacity(store: Arc<dyn Store>, tail_capacity: usize) -> Self {
        Self {
            store,
            tail: RwLock::new(VecDeque::new()),
            tail_capacity,
        }
    }

    /// Persist `event` via the store, then append it to the in-memory tail.
    /// Callers invoke this inside the same `with_run_lease` scope as the
    /// state change the event describes, so presence of the event implies
    /// the state change committed and vice versa (spec §4.8 invariant).
    pub async fn record(&self, event: AuditEvent) -> Result<(), StoreError> {
        self.store.append_audit(&event).await?;
        let mut tail = self.tail.write().await;
        if tail.len() >= self.tail_capacity {
            tail.pop_front();
        }
        tail.push_back(event);
        Ok(())
    }

    /// Fast path for the most recent events across all runs, newest last.
    /// Falls back to the store for full per-run history.
    pub async fn recent(&self, limit: usize) -> Vec<AuditEvent> {
        let tail = self.tail.read().await;
        tail.iter().rev().take(limit).rev().cloned().collect()
    }

    /// Full, durable history for one run, oldest first (spec §4.8).
    pub async fn history(&self, run_id: &str) -> Result<Vec<AuditEvent>, StoreError> {
        self.store.list_audit_events(run_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orc_store::sqlite::SqliteStore;
    use orc_types::AuditAction;

    fn event(id: &str, run_id: &str) -> AuditEvent {
        AuditEvent {
            id: id.to_string(),
            run_id: run_id.to_string(),
            step_id: None,
            action: AuditAction::RunCreated,
            actor: "scheduler".to_string(),
            timestamp: chrono::Utc::now(),
            details: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn record_persists_and_tails() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().unwrap());
        let recorder = AuditRecorder::new(store);
        recorder.record(event("aud_1", "run_1")).await.unwrap();
        recorder.record(event("aud_2", "run_1")).await.unwrap();

        assert_eq!(recorder.recent(10).await.len(), 2);
        assert_eq!(recorder.history("run_1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn tail_buffer_is_bounded() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().unwrap());
        let recorder = AuditRecorder::with_tail_capacity(store, 2);
        for i in 0..5 {
            recorder
                .record(event(&format!("aud_{i}"), "run_1"))
                .await
                .unwrap();
        }
        let tail = recorder.recent(10).await;
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[1].id, "aud_4");

        // durable history is unaffected by the tail bound
        assert_eq!(recorder.history("run_1").await.unwrap().len(), 5);
    }
}
