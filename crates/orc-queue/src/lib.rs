//! Durable step queue (spec §4.3).
//!
//! Grounded on `orchestrator::store::OrchestratorStore::append_run_event`'s
//! append-only JSONL idiom for on-disk durability, and on
//! `fd_worker.queue.RedisQueueConsumer`'s `xreadgroup`/`xack`/pending-entries
//! semantics for the consumer-group delivery contract: a message is
//! re-delivered to the group only after being claimed and not acked within
//! the visibility timeout.

pub mod error;
pub mod jsonl;

use async_trait::async_trait;
use orc_types::Envelope;

pub use error::QueueError;

/// Opaque handle identifying one delivery of one message to one consumer
/// group. Acking requires this handle, mirroring a Redis Streams message id
/// scoped to `(group, id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryId(pub String);

#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_id: DeliveryId,
    pub envelope: Envelope,
    pub delivery_count: u32,
}

#[async_trait]
pub trait Queue: Send + Sync {
    /// Append an envelope to the stream. At-least-once: callers may publish
    /// duplicates under retry; consumers are expected to de-dup on
    /// `envelope.context.idempotency_key` (spec §4.7).
    async fn publish(&self, envelope: Envelope) -> Result<(), QueueError>;

    /// Claim up to `max` undelivered (or reclaimable) messages for
    /// `consumer_group`, marking them pending with the given visibility
    /// timeout.
    async fn poll(
        &self,
        consumer_group: &str,
        max: usize,
        visibility_timeout_ms: u64,
    ) -> Result<Vec<Delivery>, QueueError>;

    /// Acknowledge successful processing, removing the entry from the
    /// group's pending list.
    async fn ack(&self, consumer_group: &str, delivery_id: &DeliveryId) -> Result<(), QueueError>;

    /// Remove and return pending entries whose visibility timeout has
    /// elapsed, for a janitor to settle (spec §5: "claimed by a janitor
    /// that fails the corresponding StepExecution with a transient
    /// error"). Unlike a plain redelivery, the queue does not hand these
    /// back out on the next `poll` -- the caller decides whether a new
    /// attempt is warranted.
    async fn reclaim_expired(&self, consumer_group: &str) -> Result<Vec<Delivery>, QueueError>;

    /// All entries claimed but not yet acked for `consumer_group`, for
    /// orphan inspection/recovery (spec §4.3: `pending(group) → list`).
    async fn pending(&self, consumer_group: &str) -> Result<Vec<Delivery>, QueueError>;

    /// Count of entries claimed but not yet acked for `consumer_group`.
    async fn pending_count(&self, consumer_group: &str) -> Result<usize, QueueError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jsonl::JsonlQueue;
    use orc_types::{EnvelopeContext, StepDispatchPayload, TraceContext};

    fn sample_envelope(id: &str) -> Envelope {
        Envelope {
            id: id.to_string(),
            payload: StepDispatchPayload {
                run_id: "run_1".to_string(),
                step_id: id.to_string(),
                step_type: "llm".to_string(),
                attempt: 1,
                input: serde_json::json!({}),
                timeout_ms: 30_000,
                context: EnvelopeContext {
                    tenant_id: "ten_1".to_string(),
                    agent_id: "agt_1".to_string(),
                    trace_context: TraceContext::default(),
                },
            },
        }
    }

    #[tokio::test]
    async fn publish_then_poll_delivers_once() {
        let dir = tempfile::tempdir().unwrap();
        let queue = JsonlQueue::open(dir.path().join("queue.jsonl")).await.unwrap();
        queue.publish(sample_envelope("a")).await.unwrap();

        let first = queue.poll("workers", 10, 5_000).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].delivery_count, 1);

        let second = queue.poll("workers", 10, 5_000).await.unwrap();
        assert!(second.is_empty(), "undelivered entry should not repeat while pending");
    }

    #[tokio::test]
    async fn ack_removes_from_pending() {
        let dir = tempfile::tempdir().unwrap();
        let queue = JsonlQueue::open(dir.path().join("queue.jsonl")).await.unwrap();
        queue.publish(sample_envelope("a")).await.unwrap();
        let delivered = queue.poll("workers", 10, 5_000).await.unwrap();
        assert_eq!(queue.pending_count("workers").await.unwrap(), 1);

        queue.ack("workers", &delivered[0].delivery_id).await.unwrap();
        assert_eq!(queue.pending_count("workers").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn expired_visibility_timeout_is_reclaimed_and_not_redelivered() {
        let dir = tempfile::tempdir().unwrap();
        let queue = JsonlQueue::open(dir.path().join("queue.jsonl")).await.unwrap();
        queue.publish(sample_envelope("a")).await.unwrap();
        let first = queue.poll("workers", 10, 0).await.unwrap();
        assert_eq!(first[0].delivery_count, 1);

        let reclaimed = queue.reclaim_expired("workers").await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].envelope.payload.step_id, "a");

        // the janitor owns the reclaimed entry now; the queue does not
        // silently hand it back out on the next poll.
        let second = queue.poll("workers", 10, 5_000).await.unwrap();
        assert!(second.is_empty());
        assert_eq!(queue.pending_count("workers").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn pending_lists_claimed_unacked_entries() {
        let dir = tempfile::tempdir().unwrap();
        let queue = JsonlQueue::open(dir.path().join("queue.jsonl")).await.unwrap();
        queue.publish(sample_envelope("a")).await.unwrap();
        queue.publish(sample_envelope("b")).await.unwrap();
        let delivered = queue.poll("workers", 10, 5_000).await.unwrap();

        let pending = queue.pending("workers").await.unwrap();
        assert_eq!(pending.len(), 2);

        queue.ack("workers", &delivered[0].delivery_id).await.unwrap();
        let pending = queue.pending("workers").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].envelope.payload.step_id, "b");
    }

    #[tokio::test]
    async fn independent_consumer_groups_each_see_the_full_stream() {
        let dir = tempfile::tempdir().unwrap();
        let queue = JsonlQueue::open(dir.path().join("queue.jsonl")).await.unwrap();
        queue.publish(sample_envelope("a")).await.unwrap();

        let workers = queue.poll("workers", 10, 5_000).await.unwrap();
        let audit_mirror = queue.poll("audit-mirror", 10, 5_000).await.unwrap();
        assert_eq!(workers.len(), 1);
        assert_eq!(audit_mirror.len(), 1);
    }
}
