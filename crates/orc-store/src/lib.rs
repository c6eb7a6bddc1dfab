//! Persistent store adapter (spec §4.2).
//!
//! Grounded on `orchestrator::store::OrchestratorStore`'s atomic-write /
//! JSONL-append idiom for the audit trail, and on `tandem-memory::db`'s
//! `Arc<tokio::sync::Mutex<rusqlite::Connection>>` WAL-mode pattern for the
//! transactional row store itself.

pub mod error;
pub mod lease;
pub mod sqlite;

use std::time::Duration;

use async_trait::async_trait;
use orc_types::{AuditEvent, Policy, Run, RunStatus, StepExecution, StepOutcome, Workflow};

pub use error::StoreError;
pub use lease::{RunLease, RunLeaseTable};

/// A snapshot list ordered by creation time, per spec §4.2
/// ("Reads for lists return snapshots ordered by creation time").
pub type Snapshot<T> = Vec<T>;

#[async_trait]
pub trait Store: Send + Sync {
    /// Registers a workflow template (spec §4.9 `POST /workflows`).
    /// Fails with `Conflict` if `(tenant_id, id)` already exists.
    async fn create_workflow(&self, workflow: &Workflow) -> Result<(), StoreError>;
    async fn get_workflow(&self, id: &str) -> Result<Workflow, StoreError>;
    async fn list_workflows(&self, tenant_id: &str) -> Result<Snapshot<Workflow>, StoreError>;

    /// Inserts or replaces the active policy for a tenant (spec §4.5 gates
    /// every tool call against exactly one policy per tenant).
    async fn upsert_policy(&self, policy: &Policy) -> Result<(), StoreError>;
    async fn get_policy(&self, tenant_id: &str) -> Result<Policy, StoreError>;

    async fn create_run(&self, run: &Run) -> Result<(), StoreError>;
    async fn get_run(&self, id: &str) -> Result<Run, StoreError>;
    /// Compare-and-set on current status; fails with `Conflict` if `from`
    /// does not match the stored status.
    async fn update_run_status(
        &self,
        id: &str,
        from: RunStatus,
        to: RunStatus,
    ) -> Result<(), StoreError>;
    async fn save_run(&self, run: &Run) -> Result<(), StoreError>;

    async fn create_step(&self, step: &StepExecution) -> Result<(), StoreError>;
    async fn list_steps_by_run(&self, run_id: &str) -> Result<Snapshot<StepExecution>, StoreError>;
    async fn update_step_result(
        &self,
        step_id: &str,
        attempt: u32,
        outcome: &StepOutcome,
    ) -> Result<(), StoreError>;

    /// Outbox-pattern append: the caller commits this in the same logical
    /// transaction as the state change it describes (spec §4.8).
    async fn append_audit(&self, event: &AuditEvent) -> Result<(), StoreError>;
    async fn list_audit_events(&self, run_id: &str) -> Result<Snapshot<AuditEvent>, StoreError>;

    /// Acquire an advisory lock on `run_id`, waiting up to `timeout`. Hold
    /// the returned guard for as long as the caller's multi-statement
    /// sequence needs serialized access; drop it to release (spec §4.2, §5).
    /// Fails with `LeaseBusy` on contention past the timeout.
    async fn acquire_run_lease(
        &self,
        run_id: &str,
        timeout: Duration,
    ) -> Result<RunLease, StoreError>;
}
