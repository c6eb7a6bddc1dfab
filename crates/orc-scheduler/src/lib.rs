//! Run kernel: the scheduler component (spec §4.6).
//!
//! One [`RunScheduler`] instance serves every run; concurrency is gated by
//! the store's `acquire_run_lease` rather than per-run actors, matching the
//! advisory-row-lock direction recorded for the "run lease" design note
//! (spec §9) while keeping tests free of a mailbox/actor harness.

pub mod condition;
mod error;
pub mod kernel;
pub mod retry;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use orc_audit::AuditRecorder;
use orc_queue::Queue;
use orc_store::Store;
use orc_types::{
    AuditAction, AuditEvent, Envelope, EnvelopeContext, IdGenerator, Run, RunStatus, StepDef,
    StepExecution, StepOutcome, StepStatus, StepDispatchPayload, TraceContext,
};

pub use error::SchedulerError;
pub use kernel::ReleaseOutcome;

const RUN_LEASE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct RunScheduler {
    store: Arc<dyn Store>,
    queue: Arc<dyn Queue>,
    audit: Arc<AuditRecorder>,
    ids: IdGenerator,
    consumer_group: String,
}

impl RunScheduler {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<dyn Queue>,
        audit: Arc<AuditRecorder>,
        consumer_group: impl Into<String>,
    ) -> Self {
        Self {
            store,
            queue,
            audit,
            ids: IdGenerator::default(),
            consumer_group: consumer_group.into(),
        }
    }

    async fn audit_event(&self, run_id: &str, step_id: Option<String>, action: AuditAction, details: serde_json::Value) -> Result<(), SchedulerError> {
        let event = AuditEvent {
            id: self.ids.new_id("aud", &orc_types::SystemClock),
            run_id: run_id.to_string(),
            step_id,
            action,
            actor: "scheduler".to_string(),
            timestamp: Utc::now(),
            details,
        };
        self.audit.record(event).await?;
        Ok(())
    }

    /// Validate the workflow, persist the run row, enqueue it, and release
    /// the first layer.
    pub async fn start_run(
        &self,
        run: Run,
        workflow_steps: &[StepDef],
        on_error: orc_types::OnError,
    ) -> Result<(), SchedulerError> {
        orc_compiler::validate(&orc_types::Workflow {
            id: run.workflow_id.clone(),
            tenant_id: run.tenant_id.clone(),
            name: String::new(),
            version: run.workflow_version.clone(),
            description: String::new(),
            steps: workflow_steps.to_vec(),
            max_iterations: None,
            on_error,
        })?;

        self.store.create_run(&run).await?;
        self.audit_event(&run.id, None, AuditAction::RunCreated, serde_json::json!({})).await?;
        self.store
            .update_run_status(&run.id, RunStatus::Created, RunStatus::Queued)
            .await?;

        self.tick(&run.id, workflow_steps, on_error).await
    }

    /// One pass of the step-release algorithm under the run lease (spec
    /// §4.6 step-release). Idempotent: calling it with nothing newly
    /// releasable is a no-op beyond a possible settlement transition.
    pub async fn tick(
        &self,
        run_id: &str,
        workflow_steps: &[StepDef],
        on_error: orc_types::OnError,
    ) -> Result<(), SchedulerError> {
        use tracing::Instrument;
        let span = tracing::info_span!("run_tick", run_id = %run_id);
        self.tick_inner(run_id, workflow_steps, on_error).instrument(span).await
    }

    async fn tick_inner(
        &self,
        run_id: &str,
        workflow_steps: &[StepDef],
        on_error: orc_types::OnError,
    ) -> Result<(), SchedulerError> {
        let _lease = self.store.acquire_run_lease(run_id, RUN_LEASE_TIMEOUT).await?;

        let mut run = self.store.get_run(run_id).await?;
        if run.status.is_terminal() {
            return Ok(());
        }
        let executions = self.store.list_steps_by_run(run_id).await?;
        let context = kernel::build_context(&run.input, &executions, &serde_json::json!({}));
        let plan = kernel::evaluate_releases(workflow_steps, &executions, &context)?;

        if plan.outcomes.is_empty() {
            if let Some(next) = kernel::run_outcome(workflow_steps, &executions, on_error, true) {
                self.store.update_run_status(run_id, run.status, next).await?;
                self.audit_event(
                    run_id,
                    None,
                    if next == RunStatus::Completed {
                        AuditAction::RunCompleted
                    } else {
                        AuditAction::StepFailed
                    },
                    serde_json::json!({ "final_status": format!("{next:?}") }),
                )
                .await?;
            }
            return Ok(());
        }

        if run.status == RunStatus::Queued {
            self.store
                .update_run_status(run_id, RunStatus::Queued, RunStatus::Running)
                .await?;
            run.status = RunStatus::Running;
        }

        for outcome in plan.outcomes {
            match outcome {
                ReleaseOutcome::Skip(step_id) => {
                    let mut exec = StepExecution::new_pending(
                        self.ids.new_id(orc_types::IdKind::Step.prefix(), &orc_types::SystemClock),
                        run_id.to_string(),
                        step_id.clone(),
                        1,
                        serde_json::json!({}),
                        Utc::now(),
                    );
                    exec.status = StepStatus::Skipped;
                    exec.completed_at = Some(Utc::now());
                    self.store.create_step(&exec).await?;
                    self.audit_event(
                        run_id,
                        Some(exec.id.clone()),
                        AuditAction::StepCompleted,
                        serde_json::json!({ "step_def_id": step_id, "skipped": true }),
                    )
                    .await?;
                }
                ReleaseOutcome::Dispatch(step_id) => {
                    self.dispatch_attempt(&run, workflow_steps, &step_id, 1, serde_json::json!({}))
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn dispatch_attempt(
        &self,
        run: &Run,
        workflow_steps: &[StepDef],
        step_def_id: &str,
        attempt: u32,
        input: serde_json::Value,
    ) -> Result<(), SchedulerError> {
        let step_def = workflow_steps
            .iter()
            .find(|s| s.id == step_def_id)
            .expect("dispatch target must be a known StepDef");

        let exec = StepExecution::new_pending(
            self.ids.new_id(orc_types::IdKind::Step.prefix(), &orc_types::SystemClock),
            run.id.clone(),
            step_def_id.to_string(),
            attempt,
            input.clone(),
            Utc::now(),
        );
        self.store.create_step(&exec).await?;
        self.audit_event(
            &run.id,
            Some(exec.id.clone()),
            AuditAction::StepQueued,
            serde_json::json!({ "step_def_id": step_def_id, "attempt": attempt }),
        )
        .await?;

        let envelope = Envelope {
            id: self.ids.new_id("evt", &orc_types::SystemClock),
            payload: StepDispatchPayload {
                run_id: run.id.clone(),
                step_id: exec.id.clone(),
                step_type: format!("{:?}", step_def.kind).to_lowercase(),
                attempt,
                input,
                context: EnvelopeContext {
                    tenant_id: run.tenant_id.clone(),
                    agent_id: run.agent_id.clone(),
                    trace_context: TraceContext::default(),
                },
                timeout_ms: step_def.timeout_ms,
            },
        };
        self.queue.publish(envelope).await?;
        Ok(())
    }

    /// Apply a worker's step result (spec §4.7 step 4). Late POSTs against
    /// an already-terminal execution are rejected as a conflict rather than
    /// silently reprocessed (spec §8 boundary behaviour on timeout).
    pub async fn handle_step_result(
        &self,
        run_id: &str,
        workflow_steps: &[StepDef],
        on_error: orc_types::OnError,
        outcome: StepOutcome,
    ) -> Result<(), SchedulerError> {
        use tracing::Instrument;
        let span = tracing::info_span!(
            "step_result",
            run_id = %run_id,
            step_execution_id = %outcome.step_execution_id,
        );
        self.handle_step_result_inner(run_id, workflow_steps, on_error, outcome)
            .instrument(span)
            .await
    }

    async fn handle_step_result_inner(
        &self,
        run_id: &str,
        workflow_steps: &[StepDef],
        on_error: orc_types::OnError,
        outcome: StepOutcome,
    ) -> Result<(), SchedulerError> {
        let _lease = self.store.acquire_run_lease(run_id, RUN_LEASE_TIMEOUT).await?;

        let mut run = self.store.get_run(run_id).await?;
        let executions = self.store.list_steps_by_run(run_id).await?;
        let exec = executions
            .iter()
            .find(|e| e.id == outcome.step_execution_id)
            .ok_or_else(|| orc_store::StoreError::NotFound(outcome.step_execution_id.clone()))?;
        if exec.status.is_terminal() {
            return Err(SchedulerError::InvalidState {
                run_id: run_id.to_string(),
                reason: format!("step {} already settled", exec.id),
            });
        }

        self.store
            .update_step_result(&outcome.step_execution_id, outcome.attempt, &outcome)
            .await?;

        let mut tracker = orc_policy::BudgetTracker {
            budget: run.budget,
            usage: run.usage,
        };
        let breach = tracker.commit(&outcome.usage);
        run.usage = tracker.usage;
        self.store.save_run(&run).await?;

        self.audit_event(
            run_id,
            Some(exec.id.clone()),
            match outcome.status {
                StepStatus::Completed => AuditAction::StepCompleted,
                StepStatus::Failed => AuditAction::StepFailed,
                _ => AuditAction::StepCompleted,
            },
            serde_json::json!({ "status": format!("{:?}", outcome.status) }),
        )
        .await?;

        if let Some(dimension) = breach {
            self.store
                .update_run_status(run_id, run.status, RunStatus::BudgetKilled)
                .await?;
            self.cancel_pending_steps(run_id).await?;
            self.audit_event(
                run_id,
                None,
                AuditAction::BudgetExceeded,
                serde_json::json!({ "dimension": format!("{dimension:?}") }),
            )
            .await?;
            return Ok(());
        }

        match outcome.status {
            StepStatus::WaitingApproval => {
                self.store
                    .update_run_status(run_id, run.status, RunStatus::WaitingApproval)
                    .await?;
                self.audit_event(
                    run_id,
                    Some(exec.id.clone()),
                    AuditAction::PolicyApprovalRequired,
                    serde_json::json!({}),
                )
                .await?;
                Ok(())
            }
            StepStatus::Failed => {
                let step_def = workflow_steps.iter().find(|s| s.id == exec.step_def_id);
                if let Some(retry_policy) = step_def.and_then(|s| s.retry_policy.as_ref()) {
                    if retry::has_attempts_remaining(retry_policy, outcome.attempt) {
                        let delay = retry::next_delay(retry_policy, outcome.attempt, jitter_sample());
                        tokio::time::sleep(delay).await;
                        self.dispatch_attempt(
                            &run,
                            workflow_steps,
                            &exec.step_def_id,
                            outcome.attempt + 1,
                            exec.input.clone(),
                        )
                        .await?;
                        return Ok(());
                    }
                }
                self.tick(run_id, workflow_steps, on_error).await
            }
            _ => self.tick(run_id, workflow_steps, on_error).await,
        }
    }

    async fn cancel_pending_steps(&self, run_id: &str) -> Result<(), SchedulerError> {
        let executions = self.store.list_steps_by_run(run_id).await?;
        for exec in executions {
            if !exec.status.is_terminal() {
                let cancelled = StepOutcome {
                    step_execution_id: exec.id.clone(),
                    attempt: exec.attempt,
                    status: StepStatus::Cancelled,
                    output: None,
                    error: Some("run budget exceeded".to_string()),
                    usage: Default::default(),
                };
                self.store
                    .update_step_result(&exec.id, exec.attempt, &cancelled)
                    .await?;
            }
        }
        Ok(())
    }

    /// External approval grant/reject (spec §4.6.4). Rejecting settles only
    /// the requesting step as Failed and lets the normal step-release pass
    /// decide the run's fate, rather than force-failing the whole run — see
    /// the grounding ledger for the rationale (an Open Question in spec §9).
    pub async fn grant_approval(
        &self,
        run_id: &str,
        workflow_steps: &[StepDef],
        on_error: orc_types::OnError,
        step_execution_id: &str,
    ) -> Result<(), SchedulerError> {
        let _lease = self.store.acquire_run_lease(run_id, RUN_LEASE_TIMEOUT).await?;
        let run = self.store.get_run(run_id).await?;
        let exec = self
            .store
            .list_steps_by_run(run_id)
            .await?
            .into_iter()
            .find(|e| e.id == step_execution_id)
            .ok_or_else(|| orc_store::StoreError::NotFound(step_execution_id.to_string()))?;
        self.store
            .update_run_status(run_id, run.status, RunStatus::Running)
            .await?;
        self.audit_event(
            run_id,
            Some(exec.id.clone()),
            AuditAction::ApprovalGranted,
            serde_json::json!({}),
        )
        .await?;
        drop(_lease);
        let refreshed = self.store.get_run(run_id).await?;
        self.dispatch_attempt(
            &refreshed,
            workflow_steps,
            &exec.step_def_id,
            exec.attempt + 1,
            exec.input.clone(),
        )
        .await?;
        self.tick(run_id, workflow_steps, on_error).await
    }

    pub async fn reject_approval(
        &self,
        run_id: &str,
        workflow_steps: &[StepDef],
        on_error: orc_types::OnError,
        step_execution_id: &str,
    ) -> Result<(), SchedulerError> {
        let _lease = self.store.acquire_run_lease(run_id, RUN_LEASE_TIMEOUT).await?;
        let exec = self
            .store
            .list_steps_by_run(run_id)
            .await?
            .into_iter()
            .find(|e| e.id == step_execution_id)
            .ok_or_else(|| orc_store::StoreError::NotFound(step_execution_id.to_string()))?;
        let rejected = StepOutcome {
            step_execution_id: exec.id.clone(),
            attempt: exec.attempt,
            status: StepStatus::Failed,
            output: None,
            error: Some("approval rejected".to_string()),
            usage: Default::default(),
        };
        self.store
            .update_step_result(&exec.id, exec.attempt, &rejected)
            .await?;
        let run = self.store.get_run(run_id).await?;
        self.store
            .update_run_status(run_id, run.status, RunStatus::Running)
            .await?;
        self.audit_event(
            run_id,
            Some(exec.id.clone()),
            AuditAction::ApprovalRejected,
            serde_json::json!({}),
        )
        .await?;
        drop(_lease);
        self.tick(run_id, workflow_steps, on_error).await
    }

    pub async fn cancel_run(&self, run_id: &str) -> Result<(), SchedulerError> {
        let _lease = self.store.acquire_run_lease(run_id, RUN_LEASE_TIMEOUT).await?;
        let run = self.store.get_run(run_id).await?;
        if run.status.is_terminal() {
            return Ok(());
        }
        self.store
            .update_run_status(run_id, run.status, RunStatus::Cancelled)
            .await?;
        self.cancel_pending_steps(run_id).await?;
        Ok(())
    }
}

/// Uniform jitter sample in `[-1, 1]`. Not cryptographic; retry timing does
/// not need to be unpredictable, only spread out (spec §4.6.3).
fn jitter_sample() -> f64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    (nanos % 2000) as f64 / 1000.0 - 1.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use orc_queue::jsonl::JsonlQueue;
    use orc_store::sqlite::SqliteStore;
    use orc_types::{Budget, OnError, StepKind};
    use std::collections::HashSet;

    async fn harness() -> (RunScheduler, Arc<dyn Store>, Arc<dyn Queue>) {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().unwrap());
        let dir = tempfile::tempdir().unwrap();
        let queue: Arc<dyn Queue> = Arc::new(JsonlQueue::open(dir.path().join("q.jsonl")).await.unwrap());
        let audit = Arc::new(AuditRecorder::new(store.clone()));
        let scheduler = RunScheduler::new(store.clone(), queue.clone(), audit, "workers");
        (scheduler, store, queue)
    }

    fn step(id: &str, deps: &[&str]) -> StepDef {
        StepDef {
            id: id.to_string(),
            name: id.to_string(),
            kind: StepKind::Llm,
            config: serde_json::Value::Null,
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
            condition: None,
            timeout_ms: 30_000,
            retry_policy: None,
            steps: Vec::new(),
        }
    }

    fn run(id: &str) -> Run {
        Run::new(
            id.to_string(),
            "ten_1".into(),
            "agt_1".into(),
            "wfr_1".into(),
            "1.0.0".into(),
            serde_json::json!({}),
            Budget::default(),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn scenario_linear_happy_path_queues_a_first() {
        let (scheduler, store, queue) = harness().await;
        let steps = vec![step("A", &[]), step("B", &["A"]), step("C", &["B"])];
        scheduler.start_run(run("run_1"), &steps, OnError::Fail).await.unwrap();

        let fetched = store.get_run("run_1").await.unwrap();
        assert_eq!(fetched.status, RunStatus::Running);

        let delivered = queue.poll("workers", 10, 30_000).await.unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].envelope.payload.run_id, "run_1");
    }

    #[tokio::test]
    async fn scenario_deny_by_default_settles_failed_and_run_policy_path() {
        let (scheduler, store, _queue) = harness().await;
        let steps = vec![step("A", &[])];
        scheduler.start_run(run("run_1"), &steps, OnError::Fail).await.unwrap();
        let pending = store.list_steps_by_run("run_1").await.unwrap();
        let step_exec_id = pending[0].id.clone();

        let denied = StepOutcome {
            step_execution_id: step_exec_id,
            attempt: 1,
            status: StepStatus::Failed,
            output: None,
            error: Some("policy_denied".to_string()),
            usage: Default::default(),
        };
        scheduler
            .handle_step_result("run_1", &steps, OnError::Fail, denied)
            .await
            .unwrap();

        let fetched = store.get_run("run_1").await.unwrap();
        assert_eq!(fetched.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn scenario_budget_kill_cancels_pending_siblings() {
        let (scheduler, store, _queue) = harness().await;
        let steps = vec![step("A", &[]), step("B", &[])];
        let mut r = run("run_1");
        r.budget.max_total_tokens = Some(100);
        scheduler.start_run(r, &steps, OnError::Fail).await.unwrap();

        let pending = store.list_steps_by_run("run_1").await.unwrap();
        assert_eq!(pending.len(), 2);
        let a = pending.iter().find(|e| e.step_def_id == "A").unwrap().clone();

        let breaching = StepOutcome {
            step_execution_id: a.id.clone(),
            attempt: 1,
            status: StepStatus::Completed,
            output: Some(serde_json::json!({"ok": true})),
            error: None,
            usage: orc_types::BudgetUsage {
                input_tokens: 80,
                output_tokens: 40,
                ..Default::default()
            },
        };
        scheduler
            .handle_step_result("run_1", &steps, OnError::Fail, breaching)
            .await
            .unwrap();

        let fetched = store.get_run("run_1").await.unwrap();
        assert_eq!(fetched.status, RunStatus::BudgetKilled);
        let b = store
            .list_steps_by_run("run_1")
            .await
            .unwrap()
            .into_iter()
            .find(|e| e.step_def_id == "B")
            .unwrap();
        assert_eq!(b.status, StepStatus::Cancelled);
    }

    #[tokio::test]
    async fn late_post_against_a_settled_step_is_rejected_as_conflict() {
        let (scheduler, store, _queue) = harness().await;
        let steps = vec![step("A", &[])];
        scheduler.start_run(run("run_1"), &steps, OnError::Fail).await.unwrap();
        let pending = store.list_steps_by_run("run_1").await.unwrap();
        let exec_id = pending[0].id.clone();

        let first = StepOutcome {
            step_execution_id: exec_id.clone(),
            attempt: 1,
            status: StepStatus::Completed,
            output: Some(serde_json::json!({})),
            error: None,
            usage: Default::default(),
        };
        scheduler
            .handle_step_result("run_1", &steps, OnError::Fail, first.clone())
            .await
            .unwrap();

        let late = scheduler
            .handle_step_result("run_1", &steps, OnError::Fail, first)
            .await;
        assert!(matches!(late, Err(SchedulerError::InvalidState { .. })));
    }

    #[test]
    fn unused_import_guard() {
        let _ = HashSet::<String>::new();
    }
}
