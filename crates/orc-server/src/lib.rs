//! HTTP boundary adapter (spec §4.9, §6): binds the control plane's REST
//! API, resolves bearer tokens to tenants, and wires requests into the
//! store/queue/audit/scheduler stack.
//!
//! Grounded on `RuntimeState`/`serve()`'s shape: one cloneable state
//! struct threaded through `axum::State`, a router builder, and a
//! background reaper task spawned alongside the listener.

pub mod http;
pub mod tenant;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use orc_audit::AuditRecorder;
use orc_queue::Queue;
use orc_scheduler::RunScheduler;
use orc_store::Store;
use orc_types::{IdGenerator, StepDispatchPayload, StepOutcome, StepStatus};

pub use tenant::{StaticTenantResolver, TenantId, TenantResolver};

pub const DEFAULT_CONSUMER_GROUP: &str = "workers";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub queue: Arc<dyn Queue>,
    pub audit: Arc<AuditRecorder>,
    pub scheduler: Arc<RunScheduler>,
    pub ids: Arc<IdGenerator>,
    pub tenants: Arc<dyn TenantResolver>,
    pub consumer_group: String,
}

impl AppState {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<dyn Queue>,
        audit: Arc<AuditRecorder>,
        scheduler: Arc<RunScheduler>,
        tenants: Arc<dyn TenantResolver>,
    ) -> Self {
        Self {
            store,
            queue,
            audit,
            scheduler,
            ids: Arc::new(IdGenerator::default()),
            tenants,
            consumer_group: DEFAULT_CONSUMER_GROUP.to_string(),
        }
    }
}

/// Binds `addr` and serves the API until ctrl-c, running a background
/// janitor that fails the StepExecution behind any orphaned queue delivery
/// (spec §5: a worker that claimed a delivery and never acked it -- crashed
/// mid-dispatch, say -- leaves it expired past the visibility timeout; the
/// janitor settles it as a transient failure rather than letting it sit
/// forever, and the normal retry-policy path decides whether to redispatch).
pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let reaper_state = state.clone();
    let app = http::app_router(state);

    let reaper = tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(5)).await;
            match reaper_state
                .queue
                .reclaim_expired(&reaper_state.consumer_group)
                .await
            {
                Ok(reclaimed) if !reclaimed.is_empty() => {
                    tracing::warn!(count = reclaimed.len(), "reclaiming orphaned step deliveries");
                    for delivery in reclaimed {
                        let payload = &delivery.envelope.payload;
                        if let Err(e) = fail_orphaned_step(&reaper_state, payload).await {
                            tracing::warn!(
                                run_id = %payload.run_id,
                                step_id = %payload.step_id,
                                error = %e,
                                "failed to settle orphaned step",
                            );
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "queue reclaim failed"),
            }
        }
    });

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await;
    reaper.abort();
    result?;
    Ok(())
}

async fn fail_orphaned_step(state: &AppState, payload: &StepDispatchPayload) -> anyhow::Result<()> {
    let run = state.store.get_run(&payload.run_id).await?;
    let workflow = state.store.get_workflow(&run.workflow_id).await?;
    let outcome = StepOutcome {
        step_execution_id: payload.step_id.clone(),
        attempt: payload.attempt,
        status: StepStatus::Failed,
        output: None,
        error: Some("orphaned delivery: worker did not ack within the visibility timeout".to_string()),
        usage: Default::default(),
    };
    state
        .scheduler
        .handle_step_result(&run.id, &workflow.steps, workflow.on_error, outcome)
        .await?;
    Ok(())
}
