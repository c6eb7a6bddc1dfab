//! The full REST route table, mounted under `/v1`.
//!
//! Grounded on the router-builder/extractor idiom this stack already
//! uses: `Router::new().route(...)` chains, `State(state): State<AppState>`
//! + `Json(body)` extractors, and a normalised `ApiError { code, message,
//! details }` body for failures.

use axum::extract::{Path, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use chrono::Utc;
use orc_types::{
    ApiError, AuditAction, AuditEvent, Budget, BudgetUsage, ErrorKind, IdKind, Policy,
    PolicyDecision, Run, StepDef, StepOutcome, StepStatus, SystemClock, Workflow,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::cors::{Any, CorsLayer};

use crate::{AppState, TenantId};

fn error_response(kind: ErrorKind, message: impl Into<String>) -> Response {
    error_response_with_details(kind, message, Value::Null)
}

fn error_response_with_details(
    kind: ErrorKind,
    message: impl Into<String>,
    details: Value,
) -> Response {
    let status = match kind {
        ErrorKind::Transient => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::PolicyDenied => StatusCode::FORBIDDEN,
        ErrorKind::ApprovalRequired => StatusCode::ACCEPTED,
        ErrorKind::BudgetExceeded => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Fatal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let body = ApiError::new(kind, message).with_details(details);
    (status, Json(body)).into_response()
}

fn store_err(e: orc_store::StoreError) -> Response {
    error_response(e.kind(), e.to_string())
}

fn scheduler_err(e: orc_scheduler::SchedulerError) -> Response {
    error_response(e.kind(), e.to_string())
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(ApiError {
            code: "UNAUTHORIZED".to_string(),
            message: "missing or unrecognized bearer token".to_string(),
            details: Value::Null,
        }),
    )
        .into_response()
}

async fn require_tenant(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Response {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string);

    let Some(token) = token else {
        return unauthorized();
    };
    let Some(tenant_id) = state.tenants.resolve(&token).await else {
        return unauthorized();
    };
    req.extensions_mut().insert(TenantId(tenant_id));
    next.run(req).await
}

pub fn app_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let v1 = Router::new()
        .route("/workflows", post(create_workflow).get(list_workflows))
        .route("/workflows/{id}", get(get_workflow))
        .route("/workflow-runs", post(start_run))
        .route("/workflow-runs/{id}", get(get_run))
        .route("/workflow-runs/{id}/steps", get(list_run_steps))
        .route("/workflow-runs/{id}/cancel", post(cancel_run))
        .route("/runs/{id}/check-tool", post(check_tool))
        .route("/runs/{id}/steps/{step_id}", post(post_step_result))
        .route("/approvals/{id}/grant", post(grant_approval))
        .route("/approvals/{id}/reject", post(reject_approval))
        .layer(middleware::from_fn_with_state(state.clone(), require_tenant));

    Router::new()
        .route("/v1/health/live", get(health_live))
        .route("/v1/health/ready", get(health_ready))
        .nest("/v1", v1)
        .layer(cors)
        .with_state(state)
}

async fn health_live() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "live" }))
}

async fn health_ready(State(state): State<AppState>) -> Response {
    match state.store.get_workflow("__readiness_probe__").await {
        Ok(_) => Json(serde_json::json!({ "status": "ready" })).into_response(),
        Err(orc_store::StoreError::NotFound(_)) => {
            Json(serde_json::json!({ "status": "ready" })).into_response()
        }
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "not_ready", "error": e.to_string() })),
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct CreateWorkflowRequest {
    id: Option<String>,
    name: String,
    version: String,
    #[serde(default)]
    description: String,
    steps: Vec<StepDef>,
    #[serde(default)]
    max_iterations: Option<u32>,
    #[serde(default)]
    on_error: orc_types::OnError,
}

async fn create_workflow(
    State(state): State<AppState>,
    Extension(TenantId(tenant_id)): Extension<TenantId>,
    Json(body): Json<CreateWorkflowRequest>,
) -> Response {
    let id = body
        .id
        .unwrap_or_else(|| state.ids.new_id(IdKind::Workflow.prefix(), &SystemClock));
    let workflow = Workflow {
        id,
        tenant_id,
        name: body.name,
        version: body.version,
        description: body.description,
        steps: body.steps,
        max_iterations: body.max_iterations,
        on_error: body.on_error,
    };

    if let Err(e) = orc_compiler::validate(&workflow) {
        return error_response(orc_types::ErrorKind::Validation, e.to_string());
    }
    match state.store.create_workflow(&workflow).await {
        Ok(()) => (StatusCode::CREATED, Json(workflow)).into_response(),
        Err(e) => store_err(e),
    }
}

async fn get_workflow(
    State(state): State<AppState>,
    Extension(TenantId(tenant_id)): Extension<TenantId>,
    Path(id): Path<String>,
) -> Response {
    match state.store.get_workflow(&id).await {
        Ok(workflow) if workflow.tenant_id == tenant_id => Json(workflow).into_response(),
        Ok(_) => error_response(orc_types::ErrorKind::NotFound, format!("workflow {id}")),
        Err(e) => store_err(e),
    }
}

async fn list_workflows(
    State(state): State<AppState>,
    Extension(TenantId(tenant_id)): Extension<TenantId>,
) -> Response {
    match state.store.list_workflows(&tenant_id).await {
        Ok(workflows) => Json(workflows).into_response(),
        Err(e) => store_err(e),
    }
}

#[derive(Debug, Deserialize)]
struct StartRunRequest {
    workflow_id: String,
    #[serde(default)]
    input: Value,
    #[serde(default)]
    budget: Option<Budget>,
    #[serde(default)]
    agent_id: Option<String>,
}

async fn start_run(
    State(state): State<AppState>,
    Extension(TenantId(tenant_id)): Extension<TenantId>,
    Json(body): Json<StartRunRequest>,
) -> Response {
    let workflow = match state.store.get_workflow(&body.workflow_id).await {
        Ok(w) if w.tenant_id == tenant_id => w,
        Ok(_) => {
            return error_response(
                orc_types::ErrorKind::NotFound,
                format!("workflow {}", body.workflow_id),
            )
        }
        Err(e) => return store_err(e),
    };

    let run_id = state.ids.new_id(IdKind::Run.prefix(), &SystemClock);
    let agent_id = body.agent_id.unwrap_or_else(|| tenant_id.clone());
    let run = Run::new(
        run_id.clone(),
        tenant_id,
        agent_id,
        workflow.id.clone(),
        workflow.version.clone(),
        body.input,
        body.budget.unwrap_or_default(),
        Utc::now(),
    );

    if let Err(e) = state
        .scheduler
        .start_run(run, &workflow.steps, workflow.on_error)
        .await
    {
        return scheduler_err(e);
    }

    match state.store.get_run(&run_id).await {
        Ok(run) => (StatusCode::CREATED, Json(run)).into_response(),
        Err(e) => store_err(e),
    }
}

async fn get_run(
    State(state): State<AppState>,
    Extension(TenantId(tenant_id)): Extension<TenantId>,
    Path(id): Path<String>,
) -> Response {
    match state.store.get_run(&id).await {
        Ok(run) if run.tenant_id == tenant_id => Json(run).into_response(),
        Ok(_) => error_response(orc_types::ErrorKind::NotFound, format!("run {id}")),
        Err(e) => store_err(e),
    }
}

async fn list_run_steps(
    State(state): State<AppState>,
    Extension(TenantId(tenant_id)): Extension<TenantId>,
    Path(id): Path<String>,
) -> Response {
    match state.store.get_run(&id).await {
        Ok(run) if run.tenant_id == tenant_id => {}
        Ok(_) => return error_response(orc_types::ErrorKind::NotFound, format!("run {id}")),
        Err(e) => return store_err(e),
    }
    match state.store.list_steps_by_run(&id).await {
        Ok(steps) => Json(steps).into_response(),
        Err(e) => store_err(e),
    }
}

async fn cancel_run(
    State(state): State<AppState>,
    Extension(TenantId(tenant_id)): Extension<TenantId>,
    Path(id): Path<String>,
) -> Response {
    let run = match state.store.get_run(&id).await {
        Ok(run) if run.tenant_id == tenant_id => run,
        Ok(_) => return error_response(orc_types::ErrorKind::NotFound, format!("run {id}")),
        Err(e) => return store_err(e),
    };
    if run.status.is_terminal() {
        return error_response(
            orc_types::ErrorKind::Conflict,
            format!("run {id} is already in a terminal state"),
        );
    }
    match state.scheduler.cancel_run(&id).await {
        Ok(()) => Json(serde_json::json!({ "status": "cancelled" })).into_response(),
        Err(e) => scheduler_err(e),
    }
}

#[derive(Debug, Deserialize)]
struct CheckToolRequest {
    tool_name: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Serialize)]
struct CheckToolResponse {
    allowed: bool,
    requires_approval: bool,
    reason: String,
    decision_id: String,
}

async fn check_tool(
    State(state): State<AppState>,
    Extension(TenantId(tenant_id)): Extension<TenantId>,
    Path(run_id): Path<String>,
    Json(body): Json<CheckToolRequest>,
) -> Response {
    match state.store.get_run(&run_id).await {
        Ok(run) if run.tenant_id == tenant_id => {}
        Ok(_) => return error_response(orc_types::ErrorKind::NotFound, format!("run {run_id}")),
        Err(e) => return store_err(e),
    }

    // A tenant with no policy on file denies every tool, matching the
    // deny-by-default invariant (spec §4.5) rather than erroring.
    let policy = match state.store.get_policy(&tenant_id).await {
        Ok(policy) => policy,
        Err(orc_store::StoreError::NotFound(_)) => Policy {
            tenant_id: tenant_id.clone(),
            ..Default::default()
        },
        Err(e) => return store_err(e),
    };

    let engine = orc_policy::PolicyEngine::new(policy);
    let decision = engine.decide(&body.tool_name, &body.args).await;
    let decision_id = state.ids.new_id("dec", &SystemClock);

    let (allowed, requires_approval, reason, action) = match decision.decision {
        PolicyDecision::Allow => (true, false, "tool is allowed by policy".to_string(), AuditAction::PolicyAllowed),
        PolicyDecision::Approval => (
            false,
            true,
            "tool requires human approval".to_string(),
            AuditAction::PolicyApprovalRequired,
        ),
        PolicyDecision::Deny => (
            false,
            false,
            "tool is denied by policy".to_string(),
            AuditAction::PolicyDenied,
        ),
    };

    let event = AuditEvent {
        id: state.ids.new_id("aud", &SystemClock),
        run_id: run_id.clone(),
        step_id: None,
        action,
        actor: "policy-engine".to_string(),
        timestamp: Utc::now(),
        details: decision.audit_details,
    };
    if let Err(e) = state.audit.record(event).await {
        return store_err(e);
    }

    let body = CheckToolResponse {
        allowed,
        requires_approval,
        reason,
        decision_id,
    };
    if decision.decision == PolicyDecision::Deny {
        (StatusCode::FORBIDDEN, Json(body)).into_response()
    } else {
        Json(body).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct StepResultRequest {
    attempt: u32,
    status: StepStatus,
    #[serde(default)]
    output: Option<Value>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    usage: BudgetUsage,
}

async fn post_step_result(
    State(state): State<AppState>,
    Extension(TenantId(tenant_id)): Extension<TenantId>,
    Path((run_id, step_id)): Path<(String, String)>,
    Json(body): Json<StepResultRequest>,
) -> Response {
    let run = match state.store.get_run(&run_id).await {
        Ok(run) if run.tenant_id == tenant_id => run,
        Ok(_) => return error_response(orc_types::ErrorKind::NotFound, format!("run {run_id}")),
        Err(e) => return store_err(e),
    };
    let workflow = match state.store.get_workflow(&run.workflow_id).await {
        Ok(w) => w,
        Err(e) => return store_err(e),
    };

    let outcome = StepOutcome {
        step_execution_id: step_id,
        attempt: body.attempt,
        status: body.status,
        output: body.output,
        error: body.error,
        usage: body.usage,
    };

    match state
        .scheduler
        .handle_step_result(&run_id, &workflow.steps, workflow.on_error, outcome)
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => scheduler_err(e),
    }
}

#[derive(Debug, Deserialize)]
struct ApprovalResolutionRequest {
    run_id: String,
}

async fn grant_approval(
    State(state): State<AppState>,
    Extension(TenantId(tenant_id)): Extension<TenantId>,
    Path(step_execution_id): Path<String>,
    Json(body): Json<ApprovalResolutionRequest>,
) -> Response {
    resolve_approval(state, tenant_id, body.run_id, step_execution_id, true).await
}

async fn reject_approval(
    State(state): State<AppState>,
    Extension(TenantId(tenant_id)): Extension<TenantId>,
    Path(step_execution_id): Path<String>,
    Json(body): Json<ApprovalResolutionRequest>,
) -> Response {
    resolve_approval(state, tenant_id, body.run_id, step_execution_id, false).await
}

async fn resolve_approval(
    state: AppState,
    tenant_id: String,
    run_id: String,
    step_execution_id: String,
    grant: bool,
) -> Response {
    let run = match state.store.get_run(&run_id).await {
        Ok(run) if run.tenant_id == tenant_id => run,
        Ok(_) => return error_response(orc_types::ErrorKind::NotFound, format!("run {run_id}")),
        Err(e) => return store_err(e),
    };
    let workflow = match state.store.get_workflow(&run.workflow_id).await {
        Ok(w) => w,
        Err(e) => return store_err(e),
    };

    let result = if grant {
        state
            .scheduler
            .grant_approval(&run_id, &workflow.steps, workflow.on_error, &step_execution_id)
            .await
    } else {
        state
            .scheduler
            .reject_approval(&run_id, &workflow.steps, workflow.on_error, &step_execution_id)
            .await
    };

    match result {
        Ok(()) => Json(serde_json::json!({
            "status": if grant { "granted" } else { "rejected" },
        }))
        .into_response(),
        Err(e) => scheduler_err(e),
    }
}

