use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use orc_audit::AuditRecorder;
use orc_core::ControlPlaneConfig;
use orc_executor::{
    ExecutorError, FilesystemArtifactStore, HttpLlmProvider, McpToolInvoker, PolicyResolver,
    ResultSink, StepWorker,
};
use orc_observability::{init_process_logging, ProcessKind};
use orc_policy::PolicyEngine;
use orc_queue::{JsonlQueue, Queue};
use orc_scheduler::RunScheduler;
use orc_server::{AppState, StaticTenantResolver};
use orc_store::{SqliteStore, Store};
use orc_types::{Policy, StepOutcome};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "orc-controlplane")]
#[command(about = "Agent orchestration control plane: API server and step worker")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the HTTP boundary API.
    Serve {
        #[arg(long, alias = "host", default_value = "127.0.0.1")]
        hostname: String,
        #[arg(long, default_value_t = 8080)]
        port: u16,
        #[arg(long)]
        state_dir: Option<String>,
    },
    /// Run a pool of step workers against the durable queue.
    Worker {
        #[arg(long)]
        state_dir: Option<String>,
        #[arg(long)]
        concurrency: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ControlPlaneConfig::from_env();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { hostname, port, state_dir } => {
            let state_dir = resolve_state_dir(state_dir);
            let (_guard, log_info) =
                init_process_logging(ProcessKind::ControlPlane, &state_dir.join("logs"), 14)?;
            info!(process = %log_info.process, "logging initialized");

            let store = open_store(&state_dir, &config).await?;
            let queue = open_queue(&state_dir).await?;
            let audit = Arc::new(AuditRecorder::new(store.clone()));
            let scheduler = Arc::new(RunScheduler::new(
                store.clone(),
                queue.clone(),
                audit.clone(),
                orc_server::DEFAULT_CONSUMER_GROUP,
            ));
            let tenants = Arc::new(StaticTenantResolver::new(static_tokens_from_env()));

            let addr: SocketAddr = format!("{hostname}:{port}")
                .parse()
                .context("invalid hostname or port")?;
            let state = AppState::new(store, queue, audit, scheduler, tenants);
            log_startup_paths(&state_dir, &addr);
            orc_server::serve(addr, state).await?;
        }
        Command::Worker { state_dir, concurrency } => {
            let state_dir = resolve_state_dir(state_dir);
            let (_guard, log_info) =
                init_process_logging(ProcessKind::Worker, &state_dir.join("logs"), 14)?;
            info!(process = %log_info.process, "logging initialized");

            let store = open_store(&state_dir, &config).await?;
            let queue = open_queue(&state_dir).await?;
            let audit = Arc::new(AuditRecorder::new(store.clone()));
            let scheduler = Arc::new(RunScheduler::new(
                store.clone(),
                queue.clone(),
                audit.clone(),
                orc_server::DEFAULT_CONSUMER_GROUP,
            ));

            let llm = Arc::new(HttpLlmProvider::new(
                config.llm_provider_url.clone(),
                config.llm_provider_api_key.clone().unwrap_or_default(),
            ));
            let tools = Arc::new(McpToolInvoker::new(config.mcp_endpoint.clone()));
            let artifacts = Arc::new(FilesystemArtifactStore::new(
                PathBuf::from(&config.fd_workspace_dir).join("artifacts"),
            ));
            let policy = Arc::new(StorePolicyResolver { store: store.clone() });
            let sink = Arc::new(SchedulerResultSink { store: store.clone(), scheduler: scheduler.clone() });

            let worker = Arc::new(StepWorker::new(
                queue,
                orc_server::DEFAULT_CONSUMER_GROUP,
                llm,
                tools,
                policy,
                artifacts,
                sink,
                config.worker_max_retries,
                std::time::Duration::from_millis(config.worker_retry_delay_ms),
            ));

            let concurrency = concurrency.unwrap_or(config.worker_concurrency).max(1);
            info!(concurrency, "starting worker pool");
            run_worker_pool(worker, concurrency).await;
        }
    }

    Ok(())
}

/// Runs `concurrency` independent poll loops against the shared consumer
/// group, each pulling and fully processing one delivery at a time -- a
/// pool of parallel consumers (spec §5), grounded on
/// `OrchestratorEngine::new`'s `task_semaphore`/`llm_semaphore` bound on
/// concurrent in-flight work: there the bound gates how many spawned tasks
/// run at once, here it's realized directly as the lane count since each
/// lane is already one in-flight step at a time.
async fn run_worker_pool(worker: Arc<StepWorker>, concurrency: usize) {
    let mut handles = Vec::with_capacity(concurrency);
    for lane in 0..concurrency {
        let worker = worker.clone();
        handles.push(tokio::spawn(async move {
            loop {
                match worker.run_once(1).await {
                    Ok(0) => tokio::time::sleep(std::time::Duration::from_millis(500)).await,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(lane, error = %e, "worker lane error");
                        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                    }
                }
            }
        }));
    }
    for handle in handles {
        let _ = handle.await;
    }
}

/// Resolves a tenant's policy directly against the shared store. A worker
/// runs in the same process/filesystem as the control plane here, so there
/// is no need to round-trip through the HTTP API for this lookup.
struct StorePolicyResolver {
    store: Arc<dyn Store>,
}

#[async_trait]
impl PolicyResolver for StorePolicyResolver {
    async fn resolve(&self, tenant_id: &str) -> Result<Arc<PolicyEngine>, ExecutorError> {
        let policy = match self.store.get_policy(tenant_id).await {
            Ok(policy) => policy,
            Err(orc_store::StoreError::NotFound(_)) => Policy {
                id: String::new(),
                tenant_id: tenant_id.to_string(),
                ..Default::default()
            },
            Err(e) => return Err(ExecutorError::Fatal(e.to_string())),
        };
        Ok(Arc::new(PolicyEngine::new(policy)))
    }
}

/// Posts a step's outcome straight into `RunScheduler::handle_step_result`
/// rather than over HTTP, since the worker and scheduler share one process
/// and store here. A networked deployment would swap this for an HTTP
/// `ResultSink` instead.
struct SchedulerResultSink {
    store: Arc<dyn Store>,
    scheduler: Arc<RunScheduler>,
}

#[async_trait]
impl ResultSink for SchedulerResultSink {
    async fn post_result(
        &self,
        run_id: &str,
        _step_id: &str,
        outcome: StepOutcome,
    ) -> Result<(), ExecutorError> {
        let run = self
            .store
            .get_run(run_id)
            .await
            .map_err(|e| ExecutorError::Transient(e.to_string()))?;
        let workflow = self
            .store
            .get_workflow(&run.workflow_id)
            .await
            .map_err(|e| ExecutorError::Transient(e.to_string()))?;
        self.scheduler
            .handle_step_result(run_id, &workflow.steps, workflow.on_error, outcome)
            .await
            .map_err(|e| ExecutorError::Transient(e.to_string()))
    }
}

async fn open_store(state_dir: &PathBuf, config: &ControlPlaneConfig) -> anyhow::Result<Arc<dyn Store>> {
    let path = if config.database_url.contains('/') {
        PathBuf::from(&config.database_url)
    } else {
        state_dir.join(&config.database_url)
    };
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.ok();
    }
    let store = SqliteStore::open(path).await?;
    Ok(Arc::new(store))
}

async fn open_queue(state_dir: &PathBuf) -> anyhow::Result<Arc<dyn Queue>> {
    let queue = JsonlQueue::open(state_dir.join("queue.jsonl")).await?;
    Ok(Arc::new(queue))
}

/// Parses `ORC_STATIC_TOKENS` as `token:tenant_id` pairs separated by
/// commas, mirroring `RuntimeState::auth`'s in-memory map but seeded from
/// the environment instead of an interactive login flow.
fn static_tokens_from_env() -> Vec<(String, String)> {
    std::env::var("ORC_STATIC_TOKENS")
        .unwrap_or_default()
        .split(',')
        .filter_map(|pair| {
            let (token, tenant) = pair.split_once(':')?;
            let (token, tenant) = (token.trim(), tenant.trim());
            if token.is_empty() || tenant.is_empty() {
                None
            } else {
                Some((token.to_string(), tenant.to_string()))
            }
        })
        .collect()
}

fn resolve_state_dir(flag: Option<String>) -> PathBuf {
    if let Some(dir) = flag {
        return PathBuf::from(dir);
    }
    if let Ok(dir) = std::env::var("ORC_STATE_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    PathBuf::from(".orc")
}

fn log_startup_paths(state_dir: &PathBuf, addr: &SocketAddr) {
    let exe = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    info!("starting orc-controlplane on http://{addr}");
    info!(
        "startup paths: exe={} cwd={} state_dir={}",
        exe.display(),
        cwd.display(),
        state_dir.display(),
    );
}
