use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use orc_types::{
    AuditEvent, Policy, Run, RunStatus, StepExecution, StepOutcome, StepStatus, Workflow,
};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex as AsyncMutex;

use crate::error::StoreError;
use crate::lease::RunLeaseTable;
use crate::{RunLease, Snapshot, Store};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS workflows (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    body TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_workflows_tenant ON workflows(tenant_id, created_at);

CREATE TABLE IF NOT EXISTS policies (
    tenant_id TEXT PRIMARY KEY,
    body TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS runs (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    body TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS step_executions (
    id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL,
    attempt INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    body TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_step_executions_run ON step_executions(run_id, created_at);

CREATE TABLE IF NOT EXISTS audit_events (
    id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    body TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_audit_events_run ON audit_events(run_id, created_at);
"#;

/// `rusqlite`-backed `Store`, grounded on `tandem-memory::db`'s
/// `Arc<tokio::sync::Mutex<Connection>>` + WAL idiom. Row-level locking is
/// approximated by a CAS `UPDATE ... WHERE status = ?old` plus the
/// in-process `RunLeaseTable` for multi-statement sequences (spec §4.2).
pub struct SqliteStore {
    conn: Arc<AsyncMutex<Connection>>,
    leases: RunLeaseTable,
}

impl SqliteStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_owned();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection, StoreError> {
            let conn = Connection::open(path)?;
            conn.busy_timeout(Duration::from_secs(10))?;
            conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
            conn.execute_batch(SCHEMA)?;
            Ok(conn)
        })
        .await
        .map_err(|e| StoreError::Fatal(e.to_string()))??;

        Ok(Self {
            conn: Arc::new(AsyncMutex::new(conn)),
            leases: RunLeaseTable::new(),
        })
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(AsyncMutex::new(conn)),
            leases: RunLeaseTable::new(),
        })
    }
}

fn now_rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

#[async_trait]
impl Store for SqliteStore {
    async fn create_workflow(&self, workflow: &Workflow) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let body = serde_json::to_string(workflow)?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO workflows (id, tenant_id, created_at, body) VALUES (?1, ?2, ?3, ?4)",
            params![workflow.id, workflow.tenant_id, Utc::now().to_rfc3339(), body],
        )?;
        if inserted != 1 {
            return Err(StoreError::Conflict(format!(
                "workflow {} already exists",
                workflow.id
            )));
        }
        Ok(())
    }

    async fn get_workflow(&self, id: &str) -> Result<Workflow, StoreError> {
        let conn = self.conn.lock().await;
        let body: String = conn
            .query_row(
                "SELECT body FROM workflows WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("workflow {id}")))?;
        Ok(serde_json::from_str(&body)?)
    }

    async fn list_workflows(&self, tenant_id: &str) -> Result<Snapshot<Workflow>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT body FROM workflows WHERE tenant_id = ?1 ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![tenant_id], |row| {
            let body: String = row.get(0)?;
            Ok(body)
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(serde_json::from_str(&row?)?);
        }
        Ok(out)
    }

    async fn upsert_policy(&self, policy: &Policy) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let body = serde_json::to_string(policy)?;
        conn.execute(
            "INSERT INTO policies (tenant_id, body) VALUES (?1, ?2)
             ON CONFLICT(tenant_id) DO UPDATE SET body = excluded.body",
            params![policy.tenant_id, body],
        )?;
        Ok(())
    }

    async fn get_policy(&self, tenant_id: &str) -> Result<Policy, StoreError> {
        let conn = self.conn.lock().await;
        let body: String = conn
            .query_row(
                "SELECT body FROM policies WHERE tenant_id = ?1",
                params![tenant_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("policy for tenant {tenant_id}")))?;
        Ok(serde_json::from_str(&body)?)
    }

    async fn create_run(&self, run: &Run) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let body = serde_json::to_string(run)?;
        conn.execute(
            "INSERT INTO runs (id, tenant_id, status, created_at, body) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                run.id,
                run.tenant_id,
                serde_json::to_string(&run.status)?,
                now_rfc3339(run.created_at),
                body
            ],
        )?;
        Ok(())
    }

    async fn get_run(&self, id: &str) -> Result<Run, StoreError> {
        let conn = self.conn.lock().await;
        let body: String = conn
            .query_row("SELECT body FROM runs WHERE id = ?1", params![id], |row| {
                row.get(0)
            })
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("run {id}")))?;
        Ok(serde_json::from_str(&body)?)
    }

    async fn update_run_status(
        &self,
        id: &str,
        from: RunStatus,
        to: RunStatus,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let from_json = serde_json::to_string(&from)?;
        let body: String = conn
            .query_row("SELECT body FROM runs WHERE id = ?1", params![id], |row| {
                row.get(0)
            })
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("run {id}")))?;
        let mut run: Run = serde_json::from_str(&body)?;
        run.status = to;
        if to.is_terminal() {
            run.completed_at = Some(Utc::now());
        }
        let new_body = serde_json::to_string(&run)?;

        let changed = conn.execute(
            "UPDATE runs SET status = ?1, body = ?2 WHERE id = ?3 AND status = ?4",
            params![serde_json::to_string(&to)?, new_body, id, from_json],
        )?;
        if changed != 1 {
            return Err(StoreError::Conflict(format!(
                "run {id} was not in status {from:?}"
            )));
        }
        Ok(())
    }

    async fn save_run(&self, run: &Run) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let body = serde_json::to_string(run)?;
        conn.execute(
            "UPDATE runs SET status = ?1, body = ?2 WHERE id = ?3",
            params![serde_json::to_string(&run.status)?, body, run.id],
        )?;
        Ok(())
    }

    async fn create_step(&self, step: &StepExecution) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let body = serde_json::to_string(step)?;
        conn.execute(
            "INSERT INTO step_executions (id, run_id, attempt, created_at, body) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                step.id,
                step.run_id,
                step.attempt,
                step.started_at.unwrap_or_else(Utc::now).to_rfc3339(),
                body
            ],
        )?;
        Ok(())
    }

    async fn list_steps_by_run(&self, run_id: &str) -> Result<Snapshot<StepExecution>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT body FROM step_executions WHERE run_id = ?1 ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            let body: String = row.get(0)?;
            Ok(body)
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(serde_json::from_str(&row?)?);
        }
        Ok(out)
    }

    async fn update_step_result(
        &self,
        step_id: &str,
        attempt: u32,
        outcome: &StepOutcome,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let body: String = conn
            .query_row(
                "SELECT body FROM step_executions WHERE id = ?1",
                params![step_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("step {step_id}")))?;
        let mut step: StepExecution = serde_json::from_str(&body)?;
        if step.attempt != attempt {
            return Err(StoreError::Conflict(format!(
                "step {step_id} attempt mismatch: stored {}, expected {attempt}",
                step.attempt
            )));
        }
        step.status = outcome.status;
        step.output = outcome.output.clone();
        step.error = outcome.error.clone();
        step.usage = outcome.usage;
        if matches!(step.status, StepStatus::Completed | StepStatus::Failed) {
            step.completed_at = Some(Utc::now());
        }
        let new_body = serde_json::to_string(&step)?;
        conn.execute(
            "UPDATE step_executions SET body = ?1 WHERE id = ?2",
            params![new_body, step_id],
        )?;
        Ok(())
    }

    async fn append_audit(&self, event: &AuditEvent) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let body = serde_json::to_string(event)?;
        conn.execute(
            "INSERT INTO audit_events (id, run_id, created_at, body) VALUES (?1, ?2, ?3, ?4)",
            params![event.id, event.run_id, event.timestamp.to_rfc3339(), body],
        )?;
        Ok(())
    }

    async fn list_audit_events(&self, run_id: &str) -> Result<Snapshot<AuditEvent>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT body FROM audit_events WHERE run_id = ?1 ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            let body: String = row.get(0)?;
            Ok(body)
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(serde_json::from_str(&row?)?);
        }
        Ok(out)
    }

    async fn acquire_run_lease(
        &self,
        run_id: &str,
        timeout: Duration,
    ) -> Result<RunLease, StoreError> {
        self.leases.acquire(run_id, timeout).await
    }
}
