use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Fixed vocabulary of audit actions (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    RunCreated,
    RunCompleted,
    StepQueued,
    StepStarted,
    StepCompleted,
    StepFailed,
    PolicyAllowed,
    PolicyApprovalRequired,
    PolicyDenied,
    BudgetExceeded,
    ApprovalGranted,
    ApprovalRejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: String,
    pub run_id: String,
    #[serde(default)]
    pub step_id: Option<String>,
    pub action: AuditAction,
    pub actor: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub details: Value,
}

impl AuditEvent {
    /// Total order for events of the same run: commit timestamp first,
    /// ties broken by id (spec §5 ordering guarantee).
    pub fn order_key(&self) -> (DateTime<Utc>, &str) {
        (self.timestamp, self.id.as_str())
    }
}
