use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::budget::{Budget, BudgetUsage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Created,
    Queued,
    Running,
    WaitingApproval,
    Completed,
    Failed,
    BudgetKilled,
    PolicyBlocked,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed
                | RunStatus::Failed
                | RunStatus::BudgetKilled
                | RunStatus::PolicyBlocked
                | RunStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    // Immutable.
    pub id: String,
    pub tenant_id: String,
    pub agent_id: String,
    pub workflow_id: String,
    pub workflow_version: String,
    pub input: Value,
    pub created_at: DateTime<Utc>,
    pub budget: Budget,

    // Mutable.
    pub status: RunStatus,
    pub usage: BudgetUsage,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub output: Option<Value>,
    pub error: Option<String>,
}

impl Run {
    pub fn new(
        id: String,
        tenant_id: String,
        agent_id: String,
        workflow_id: String,
        workflow_version: String,
        input: Value,
        budget: Budget,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            tenant_id,
            agent_id,
            workflow_id,
            workflow_version,
            input,
            created_at: now,
            budget,
            status: RunStatus::Created,
            usage: BudgetUsage::default(),
            started_at: None,
            completed_at: None,
            output: None,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses_are_sticky_by_classification() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::BudgetKilled.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(!RunStatus::WaitingApproval.is_terminal());
    }
}
