use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::budget::BudgetUsage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    WaitingApproval,
    Cancelled,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Completed
                | StepStatus::Failed
                | StepStatus::Skipped
                | StepStatus::Cancelled
        )
    }

    pub fn is_settled(self) -> bool {
        self.is_terminal()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecution {
    pub id: String,
    pub run_id: String,
    pub step_def_id: String,
    pub attempt: u32,
    pub status: StepStatus,
    pub input: Value,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub usage: BudgetUsage,
}

impl StepExecution {
    pub fn new_pending(
        id: String,
        run_id: String,
        step_def_id: String,
        attempt: u32,
        input: Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            run_id,
            step_def_id,
            attempt,
            status: StepStatus::Pending,
            input,
            output: None,
            error: None,
            started_at: Some(now),
            completed_at: None,
            usage: BudgetUsage::default(),
        }
    }
}

/// Outcome reported by a worker for one step attempt, POSTed back to the
/// control plane (spec §4.7 step 4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutcome {
    pub step_execution_id: String,
    pub attempt: u32,
    pub status: StepStatus,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub usage: BudgetUsage,
}
