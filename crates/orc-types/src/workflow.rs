use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

/// A declarative workflow template: a DAG of `StepDef`s.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    pub steps: Vec<StepDef>,
    #[serde(default)]
    pub max_iterations: Option<u32>,
    #[serde(default)]
    pub on_error: OnError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    #[default]
    Fail,
    Continue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Llm,
    Tool,
    Approval,
    Loop,
    Parallel,
    Condition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub backoff_multiplier: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDef {
    pub id: String,
    pub name: String,
    pub kind: StepKind,
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub depends_on: HashSet<String>,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
    /// Nested plan for `Loop`/`Parallel` kinds. Ids are namespaced to this
    /// nested block only (spec §4.4 rule 5).
    #[serde(default)]
    pub steps: Vec<StepDef>,
}

fn default_timeout_ms() -> u64 {
    30_000
}

impl Workflow {
    /// Every top-level StepDef id, not descending into nested blocks
    /// (nested ids live in their own namespace per the compiler's rule 5).
    pub fn top_level_ids(&self) -> HashSet<&str> {
        self.steps.iter().map(|s| s.id.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn on_error_defaults_to_fail() {
        let json = serde_json::json!({
            "id": "wfr_x", "tenant_id": "ten_x", "name": "n", "version": "1.0.0",
            "steps": []
        });
        let wf: Workflow = serde_json::from_value(json).unwrap();
        assert_eq!(wf.on_error, OnError::Fail);
    }
}
