//! Pure run-kernel transition functions (spec §4.6 step-release algorithm).
//!
//! Grounded on `TaskScheduler` (`get_next_runnable`, `all_completed`,
//! `any_failed`, `has_deadlock`) — a stateless, testable pass over a task
//! list and its executions — generalized to a condition language and
//! Skip-on-false-condition semantics. Kept free of I/O so the six
//! end-to-end scenarios can be asserted against directly.

use std::collections::HashMap;

use orc_types::{OnError, RunStatus, StepDef, StepExecution, StepStatus};
use serde_json::Value;

use crate::condition::{self, ConditionError};

/// Per-StepDef decision after one pass of the release algorithm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Dependencies satisfied, condition true: create a Pending execution
    /// and publish it to the queue (subject to the caller's budget check).
    Dispatch(String),
    /// Dependencies satisfied, condition false: settle immediately as
    /// Skipped so dependents are not blocked forever.
    Skip(String),
}

#[derive(Debug, Default)]
pub struct ReleasePlan {
    pub outcomes: Vec<ReleaseOutcome>,
}

/// Build the condition-evaluation context: `$.input`, `$.<step_id>` per
/// completed step output, `$.variables` (spec §4.6.1).
pub fn build_context(input: &Value, executions: &[StepExecution], variables: &Value) -> Value {
    let mut steps = serde_json::Map::new();
    for exec in executions {
        if exec.status == StepStatus::Completed {
            if let Some(output) = &exec.output {
                steps.insert(exec.step_def_id.clone(), output.clone());
            }
        }
    }
    let mut context = Value::Object(steps);
    if let Value::Object(map) = &mut context {
        map.insert("input".to_string(), input.clone());
        map.insert("variables".to_string(), variables.clone());
    }
    context
}

fn latest_execution<'a>(
    executions: &'a [StepExecution],
    step_def_id: &str,
) -> Option<&'a StepExecution> {
    executions
        .iter()
        .filter(|e| e.step_def_id == step_def_id)
        .max_by_key(|e| e.attempt)
}

/// A StepDef's dependencies are satisfied once every dependency has a
/// Completed or Skipped execution (spec §4.6 step-release 2b).
fn deps_satisfied(step: &StepDef, latest_by_id: &HashMap<&str, &StepExecution>) -> bool {
    step.depends_on.iter().all(|dep| {
        latest_by_id
            .get(dep.as_str())
            .map(|e| matches!(e.status, StepStatus::Completed | StepStatus::Skipped))
            .unwrap_or(false)
    })
}

/// One pass of the step-release algorithm over top-level StepDefs. Nested
/// Loop/Parallel blocks run their own sub-plan once the owning step itself
/// is dispatched (spec §4.6.2) and are not considered here.
pub fn evaluate_releases(
    steps: &[StepDef],
    executions: &[StepExecution],
    context: &Value,
) -> Result<ReleasePlan, ConditionError> {
    let latest_by_id: HashMap<&str, &StepExecution> = steps
        .iter()
        .filter_map(|s| latest_execution(executions, &s.id).map(|e| (s.id.as_str(), e)))
        .collect();

    let mut plan = ReleasePlan::default();
    for step in steps {
        if latest_by_id.contains_key(step.id.as_str()) {
            continue; // already has an execution; retries are a separate path.
        }
        if !deps_satisfied(step, &latest_by_id) {
            continue;
        }
        if condition::evaluate(step.condition.as_deref(), context)? {
            plan.outcomes.push(ReleaseOutcome::Dispatch(step.id.clone()));
        } else {
            plan.outcomes.push(ReleaseOutcome::Skip(step.id.clone()));
        }
    }
    Ok(plan)
}

/// Whether the run is settled: no execution Pending/Running/WaitingApproval
/// and nothing newly releasable. Returns the terminal status to transition
/// to, or `None` if the run is still in flight (spec §4.6 step-release 4).
pub fn run_outcome(
    steps: &[StepDef],
    executions: &[StepExecution],
    on_error: OnError,
    nothing_releasable: bool,
) -> Option<RunStatus> {
    let in_flight = executions.iter().any(|e| {
        matches!(
            e.status,
            StepStatus::Pending | StepStatus::Running | StepStatus::WaitingApproval
        )
    });
    if in_flight || !nothing_releasable {
        return None;
    }

    let latest_by_id: HashMap<&str, &StepExecution> = steps
        .iter()
        .filter_map(|s| latest_execution(executions, &s.id).map(|e| (s.id.as_str(), e)))
        .collect();
    let any_failed = latest_by_id.values().any(|e| e.status == StepStatus::Failed);

    if any_failed && on_error == OnError::Fail {
        Some(RunStatus::Failed)
    } else {
        Some(RunStatus::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use orc_types::StepKind;
    use std::collections::HashSet;

    fn step(id: &str, deps: &[&str], condition: Option<&str>) -> StepDef {
        StepDef {
            id: id.to_string(),
            name: id.to_string(),
            kind: StepKind::Llm,
            config: Value::Null,
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
            condition: condition.map(str::to_string),
            timeout_ms: 30_000,
            retry_policy: None,
            steps: Vec::new(),
        }
    }

    fn completed(step_def_id: &str, output: Value) -> StepExecution {
        let mut exec = StepExecution::new_pending(
            format!("exec_{step_def_id}"),
            "run_1".into(),
            step_def_id.into(),
            1,
            Value::Null,
            Utc::now(),
        );
        exec.status = StepStatus::Completed;
        exec.output = Some(output);
        exec
    }

    #[test]
    fn scenario_linear_happy_path_releases_entry_point_first() {
        let steps = vec![step("A", &[], None), step("B", &["A"], None)];
        let plan = evaluate_releases(&steps, &[], &Value::Null).unwrap();
        assert_eq!(plan.outcomes, vec![ReleaseOutcome::Dispatch("A".into())]);
    }

    #[test]
    fn dependent_releases_only_after_dependency_completes() {
        let steps = vec![step("A", &[], None), step("B", &["A"], None)];
        let executions = vec![completed("A", serde_json::json!({"ok": true}))];
        let plan = evaluate_releases(&steps, &executions, &Value::Null).unwrap();
        assert_eq!(plan.outcomes, vec![ReleaseOutcome::Dispatch("B".into())]);
    }

    #[test]
    fn false_condition_settles_as_skip_not_a_block() {
        let steps = vec![
            step("A", &[], None),
            step("B", &["A"], Some("$.A.proceed == true")),
        ];
        let executions = vec![completed("A", serde_json::json!({"proceed": false}))];
        let context = build_context(&Value::Null, &executions, &Value::Null);
        let plan = evaluate_releases(&steps, &executions, &context).unwrap();
        assert_eq!(plan.outcomes, vec![ReleaseOutcome::Skip("B".into())]);
    }

    #[test]
    fn run_completes_when_all_settled_without_failures() {
        let steps = vec![step("A", &[], None)];
        let executions = vec![completed("A", serde_json::json!({}))];
        let outcome = run_outcome(&steps, &executions, OnError::Fail, true);
        assert_eq!(outcome, Some(RunStatus::Completed));
    }

    #[test]
    fn run_fails_when_on_error_fail_and_a_step_failed() {
        let steps = vec![step("A", &[], None)];
        let mut exec = completed("A", Value::Null);
        exec.status = StepStatus::Failed;
        let outcome = run_outcome(&steps, &[exec], OnError::Fail, true);
        assert_eq!(outcome, Some(RunStatus::Failed));
    }

    #[test]
    fn run_stays_in_flight_while_a_step_is_running() {
        let steps = vec![step("A", &[], None)];
        let mut exec = completed("A", Value::Null);
        exec.status = StepStatus::Running;
        let outcome = run_outcome(&steps, &[exec], OnError::Fail, true);
        assert_eq!(outcome, None);
    }

    #[test]
    fn scenario_parallel_fan_in_both_branches_releasable_together() {
        let steps = vec![
            step("start", &[], None),
            step("branch_a", &["start"], None),
            step("branch_b", &["start"], None),
            step("end", &["branch_a", "branch_b"], None),
        ];
        let executions = vec![completed("start", Value::Null)];
        let plan = evaluate_releases(&steps, &executions, &Value::Null).unwrap();
        let mut dispatched: Vec<String> = plan
            .outcomes
            .iter()
            .map(|o| match o {
                ReleaseOutcome::Dispatch(id) => id.clone(),
                ReleaseOutcome::Skip(id) => id.clone(),
            })
            .collect();
        dispatched.sort();
        assert_eq!(dispatched, vec!["branch_a".to_string(), "branch_b".to_string()]);
    }

    #[test]
    fn unused_depends_on_set_is_exhaustive() {
        // sanity check that HashSet deps compile against StepDef's shape
        let s = step("A", &["x", "y"], None);
        assert_eq!(s.depends_on, HashSet::from(["x".to_string(), "y".to_string()]));
    }
}
