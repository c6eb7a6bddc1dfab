//! Workflow compiler: parse -> validate -> layered execution plan.
//!
//! Validation and the deterministic layering algorithm are grounded on
//! `TaskScheduler::validate`/`detect_cycle` (a flat, stateless, testable
//! pass over a task list), generalized to handle nested Loop/Parallel
//! StepDef trees, each validated and layered in its own id namespace.

use std::collections::{HashMap, HashSet};

use orc_types::{StepDef, StepKind, Workflow};

#[derive(Debug, Clone, thiserror::Error)]
pub enum CompileError {
    #[error("duplicate StepDef id(s): {ids:?}")]
    DuplicateStepId { ids: Vec<String> },
    #[error("StepDef '{step_id}' depends on unknown id '{dependency_id}'")]
    DanglingDependency {
        step_id: String,
        dependency_id: String,
    },
    #[error("cycle detected among StepDef ids: {ids:?}")]
    Cycle { ids: Vec<String> },
    #[error("workflow has no steps")]
    EmptyWorkflow,
    #[error("no step has empty depends_on; the workflow has no entry point")]
    NoEntryPoint,
}

/// A layer is a maximal set of step ids with no intra-set dependency,
/// in deterministic ascending-id order.
pub type Layer = Vec<String>;

/// The layered execution plan for one workflow or one nested block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionPlan {
    pub layers: Vec<Layer>,
    /// Nested plans for Loop/Parallel StepDefs, keyed by their id.
    pub nested: HashMap<String, ExecutionPlan>,
}

impl ExecutionPlan {
    /// Every StepDef id appearing anywhere in this plan (flatten preserves
    /// the full id set, matching the round-trip law in spec §8).
    pub fn all_ids(&self) -> HashSet<String> {
        let mut out: HashSet<String> = self.layers.iter().flatten().cloned().collect();
        for nested in self.nested.values() {
            out.extend(nested.all_ids());
        }
        out
    }
}

/// Validate a workflow against the compiler's five rules (spec §4.4).
pub fn validate(workflow: &Workflow) -> Result<(), CompileError> {
    validate_steps(&workflow.steps)
}

fn validate_steps(steps: &[StepDef]) -> Result<(), CompileError> {
    if steps.is_empty() {
        return Err(CompileError::EmptyWorkflow);
    }

    let ids: Vec<&str> = steps.iter().map(|s| s.id.as_str()).collect();
    let id_set: HashSet<&str> = ids.iter().copied().collect();
    if id_set.len() != ids.len() {
        let mut seen = HashSet::new();
        let mut dupes = Vec::new();
        for id in &ids {
            if !seen.insert(*id) {
                dupes.push(id.to_string());
            }
        }
        return Err(CompileError::DuplicateStepId { ids: dupes });
    }

    for step in steps {
        for dep in &step.depends_on {
            if !id_set.contains(dep.as_str()) {
                return Err(CompileError::DanglingDependency {
                    step_id: step.id.clone(),
                    dependency_id: dep.clone(),
                });
            }
        }
    }

    if !steps.iter().any(|s| s.depends_on.is_empty()) {
        return Err(CompileError::NoEntryPoint);
    }

    kahn_layers(steps).map(|_| ())?;

    for step in steps {
        if matches!(step.kind, StepKind::Loop | StepKind::Parallel) && !step.steps.is_empty() {
            validate_steps(&step.steps)?;
        }
    }

    Ok(())
}

/// Kahn's algorithm: repeatedly remove steps whose dependencies are all
/// already placed. If the remaining set cannot be emptied, there is a cycle
/// (spec §4.4 rule 3: "detected by inability to empty the remaining set").
fn kahn_layers(steps: &[StepDef]) -> Result<Vec<Layer>, CompileError> {
    let by_id: HashMap<&str, &StepDef> = steps.iter().map(|s| (s.id.as_str(), s)).collect();
    let mut remaining: HashSet<&str> = by_id.keys().copied().collect();
    let mut placed: HashSet<&str> = HashSet::new();
    let mut layers = Vec::new();

    while !remaining.is_empty() {
        let mut ready: Vec<&str> = remaining
            .iter()
            .copied()
            .filter(|id| {
                by_id[id]
                    .depends_on
                    .iter()
                    .all(|dep| placed.contains(dep.as_str()))
            })
            .collect();

        if ready.is_empty() {
            let mut ids: Vec<String> = remaining.iter().map(|s| s.to_string()).collect();
            ids.sort();
            return Err(CompileError::Cycle { ids });
        }

        ready.sort_unstable();
        for id in &ready {
            remaining.remove(id);
            placed.insert(id);
        }
        layers.push(ready.into_iter().map(String::from).collect());
    }

    Ok(layers)
}

/// Compile a validated workflow into its layered execution plan.
pub fn compile(workflow: &Workflow) -> Result<ExecutionPlan, CompileError> {
    validate(workflow)?;
    compile_steps(&workflow.steps)
}

fn compile_steps(steps: &[StepDef]) -> Result<ExecutionPlan, CompileError> {
    let layers = kahn_layers(steps)?;
    let mut nested = HashMap::new();
    for step in steps {
        if matches!(step.kind, StepKind::Loop | StepKind::Parallel) && !step.steps.is_empty() {
            nested.insert(step.id.clone(), compile_steps(&step.steps)?);
        }
    }
    Ok(ExecutionPlan { layers, nested })
}
