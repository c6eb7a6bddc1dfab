//! Policy & budget engine.
//!
//! `decide()` is grounded in the shape of `tool_policy::
//! python_policy_violation`'s narrow check (inspect args before a
//! terminal-tool dispatch), generalized to a three-set
//! allow/approval/deny policy. Budget tracking is grounded in
//! `orchestrator::types::Budget`/`is_exceeded`. The pluggable risk
//! oracle is modeled on `original_source/fd-runtime/airlock.py`'s
//! `AirlockResponse`.

use async_trait::async_trait;
use orc_types::{AirlockVerdict, Budget, BudgetDimension, BudgetUsage, Policy, PolicyDecision};
use serde_json::Value;

#[derive(Debug, Clone, thiserror::Error)]
pub enum PolicyError {
    #[error("tool '{tool_name}' denied by policy: {reason}")]
    Denied { tool_name: String, reason: String },
    #[error("tool '{tool_name}' requires approval")]
    ApprovalRequired { tool_name: String },
    #[error("budget exceeded in dimension {dimension:?}")]
    BudgetExceeded { dimension: BudgetDimension },
    #[error("airlock inspector unavailable: {0}")]
    InspectorUnavailable(String),
}

impl PolicyError {
    pub fn kind(&self) -> orc_types::ErrorKind {
        use orc_types::ErrorKind;
        match self {
            PolicyError::Denied { .. } => ErrorKind::PolicyDenied,
            PolicyError::ApprovalRequired { .. } => ErrorKind::ApprovalRequired,
            PolicyError::BudgetExceeded { .. } => ErrorKind::BudgetExceeded,
            PolicyError::InspectorUnavailable(_) => ErrorKind::Transient,
        }
    }
}

/// Mode the external Airlock-style inspector operates in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InspectorMode {
    Enforce,
    Shadow,
}

/// Pluggable external risk oracle consulted by the policy engine.
/// The real implementation lives outside the core (spec §1); this core only
/// depends on the contract.
#[async_trait]
pub trait AirlockInspector: Send + Sync {
    async fn inspect(&self, tool_name: &str, args: &Value) -> anyhow::Result<AirlockVerdict>;
}

/// Tool-call policy decision, folding in the Airlock verdict when present.
pub struct PolicyEngine {
    policy: Policy,
    inspector: Option<(std::sync::Arc<dyn AirlockInspector>, InspectorMode)>,
}

/// The decision returned to a caller, plus the audit detail payload it must
/// be recorded with (spec §4.5: "All decisions are written to the audit log
/// before the caller observes them" -- the caller is responsible for
/// committing this via the store's outbox-pattern audit append).
pub struct ToolDecision {
    pub decision: PolicyDecision,
    pub audit_details: Value,
}

impl PolicyEngine {
    pub fn new(policy: Policy) -> Self {
        Self {
            policy,
            inspector: None,
        }
    }

    pub fn with_inspector(
        mut self,
        inspector: std::sync::Arc<dyn AirlockInspector>,
        mode: InspectorMode,
    ) -> Self {
        self.inspector = Some((inspector, mode));
        self
    }

    /// `decide(tool_name, policy) -> Allow | Approval | Deny`, consulting the
    /// inspector if configured (spec §4.5 "Risk integration").
    pub async fn decide(&self, tool_name: &str, args: &Value) -> ToolDecision {
        let base = self.policy.decide(tool_name);

        let Some((inspector, mode)) = &self.inspector else {
            return ToolDecision {
                decision: base,
                audit_details: serde_json::json!({ "tool_name": tool_name, "source": "policy" }),
            };
        };

        match inspector.inspect(tool_name, args).await {
            Ok(verdict) => {
                let effective = if !verdict.allowed && *mode == InspectorMode::Enforce {
                    PolicyDecision::Deny
                } else if verdict.requires_approval && base == PolicyDecision::Allow {
                    PolicyDecision::Approval
                } else {
                    base
                };
                ToolDecision {
                    decision: effective,
                    audit_details: serde_json::json!({
                        "tool_name": tool_name,
                        "source": "airlock",
                        "shadow_mode": *mode == InspectorMode::Shadow,
                        "risk_score": verdict.risk_score,
                        "violation_type": verdict.violation_type,
                    }),
                }
            }
            Err(_) => ToolDecision {
                decision: base,
                audit_details: serde_json::json!({
                    "tool_name": tool_name,
                    "source": "policy",
                    "inspector_error": true,
                }),
            },
        }
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }
}

/// Running budget state for one run, serialized under the run lease by the
/// scheduler (spec §4.5 "Budget check").
#[derive(Debug, Clone, Default)]
pub struct BudgetTracker {
    pub budget: Budget,
    pub usage: BudgetUsage,
}

impl BudgetTracker {
    pub fn from_budget(budget: Budget) -> Self {
        Self {
            budget,
            usage: BudgetUsage::default(),
        }
    }

    /// `precheck(run, cost_estimate) -> Ok | Exceeded(dim)`.
    pub fn precheck(&self, estimate: &BudgetUsage) -> Result<(), BudgetDimension> {
        self.budget.precheck(&self.usage, estimate)
    }

    /// Post-step accounting: commit actual usage. Returns the breached
    /// dimension, if any, after the commit (spec §4.5 "Post-step accounting").
    pub fn commit(&mut self, actual: &BudgetUsage) -> Option<BudgetDimension> {
        self.usage.input_tokens += actual.input_tokens;
        self.usage.output_tokens += actual.output_tokens;
        self.usage.tool_calls += actual.tool_calls;
        self.usage.wall_time_ms += actual.wall_time_ms;
        self.usage.cost_cents += actual.cost_cents;
        self.budget.is_exceeded(&self.usage)
    }
}
