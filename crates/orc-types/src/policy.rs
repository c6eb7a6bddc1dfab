use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Three disjoint tool-name sets. Any name absent from all three is
/// implicitly denied.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Policy {
    pub id: String,
    pub tenant_id: String,
    pub allowed: HashSet<String>,
    pub approval_required: HashSet<String>,
    pub denied: HashSet<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyDecision {
    Allow,
    Approval,
    Deny,
}

impl Policy {
    /// `decide(tool_name, policy)`. Ordering is fixed: denied wins ties,
    /// then approval_required, then allowed; absent names deny by default.
    pub fn decide(&self, tool_name: &str) -> PolicyDecision {
        if self.denied.contains(tool_name) {
            PolicyDecision::Deny
        } else if self.approval_required.contains(tool_name) {
            PolicyDecision::Approval
        } else if self.allowed.contains(tool_name) {
            PolicyDecision::Allow
        } else {
            PolicyDecision::Deny
        }
    }
}

/// Risk level returned by the pluggable Airlock-style inspector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

/// Security violation categories the inspector may report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationType {
    RcePattern,
    VelocityBreach,
    LoopDetection,
    ExfiltrationAttempt,
    IpAddressUsed,
}

/// Response from the external Airlock inspector consulted by the policy
/// engine as a pluggable decision oracle (spec §4.5 "Risk integration").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AirlockVerdict {
    pub allowed: bool,
    pub requires_approval: bool,
    pub decision_id: String,
    pub reason: String,
    #[serde(default)]
    pub risk_score: u8,
    #[serde(default = "default_risk_level")]
    pub risk_level: RiskLevel,
    #[serde(default)]
    pub violation_type: Option<ViolationType>,
    #[serde(default)]
    pub shadow_mode: bool,
}

fn default_risk_level() -> RiskLevel {
    RiskLevel::Low
}

impl AirlockVerdict {
    pub fn is_high_risk(&self) -> bool {
        matches!(self.risk_level, RiskLevel::High | RiskLevel::Critical)
    }
}
