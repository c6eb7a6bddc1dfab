use serde::{Deserialize, Serialize};

/// Enforceable upper bounds on resource consumption for one run.
/// Every field is nullable; `None` means unlimited.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Budget {
    pub max_input_tokens: Option<u64>,
    pub max_output_tokens: Option<u64>,
    pub max_total_tokens: Option<u64>,
    pub max_tool_calls: Option<u64>,
    pub max_wall_time_ms: Option<u64>,
    pub max_cost_cents: Option<u64>,
}

/// Running totals against a `Budget`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct BudgetUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub tool_calls: u64,
    pub wall_time_ms: u64,
    pub cost_cents: u64,
}

impl BudgetUsage {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Which budget dimension was breached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BudgetDimension {
    InputTokens,
    OutputTokens,
    TotalTokens,
    ToolCalls,
    WallTimeMs,
    CostCents,
}

impl Budget {
    /// `precheck`: compare usage + estimate against each limit, first-breach wins.
    pub fn precheck(
        &self,
        usage: &BudgetUsage,
        estimate: &BudgetUsage,
    ) -> Result<(), BudgetDimension> {
        macro_rules! check {
            ($limit:expr, $have:expr, $add:expr, $dim:expr) => {
                if let Some(limit) = $limit {
                    if $have + $add > limit {
                        return Err($dim);
                    }
                }
            };
        }
        check!(
            self.max_input_tokens,
            usage.input_tokens,
            estimate.input_tokens,
            BudgetDimension::InputTokens
        );
        check!(
            self.max_output_tokens,
            usage.output_tokens,
            estimate.output_tokens,
            BudgetDimension::OutputTokens
        );
        check!(
            self.max_total_tokens,
            usage.total_tokens(),
            estimate.total_tokens(),
            BudgetDimension::TotalTokens
        );
        check!(
            self.max_tool_calls,
            usage.tool_calls,
            estimate.tool_calls,
            BudgetDimension::ToolCalls
        );
        check!(
            self.max_wall_time_ms,
            usage.wall_time_ms,
            estimate.wall_time_ms,
            BudgetDimension::WallTimeMs
        );
        check!(
            self.max_cost_cents,
            usage.cost_cents,
            estimate.cost_cents,
            BudgetDimension::CostCents
        );
        Ok(())
    }

    /// Post-step accounting: usage already reflects committed amounts; just
    /// re-check the invariant `usage <= budget`.
    pub fn is_exceeded(&self, usage: &BudgetUsage) -> Option<BudgetDimension> {
        self.precheck(usage, &BudgetUsage::default()).err()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precheck_passes_when_unlimited() {
        let budget = Budget::default();
        let usage = BudgetUsage {
            input_tokens: 1_000_000,
            ..Default::default()
        };
        assert!(budget.precheck(&usage, &BudgetUsage::default()).is_ok());
    }

    #[test]
    fn precheck_fails_on_first_breached_dimension() {
        let budget = Budget {
            max_total_tokens: Some(100),
            ..Default::default()
        };
        let usage = BudgetUsage {
            input_tokens: 80,
            output_tokens: 40,
            ..Default::default()
        };
        assert_eq!(
            budget.precheck(&usage, &BudgetUsage::default()),
            Err(BudgetDimension::TotalTokens)
        );
    }

    #[test]
    fn scenario_budget_kill_120_over_100() {
        let budget = Budget {
            max_total_tokens: Some(100),
            ..Default::default()
        };
        let usage = BudgetUsage {
            input_tokens: 80,
            output_tokens: 40,
            ..Default::default()
        };
        assert_eq!(usage.total_tokens(), 120);
        assert_eq!(budget.is_exceeded(&usage), Some(BudgetDimension::TotalTokens));
    }
}
