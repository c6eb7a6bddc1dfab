use orc_types::ErrorKind;

/// Flattens the original multi-inheritance worker exception hierarchy
/// (`StepExecutionError`/`PolicyDeniedError`/`ApprovalRequiredError`/
/// `BudgetExceededError`/`TransientError`/`LLMError`+`LLMRateLimitError`/
/// `MCPError` family/`ValidationError`) into one enum classified by
/// `kind()`.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("policy denied tool '{tool_name}': {reason}")]
    PolicyDenied { tool_name: String, reason: String },
    #[error("tool '{tool_name}' requires approval")]
    ApprovalRequired { tool_name: String },
    #[error("transient error: {0}")]
    Transient(String),
    #[error("step timed out after {0}ms")]
    Timeout(u64),
    #[error("llm provider error: {0}")]
    Llm(String),
    #[error("mcp tool error: {0}")]
    Mcp(String),
    #[error("malformed envelope: {0}")]
    Validation(String),
    #[error("output rejected: {0}")]
    OutputRisk(String),
    #[error("input rejected: {0}")]
    InputRisk(String),
    #[error("artifact store error: {0}")]
    Artifact(String),
    #[error("fatal worker error: {0}")]
    Fatal(String),
}

impl ExecutorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExecutorError::PolicyDenied { .. } => ErrorKind::PolicyDenied,
            ExecutorError::ApprovalRequired { .. } => ErrorKind::ApprovalRequired,
            ExecutorError::Transient(_) => ErrorKind::Transient,
            ExecutorError::Timeout(_) => ErrorKind::Transient,
            ExecutorError::Llm(_) => ErrorKind::Fatal,
            ExecutorError::Mcp(_) => ErrorKind::Fatal,
            ExecutorError::Validation(_) => ErrorKind::Validation,
            ExecutorError::OutputRisk(_) => ErrorKind::Validation,
            ExecutorError::InputRisk(_) => ErrorKind::Validation,
            ExecutorError::Artifact(_) => ErrorKind::Fatal,
            ExecutorError::Fatal(_) => ErrorKind::Fatal,
        }
    }

    /// Whether a failed LLM/tool call should be retried under the step's
    /// retry policy (spec §4.7 step 2: "bounded by max_retries over
    /// *transient* errors (timeout, rate-limit, connection reset)").
    pub fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient)
    }
}
