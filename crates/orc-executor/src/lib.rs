//! Step executor worker (spec §4.7).
//!
//! Polls one consumer group of the durable step queue, dispatches each
//! envelope to an LLM provider or an external tool, sanitizes input/output,
//! stores the output as a content-addressed artifact, and POSTs the result
//! back through a [`ResultSink`] before acking the delivery -- the envelope
//! is only acked *after* the result POST succeeds (spec §4.7 step 5), so a
//! worker crash between dispatch and ack simply redelivers the envelope.
//!
//! This worker has no policy state of its own; it resolves a per-tenant
//! [`orc_policy::PolicyEngine`] through [`PolicyResolver`] and consults it
//! before every tool call, matching the deny-by-default gate the control
//! plane applies on the scheduler side (spec §4.5).

pub mod artifact;
pub mod error;
pub mod llm;
pub mod sanitize;
pub mod tool;

use async_trait::async_trait;
use orc_policy::PolicyEngine;
use orc_queue::{Delivery, Queue};
use orc_types::{PolicyDecision, StepOutcome, StepStatus};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

pub use artifact::{content_hash, input_hash, ArtifactStore, FilesystemArtifactStore};
pub use error::ExecutorError;
pub use llm::{dispatch_with_retry, HttpLlmProvider, LlmProvider, LlmRequest, LlmResponse};
pub use sanitize::{sanitize_input_value, InputSanitizeMode, InputSanitizer, OutputValidator};
pub use tool::{McpToolInvoker, ToolInvoker};

const MAX_INPUT_NESTING_DEPTH: usize = 20;

/// Resolves the policy engine governing one tenant's tool calls. Kept
/// pluggable so the worker doesn't need a direct line to the control
/// plane's policy store; a real deployment backs this with an HTTP or
/// shared-store lookup.
#[async_trait]
pub trait PolicyResolver: Send + Sync {
    async fn resolve(&self, tenant_id: &str) -> Result<Arc<PolicyEngine>, ExecutorError>;
}

/// Reports a step's outcome back to the control plane. The worker treats a
/// successful call as the durability boundary: only after this returns `Ok`
/// is the queue delivery acked.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn post_result(
        &self,
        run_id: &str,
        step_id: &str,
        outcome: StepOutcome,
    ) -> Result<(), ExecutorError>;
}

pub struct StepWorker {
    queue: Arc<dyn Queue>,
    consumer_group: String,
    llm: Arc<dyn LlmProvider>,
    tools: Arc<dyn ToolInvoker>,
    policy: Arc<dyn PolicyResolver>,
    artifacts: Arc<dyn ArtifactStore>,
    sink: Arc<dyn ResultSink>,
    output_validator: OutputValidator,
    input_sanitizer: InputSanitizer,
    visibility_timeout_ms: u64,
    max_retries: u32,
    retry_delay: Duration,
}

impl StepWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<dyn Queue>,
        consumer_group: impl Into<String>,
        llm: Arc<dyn LlmProvider>,
        tools: Arc<dyn ToolInvoker>,
        policy: Arc<dyn PolicyResolver>,
        artifacts: Arc<dyn ArtifactStore>,
        sink: Arc<dyn ResultSink>,
        max_retries: u32,
        retry_delay: Duration,
    ) -> Self {
        Self {
            queue,
            consumer_group: consumer_group.into(),
            llm,
            tools,
            policy,
            artifacts,
            sink,
            output_validator: OutputValidator::default(),
            input_sanitizer: InputSanitizer::new(InputSanitizeMode::Block, 2),
            visibility_timeout_ms: 60_000,
            max_retries,
            retry_delay,
        }
    }

    /// Polls once, processes every delivery returned, and returns the
    /// number processed. Callers loop this with their own pacing/shutdown
    /// signal.
    pub async fn run_once(&self, max: usize) -> Result<usize, ExecutorError> {
        let deliveries = self
            .queue
            .poll(&self.consumer_group, max, self.visibility_timeout_ms)
            .await
            .map_err(|e| ExecutorError::Transient(e.to_string()))?;

        let count = deliveries.len();
        for delivery in deliveries {
            self.process_delivery(delivery).await?;
        }
        Ok(count)
    }

    async fn process_delivery(&self, delivery: Delivery) -> Result<(), ExecutorError> {
        let payload = delivery.envelope.payload.clone();
        let span = tracing::info_span!(
            "step_dispatch",
            run_id = %payload.run_id,
            step_id = %payload.step_id,
            attempt = payload.attempt,
        );
        use tracing::Instrument;
        self.process_delivery_inner(delivery, payload)
            .instrument(span)
            .await
    }

    async fn process_delivery_inner(
        &self,
        delivery: Delivery,
        payload: orc_types::StepDispatchPayload,
    ) -> Result<(), ExecutorError> {
        let outcome = match self.execute(&payload).await {
            Ok(result) => result,
            Err(err) => self.outcome_for_error(&payload, &err),
        };

        self.sink
            .post_result(&payload.run_id, &payload.step_id, outcome)
            .await?;

        self.queue
            .ack(&self.consumer_group, &delivery.delivery_id)
            .await
            .map_err(|e| ExecutorError::Transient(e.to_string()))?;
        Ok(())
    }

    async fn execute(
        &self,
        payload: &orc_types::StepDispatchPayload,
    ) -> Result<StepOutcome, ExecutorError> {
        let sanitized_input = sanitize_input_value(
            &self.input_sanitizer,
            &payload.input,
            0,
            MAX_INPUT_NESTING_DEPTH,
        )?;

        let dispatch = async {
            match payload.step_type.as_str() {
                "llm" => self.execute_llm(&sanitized_input).await,
                "tool" => {
                    self.execute_tool(&payload.context.tenant_id, &sanitized_input)
                        .await
                }
                "approval" => self.execute_approval(payload, &sanitized_input).await,
                other => Err(ExecutorError::Validation(format!(
                    "unknown step_type '{other}'"
                ))),
            }
        };
        let raw_output = tokio::time::timeout(Duration::from_millis(payload.timeout_ms), dispatch)
            .await
            .map_err(|_| ExecutorError::Timeout(payload.timeout_ms))??;

        let sanitized_output = self.output_validator.sanitize_structured_output(&raw_output)?;
        let bytes = serde_json::to_vec(&sanitized_output)
            .map_err(|e| ExecutorError::Validation(e.to_string()))?;
        let hash = self.artifacts.put(&bytes).await?;

        Ok(StepOutcome {
            step_execution_id: payload.step_id.clone(),
            attempt: payload.attempt,
            status: StepStatus::Completed,
            output: Some(serde_json::json!({ "artifact_hash": hash })),
            error: None,
            usage: Default::default(),
        })
    }

    async fn execute_llm(&self, input: &Value) -> Result<Value, ExecutorError> {
        let model = input
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or("default")
            .to_string();
        let request = LlmRequest {
            model,
            prompt: input.clone(),
            parameters: input.get("parameters").cloned().unwrap_or(Value::Null),
        };
        let response =
            dispatch_with_retry(self.llm.as_ref(), &request, self.max_retries, self.retry_delay)
                .await?;
        Ok(response.output)
    }

    async fn execute_tool(&self, tenant_id: &str, input: &Value) -> Result<Value, ExecutorError> {
        let tool_name = input
            .get("tool_name")
            .and_then(Value::as_str)
            .ok_or_else(|| ExecutorError::Validation("tool step missing tool_name".into()))?;
        let tool_input = input.get("tool_input").cloned().unwrap_or(Value::Null);

        self.output_validator.validate_tool_name(tool_name)?;

        let policy = self.policy.resolve(tenant_id).await?;
        let decision = policy.decide(tool_name, &tool_input).await;
        match decision.decision {
            PolicyDecision::Deny => {
                return Err(ExecutorError::PolicyDenied {
                    tool_name: tool_name.to_string(),
                    reason: "denied by tenant policy".to_string(),
                })
            }
            PolicyDecision::Approval => {
                return Err(ExecutorError::ApprovalRequired {
                    tool_name: tool_name.to_string(),
                })
            }
            PolicyDecision::Allow => {}
        }

        self.tools.invoke(tool_name, &tool_input).await
    }

    /// A first-class Approval step (`_execute_approval_step`'s shape): the
    /// first dispatch always waits for a human decision, mirroring the Tool
    /// path's `PolicyDecision::Approval` handling; the re-dispatch after
    /// `RunScheduler::grant_approval` (attempt > 1) runs the approved tool
    /// call directly, since the approval gate has already been cleared.
    async fn execute_approval(
        &self,
        payload: &orc_types::StepDispatchPayload,
        input: &Value,
    ) -> Result<Value, ExecutorError> {
        let tool_name = input
            .get("tool_name")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();

        if payload.attempt <= 1 {
            return Err(ExecutorError::ApprovalRequired { tool_name });
        }

        if tool_name.is_empty() {
            return Ok(serde_json::json!({ "approved": true }));
        }
        let tool_input = input.get("tool_input").cloned().unwrap_or(Value::Null);
        self.output_validator.validate_tool_name(&tool_name)?;
        self.tools.invoke(&tool_name, &tool_input).await
    }

    fn outcome_for_error(
        &self,
        payload: &orc_types::StepDispatchPayload,
        err: &ExecutorError,
    ) -> StepOutcome {
        let status = match err {
            ExecutorError::ApprovalRequired { .. } => StepStatus::WaitingApproval,
            _ => StepStatus::Failed,
        };
        StepOutcome {
            step_execution_id: payload.step_id.clone(),
            attempt: payload.attempt,
            status,
            output: None,
            error: Some(err.to_string()),
            usage: Default::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orc_queue::jsonl::JsonlQueue;
    use orc_types::{EnvelopeContext, Policy, StepDispatchPayload, TraceContext};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex as AsyncMutex;

    struct EchoLlm;
    #[async_trait]
    impl LlmProvider for EchoLlm {
        async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, ExecutorError> {
            Ok(LlmResponse {
                output: serde_json::json!({ "reply": request.prompt.get("text") }),
                usage: Default::default(),
            })
        }
    }

    struct FlakyLlm {
        fail_times: u32,
        calls: AtomicUsize,
    }
    #[async_trait]
    impl LlmProvider for FlakyLlm {
        async fn complete(&self, _request: &LlmRequest) -> Result<LlmResponse, ExecutorError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) as u32;
            if n < self.fail_times {
                return Err(ExecutorError::Transient("rate limited".into()));
            }
            Ok(LlmResponse {
                output: serde_json::json!({ "ok": true }),
                usage: Default::default(),
            })
        }
    }

    struct SlowLlm;
    #[async_trait]
    impl LlmProvider for SlowLlm {
        async fn complete(&self, _request: &LlmRequest) -> Result<LlmResponse, ExecutorError> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(LlmResponse {
                output: serde_json::json!({ "ok": true }),
                usage: Default::default(),
            })
        }
    }

    struct NoopToolInvoker;
    #[async_trait]
    impl ToolInvoker for NoopToolInvoker {
        async fn invoke(&self, _tool_name: &str, _input: &Value) -> Result<Value, ExecutorError> {
            Ok(serde_json::json!({ "ok": true }))
        }
    }

    struct StaticPolicy(Policy);
    #[async_trait]
    impl PolicyResolver for StaticPolicy {
        async fn resolve(&self, _tenant_id: &str) -> Result<Arc<PolicyEngine>, ExecutorError> {
            Ok(Arc::new(PolicyEngine::new(self.0.clone())))
        }
    }

    struct RecordingSink {
        outcomes: AsyncMutex<Vec<StepOutcome>>,
    }
    impl RecordingSink {
        fn new() -> Self {
            Self {
                outcomes: AsyncMutex::new(Vec::new()),
            }
        }
    }
    #[async_trait]
    impl ResultSink for RecordingSink {
        async fn post_result(
            &self,
            _run_id: &str,
            _step_id: &str,
            outcome: StepOutcome,
        ) -> Result<(), ExecutorError> {
            self.outcomes.lock().await.push(outcome);
            Ok(())
        }
    }

    struct FailingSink(AtomicUsize);
    #[async_trait]
    impl ResultSink for FailingSink {
        async fn post_result(
            &self,
            _run_id: &str,
            _step_id: &str,
            _outcome: StepOutcome,
        ) -> Result<(), ExecutorError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(ExecutorError::Transient("control plane unreachable".into()))
        }
    }

    fn envelope_with_timeout(step_type: &str, input: Value, timeout_ms: u64) -> orc_types::Envelope {
        let mut env = envelope(step_type, input);
        env.payload.timeout_ms = timeout_ms;
        env
    }

    fn envelope_with_attempt(step_type: &str, input: Value, attempt: u32) -> orc_types::Envelope {
        let mut env = envelope(step_type, input);
        env.payload.attempt = attempt;
        env
    }

    fn envelope(step_type: &str, input: Value) -> orc_types::Envelope {
        orc_types::Envelope {
            id: "evt_1".into(),
            payload: StepDispatchPayload {
                run_id: "run_1".into(),
                step_id: "stp_1".into(),
                step_type: step_type.into(),
                attempt: 1,
                input,
                context: EnvelopeContext {
                    tenant_id: "ten_1".into(),
                    agent_id: "agt_1".into(),
                    trace_context: TraceContext::default(),
                },
                timeout_ms: 30_000,
            },
        }
    }

    async fn harness() -> (StepWorker, Arc<JsonlQueue>, Arc<RecordingSink>) {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(JsonlQueue::open(dir.path().join("q.jsonl")).await.unwrap());
        let sink = Arc::new(RecordingSink::new());
        let worker = StepWorker::new(
            queue.clone(),
            "workers".to_string(),
            Arc::new(EchoLlm),
            Arc::new(NoopToolInvoker),
            Arc::new(StaticPolicy(Policy {
                id: "pol_1".into(),
                tenant_id: "ten_1".into(),
                allowed: ["read_file".to_string()].into_iter().collect(),
                approval_required: Default::default(),
                denied: Default::default(),
            })),
            Arc::new(FilesystemArtifactStore::new(dir.path().join("artifacts"))),
            sink.clone(),
            3,
            Duration::from_millis(1),
        );
        (worker, queue, sink)
    }

    #[tokio::test]
    async fn llm_step_completes_and_acks() {
        let (worker, queue, sink) = harness().await;
        queue
            .publish(envelope("llm", serde_json::json!({"text": "hi"})))
            .await
            .unwrap();

        let processed = worker.run_once(10).await.unwrap();
        assert_eq!(processed, 1);
        assert_eq!(sink.outcomes.lock().await.len(), 1);
        assert_eq!(queue.pending_count("workers").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn allowed_tool_call_completes() {
        let (worker, queue, sink) = harness().await;
        queue
            .publish(envelope(
                "tool",
                serde_json::json!({"tool_name": "read_file", "tool_input": {"path": "a.txt"}}),
            ))
            .await
            .unwrap();

        worker.run_once(10).await.unwrap();
        let outcomes = sink.outcomes.lock().await;
        assert_eq!(outcomes[0].status, StepStatus::Completed);
    }

    #[tokio::test]
    async fn denied_tool_call_settles_failed_but_still_acks() {
        let (worker, queue, sink) = harness().await;
        queue
            .publish(envelope(
                "tool",
                serde_json::json!({"tool_name": "delete_everything", "tool_input": {}}),
            ))
            .await
            .unwrap();

        worker.run_once(10).await.unwrap();
        let outcomes = sink.outcomes.lock().await;
        assert_eq!(outcomes[0].status, StepStatus::Failed);
        assert_eq!(queue.pending_count("workers").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn approval_step_first_attempt_waits_for_approval() {
        let (worker, queue, sink) = harness().await;
        queue
            .publish(envelope(
                "approval",
                serde_json::json!({"tool_name": "delete_everything", "tool_input": {}}),
            ))
            .await
            .unwrap();

        worker.run_once(10).await.unwrap();
        let outcomes = sink.outcomes.lock().await;
        assert_eq!(outcomes[0].status, StepStatus::WaitingApproval);
        assert_eq!(queue.pending_count("workers").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn approval_step_second_attempt_runs_the_approved_tool() {
        let (worker, queue, sink) = harness().await;
        queue
            .publish(envelope_with_attempt(
                "approval",
                serde_json::json!({"tool_name": "read_file", "tool_input": {"path": "a.txt"}}),
                2,
            ))
            .await
            .unwrap();

        worker.run_once(10).await.unwrap();
        let outcomes = sink.outcomes.lock().await;
        assert_eq!(outcomes[0].status, StepStatus::Completed);
    }

    #[tokio::test]
    async fn sink_failure_leaves_delivery_pending_for_redelivery() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(JsonlQueue::open(dir.path().join("q.jsonl")).await.unwrap());
        let worker = StepWorker::new(
            queue.clone(),
            "workers".to_string(),
            Arc::new(EchoLlm),
            Arc::new(NoopToolInvoker),
            Arc::new(StaticPolicy(Policy {
                id: "pol_1".into(),
                tenant_id: "ten_1".into(),
                allowed: Default::default(),
                approval_required: Default::default(),
                denied: Default::default(),
            })),
            Arc::new(FilesystemArtifactStore::new(dir.path().join("artifacts"))),
            Arc::new(FailingSink(AtomicUsize::new(0))),
            3,
            Duration::from_millis(1),
        );
        queue
            .publish(envelope("llm", serde_json::json!({"text": "hi"})))
            .await
            .unwrap();

        let err = worker.run_once(10).await;
        assert!(err.is_err());
        assert_eq!(queue.pending_count("workers").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn llm_step_honors_configured_max_retries() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(JsonlQueue::open(dir.path().join("q.jsonl")).await.unwrap());
        let sink = Arc::new(RecordingSink::new());
        let worker = StepWorker::new(
            queue.clone(),
            "workers".to_string(),
            Arc::new(FlakyLlm {
                fail_times: 1,
                calls: AtomicUsize::new(0),
            }),
            Arc::new(NoopToolInvoker),
            Arc::new(StaticPolicy(Policy {
                id: "pol_1".into(),
                tenant_id: "ten_1".into(),
                allowed: Default::default(),
                approval_required: Default::default(),
                denied: Default::default(),
            })),
            Arc::new(FilesystemArtifactStore::new(dir.path().join("artifacts"))),
            sink.clone(),
            1,
            Duration::from_millis(1),
        );
        queue
            .publish(envelope("llm", serde_json::json!({"text": "hi"})))
            .await
            .unwrap();

        worker.run_once(10).await.unwrap();
        let outcomes = sink.outcomes.lock().await;
        assert_eq!(
            outcomes[0].status,
            StepStatus::Failed,
            "max_retries=1 should exhaust on the first transient failure"
        );
    }

    #[tokio::test]
    async fn step_exceeding_timeout_settles_failed_and_acks() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(JsonlQueue::open(dir.path().join("q.jsonl")).await.unwrap());
        let sink = Arc::new(RecordingSink::new());
        let worker = StepWorker::new(
            queue.clone(),
            "workers".to_string(),
            Arc::new(SlowLlm),
            Arc::new(NoopToolInvoker),
            Arc::new(StaticPolicy(Policy::default())),
            Arc::new(FilesystemArtifactStore::new(dir.path().join("artifacts"))),
            sink.clone(),
            3,
            Duration::from_millis(1),
        );
        queue
            .publish(envelope_with_timeout(
                "llm",
                serde_json::json!({"text": "hi"}),
                5,
            ))
            .await
            .unwrap();

        worker.run_once(10).await.unwrap();
        let outcomes = sink.outcomes.lock().await;
        assert_eq!(outcomes[0].status, StepStatus::Failed);
        assert!(outcomes[0].error.as_ref().unwrap().contains("timed out"));
        assert_eq!(queue.pending_count("workers").await.unwrap(), 0);
    }
}
