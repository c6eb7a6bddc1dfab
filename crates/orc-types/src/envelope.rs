use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Trace propagation context carried alongside every step envelope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceContext {
    #[serde(default)]
    pub trace_id: Option<String>,
    #[serde(default)]
    pub span_id: Option<String>,
    #[serde(flatten)]
    pub baggage: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeContext {
    pub tenant_id: String,
    pub agent_id: String,
    #[serde(default)]
    pub trace_context: TraceContext,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDispatchPayload {
    pub run_id: String,
    pub step_id: String,
    pub step_type: String,
    pub attempt: u32,
    pub input: Value,
    pub context: EnvelopeContext,
    /// The StepDef's `timeout_ms`, carried along so the worker can bound
    /// the LLM/tool call itself (spec §4.7/§5: "on timeout the worker
    /// aborts I/O, returns Failed(timeout), and ACKs").
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    30_000
}

/// Wire-compatible JSON envelope published to the stream queue (spec §4.3, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    pub payload: StepDispatchPayload,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips_through_json() {
        let env = Envelope {
            id: "01ARZ3NDEKTSV4RRFFQ69G5FAV".to_string(),
            payload: StepDispatchPayload {
                run_id: "run_x".to_string(),
                step_id: "stp_x".to_string(),
                step_type: "llm".to_string(),
                attempt: 1,
                input: serde_json::json!({"k": "v"}),
                context: EnvelopeContext {
                    tenant_id: "ten_x".to_string(),
                    agent_id: "agt_x".to_string(),
                    trace_context: TraceContext::default(),
                },
                timeout_ms: 30_000,
            },
        };
        let raw = serde_json::to_string(&env).unwrap();
        let back: Envelope = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.payload.run_id, "run_x");
    }
}
