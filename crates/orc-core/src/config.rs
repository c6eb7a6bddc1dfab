//! Environment-driven configuration (ambient layer, spec §4.10).
//!
//! Grounded on `ConfigStore`'s env-overlaying-defaults idiom,
//! trimmed to this domain's keys -- there is no project/global/managed
//! layering or secret-scrubbing here, just env vars over documented
//! defaults, read once at process startup.

use std::time::Duration;

/// Process-wide configuration for both the `serve` and `worker`
/// subcommands, populated from the env keys named in spec §6.
#[derive(Debug, Clone)]
pub struct ControlPlaneConfig {
    pub control_plane_url: String,
    pub redis_url: Option<String>,
    pub database_url: String,
    pub otel_exporter_otlp_endpoint: Option<String>,
    pub worker_max_retries: u32,
    pub worker_retry_delay_ms: u64,
    pub fd_test_timeout: Duration,
    pub fd_workspace_dir: String,
    /// The boundary's own recognised keys cover the API side; the worker
    /// also needs somewhere to dispatch LLM/tool calls, so these four keys
    /// extend the table rather than hardcoding endpoints.
    pub llm_provider_url: String,
    pub llm_provider_api_key: Option<String>,
    pub mcp_endpoint: String,
    pub worker_concurrency: usize,
}

impl ControlPlaneConfig {
    /// Reads every key from the environment, falling back to the
    /// documented default when unset or empty.
    pub fn from_env() -> Self {
        Self {
            control_plane_url: env_or("CONTROL_PLANE_URL", "http://127.0.0.1:8080"),
            redis_url: env_opt("REDIS_URL"),
            database_url: env_or("DATABASE_URL", "orc.sqlite3"),
            otel_exporter_otlp_endpoint: env_opt("OTEL_EXPORTER_OTLP_ENDPOINT"),
            worker_max_retries: env_parsed("WORKER_MAX_RETRIES", 3),
            worker_retry_delay_ms: env_parsed("WORKER_RETRY_DELAY_MS", 1_000),
            fd_test_timeout: Duration::from_secs(env_parsed("FD_TEST_TIMEOUT", 300)),
            fd_workspace_dir: env_or("FD_WORKSPACE_DIR", ".orc-workspace"),
            llm_provider_url: env_or("LLM_PROVIDER_URL", "http://127.0.0.1:11434"),
            llm_provider_api_key: env_opt("LLM_PROVIDER_API_KEY"),
            mcp_endpoint: env_or("MCP_ENDPOINT", "https://mcp.exa.ai/mcp"),
            worker_concurrency: env_parsed("WORKER_CONCURRENCY", 4),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_env_unset() {
        std::env::remove_var("WORKER_MAX_RETRIES");
        std::env::remove_var("CONTROL_PLANE_URL");
        let cfg = ControlPlaneConfig::from_env();
        assert_eq!(cfg.worker_max_retries, 3);
        assert_eq!(cfg.control_plane_url, "http://127.0.0.1:8080");
    }

    #[test]
    fn env_override_wins() {
        std::env::set_var("WORKER_RETRY_DELAY_MS", "2500");
        let cfg = ControlPlaneConfig::from_env();
        assert_eq!(cfg.worker_retry_delay_ms, 2_500);
        std::env::remove_var("WORKER_RETRY_DELAY_MS");
    }
}
