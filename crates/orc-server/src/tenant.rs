//! Bearer-token-to-tenant resolution (spec §4.9: tenant identity storage is
//! explicitly external to the core, so this is a pluggable trait rather
//! than a hardcoded table).
//!
//! Grounded on `RuntimeState::auth: Arc<RwLock<HashMap<String, String>>>`'s
//! token table, generalized into a trait so a real deployment can swap in
//! its own identity provider without touching the router.

use std::collections::HashMap;

use async_trait::async_trait;

#[derive(Debug, Clone)]
pub struct TenantId(pub String);

#[async_trait]
pub trait TenantResolver: Send + Sync {
    /// Resolve a raw bearer token to a tenant id, or `None` if unrecognized.
    async fn resolve(&self, bearer_token: &str) -> Option<String>;
}

/// Fixed token -> tenant_id table, the in-process default.
pub struct StaticTenantResolver {
    tokens: HashMap<String, String>,
}

impl StaticTenantResolver {
    pub fn new(tokens: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            tokens: tokens.into_iter().collect(),
        }
    }
}

#[async_trait]
impl TenantResolver for StaticTenantResolver {
    async fn resolve(&self, bearer_token: &str) -> Option<String> {
        self.tokens.get(bearer_token).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn known_token_resolves_to_its_tenant() {
        let resolver = StaticTenantResolver::new([("tok_a".to_string(), "ten_1".to_string())]);
        assert_eq!(resolver.resolve("tok_a").await, Some("ten_1".to_string()));
    }

    #[tokio::test]
    async fn unknown_token_resolves_to_none() {
        let resolver = StaticTenantResolver::new([]);
        assert_eq!(resolver.resolve("tok_x").await, None);
    }
}
