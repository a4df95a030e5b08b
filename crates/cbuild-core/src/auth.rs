//! Access tokens for the hosting platform.

use async_trait::async_trait;

use crate::Result;

/// Supplies API tokens, per installation when the platform has installations.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// A token for `installation_id`, or `None` for anonymous access.
    async fn token(&self, installation_id: Option<i64>) -> Result<Option<String>>;
}

/// The same token for every installation.
#[derive(Debug, Clone, Default)]
pub struct StaticToken(pub Option<String>);

#[async_trait]
impl TokenSource for StaticToken {
    async fn token(&self, _installation_id: Option<i64>) -> Result<Option<String>> {
        Ok(self.0.clone())
    }
}
