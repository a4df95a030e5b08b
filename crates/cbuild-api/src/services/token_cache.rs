//! Installation access tokens, cached until shortly before they expire.

use async_trait::async_trait;
use cbuild_core::auth::TokenSource;
use cbuild_core::clock::Clock;
use cbuild_core::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Tokens this close to expiry are treated as expired.
const EXPIRY_MARGIN_MINUTES: i64 = 5;

#[derive(Debug, Clone, Deserialize)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl IssuedToken {
    fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.expires_at - Duration::minutes(EXPIRY_MARGIN_MINUTES) > now
    }
}

/// Issues access tokens for an installation.
#[async_trait]
pub trait TokenIssuer: Send + Sync {
    async fn issue(&self, installation_id: i64) -> Result<IssuedToken>;
}

/// Exchanges an app token for installation tokens through the GitHub API.
pub struct InstallationTokenIssuer {
    client: reqwest::Client,
    api_url: String,
    app_token: String,
}

impl InstallationTokenIssuer {
    pub fn new(api_url: impl Into<String>, app_token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
            app_token: app_token.into(),
        }
    }
}

#[async_trait]
impl TokenIssuer for InstallationTokenIssuer {
    async fn issue(&self, installation_id: i64) -> Result<IssuedToken> {
        let url = format!(
            "{}/app/installations/{}/access_tokens",
            self.api_url, installation_id
        );
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.app_token)
            .header("User-Agent", "cbuild")
            .header("Accept", "application/vnd.github+json")
            .send()
            .await
            .map_err(|e| Error::Unavailable(format!("Failed to issue token: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(Error::ExecutionFailed(format!(
                "Issuing token for installation {} returned {}",
                installation_id, status
            )));
        }
        response
            .json()
            .await
            .map_err(|e| Error::Internal(e.to_string()))
    }
}

/// Token cache keyed by installation id.
///
/// Requests without an installation, or any request when no issuer is
/// configured, get the static fallback token.
pub struct TokenCache {
    issuer: Option<Arc<dyn TokenIssuer>>,
    fallback: Option<String>,
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<i64, IssuedToken>>,
}

impl TokenCache {
    pub fn new(
        issuer: Option<Arc<dyn TokenIssuer>>,
        fallback: Option<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            issuer,
            fallback,
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Drop expired tokens. Returns how many were removed.
    pub async fn prune(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, token| token.is_valid(now));
        before - entries.len()
    }

    /// Prune on a fixed interval for the lifetime of the process.
    pub fn spawn_pruner(self: Arc<Self>, every: std::time::Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                let pruned = self.prune().await;
                if pruned > 0 {
                    debug!(pruned, "Pruned expired installation tokens");
                }
            }
        })
    }
}

#[async_trait]
impl TokenSource for TokenCache {
    async fn token(&self, installation_id: Option<i64>) -> Result<Option<String>> {
        let (Some(issuer), Some(installation_id)) = (&self.issuer, installation_id) else {
            return Ok(self.fallback.clone());
        };

        let mut entries = self.entries.lock().await;
        if let Some(cached) = entries.get(&installation_id) {
            if cached.is_valid(self.clock.now()) {
                return Ok(Some(cached.token.clone()));
            }
        }

        let issued = issuer.issue(installation_id).await?;
        info!(installation_id, expires_at = %issued.expires_at, "Issued installation token");
        let token = issued.token.clone();
        entries.insert(installation_id, issued);
        Ok(Some(token))
    }
}
