//! Credential resolution for the inference proxy.
//!
//! A static API key always wins. Otherwise the OAuth access token is read
//! from the shared credential file and refreshed when it is within five
//! minutes of expiry.
//!
//! The common case takes no lock: the file is read and a usable token is
//! returned straight away. Only when the token is expiring does a request
//! take the refresh mutex, re-read the file (the host CLI may already have
//! refreshed it) and, if still needed, run the refresh exchange and persist
//! the result.

use crate::config::{InferenceConfig, OAuthConfig};
use crate::credential::{CredentialDocument, CredentialStore, OAuthRecord};
use crate::error::{ProxyError, Result};
use crate::headers::HeaderList;
use crate::retry::{RetryableClient, UpstreamRequest};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Mutex as StdMutex;
use tracing::{debug, warn};
use zeroize::Zeroizing;

/// `anthropic-beta` capability token required with OAuth bearer tokens.
pub const OAUTH_BETA: &str = "oauth-2025-04-20";

/// Lifetime assumed when the token endpoint omits `expires_in`.
const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

/// Which kind of credential was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    /// Sent as `x-api-key`.
    ApiKey,
    /// Sent as `Authorization: Bearer` with the OAuth beta flag.
    OAuth,
}

/// A credential ready to inject.
#[derive(Debug, Clone)]
pub struct ResolvedToken {
    pub token: Zeroizing<String>,
    pub kind: CredentialKind,
}

impl ResolvedToken {
    fn oauth(token: &str) -> Self {
        Self {
            token: Zeroizing::new(token.to_string()),
            kind: CredentialKind::OAuth,
        }
    }
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    grant_type: &'static str,
    refresh_token: &'a str,
    client_id: &'a str,
    scope: &'a str,
}

#[derive(Deserialize)]
struct RefreshResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    scope: Option<String>,
}

/// Resolves the credential injected into inference requests.
pub struct TokenProvider {
    api_key: Option<Zeroizing<String>>,
    store: CredentialStore,
    oauth: OAuthConfig,
    client: RetryableClient,
    /// Serializes refresh exchanges within this process.
    refresh_lock: tokio::sync::Mutex<()>,
    /// Last record obtained by refresh, for when persisting it failed.
    refreshed: StdMutex<Option<OAuthRecord>>,
}

impl std::fmt::Debug for TokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenProvider")
            .field("api_key", &self.api_key.is_some())
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl TokenProvider {
    /// `client` carries the refresh exchange; its retry policy applies.
    #[must_use]
    pub fn new(config: &InferenceConfig, client: RetryableClient) -> Self {
        Self {
            api_key: config.api_key.clone().filter(|k| !k.is_empty()),
            store: CredentialStore::new(&config.credentials_path),
            oauth: config.oauth.clone(),
            client,
            refresh_lock: tokio::sync::Mutex::new(()),
            refreshed: StdMutex::new(None),
        }
    }

    /// Return a usable credential, refreshing the OAuth token if needed.
    pub async fn resolve(&self) -> Result<ResolvedToken> {
        if let Some(key) = &self.api_key {
            return Ok(ResolvedToken {
                token: key.clone(),
                kind: CredentialKind::ApiKey,
            });
        }

        let doc = self.read_document().await?;
        let now = now_ms();
        if let Some(token) = usable_token(&doc.oauth, now) {
            return Ok(ResolvedToken::oauth(token));
        }
        if let Some(resolved) = self.memoized(now) {
            return Ok(resolved);
        }

        let _guard = self.refresh_lock.lock().await;
        self.ensure_fresh().await
    }

    /// Slow path, called with the refresh lock held.
    async fn ensure_fresh(&self) -> Result<ResolvedToken> {
        let doc = self.read_document().await?;
        let now = now_ms();
        if let Some(token) = usable_token(&doc.oauth, now) {
            debug!("credential file already holds a fresh token");
            return Ok(ResolvedToken::oauth(token));
        }
        if let Some(resolved) = self.memoized(now) {
            return Ok(resolved);
        }

        if doc.oauth.access_token().is_none() {
            return Err(ProxyError::Auth(format!(
                "No accessToken in {}. Run 'claude' on the host to authenticate.",
                self.store.path().display()
            )));
        }
        let refresh_token = doc.oauth.refresh_token().ok_or_else(|| {
            ProxyError::Auth(
                "OAuth token expired and no refreshToken available. \
                 Run 'claude' on the host to re-authenticate."
                    .to_string(),
            )
        })?;

        debug!("OAuth token expiring, attempting refresh");
        let record = self.exchange(&doc.oauth, refresh_token).await?;
        let token = record
            .access_token()
            .map(ResolvedToken::oauth)
            .ok_or_else(|| ProxyError::MalformedResponse("empty access_token".to_string()))?;

        self.persist(&record).await;
        if let Ok(mut memo) = self.refreshed.lock() {
            *memo = Some(record);
        }
        Ok(token)
    }

    /// Run the refresh-token exchange and build the replacement record.
    async fn exchange(&self, old: &OAuthRecord, refresh_token: &str) -> Result<OAuthRecord> {
        let payload = serde_json::to_vec(&RefreshRequest {
            grant_type: "refresh_token",
            refresh_token,
            client_id: &self.oauth.client_id,
            scope: &self.oauth.scopes,
        })?;
        let mut headers = HeaderList::new();
        headers.set("Content-Type", "application/json");

        let request = UpstreamRequest {
            method: "POST",
            url: &self.oauth.token_url,
            headers: &headers,
            body: Some(Bytes::from(payload)),
            timeout: Some(self.oauth.timeout),
        };
        let resp = match self.client.call(&request).await {
            Ok(resp) => resp,
            Err(e @ ProxyError::UpstreamUnavailable { .. }) => {
                return Err(ProxyError::RefreshFailed(e.to_string()))
            }
            Err(e) => return Err(e),
        };

        let status = resp.status;
        let body = resp.into_bytes().await?;
        if status != 200 {
            let preview = String::from_utf8_lossy(&body[..body.len().min(200)]).to_string();
            debug!("token refresh HTTP {}: {}", status, preview);
            return Err(ProxyError::RefreshFailed(format!(
                "Token refresh failed (HTTP {})",
                status
            )));
        }

        let data: RefreshResponse = serde_json::from_slice(&body)
            .map_err(|e| ProxyError::MalformedResponse(e.to_string()))?;
        let access_token = data
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                ProxyError::MalformedResponse("Token refresh response missing access_token".to_string())
            })?;

        let expires_in = data.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS);
        let expires_at = now_ms().saturating_add(expires_in.saturating_mul(1000));
        let scopes = match data.scope {
            Some(scope) => scope.split_whitespace().map(str::to_string).collect(),
            None => old.scopes.clone(),
        };

        let record = OAuthRecord {
            access_token: Some(access_token),
            refresh_token: Some(data.refresh_token.unwrap_or_else(|| refresh_token.to_string())),
            expires_at: Some(serde_json::Value::from(expires_at)),
            scopes,
            subscription_type: old.subscription_type.clone(),
            rate_limit_tier: old.rate_limit_tier.clone(),
        };
        debug!("token refreshed, new expiry: {}", expires_at);
        Ok(record)
    }

    /// Write the refreshed record. Failure only costs persistence.
    async fn persist(&self, record: &OAuthRecord) {
        let store = self.store.clone();
        let record = record.clone();
        match tokio::task::spawn_blocking(move || store.write(&record)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("failed to save refreshed credentials: {}", e),
            Err(e) => warn!("credential writer task failed: {}", e),
        }
    }

    async fn read_document(&self) -> Result<CredentialDocument> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.read())
            .await
            .map_err(|e| ProxyError::CredentialsCorrupt(format!("reader task failed: {}", e)))?
    }

    fn memoized(&self, now: i64) -> Option<ResolvedToken> {
        let memo = self.refreshed.lock().ok()?;
        memo.as_ref()
            .and_then(|record| usable_token(record, now))
            .map(ResolvedToken::oauth)
    }
}

fn usable_token(record: &OAuthRecord, now: i64) -> Option<&str> {
    record.access_token().filter(|_| !record.is_expiring(now))
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
