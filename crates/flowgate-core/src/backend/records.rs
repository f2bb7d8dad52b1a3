//! Record store client and the shared service credential.
//!
//! The engine talks to both remote services as a service account. The
//! credential comes from the record store's token exchange and is cached
//! until shortly before it expires; a credential the exchange returns
//! without an expiry is treated as already expired and refreshed on the
//! next use.

use crate::backend::{RecordStore, StoredMessage};
use crate::config::CoreConfig;
use crate::error::{FlowError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
struct CachedCredential {
    token: String,
    /// Epoch millis past which the token is no longer trusted. `None` means
    /// the exchange gave no expiry, which counts as expired.
    expires_at: Option<i64>,
}

impl CachedCredential {
    fn is_fresh(&self, now: i64) -> bool {
        self.expires_at.map(|at| now < at).unwrap_or(false)
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Service-account authenticator shared by the backend and record-store
/// clients. Verification of client tokens lives elsewhere; this is only the
/// engine's own outbound identity.
pub struct ServiceAuth {
    client: reqwest::Client,
    records_url: String,
    api_key: String,
    email: String,
    password: String,
    ttl_ms: i64,
    cached: RwLock<Option<CachedCredential>>,
}

impl ServiceAuth {
    pub fn new(client: reqwest::Client, config: &CoreConfig) -> Self {
        Self {
            client,
            records_url: config.records_url.trim_end_matches('/').to_string(),
            api_key: config.records_api_key.clone(),
            email: config.service_email.clone(),
            password: config.service_password.clone(),
            ttl_ms: config.credential_ttl_minutes * 60_000,
            cached: RwLock::new(None),
        }
    }

    /// Current service token, refreshed through the exchange when the cached
    /// one is missing or stale.
    pub async fn token(&self) -> Result<String> {
        let now = chrono::Utc::now().timestamp_millis();
        {
            let cached = self.cached.read().await;
            if let Some(credential) = cached.as_ref() {
                if credential.is_fresh(now) {
                    return Ok(credential.token.clone());
                }
            }
        }

        let mut cached = self.cached.write().await;
        // Another caller may have refreshed while we waited for the lock.
        if let Some(credential) = cached.as_ref() {
            if credential.is_fresh(now) {
                return Ok(credential.token.clone());
            }
        }

        let credential = self.exchange(now).await?;
        let token = credential.token.clone();
        *cached = Some(credential);
        Ok(token)
    }

    async fn exchange(&self, now: i64) -> Result<CachedCredential> {
        debug!("exchanging service credential");
        let response = self
            .client
            .post(format!("{}/auth/token", self.records_url))
            .header("apikey", &self.api_key)
            .json(&serde_json::json!({
                "email": self.email,
                "password": self.password,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            warn!(%status, "service credential exchange rejected");
            return Err(FlowError::Unavailable(format!(
                "credential exchange failed with status {}",
                status
            )));
        }

        let body: TokenResponse = response.json().await?;
        let expires_at = body
            .expires_in
            .map(|secs| now + (secs * 1000).min(self.ttl_ms));
        if expires_at.is_none() {
            warn!("credential exchange returned no expiry, will refresh on next use");
        }
        info!("service credential refreshed");
        Ok(CachedCredential {
            token: body.access_token,
            expires_at,
        })
    }

    /// Drop the cached credential so the next use re-exchanges.
    pub async fn invalidate(&self) {
        *self.cached.write().await = None;
    }

    pub(crate) fn records_url(&self) -> &str {
        &self.records_url
    }

    pub(crate) fn api_key(&self) -> &str {
        &self.api_key
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionRecord {
    unit_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UnitRecord {
    sandbox_id: Option<String>,
}

/// REST client for the durable record store.
pub struct HttpRecordStore {
    client: reqwest::Client,
    auth: Arc<ServiceAuth>,
}

impl HttpRecordStore {
    pub fn new(client: reqwest::Client, auth: Arc<ServiceAuth>) -> Self {
        Self { client, auth }
    }

    /// Drop the cached service credential when the store stops accepting it.
    async fn note_unauthorized(&self, status: reqwest::StatusCode) {
        if status == reqwest::StatusCode::UNAUTHORIZED {
            self.auth.invalidate().await;
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: String) -> Result<Option<T>> {
        let token = self.auth.token().await?;
        let response = self
            .client
            .get(&url)
            .header("apikey", self.auth.api_key())
            .bearer_auth(token)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            self.note_unauthorized(response.status()).await;
            return Err(FlowError::Unavailable(format!(
                "record store returned status {} for {}",
                response.status(),
                url
            )));
        }
        Ok(Some(response.json::<T>().await?))
    }
}

#[async_trait]
impl RecordStore for HttpRecordStore {
    async fn unit_for_session(&self, session_id: &str) -> Result<Option<String>> {
        let url = format!("{}/sessions/{}", self.auth.records_url(), session_id);
        let record: Option<SessionRecord> = self.get_json(url).await?;
        Ok(record.and_then(|r| r.unit_id))
    }

    async fn sandbox_for_unit(&self, unit_id: &str) -> Result<Option<String>> {
        let url = format!("{}/units/{}", self.auth.records_url(), unit_id);
        let record: Option<UnitRecord> = self.get_json(url).await?;
        Ok(record.and_then(|r| r.sandbox_id))
    }

    async fn append_message(&self, session_id: &str, role: &str, content: &str) -> Result<()> {
        let token = self.auth.token().await?;
        let url = format!(
            "{}/sessions/{}/messages",
            self.auth.records_url(),
            session_id
        );
        let response = self
            .client
            .post(&url)
            .header("apikey", self.auth.api_key())
            .bearer_auth(token)
            .json(&serde_json::json!({
                "role": role,
                "content": content,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            self.note_unauthorized(response.status()).await;
            return Err(FlowError::Unavailable(format!(
                "message append returned status {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn list_messages(
        &self,
        session_id: &str,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<StoredMessage>> {
        let token = self.auth.token().await?;
        let url = format!(
            "{}/sessions/{}/messages",
            self.auth.records_url(),
            session_id
        );
        let response = self
            .client
            .get(&url)
            .query(&[("offset", offset), ("limit", limit)])
            .header("apikey", self.auth.api_key())
            .bearer_auth(token)
            .send()
            .await?;

        if !response.status().is_success() {
            self.note_unauthorized(response.status()).await;
            return Err(FlowError::Unavailable(format!(
                "message listing returned status {}",
                response.status()
            )));
        }
        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_without_expiry_is_stale() {
        let credential = CachedCredential {
            token: "t".into(),
            expires_at: None,
        };
        assert!(!credential.is_fresh(0));
        assert!(!credential.is_fresh(i64::MAX));
    }

    #[test]
    fn credential_freshness_tracks_expiry() {
        let credential = CachedCredential {
            token: "t".into(),
            expires_at: Some(1_000),
        };
        assert!(credential.is_fresh(999));
        assert!(!credential.is_fresh(1_000));
        assert!(!credential.is_fresh(2_000));
    }
}
