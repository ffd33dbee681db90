//! Access-token cache for the marketplace API.
//!
//! One bearer credential per process, refreshed lazily through the
//! refresh-token grant. The credential mutex is held across the exchange,
//! so concurrent callers that observe a stale token wait on a single
//! in-flight refresh instead of each hitting the token endpoint. Only the
//! token path ever takes this lock; item and pricing fetches never hold it.

use crate::http::build_client;
use crate::meli::config::{
    ML_CLIENT_ID, ML_CLIENT_SECRET, ML_REDIRECT_URI, OAUTH_TOKEN_URL,
};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;

/// Subtracted from the provider TTL so a token is never presented while
/// an in-flight request could outlive it.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

const DEFAULT_TTL_SECS: u64 = 21_600;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("ML_REFRESH_TOKEN is not configured")]
    MissingRefreshToken,
    #[error("token request failed: {0}")]
    Request(String),
    #[error("token endpoint returned no access_token")]
    MissingAccessToken,
}

#[derive(Debug, Clone)]
struct Credential {
    access_token: String,
    expires_at: Instant,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    expires_in: Option<u64>,
}

pub struct TokenCache {
    http: Client,
    refresh_token: Option<String>,
    state: Mutex<Option<Credential>>,
}

impl TokenCache {
    pub fn new(refresh_token: Option<String>) -> Self {
        Self {
            http: build_client(),
            refresh_token: refresh_token.filter(|t| !t.trim().is_empty()),
            state: Mutex::new(None),
        }
    }

    pub fn from_env() -> Self {
        Self::new(std::env::var("ML_REFRESH_TOKEN").ok())
    }

    /// Current access token, refreshing first when absent or expired.
    pub async fn get(&self) -> Result<String, AuthError> {
        let mut guard = self.state.lock().await;
        if let Some(credential) = guard.as_ref()
            && Instant::now() < credential.expires_at
        {
            return Ok(credential.access_token.clone());
        }
        let fresh = self.exchange_refresh().await?;
        let token = fresh.access_token.clone();
        *guard = Some(fresh);
        Ok(token)
    }

    /// Unconditionally replace the cached credential.
    pub async fn force_refresh(&self) -> Result<String, AuthError> {
        let mut guard = self.state.lock().await;
        let fresh = self.exchange_refresh().await?;
        let token = fresh.access_token.clone();
        *guard = Some(fresh);
        Ok(token)
    }

    async fn exchange_refresh(&self) -> Result<Credential, AuthError> {
        let refresh = self
            .refresh_token
            .as_deref()
            .ok_or(AuthError::MissingRefreshToken)?;
        let params = [
            ("grant_type", "refresh_token"),
            ("client_id", ML_CLIENT_ID.as_str()),
            ("client_secret", ML_CLIENT_SECRET.as_str()),
            ("refresh_token", refresh),
        ];
        let response = self
            .http
            .post(OAUTH_TOKEN_URL.as_str())
            .form(&params)
            .send()
            .await
            .map_err(|err| AuthError::Request(err.to_string()))?;

        if !response.status().is_success() {
            return Err(AuthError::Request(format!("HTTP {}", response.status())));
        }

        let payload: TokenResponse = response
            .json()
            .await
            .map_err(|err| AuthError::Request(err.to_string()))?;
        let access_token = payload.access_token.ok_or(AuthError::MissingAccessToken)?;
        let ttl = Duration::from_secs(payload.expires_in.unwrap_or(DEFAULT_TTL_SECS));
        Ok(Credential {
            access_token,
            expires_at: Instant::now() + ttl.saturating_sub(EXPIRY_MARGIN),
        })
    }

    #[cfg(test)]
    async fn prime(&self, access_token: &str, expires_at: Instant) {
        let mut guard = self.state.lock().await;
        *guard = Some(Credential {
            access_token: access_token.to_string(),
            expires_at,
        });
    }
}

/// One-shot authorization-code exchange used by the `/callback` bootstrap
/// route. The raw token document is handed back to the operator so the
/// refresh token can be copied into the environment; nothing is cached.
pub async fn exchange_authorization_code(http: &Client, code: &str) -> Result<Value, AuthError> {
    let params = [
        ("grant_type", "authorization_code"),
        ("client_id", ML_CLIENT_ID.as_str()),
        ("client_secret", ML_CLIENT_SECRET.as_str()),
        ("code", code),
        ("redirect_uri", ML_REDIRECT_URI.as_str()),
    ];
    let response = http
        .post(OAUTH_TOKEN_URL.as_str())
        .form(&params)
        .send()
        .await
        .map_err(|err| AuthError::Request(err.to_string()))?;
    response
        .json()
        .await
        .map_err(|err| AuthError::Request(err.to_string()))
}
