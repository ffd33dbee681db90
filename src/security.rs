//! Optional API-key gate for the read/query routes.
//!
//! The webhook endpoint itself stays open (the marketplace sender does
//! not sign notifications), but the dashboard-facing `/api` routes can be
//! locked down with `WATCH_API_KEYS`. With no keys configured the
//! middleware admits everything, which matches single-operator deploys.

use crate::models::ApiError;
use axum::{
    Json,
    body::Body,
    extract::State,
    http::{self, Request, StatusCode, header::HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::{
    collections::{HashMap, HashSet},
    convert::Infallible,
    env,
    sync::Arc,
    time::Instant,
};
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Clone)]
pub struct AuthState {
    keys: Arc<HashSet<String>>,
    limiter: Arc<TokenBuckets>,
}

impl AuthState {
    pub fn from_env() -> Self {
        let keys = load_keys_from_env();
        if keys.is_empty() {
            warn!(
                target = "watch.api",
                "WATCH_API_KEYS not set, /api routes are unauthenticated"
            );
        } else {
            info!(
                target = "watch.api",
                key_count = keys.len(),
                "loaded API keys from env"
            );
        }
        Self {
            keys: Arc::new(keys),
            limiter: Arc::new(TokenBuckets::from_env()),
        }
    }

    fn open(&self) -> bool {
        self.keys.is_empty()
    }
}

pub async fn require_api_auth(
    State(state): State<AuthState>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, Infallible> {
    if state.open() {
        return Ok(next.run(request).await);
    }

    let Some(presented) = extract_api_key(request.headers()) else {
        return Ok(unauthorized_response(
            "missing_api_key",
            "Provide X-Watch-Key or Bearer token",
        ));
    };
    if !state.keys.contains(&presented) {
        return Ok(unauthorized_response(
            "invalid_api_key",
            "Key not recognized",
        ));
    }

    match state.limiter.consume(&presented).await {
        Ok(status) => {
            let mut response = next.run(request).await;
            status.apply_headers(response.headers_mut());
            Ok(response)
        }
        Err(status) => {
            let payload = ApiError {
                error: "rate_limited".to_string(),
                detail: Some("Too many requests".to_string()),
            };
            let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(payload)).into_response();
            status.apply_headers(response.headers_mut());
            Ok(response)
        }
    }
}

fn extract_api_key(headers: &http::HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(http::header::AUTHORIZATION)
        && let Ok(raw) = value.to_str()
        && raw.len() >= 7
        && raw[..6].eq_ignore_ascii_case("bearer")
    {
        return Some(raw[6..].trim().to_string());
    }
    headers
        .get("X-Watch-Key")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn unauthorized_response(code: &str, message: &str) -> Response {
    let payload = ApiError {
        error: code.to_string(),
        detail: Some(message.to_string()),
    };
    (StatusCode::UNAUTHORIZED, Json(payload)).into_response()
}

fn load_keys_from_env() -> HashSet<String> {
    env::var("WATCH_API_KEYS")
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .map(str::to_string)
        .collect()
}

struct TokenBuckets {
    rate_per_sec: f64,
    capacity: f64,
    buckets: Mutex<HashMap<String, BucketState>>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Rate headers emitted on both admitted and rejected responses.
#[derive(Debug)]
struct RateStatus {
    capacity: f64,
    tokens: f64,
    rate: f64,
    retry_after: Option<f64>,
}

impl TokenBuckets {
    fn from_env() -> Self {
        let rate_per_sec = env::var("RATE_LIMIT_PER_SEC")
            .ok()
            .and_then(|value| value.parse::<f64>().ok())
            .filter(|value| *value > 0.0)
            .unwrap_or(5.0);
        let capacity = env::var("RATE_LIMIT_CAPACITY")
            .ok()
            .and_then(|value| value.parse::<f64>().ok())
            .filter(|value| *value >= 1.0)
            .unwrap_or(10.0);
        Self::new(rate_per_sec, capacity)
    }

    fn new(rate_per_sec: f64, capacity: f64) -> Self {
        Self {
            rate_per_sec,
            capacity,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    async fn consume(&self, key: &str) -> Result<RateStatus, RateStatus> {
        let mut guard = self.buckets.lock().await;
        let now = Instant::now();
        let state = guard.entry(key.to_string()).or_insert_with(|| BucketState {
            tokens: self.capacity,
            last_refill: now,
        });

        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            state.tokens = (state.tokens + elapsed * self.rate_per_sec).min(self.capacity);
            state.last_refill = now;
        }

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(RateStatus {
                capacity: self.capacity,
                tokens: state.tokens,
                rate: self.rate_per_sec,
                retry_after: None,
            })
        } else {
            let deficit = 1.0 - state.tokens;
            Err(RateStatus {
                capacity: self.capacity,
                tokens: state.tokens,
                rate: self.rate_per_sec,
                retry_after: Some((deficit / self.rate_per_sec).max(0.0)),
            })
        }
    }
}

impl RateStatus {
    fn apply_headers(&self, headers: &mut http::HeaderMap) {
        let remaining = self.tokens.max(0.0).floor() as u64;
        let reset = ((self.capacity - self.tokens) / self.rate).ceil().max(0.0) as u64;
        headers.insert("X-RateLimit-Limit", numeric_header(self.capacity as u64));
        headers.insert("X-RateLimit-Remaining", numeric_header(remaining));
        headers.insert("X-RateLimit-Reset", numeric_header(reset));
        if let Some(retry_after) = self.retry_after {
            headers.insert(
                http::header::RETRY_AFTER,
                numeric_header(retry_after.ceil().max(0.0) as u64),
            );
        }
    }
}

fn numeric_header(value: u64) -> HeaderValue {
    HeaderValue::from_str(&value.to_string()).unwrap_or_else(|_| HeaderValue::from_static("0"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bucket_exhausts_then_reports_retry_after() {
        let buckets = TokenBuckets::new(1.0, 2.0);
        assert!(buckets.consume("key").await.is_ok());
        assert!(buckets.consume("key").await.is_ok());
        let exceeded = buckets.consume("key").await.expect_err("drained");
        assert!(exceeded.retry_after.is_some());
    }

    #[tokio::test]
    async fn buckets_are_per_key() {
        let buckets = TokenBuckets::new(0.001, 1.0);
        assert!(buckets.consume("a").await.is_ok());
        assert!(buckets.consume("b").await.is_ok());
        assert!(buckets.consume("a").await.is_err());
    }

    #[test]
    fn api_key_extraction_prefers_bearer() {
        let mut headers = http::HeaderMap::new();
        headers.insert(
            http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer secret-1"),
        );
        headers.insert("X-Watch-Key", HeaderValue::from_static("secret-2"));
        assert_eq!(extract_api_key(&headers).as_deref(), Some("secret-1"));
        headers.remove(http::header::AUTHORIZATION);
        assert_eq!(extract_api_key(&headers).as_deref(), Some("secret-2"));
    }
}
