mod http;
mod ingest;
mod meli;
mod metrics;
mod models;
mod normalize;
mod security;
mod store;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
};
use ingest::{Fetcher, IngestError, Ingestor, RefreshError, parse_env_bool};
use meli::auth::{AuthError, TokenCache, exchange_authorization_code};
use meli::config::{AUTH_ROOT, ML_CLIENT_ID, ML_REDIRECT_URI};
use meli::items::{MeliClient, MeliError};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{ApiError, ListingPage, Pagination, PreviewRecord};
use security::{AuthState, require_api_auth};
use serde::Deserialize;
use serde_json::{Value, json};
use std::{collections::BTreeMap, net::SocketAddr, sync::Arc, sync::OnceLock};
use store::{Store, StoreError};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

const DEFAULT_PAGE_LIMIT: usize = 20;
const MAX_PAGE_LIMIT: usize = 100;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "watch.api", "server crashed: {err}");
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenvy::dotenv().ok();
    init_tracing();

    let store = Store::from_env();
    let tokens = Arc::new(TokenCache::from_env());
    let meli = MeliClient::new(http::build_client(), tokens);
    let ingestor = Ingestor::new(
        store,
        Fetcher::Meli(meli.clone()),
        parse_env_bool("WEBHOOK_DIAGNOSTICS"),
    );

    if std::env::args().any(|arg| arg == "--backfill") {
        let refreshed = ingestor.backfill().await?;
        info!(target = "watch.api", refreshed, "backfill complete");
        return Ok(());
    }

    let openapi: Value = serde_yaml::from_str(include_str!("../docs/openapi.yaml"))
        .unwrap_or(json!({"openapi": "3.0.3"}));
    let state = AppState {
        ingestor,
        meli,
        openapi: Arc::new(openapi),
        prometheus_handle: init_metrics(),
    };
    let auth_state = AuthState::from_env();
    let app = build_router(state, auth_state);

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(3000);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(target = "watch.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    ingestor: Ingestor,
    meli: MeliClient,
    openapi: Arc<Value>,
    prometheus_handle: PrometheusHandle,
}

fn build_router(state: AppState, auth_state: AuthState) -> Router {
    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let api = Router::new()
        .route("/api/webhooks", get(list_webhooks))
        .route("/api/webhooks/topics", get(list_topics))
        .route("/api/ml", get(ml_passthrough))
        .route("/api/ml/preview", get(force_preview))
        .route_layer(middleware::from_fn_with_state(auth_state, require_api_auth));

    Router::new()
        .route("/webhook", post(webhook))
        .route("/auth", get(auth_redirect))
        .route("/callback", get(oauth_callback))
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/openapi.json", get(openapi_json))
        .route("/docs", get(swagger_ui))
        .merge(api)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(body_limit_from_env()))
}

/// Ingest one marketplace notification.
///
/// - Method: `POST`
/// - Path: `/webhook`
/// - Auth: none (the sender does not sign notifications)
///
/// Always answers `200` once the body parses, even when inner stages
/// failed — the sender retries on non-2xx and the event log already
/// deduplicates replays. `400` only for an absent or unparseable body.
async fn webhook(State(state): State<AppState>, body: Bytes) -> Result<Response, AppError> {
    metrics::inc_requests("/webhook");
    let parsed = if body.is_empty() {
        None
    } else {
        serde_json::from_slice::<Value>(&body).ok()
    };
    let report = state.ingestor.ingest(parsed).await?;
    if state.ingestor.diagnostics_enabled() {
        Ok(Json(report).into_response())
    } else {
        Ok(Json(json!({ "status": "received" })).into_response())
    }
}

#[derive(Debug, Deserialize)]
struct ListParams {
    topic: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
}

/// Latest event per canonical resource within a topic, joined against
/// the preview cache, paginated.
async fn list_webhooks(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<ListingPage>, AppError> {
    metrics::inc_requests("/api/webhooks");
    let Some(topic) = params.topic.filter(|t| !t.trim().is_empty()) else {
        return Err(AppError::BadRequest("missing_topic"));
    };
    let limit = params
        .limit
        .unwrap_or(DEFAULT_PAGE_LIMIT)
        .clamp(1, MAX_PAGE_LIMIT);
    let offset = params.offset.unwrap_or(0);
    let page = state.ingestor.store().list_topic(&topic, limit, offset).await?;
    Ok(Json(ListingPage {
        topic,
        events: page.events,
        pagination: Pagination {
            limit,
            offset,
            total: page.total,
        },
    }))
}

async fn list_topics(
    State(state): State<AppState>,
) -> Result<Json<BTreeMap<String, u64>>, AppError> {
    metrics::inc_requests("/api/webhooks/topics");
    let counts = state.ingestor.store().topic_counts().await?;
    Ok(Json(counts))
}

#[derive(Debug, Deserialize)]
struct ResourceParams {
    resource: Option<String>,
}

/// Force an on-demand upstream fetch + preview upsert for one resource.
async fn force_preview(
    State(state): State<AppState>,
    Query(params): Query<ResourceParams>,
) -> Result<Json<PreviewRecord>, AppError> {
    metrics::inc_requests("/api/ml/preview");
    let Some(raw) = params.resource.filter(|r| !r.trim().is_empty()) else {
        return Err(AppError::BadRequest("missing_resource"));
    };
    let canonical = normalize::normalize(&raw);
    if !normalize::is_item_resource(&canonical) {
        return Err(AppError::BadRequest("not_an_item_resource"));
    }
    let record = state
        .ingestor
        .refresh_preview(&canonical, normalize::is_competitive(&raw))
        .await?;
    Ok(Json(record))
}

/// Authenticated passthrough for an arbitrary marketplace resource; the
/// upstream status code is forwarded verbatim.
async fn ml_passthrough(
    State(state): State<AppState>,
    Query(params): Query<ResourceParams>,
) -> Result<Response, AppError> {
    metrics::inc_requests("/api/ml");
    let Some(resource) = params.resource.filter(|r| !r.trim().is_empty()) else {
        return Err(AppError::BadRequest("missing_resource"));
    };
    let (status, body) = state.meli.fetch_raw(&resource).await?;
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
    Ok((status, Json(body)).into_response())
}

/// Redirect the operator to the marketplace consent page. One-shot
/// bootstrap for minting the long-lived refresh token.
async fn auth_redirect() -> Redirect {
    let url = format!(
        "{}/authorization?response_type=code&client_id={}&redirect_uri={}",
        *AUTH_ROOT, *ML_CLIENT_ID, *ML_REDIRECT_URI,
    );
    Redirect::temporary(&url)
}

#[derive(Debug, Deserialize)]
struct CallbackParams {
    code: Option<String>,
}

/// Exchange the authorization code and hand the raw token document back
/// to the operator. Nothing is cached; the refresh token goes into the
/// environment by hand.
async fn oauth_callback(Query(params): Query<CallbackParams>) -> Result<Response, AppError> {
    metrics::inc_requests("/callback");
    let Some(code) = params.code.filter(|c| !c.trim().is_empty()) else {
        return Err(AppError::BadRequest("missing_code"));
    };
    let tokens = exchange_authorization_code(&http::build_client(), &code).await?;
    let status = if tokens.get("access_token").is_some() {
        StatusCode::OK
    } else {
        StatusCode::BAD_REQUEST
    };
    Ok((status, Json(tokens)).into_response())
}

/// Health and readiness check.
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "meli-watch-rs",
    }))
}

async fn metrics_endpoint(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
) -> axum::http::Response<String> {
    if let Ok(secret) = std::env::var("METRICS_KEY") {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return axum::http::Response::builder()
                .status(StatusCode::UNAUTHORIZED)
                .body("unauthorized".into())
                .unwrap();
        }
    }
    let body = state.prometheus_handle.render();
    axum::http::Response::builder()
        .header("Content-Type", "text/plain; version=0.0.4")
        .body(body)
        .unwrap()
}

async fn openapi_json(State(state): State<AppState>) -> Json<Value> {
    Json((*state.openapi).clone())
}

async fn swagger_ui() -> axum::http::Response<String> {
    let html = r#"<!doctype html>
<html>
<head>
  <meta charset='utf-8'/>
  <title>Meli Watch API Docs</title>
  <link rel="stylesheet" href="https://unpkg.com/swagger-ui-dist@5/swagger-ui.css" />
</head>
<body>
  <div id="swagger-ui"></div>
  <script src="https://unpkg.com/swagger-ui-dist@5/swagger-ui-bundle.js"></script>
  <script>
    window.onload = () => {
      window.ui = SwaggerUIBundle({ url: '/openapi.json', dom_id: '#swagger-ui' });
    };
  </script>
</body>
</html>"#;
    axum::http::Response::builder()
        .header("Content-Type", "text/html; charset=utf-8")
        .body(html.to_string())
        .unwrap()
}

#[derive(Debug)]
enum AppError {
    BadRequest(&'static str),
    Auth(AuthError),
    Upstream(MeliError),
    Store(StoreError),
}

impl From<IngestError> for AppError {
    fn from(_: IngestError) -> Self {
        AppError::BadRequest("invalid_body")
    }
}

impl From<AuthError> for AppError {
    fn from(value: AuthError) -> Self {
        AppError::Auth(value)
    }
}

impl From<MeliError> for AppError {
    fn from(value: MeliError) -> Self {
        AppError::Upstream(value)
    }
}

impl From<StoreError> for AppError {
    fn from(value: StoreError) -> Self {
        AppError::Store(value)
    }
}

impl From<RefreshError> for AppError {
    fn from(value: RefreshError) -> Self {
        match value {
            RefreshError::Upstream(err) => AppError::Upstream(err),
            RefreshError::Store(err) => AppError::Store(err),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, detail) = match self {
            AppError::BadRequest(code) => (StatusCode::BAD_REQUEST, code, None),
            AppError::Auth(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "auth_error",
                Some(err.to_string()),
            ),
            AppError::Upstream(err) => {
                (StatusCode::BAD_GATEWAY, "upstream_error", Some(err.to_string()))
            }
            AppError::Store(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "store_error",
                Some(err.to_string()),
            ),
        };
        let payload = ApiError {
            error: code.to_string(),
            detail,
        };
        (status, Json(payload)).into_response()
    }
}

fn body_limit_from_env() -> usize {
    std::env::var("REQUEST_MAX_BYTES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(256 * 1024)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}

// One recorder per process; tests share it through the OnceLock.
fn init_metrics() -> PrometheusHandle {
    static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
    HANDLE
        .get_or_init(|| {
            PrometheusBuilder::new()
                .install_recorder()
                .expect("prom recorder")
        })
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::StubFetcher;
    use crate::models::PreviewFields;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn competitive_fields() -> PreviewFields {
        PreviewFields {
            title: Some("Teclado mecánico".to_string()),
            price: Some(44100.0),
            currency: Some("ARS".to_string()),
            catalog_product_id: Some("MLA-CAT-9".to_string()),
            competitor_status: Some("losing".to_string()),
            competitor_id: Some("MLA2".to_string()),
            competitor_price: Some(43000.5),
            ..PreviewFields::default()
        }
    }

    fn test_app(fetcher: Fetcher, diagnostics: bool) -> Router {
        let store = Store::Memory(crate::store::MemoryStore::new());
        let tokens = Arc::new(TokenCache::new(None));
        let meli = MeliClient::new(http::build_client(), tokens);
        let state = AppState {
            ingestor: Ingestor::new(store, fetcher, diagnostics),
            meli,
            openapi: Arc::new(json!({"openapi": "3.0.3"})),
            prometheus_handle: init_metrics(),
        };
        build_router(state, AuthState::from_env())
    }

    fn webhook_request(body: &Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/webhook")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn sample_webhook() -> Value {
        json!({
            "_id": "abc",
            "topic": "items",
            "user_id": 123456,
            "resource": "/items/MLA1/price_to_win",
            "application_id": 999,
        })
    }

    #[tokio::test]
    async fn webhook_then_listing_round_trip() {
        let app = test_app(StubFetcher::returning(competitive_fields()), false);

        let response = app
            .clone()
            .oneshot(webhook_request(&sample_webhook()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await, json!({ "status": "received" }));

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/webhooks?topic=items")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let page = json_body(response).await;
        assert_eq!(page["pagination"]["total"], json!(1));
        let event = &page["events"][0];
        assert_eq!(event["event_id"], json!("abc"));
        assert_eq!(event["canonical_resource"], json!("/items/MLA1"));
        assert_eq!(event["resource"], json!("/items/MLA1/price_to_win"));
        assert_eq!(event["db_preview"]["competitor_id"], json!("MLA2"));
        assert_eq!(event["db_preview"]["competitor_status"], json!("losing"));
    }

    #[tokio::test]
    async fn webhook_replay_is_idempotent() {
        let app = test_app(StubFetcher::returning(competitive_fields()), false);
        for _ in 0..2 {
            let response = app
                .clone()
                .oneshot(webhook_request(&sample_webhook()))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/webhooks?topic=items")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let page = json_body(response).await;
        assert_eq!(page["pagination"]["total"], json!(1));
        assert_eq!(page["events"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn webhook_rejects_garbage_body() {
        let app = test_app(StubFetcher::returning(competitive_fields()), false);
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/webhook")
                    .header("content-type", "application/json")
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/webhook")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn webhook_acknowledges_despite_upstream_outage() {
        let app = test_app(StubFetcher::failing(), false);
        let response = app
            .clone()
            .oneshot(webhook_request(&sample_webhook()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // The raw event is listed with a null preview, not an error.
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/webhooks?topic=items")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let page = json_body(response).await;
        assert_eq!(page["events"][0]["db_preview"], Value::Null);
    }

    #[tokio::test]
    async fn diagnostics_mode_returns_stage_report() {
        let app = test_app(StubFetcher::returning(competitive_fields()), true);
        let response = app
            .clone()
            .oneshot(webhook_request(&sample_webhook()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let report = json_body(response).await;
        assert_eq!(report["event_id"], json!("abc"));
        assert_eq!(report["inserted"], json!(true));
        let names: Vec<&str> = report["stages"]
            .as_array()
            .unwrap()
            .iter()
            .map(|s| s["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["normalize", "append_event", "refresh_preview"]);
    }

    #[tokio::test]
    async fn listing_requires_topic() {
        let app = test_app(StubFetcher::returning(competitive_fields()), false);
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/webhooks")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["error"], json!("missing_topic"));
    }

    #[tokio::test]
    async fn topics_endpoint_aggregates_counts() {
        let app = test_app(StubFetcher::returning(competitive_fields()), false);
        for (id, topic) in [("a", "items"), ("b", "items"), ("c", "orders_v2")] {
            let body = json!({
                "_id": id,
                "topic": topic,
                "user_id": "1",
                "resource": "/items/MLA1",
            });
            app.clone().oneshot(webhook_request(&body)).await.unwrap();
        }
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/webhooks/topics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let counts = json_body(response).await;
        assert_eq!(counts["items"], json!(2));
        assert_eq!(counts["orders_v2"], json!(1));
    }

    #[tokio::test]
    async fn forced_preview_validates_resource() {
        let app = test_app(StubFetcher::returning(competitive_fields()), false);
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/ml/preview")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/ml/preview?resource=/orders/9")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["error"], json!("not_an_item_resource"));
    }

    #[tokio::test]
    async fn forced_preview_upserts_and_returns_record() {
        let app = test_app(StubFetcher::returning(competitive_fields()), false);
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/ml/preview?resource=/items/MLA1/price_to_win")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let record = json_body(response).await;
        assert_eq!(record["resource"], json!("/items/MLA1"));
        assert_eq!(record["competitor_id"], json!("MLA2"));
        assert!(record["last_updated"].is_string());
    }

    #[tokio::test]
    async fn health_is_open() {
        let app = test_app(StubFetcher::returning(competitive_fields()), false);
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], json!("ok"));
    }
}
