use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One raw notification, immutable once stored. `resource` keeps the path
/// exactly as the sender delivered it (audit trail); `canonical_resource`
/// carries the normalized key every join runs on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event_id: String,
    pub topic: String,
    pub user_id: String,
    pub resource: String,
    pub canonical_resource: String,
    pub payload: Value,
    pub received_at: DateTime<Utc>,
}

/// Display-ready fields derived from the upstream item (and, for catalog
/// listings, the price-to-win view). Competitor fields stay `None` for
/// plain item resources and for items outside catalog competition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreviewFields {
    pub title: Option<String>,
    pub price: Option<f64>,
    pub currency: Option<String>,
    pub thumbnail: Option<String>,
    pub permalink: Option<String>,
    pub brand: Option<String>,
    pub catalog_product_id: Option<String>,
    pub competitor_status: Option<String>,
    pub competitor_id: Option<String>,
    pub competitor_price: Option<f64>,
    pub competitor_link: Option<String>,
}

/// One preview-cache row per canonical resource. `last_updated` reflects
/// the most recent successful upstream fetch, never the triggering event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviewRecord {
    pub resource: String,
    #[serde(flatten)]
    pub fields: PreviewFields,
    pub last_updated: DateTime<Utc>,
}

/// A listing row: the newest raw event for a canonical resource within a
/// topic, joined against the preview cache. `db_preview` is null when the
/// upstream fetch has never succeeded for that resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListedEvent {
    #[serde(flatten)]
    pub event: StoredEvent,
    pub db_preview: Option<PreviewRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListingPage {
    pub topic: String,
    pub events: Vec<ListedEvent>,
    pub pagination: Pagination,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct Pagination {
    pub limit: usize,
    pub offset: usize,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageReport {
    pub name: String,
    pub elapsed_ms: u128,
    pub timestamp: DateTime<Utc>,
    pub output: Value,
}

impl StageReport {
    pub fn new(name: &str, elapsed_ms: u128, output: Value) -> Self {
        Self {
            name: name.to_string(),
            elapsed_ms,
            timestamp: Utc::now(),
            output,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StageFailure {
    pub stage: String,
    pub error: String,
}

/// Per-event pipeline outcome. Returned verbatim to the sender when
/// diagnostics mode is on; otherwise only logged.
#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub event_id: String,
    pub topic: String,
    pub canonical_resource: String,
    pub inserted: bool,
    pub preview_refreshed: bool,
    pub stages: Vec<StageReport>,
    pub failures: Vec<StageFailure>,
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}
