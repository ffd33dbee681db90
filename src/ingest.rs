//! Webhook ingestion pipeline.
//!
//! Per inbound event: validate → normalize → append to the event log →
//! best-effort preview refresh → acknowledge. Only validation failures
//! surface as client errors; a log-write or refresh failure is recorded
//! in the report and the sender still gets a 200, because the upstream
//! notifier retries on non-2xx and the log append already deduplicates
//! replays.

use crate::meli::items::{MeliClient, MeliError};
use crate::models::{
    IngestReport, PreviewFields, PreviewRecord, StageFailure, StageReport, StoredEvent,
};
use crate::normalize;
use crate::store::{Store, StoreError};
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Instant;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("request body is not a JSON document")]
    BadRequest,
}

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error(transparent)]
    Upstream(#[from] MeliError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Upstream fetch seam: the real marketplace client in production, a
/// canned responder in tests.
#[derive(Clone)]
pub enum Fetcher {
    Meli(MeliClient),
    #[cfg(test)]
    Stub(StubFetcher),
}

impl Fetcher {
    async fn fetch_preview(
        &self,
        canonical: &str,
        competitive: bool,
    ) -> Result<PreviewFields, MeliError> {
        match self {
            Fetcher::Meli(client) => client.fetch_preview(canonical, competitive).await,
            #[cfg(test)]
            Fetcher::Stub(stub) => stub.fetch_preview(canonical, competitive),
        }
    }
}

#[derive(Clone)]
pub struct Ingestor {
    store: Store,
    fetcher: Fetcher,
    diagnostics: bool,
}

impl Ingestor {
    pub fn new(store: Store, fetcher: Fetcher, diagnostics: bool) -> Self {
        Self {
            store,
            fetcher,
            diagnostics,
        }
    }

    pub fn diagnostics_enabled(&self) -> bool {
        self.diagnostics
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Run the pipeline for one inbound body. Returns `Err` only when the
    /// body is absent or not a JSON object; every later failure lands in
    /// the report's `failures` list instead.
    pub async fn ingest(&self, body: Option<Value>) -> Result<IngestReport, IngestError> {
        let Some(payload @ Value::Object(_)) = body else {
            return Err(IngestError::BadRequest);
        };

        let received_at = Utc::now();
        let topic = str_field(&payload, "topic").unwrap_or_else(|| "otros".to_string());
        let user_id = str_field(&payload, "user_id").unwrap_or_default();
        let raw_resource = str_field(&payload, "resource").unwrap_or_default();
        let event_id = str_field(&payload, "_id").unwrap_or_else(|| fallback_event_id(&payload));

        let mut stages = Vec::new();
        let mut failures = Vec::new();

        let started = Instant::now();
        let canonical = normalize::normalize(&raw_resource);
        let competitive = normalize::is_competitive(&raw_resource);
        self.capture(
            &mut stages,
            "normalize",
            started,
            json!({
                "resource": raw_resource,
                "canonical_resource": canonical,
                "competitive": competitive,
            }),
        );

        let event = StoredEvent {
            event_id: event_id.clone(),
            topic: topic.clone(),
            user_id,
            resource: raw_resource.clone(),
            canonical_resource: canonical.clone(),
            payload,
            received_at,
        };

        let started = Instant::now();
        let inserted = match self.store.append_event(&event).await {
            Ok(outcome) => {
                self.capture(
                    &mut stages,
                    "append_event",
                    started,
                    json!({ "event_id": event_id, "inserted": outcome.inserted }),
                );
                outcome.inserted
            }
            Err(err) => {
                // The raw-log row is lost but the preview refresh still
                // runs; availability beats completeness here.
                warn!(target = "watch.ingest", event_id = %event_id, error = %err, "event_log_append_failed");
                failures.push(StageFailure {
                    stage: "append_event".to_string(),
                    error: err.to_string(),
                });
                false
            }
        };

        let started = Instant::now();
        let mut preview_refreshed = false;
        if normalize::is_item_resource(&canonical) {
            match self.refresh_preview(&canonical, competitive).await {
                Ok(record) => {
                    preview_refreshed = true;
                    self.capture(
                        &mut stages,
                        "refresh_preview",
                        started,
                        json!({
                            "resource": record.resource,
                            "title": record.fields.title,
                            "competitor_status": record.fields.competitor_status,
                            "last_updated": record.last_updated,
                        }),
                    );
                }
                Err(err) => {
                    warn!(target = "watch.ingest", resource = %canonical, error = %err, "preview_refresh_failed");
                    failures.push(StageFailure {
                        stage: "refresh_preview".to_string(),
                        error: err.to_string(),
                    });
                }
            }
        } else {
            self.capture(
                &mut stages,
                "refresh_preview",
                started,
                json!({ "skipped": "not an item resource" }),
            );
        }

        Ok(IngestReport {
            event_id,
            topic,
            canonical_resource: canonical,
            inserted,
            preview_refreshed,
            stages,
            failures,
        })
    }

    /// Fetch upstream state for one canonical resource and overwrite its
    /// preview row. Shared by the pipeline, the forced-refresh endpoint
    /// and the backfill. A failure leaves the prior row untouched.
    pub async fn refresh_preview(
        &self,
        canonical: &str,
        competitive: bool,
    ) -> Result<PreviewRecord, RefreshError> {
        let fields = self.fetcher.fetch_preview(canonical, competitive).await?;
        let record = self.store.upsert_preview(canonical, &fields).await?;
        Ok(record)
    }

    /// Replay the preview refresh over every canonical resource that ever
    /// arrived through the competitive view. Per-resource failures are
    /// logged and skipped.
    pub async fn backfill(&self) -> Result<usize, StoreError> {
        let resources = self.store.competitive_resources().await?;
        let mut refreshed = 0;
        for resource in &resources {
            match self.refresh_preview(resource, true).await {
                Ok(_) => refreshed += 1,
                Err(err) => {
                    warn!(target = "watch.ingest", resource = %resource, error = %err, "backfill_refresh_failed");
                }
            }
        }
        Ok(refreshed)
    }

    fn capture(
        &self,
        stages: &mut Vec<StageReport>,
        name: &'static str,
        started: Instant,
        output: Value,
    ) {
        let elapsed_ms = started.elapsed().as_millis();
        crate::metrics::stage_elapsed(name, elapsed_ms);
        stages.push(StageReport::new(name, elapsed_ms, output));
    }
}

fn str_field(payload: &Value, key: &str) -> Option<String> {
    match payload.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Events without a provider id still need a stable dedup key so replays
/// of the identical body collapse to one row.
fn fallback_event_id(payload: &Value) -> String {
    let mut hasher = DefaultHasher::new();
    payload.to_string().hash(&mut hasher);
    format!("local-{:016x}", hasher.finish())
}

pub fn parse_env_bool(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

#[cfg(test)]
#[derive(Clone, Default)]
pub struct StubFetcher {
    pub fields: PreviewFields,
    pub fail: bool,
}

#[cfg(test)]
impl StubFetcher {
    pub fn returning(fields: PreviewFields) -> Fetcher {
        Fetcher::Stub(Self {
            fields,
            fail: false,
        })
    }

    pub fn failing() -> Fetcher {
        Fetcher::Stub(Self {
            fields: PreviewFields::default(),
            fail: true,
        })
    }

    fn fetch_preview(
        &self,
        _canonical: &str,
        competitive: bool,
    ) -> Result<PreviewFields, MeliError> {
        if self.fail {
            return Err(MeliError::Request("stubbed upstream outage".to_string()));
        }
        let mut fields = self.fields.clone();
        if !competitive {
            fields.competitor_status = None;
            fields.competitor_id = None;
            fields.competitor_price = None;
            fields.competitor_link = None;
        }
        Ok(fields)
    }
}
