//! Event log and preview cache.
//!
//! Two backends behind one enum: an in-process store (default, also the
//! test harness) and a hosted Postgres reached over its REST facade. The
//! event log is append-only and deduplicated on the provider event id;
//! the preview cache is a full-overwrite upsert keyed by canonical
//! resource. The two tables are never transactionally coupled.

use crate::http::build_client;
use crate::models::{ListedEvent, PreviewFields, PreviewRecord, StoredEvent};
use crate::normalize;
use chrono::Utc;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store request failed: {0}")]
    Request(String),
    #[error("store returned HTTP {0}")]
    Status(u16),
    #[error("store response could not be decoded: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, Copy)]
pub struct AppendOutcome {
    pub inserted: bool,
}

#[derive(Debug, Clone)]
pub struct TopicPage {
    pub events: Vec<ListedEvent>,
    pub total: u64,
}

#[derive(Clone)]
pub enum Store {
    Memory(MemoryStore),
    PgRest(PgRestStore),
}

impl Store {
    pub fn from_env() -> Self {
        match PgRestStore::from_env() {
            Some(pg) => {
                info!(target = "watch.store", "using postgres rest store");
                Store::PgRest(pg)
            }
            None => {
                info!(
                    target = "watch.store",
                    "no database configured, using in-memory store"
                );
                Store::Memory(MemoryStore::new())
            }
        }
    }

    /// Append one raw event. A second append with the same event id is a
    /// no-op reporting `inserted=false`, never an error.
    pub async fn append_event(&self, event: &StoredEvent) -> Result<AppendOutcome, StoreError> {
        match self {
            Store::Memory(store) => store.append_event(event).await,
            Store::PgRest(store) => store.append_event(event).await,
        }
    }

    /// Overwrite all derived fields for a canonical resource, stamping
    /// `last_updated` with the write time. Creates the row when absent.
    pub async fn upsert_preview(
        &self,
        resource: &str,
        fields: &PreviewFields,
    ) -> Result<PreviewRecord, StoreError> {
        let record = PreviewRecord {
            resource: resource.to_string(),
            fields: fields.clone(),
            last_updated: Utc::now(),
        };
        match self {
            Store::Memory(store) => store.upsert_preview(record).await,
            Store::PgRest(store) => store.upsert_preview(record).await,
        }
    }

    pub async fn get_preview(&self, resource: &str) -> Result<Option<PreviewRecord>, StoreError> {
        match self {
            Store::Memory(store) => store.get_preview(resource).await,
            Store::PgRest(store) => store.get_preview(resource).await,
        }
    }

    /// Newest event per distinct canonical resource within a topic,
    /// joined against the preview cache, newest first. `total` counts
    /// distinct canonical resources, not raw event rows.
    pub async fn list_topic(
        &self,
        topic: &str,
        limit: usize,
        offset: usize,
    ) -> Result<TopicPage, StoreError> {
        match self {
            Store::Memory(store) => store.list_topic(topic, limit, offset).await,
            Store::PgRest(store) => store.list_topic(topic, limit, offset).await,
        }
    }

    pub async fn topic_counts(&self) -> Result<BTreeMap<String, u64>, StoreError> {
        match self {
            Store::Memory(store) => store.topic_counts().await,
            Store::PgRest(store) => store.topic_counts().await,
        }
    }

    /// Canonical resources that ever arrived through the competitive
    /// view; the backfill replays the preview refresh over these.
    pub async fn competitive_resources(&self) -> Result<Vec<String>, StoreError> {
        match self {
            Store::Memory(store) => store.competitive_resources().await,
            Store::PgRest(store) => store.competitive_resources().await,
        }
    }
}

// ---------- in-memory backend ----------

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

#[derive(Default)]
struct MemoryInner {
    events: Vec<StoredEvent>,
    previews: HashMap<String, PreviewRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn append_event(&self, event: &StoredEvent) -> Result<AppendOutcome, StoreError> {
        let mut guard = self.inner.lock().await;
        if guard.events.iter().any(|held| held.event_id == event.event_id) {
            return Ok(AppendOutcome { inserted: false });
        }
        guard.events.push(event.clone());
        Ok(AppendOutcome { inserted: true })
    }

    async fn upsert_preview(&self, record: PreviewRecord) -> Result<PreviewRecord, StoreError> {
        let mut guard = self.inner.lock().await;
        guard
            .previews
            .insert(record.resource.clone(), record.clone());
        Ok(record)
    }

    async fn get_preview(&self, resource: &str) -> Result<Option<PreviewRecord>, StoreError> {
        let guard = self.inner.lock().await;
        Ok(guard.previews.get(resource).cloned())
    }

    async fn list_topic(
        &self,
        topic: &str,
        limit: usize,
        offset: usize,
    ) -> Result<TopicPage, StoreError> {
        let guard = self.inner.lock().await;
        let mut latest: HashMap<String, StoredEvent> = HashMap::new();
        for event in guard.events.iter().filter(|e| e.topic == topic) {
            latest
                .entry(event.canonical_resource.clone())
                .and_modify(|held| {
                    if event.received_at >= held.received_at {
                        *held = event.clone();
                    }
                })
                .or_insert_with(|| event.clone());
        }
        let total = latest.len() as u64;
        let mut rows: Vec<StoredEvent> = latest.into_values().collect();
        rows.sort_by(|a, b| b.received_at.cmp(&a.received_at));
        let events = rows
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|event| {
                let db_preview = guard.previews.get(&event.canonical_resource).cloned();
                ListedEvent { event, db_preview }
            })
            .collect();
        Ok(TopicPage { events, total })
    }

    async fn topic_counts(&self) -> Result<BTreeMap<String, u64>, StoreError> {
        let guard = self.inner.lock().await;
        let mut counts = BTreeMap::new();
        for event in &guard.events {
            *counts.entry(event.topic.clone()).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn competitive_resources(&self) -> Result<Vec<String>, StoreError> {
        let guard = self.inner.lock().await;
        let distinct: BTreeSet<String> = guard
            .events
            .iter()
            .filter(|event| normalize::is_competitive(&event.resource))
            .map(|event| event.canonical_resource.clone())
            .collect();
        Ok(distinct.into_iter().collect())
    }
}

// ---------- postgres-over-rest backend ----------

#[derive(Clone)]
pub struct PgRestStore {
    base_url: String,
    service_key: String,
    http: Client,
}

#[derive(Debug, Deserialize)]
struct TopicCountRow {
    topic: String,
    total: u64,
}

#[derive(Debug, Deserialize)]
struct TopicPageBody {
    events: Vec<ListedEvent>,
    total: u64,
}

impl PgRestStore {
    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("SUPABASE_URL").ok()?;
        let service_key = std::env::var("SUPABASE_SERVICE_KEY")
            .or_else(|_| std::env::var("SUPABASE_SERVICE_ROLE_KEY"))
            .ok()?;
        Some(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            service_key,
            http: build_client(),
        })
    }

    async fn append_event(&self, event: &StoredEvent) -> Result<AppendOutcome, StoreError> {
        let url = format!("{}/rest/v1/webhooks?on_conflict=event_id", self.base_url);
        let response = self
            .http
            .post(url)
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
            .header("Prefer", "resolution=ignore-duplicates,return=representation")
            .json(event)
            .send()
            .await
            .map_err(|err| StoreError::Request(err.to_string()))?;
        // ignore-duplicates returns an empty representation for a replay.
        let rows: Vec<StoredEvent> = decode(response).await?;
        Ok(AppendOutcome {
            inserted: !rows.is_empty(),
        })
    }

    async fn upsert_preview(&self, record: PreviewRecord) -> Result<PreviewRecord, StoreError> {
        let url = format!("{}/rest/v1/previews?on_conflict=resource", self.base_url);
        let response = self
            .http
            .post(url)
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
            .header("Prefer", "resolution=merge-duplicates,return=representation")
            .json(&record)
            .send()
            .await
            .map_err(|err| StoreError::Request(err.to_string()))?;
        let mut rows: Vec<PreviewRecord> = decode(response).await?;
        rows.pop()
            .ok_or_else(|| StoreError::Decode("upsert returned no row".to_string()))
    }

    async fn get_preview(&self, resource: &str) -> Result<Option<PreviewRecord>, StoreError> {
        let url = format!(
            "{}/rest/v1/previews?resource=eq.{}&limit=1",
            self.base_url,
            urlencoding::encode(resource)
        );
        let response = self
            .http
            .get(url)
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
            .send()
            .await
            .map_err(|err| StoreError::Request(err.to_string()))?;
        let mut rows: Vec<PreviewRecord> = decode(response).await?;
        Ok(rows.pop())
    }

    async fn list_topic(
        &self,
        topic: &str,
        limit: usize,
        offset: usize,
    ) -> Result<TopicPage, StoreError> {
        let body: TopicPageBody = self
            .rpc(
                "latest_events_by_topic",
                json!({ "p_topic": topic, "p_limit": limit, "p_offset": offset }),
            )
            .await?;
        Ok(TopicPage {
            events: body.events,
            total: body.total,
        })
    }

    async fn topic_counts(&self) -> Result<BTreeMap<String, u64>, StoreError> {
        let rows: Vec<TopicCountRow> = self.rpc("topic_counts", json!({})).await?;
        Ok(rows.into_iter().map(|row| (row.topic, row.total)).collect())
    }

    async fn competitive_resources(&self) -> Result<Vec<String>, StoreError> {
        self.rpc("competitive_resources", json!({})).await
    }

    async fn rpc<T: DeserializeOwned>(
        &self,
        function: &str,
        args: serde_json::Value,
    ) -> Result<T, StoreError> {
        let url = format!("{}/rest/v1/rpc/{function}", self.base_url);
        let response = self
            .http
            .post(url)
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
            .json(&args)
            .send()
            .await
            .map_err(|err| StoreError::Request(err.to_string()))?;
        decode(response).await
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, StoreError> {
    if !response.status().is_success() {
        return Err(StoreError::Status(response.status().as_u16()));
    }
    response
        .json()
        .await
        .map_err(|err| StoreError::Decode(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(id: &str, topic: &str, raw: &str) -> StoredEvent {
        StoredEvent {
            event_id: id.to_string(),
            topic: topic.to_string(),
            user_id: "123".to_string(),
            resource: raw.to_string(),
            canonical_resource: normalize::normalize(raw),
            payload: json!({ "_id": id, "topic": topic, "resource": raw }),
            received_at: Utc::now(),
        }
    }

    fn fields(title: &str) -> PreviewFields {
        PreviewFields {
            title: Some(title.to_string()),
            price: Some(100.0),
            currency: Some("ARS".to_string()),
            ..PreviewFields::default()
        }
    }

    #[tokio::test]
    async fn append_is_idempotent_on_event_id() {
        let store = Store::Memory(MemoryStore::new());
        let first = store
            .append_event(&event("abc", "items", "/items/MLA1"))
            .await
            .expect("append");
        let second = store
            .append_event(&event("abc", "items", "/items/MLA1"))
            .await
            .expect("replay append");
        assert!(first.inserted);
        assert!(!second.inserted);
        let page = store.list_topic("items", 10, 0).await.expect("list");
        assert_eq!(page.total, 1);
        assert_eq!(page.events.len(), 1);
    }

    #[tokio::test]
    async fn upsert_overwrites_and_advances_last_updated() {
        let store = Store::Memory(MemoryStore::new());
        let first = store
            .upsert_preview("/items/MLA1", &fields("old title"))
            .await
            .expect("first upsert");
        let second = store
            .upsert_preview("/items/MLA1", &fields("new title"))
            .await
            .expect("second upsert");
        assert!(second.last_updated >= first.last_updated);

        let held = store
            .get_preview("/items/MLA1")
            .await
            .expect("get")
            .expect("row present");
        assert_eq!(held.fields.title.as_deref(), Some("new title"));
    }

    #[tokio::test]
    async fn list_counts_distinct_canonical_resources() {
        let store = Store::Memory(MemoryStore::new());
        // Two raw variants of MLA1 plus one event for MLA2: two distinct
        // canonical resources regardless of raw row count.
        for (id, raw) in [
            ("e1", "/items/MLA1"),
            ("e2", "/items/MLA1/price_to_win"),
            ("e3", "/items/MLA2"),
        ] {
            store
                .append_event(&event(id, "items", raw))
                .await
                .expect("append");
        }
        let page = store.list_topic("items", 10, 0).await.expect("list");
        assert_eq!(page.total, 2);
        assert_eq!(page.events.len(), 2);
    }

    #[tokio::test]
    async fn list_paginates_and_keeps_total() {
        let store = Store::Memory(MemoryStore::new());
        for i in 0..5 {
            store
                .append_event(&event(
                    &format!("e{i}"),
                    "items",
                    &format!("/items/MLA{i}"),
                ))
                .await
                .expect("append");
        }
        let page = store.list_topic("items", 2, 2).await.expect("list");
        assert_eq!(page.total, 5);
        assert_eq!(page.events.len(), 2);
        let tail = store.list_topic("items", 2, 4).await.expect("list tail");
        assert_eq!(tail.events.len(), 1);
    }

    #[tokio::test]
    async fn missing_preview_joins_as_null_not_error() {
        let store = Store::Memory(MemoryStore::new());
        store
            .append_event(&event("e1", "items", "/items/MLA1"))
            .await
            .expect("append");
        let page = store.list_topic("items", 10, 0).await.expect("list");
        assert!(page.events[0].db_preview.is_none());
    }

    #[tokio::test]
    async fn join_matches_on_canonical_resource() {
        let store = Store::Memory(MemoryStore::new());
        store
            .append_event(&event("e1", "items", "/items/MLA1/price_to_win"))
            .await
            .expect("append");
        store
            .upsert_preview("/items/MLA1", &fields("joined"))
            .await
            .expect("upsert");
        let page = store.list_topic("items", 10, 0).await.expect("list");
        let preview = page.events[0].db_preview.as_ref().expect("joined preview");
        assert_eq!(preview.fields.title.as_deref(), Some("joined"));
    }

    #[tokio::test]
    async fn topic_counts_tally_raw_events() {
        let store = Store::Memory(MemoryStore::new());
        for (id, topic) in [("a", "items"), ("b", "items"), ("c", "orders_v2")] {
            store
                .append_event(&event(id, topic, "/items/MLA1"))
                .await
                .expect("append");
        }
        let counts = store.topic_counts().await.expect("counts");
        assert_eq!(counts.get("items"), Some(&2));
        assert_eq!(counts.get("orders_v2"), Some(&1));
    }

    #[tokio::test]
    async fn competitive_resources_are_distinct_and_canonical() {
        let store = Store::Memory(MemoryStore::new());
        for (id, raw) in [
            ("a", "/items/MLA1/price_to_win"),
            ("b", "/items/MLA1/price_to_win?v=2"),
            ("c", "/items/MLA2"),
        ] {
            store
                .append_event(&event(id, "items", raw))
                .await
                .expect("append");
        }
        let resources = store.competitive_resources().await.expect("resources");
        assert_eq!(resources, vec!["/items/MLA1".to_string()]);
    }
}
