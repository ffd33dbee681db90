//! Upstream fetches for item detail and catalog-competition state.

use crate::meli::auth::{AuthError, TokenCache};
use crate::meli::config::{API_ROOT, SITE_ROOT};
use crate::models::PreviewFields;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MeliError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("upstream request failed: {0}")]
    Request(String),
    #[error("upstream returned HTTP {0}")]
    Status(u16),
    #[error("unexpected upstream response shape: {0}")]
    Data(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ItemDetail {
    pub id: Option<String>,
    pub title: Option<String>,
    pub price: Option<f64>,
    pub currency_id: Option<String>,
    pub thumbnail: Option<String>,
    pub permalink: Option<String>,
    pub catalog_product_id: Option<String>,
    #[serde(default)]
    pub attributes: Vec<ItemAttribute>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ItemAttribute {
    pub id: Option<String>,
    pub value_name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PriceToWin {
    pub status: Option<String>,
    pub current_price: Option<f64>,
    pub catalog_product_id: Option<String>,
    pub winner: Option<CompetitionWinner>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompetitionWinner {
    pub item_id: Option<String>,
    pub price: Option<f64>,
}

/// Status reported when a competitive refresh was requested for an item
/// that is not part of any catalog entry. Distinct condition, not an error.
pub const NOT_CATALOG_LISTING: &str = "not_catalog_listing";

#[derive(Clone)]
pub struct MeliClient {
    http: Client,
    tokens: Arc<TokenCache>,
}

impl MeliClient {
    pub fn new(http: Client, tokens: Arc<TokenCache>) -> Self {
        Self { http, tokens }
    }

    /// Fetch the preview fields for a canonical item resource. Competitive
    /// resources get a second request against the price-to-win view, but
    /// only when the item belongs to a catalog entry.
    pub async fn fetch_preview(
        &self,
        canonical: &str,
        competitive: bool,
    ) -> Result<PreviewFields, MeliError> {
        let token = self.tokens.get().await?;
        let item: ItemDetail = self.get_json(canonical, &token).await?;

        if !competitive {
            return Ok(preview_from(&item, None));
        }
        if item.catalog_product_id.is_none() {
            let mut fields = preview_from(&item, None);
            fields.competitor_status = Some(NOT_CATALOG_LISTING.to_string());
            return Ok(fields);
        }

        let competition: PriceToWin = self
            .get_json(&format!("{canonical}/price_to_win"), &token)
            .await?;
        Ok(preview_from(&item, Some(&competition)))
    }

    /// Authenticated passthrough for an arbitrary marketplace resource.
    /// The upstream status code is forwarded to the caller verbatim.
    pub async fn fetch_raw(&self, resource: &str) -> Result<(u16, Value), MeliError> {
        let token = self.tokens.get().await?;
        let response = self
            .http
            .get(format!("{}{resource}", *API_ROOT))
            .bearer_auth(&token)
            .send()
            .await
            .map_err(|err| MeliError::Request(err.to_string()))?;
        let status = response.status().as_u16();
        let body: Value = response
            .json()
            .await
            .map_err(|err| MeliError::Data(err.to_string()))?;
        Ok((status, body))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        resource: &str,
        token: &str,
    ) -> Result<T, MeliError> {
        let response = self
            .http
            .get(format!("{}{resource}", *API_ROOT))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|err| MeliError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(MeliError::Status(response.status().as_u16()));
        }
        response
            .json()
            .await
            .map_err(|err| MeliError::Data(err.to_string()))
    }
}

fn preview_from(item: &ItemDetail, competition: Option<&PriceToWin>) -> PreviewFields {
    let catalog_product_id = item
        .catalog_product_id
        .clone()
        .or_else(|| competition.and_then(|c| c.catalog_product_id.clone()));
    let competitor_id = competition
        .and_then(|c| c.winner.as_ref())
        .and_then(|w| w.item_id.clone());
    let competitor_link = match (catalog_product_id.as_deref(), competitor_id.as_deref()) {
        (Some(catalog_id), Some(item_id)) => Some(competitor_link(catalog_id, item_id)),
        _ => None,
    };
    PreviewFields {
        title: item.title.clone(),
        price: competition
            .and_then(|c| c.current_price)
            .or(item.price),
        currency: item.currency_id.clone(),
        thumbnail: item.thumbnail.clone(),
        permalink: item.permalink.clone(),
        brand: brand_of(item),
        catalog_product_id,
        competitor_status: competition.and_then(|c| c.status.clone()),
        competitor_id,
        competitor_price: competition
            .and_then(|c| c.winner.as_ref())
            .and_then(|w| w.price),
        competitor_link,
    }
}

/// First attribute whose key is `BRAND`, when the item carries one.
fn brand_of(item: &ItemDetail) -> Option<String> {
    item.attributes
        .iter()
        .find(|attribute| attribute.id.as_deref() == Some("BRAND"))
        .and_then(|attribute| attribute.value_name.clone())
}

/// Catalog browsing URL filtered down to the competing listing.
fn competitor_link(catalog_product_id: &str, item_id: &str) -> String {
    format!(
        "{}/p/{}?pdp_filters=item_id:{}",
        *SITE_ROOT, catalog_product_id, item_id
    )
}
