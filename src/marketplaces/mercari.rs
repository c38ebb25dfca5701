use crate::http::build_client;
use crate::marketplaces::config::MERCARI_ROOT;
use crate::marketplaces::{ListingSpec, Marketplace, PlatformError, SearchFilters};
use crate::models::{Comparable, Platform};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use urlencoding::encode;

/// Mercari adapter. The wire format differs from eBay in every way that
/// matters: prices are integer cents, timestamps are epoch seconds, and
/// errors arrive as a flat `{code, message}` envelope.
pub struct MercariAdapter {
    http: Client,
}

impl MercariAdapter {
    pub fn new() -> Self {
        Self {
            http: build_client(),
        }
    }
}

impl Default for MercariAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Marketplace for MercariAdapter {
    fn platform(&self) -> Platform {
        Platform::Mercari
    }

    async fn create_listing(
        &self,
        access_token: &str,
        spec: &ListingSpec,
    ) -> Result<String, PlatformError> {
        let url = format!("{}/v1/listings", *MERCARI_ROOT);
        let response = self
            .http
            .post(url)
            .bearer_auth(access_token)
            .json(&ListingBody::from_spec(spec))
            .send()
            .await
            .map_err(|err| PlatformError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(classify(response).await);
        }
        let payload: ListingCreated = response
            .json()
            .await
            .map_err(|err| PlatformError::Request(err.to_string()))?;
        Ok(payload.id)
    }

    async fn update_listing(
        &self,
        access_token: &str,
        external_id: &str,
        spec: &ListingSpec,
    ) -> Result<(), PlatformError> {
        let url = format!("{}/v1/listings/{}", *MERCARI_ROOT, encode(external_id));
        let response = self
            .http
            .put(url)
            .bearer_auth(access_token)
            .json(&ListingBody::from_spec(spec))
            .send()
            .await
            .map_err(|err| PlatformError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(classify(response).await);
        }
        Ok(())
    }

    async fn end_listing(
        &self,
        access_token: &str,
        external_id: &str,
        reason: &str,
    ) -> Result<(), PlatformError> {
        let url = format!(
            "{}/v1/listings/{}/cancel",
            *MERCARI_ROOT,
            encode(external_id)
        );
        let response = self
            .http
            .post(url)
            .bearer_auth(access_token)
            .json(&CancelBody { reason })
            .send()
            .await
            .map_err(|err| PlatformError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(classify(response).await);
        }
        Ok(())
    }

    async fn search_comparables(
        &self,
        access_token: &str,
        query: &str,
        filters: &SearchFilters,
        limit: usize,
    ) -> Result<Vec<Comparable>, PlatformError> {
        let url = format!("{}/v1/search", *MERCARI_ROOT);
        let limit = limit.clamp(1, 120).to_string();
        let mut params = vec![("keyword", query.to_string()), ("limit", limit)];
        if let Some(condition) = &filters.condition {
            params.push(("item_condition", condition.clone()));
        }
        let response = self
            .http
            .get(url)
            .bearer_auth(access_token)
            .query(&params)
            .send()
            .await
            .map_err(|err| PlatformError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(classify(response).await);
        }
        let payload: SearchPage = response
            .json()
            .await
            .map_err(|err| PlatformError::Request(err.to_string()))?;
        Ok(payload
            .items
            .unwrap_or_default()
            .into_iter()
            .map(item_to_comparable)
            .collect())
    }
}

#[derive(Debug, Clone, Serialize)]
struct ListingBody {
    sku: String,
    title: String,
    description: String,
    price_cents: i64,
    currency: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    condition: Option<String>,
    photo_urls: Vec<String>,
}

impl ListingBody {
    fn from_spec(spec: &ListingSpec) -> Self {
        Self {
            sku: spec.sku.clone(),
            title: spec.title.clone(),
            description: spec.description.clone(),
            price_cents: to_cents(spec.price),
            currency: spec.currency.clone(),
            condition: spec.condition.clone(),
            photo_urls: spec.photos.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct CancelBody<'a> {
    reason: &'a str,
}

#[derive(Debug, Deserialize)]
struct ListingCreated {
    id: String,
}

#[derive(Debug, Deserialize)]
struct SearchPage {
    items: Option<Vec<SearchItem>>,
}

#[derive(Debug, Deserialize)]
struct SearchItem {
    id: String,
    name: Option<String>,
    price_cents: i64,
    #[serde(default = "default_currency")]
    currency: String,
    item_condition: Option<String>,
    category_id: Option<String>,
    updated_epoch: Option<i64>,
}

fn default_currency() -> String {
    "USD".to_string()
}

fn item_to_comparable(item: SearchItem) -> Comparable {
    let observed_at = item
        .updated_epoch
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        .unwrap_or_else(Utc::now);
    Comparable {
        external_id: item.id,
        platform: Platform::Mercari,
        title: item.name,
        price: item.price_cents as f64 / 100.0,
        currency: item.currency,
        condition: item.item_condition,
        category_id: item.category_id,
        observed_at,
    }
}

fn to_cents(price: f64) -> i64 {
    (price * 100.0).round() as i64
}

#[derive(Debug, Deserialize)]
struct MercariErrorBody {
    message: Option<String>,
}

async fn classify(response: reqwest::Response) -> PlatformError {
    let status = response.status();
    let message = response
        .text()
        .await
        .ok()
        .and_then(|body| serde_json::from_str::<MercariErrorBody>(&body).ok())
        .and_then(|parsed| parsed.message)
        .unwrap_or_else(|| format!("HTTP {status}"));
    match status {
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            PlatformError::Rejected(message)
        }
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => PlatformError::Unauthorized,
        StatusCode::NOT_FOUND => PlatformError::NotFound(message),
        StatusCode::TOO_MANY_REQUESTS => PlatformError::RateLimited,
        _ => PlatformError::Request(message),
    }
}
