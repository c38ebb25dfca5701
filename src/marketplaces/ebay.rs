use crate::http::build_client;
use crate::marketplaces::config::{EBAY_DEFAULT_MARKETPLACE, EBAY_ROOT};
use crate::marketplaces::{ListingSpec, Marketplace, PlatformError, SearchFilters};
use crate::models::{Comparable, Platform};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::warn;
use urlencoding::encode;

/// eBay Sell Inventory + Browse adapter. Offer ids are the external ids we
/// persist; a `409` on create is reconciled by SKU so create is idempotent.
pub struct EbayAdapter {
    http: Client,
}

impl EbayAdapter {
    pub fn new() -> Self {
        Self {
            http: build_client(),
        }
    }

    async fn create_offer(
        &self,
        access_token: &str,
        body: &OfferBody,
    ) -> Result<CreateOutcome, PlatformError> {
        let url = format!("{}/sell/inventory/v1/offer", *EBAY_ROOT);
        let response = self
            .http
            .post(url)
            .bearer_auth(access_token)
            .json(body)
            .send()
            .await
            .map_err(|err| PlatformError::Request(err.to_string()))?;
        if response.status() == StatusCode::CONFLICT {
            return Ok(CreateOutcome::AlreadyExists);
        }
        if !response.status().is_success() {
            return Err(classify(response).await);
        }
        let payload: OfferCreated = response
            .json()
            .await
            .map_err(|err| PlatformError::Request(err.to_string()))?;
        Ok(CreateOutcome::Created(payload.offer_id))
    }

    async fn publish_offer(&self, access_token: &str, offer_id: &str) -> Result<(), PlatformError> {
        let url = format!(
            "{}/sell/inventory/v1/offer/{}/publish",
            *EBAY_ROOT,
            encode(offer_id)
        );
        let response = self
            .http
            .post(url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|err| PlatformError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(classify(response).await);
        }
        Ok(())
    }

    async fn offer_id_for_sku(
        &self,
        access_token: &str,
        sku: &str,
    ) -> Result<Option<String>, PlatformError> {
        let url = format!("{}/sell/inventory/v1/offer", *EBAY_ROOT);
        let response = self
            .http
            .get(url)
            .bearer_auth(access_token)
            .query(&[("sku", sku)])
            .send()
            .await
            .map_err(|err| PlatformError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(classify(response).await);
        }
        let payload: OfferPage = response
            .json()
            .await
            .map_err(|err| PlatformError::Request(err.to_string()))?;
        let offers = payload.offers.unwrap_or_default();
        let candidate = offers
            .iter()
            .find(|offer| offer.marketplace_id.as_deref() == Some(EBAY_DEFAULT_MARKETPLACE.as_str()))
            .or_else(|| offers.first())
            .and_then(|offer| offer.offer_id.clone());
        Ok(candidate)
    }
}

impl Default for EbayAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Marketplace for EbayAdapter {
    fn platform(&self) -> Platform {
        Platform::Ebay
    }

    async fn create_listing(
        &self,
        access_token: &str,
        spec: &ListingSpec,
    ) -> Result<String, PlatformError> {
        let body = OfferBody::from_spec(spec);
        let offer_id = match self.create_offer(access_token, &body).await? {
            CreateOutcome::Created(id) => id,
            CreateOutcome::AlreadyExists => {
                // A previous pass created the offer but we never saw the id.
                let existing = self
                    .offer_id_for_sku(access_token, &spec.sku)
                    .await?
                    .ok_or_else(|| {
                        PlatformError::Request("offer exists but sku lookup found none".into())
                    })?;
                warn!(
                    target = "syndic.ebay",
                    sku = %spec.sku,
                    offer_id = %existing,
                    "reconciled existing offer during create"
                );
                self.update_listing(access_token, &existing, spec).await?;
                existing
            }
        };
        self.publish_offer(access_token, &offer_id).await?;
        Ok(offer_id)
    }

    async fn update_listing(
        &self,
        access_token: &str,
        external_id: &str,
        spec: &ListingSpec,
    ) -> Result<(), PlatformError> {
        let url = format!(
            "{}/sell/inventory/v1/offer/{}",
            *EBAY_ROOT,
            encode(external_id)
        );
        let response = self
            .http
            .put(url)
            .bearer_auth(access_token)
            .json(&OfferBody::from_spec(spec))
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
        _reason: &str,
    ) -> Result<(), PlatformError> {
        // eBay's withdraw endpoint takes no reason; the reason stays in our
        // local audit trail.
        let url = format!(
            "{}/sell/inventory/v1/offer/{}/withdraw",
            *EBAY_ROOT,
            encode(external_id)
        );
        let response = self
            .http
            .post(url)
            .bearer_auth(access_token)
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
        let url = format!("{}/buy/browse/v1/item_summary/search", *EBAY_ROOT);
        let limit = limit.clamp(1, 200).to_string();
        let mut params = vec![("q", query.to_string()), ("limit", limit)];
        if let Some(condition) = &filters.condition {
            params.push(("filter", format!("conditions:{{{}}}", condition_bucket(condition))));
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
        let payload: BrowsePage = response
            .json()
            .await
            .map_err(|err| PlatformError::Request(err.to_string()))?;
        Ok(payload
            .item_summaries
            .unwrap_or_default()
            .into_iter()
            .filter_map(summary_to_comparable)
            .collect())
    }
}

enum CreateOutcome {
    Created(String),
    AlreadyExists,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct OfferBody {
    sku: String,
    marketplace_id: String,
    format: &'static str,
    listing_description: String,
    pricing_summary: PricingSummary,
    available_quantity: i32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    image_urls: Vec<String>,
}

impl OfferBody {
    fn from_spec(spec: &ListingSpec) -> Self {
        Self {
            sku: spec.sku.clone(),
            marketplace_id: EBAY_DEFAULT_MARKETPLACE.clone(),
            format: "FIXED_PRICE",
            listing_description: spec.description.clone(),
            pricing_summary: PricingSummary {
                price: MoneyValue {
                    value: format!("{:.2}", spec.price),
                    currency: spec.currency.clone(),
                },
            },
            available_quantity: 1,
            image_urls: spec.photos.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct PricingSummary {
    price: MoneyValue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MoneyValue {
    value: String,
    currency: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OfferCreated {
    offer_id: String,
}

#[derive(Debug, Deserialize)]
struct OfferPage {
    offers: Option<Vec<OfferSummary>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OfferSummary {
    offer_id: Option<String>,
    marketplace_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BrowsePage {
    item_summaries: Option<Vec<ItemSummary>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ItemSummary {
    item_id: String,
    title: Option<String>,
    price: Option<MoneyValue>,
    condition: Option<String>,
    categories: Option<Vec<BrowseCategory>>,
    item_creation_date: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BrowseCategory {
    category_id: String,
}

fn summary_to_comparable(summary: ItemSummary) -> Option<Comparable> {
    let money = summary.price?;
    let price: f64 = money.value.trim().parse().ok()?;
    let observed_at = summary
        .item_creation_date
        .as_deref()
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);
    Some(Comparable {
        external_id: summary.item_id,
        platform: Platform::Ebay,
        title: summary.title,
        price,
        currency: money.currency,
        condition: summary.condition,
        category_id: summary
            .categories
            .and_then(|mut cats| cats.drain(..).next())
            .map(|cat| cat.category_id),
        observed_at,
    })
}

/// eBay's Browse filter only understands coarse buckets.
fn condition_bucket(condition: &str) -> &'static str {
    if condition.to_lowercase().contains("new") {
        "NEW"
    } else {
        "USED"
    }
}

async fn classify(response: reqwest::Response) -> PlatformError {
    let status = response.status();
    match status {
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            let body = response.text().await.unwrap_or_default();
            PlatformError::Rejected(reject_detail(status, &body))
        }
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => PlatformError::Unauthorized,
        StatusCode::NOT_FOUND => PlatformError::NotFound(format!("HTTP {status}")),
        StatusCode::TOO_MANY_REQUESTS => PlatformError::RateLimited,
        _ => PlatformError::Request(format!("HTTP {status}")),
    }
}

#[derive(Debug, Deserialize)]
struct EbayErrorBody {
    errors: Option<Vec<EbayErrorEntry>>,
}

#[derive(Debug, Deserialize)]
struct EbayErrorEntry {
    message: Option<String>,
}

fn reject_detail(status: StatusCode, body: &str) -> String {
    if let Ok(parsed) = serde_json::from_str::<EbayErrorBody>(body)
        && let Some(message) = parsed
            .errors
            .and_then(|entries| entries.into_iter().find_map(|entry| entry.message))
    {
        return message;
    }
    format!("HTTP {status}")
}
