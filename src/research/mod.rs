pub mod aggregate;
pub mod query;

use crate::error::SyncError;
use crate::marketplaces::{AdapterRegistry, SearchFilters};
use crate::models::{Comparable, Platform, SuggestedPrice};
use crate::sync::platform_call_timeout;
use crate::tokens::TokenManager;
use futures_util::future::join_all;
use once_cell::sync::Lazy;
use query::QueryAnalysis;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

static RESEARCH_RESULT_LIMIT: Lazy<usize> = Lazy::new(|| {
    env::var("RESEARCH_RESULT_LIMIT")
        .ok()
        .and_then(|raw| raw.parse::<usize>().ok())
        .filter(|limit| *limit > 0)
        .unwrap_or(50)
});

/// Condition agreement is worth a fixed score bump on top of tier weights.
const CONDITION_BONUS: f64 = 0.25;

#[derive(Debug, Clone, Deserialize)]
pub struct ResearchRequest {
    pub query: String,
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub platform: Option<Platform>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl ResearchRequest {
    pub fn effective_platform(&self) -> Platform {
        self.platform.unwrap_or(Platform::Ebay)
    }

    pub fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(*RESEARCH_RESULT_LIMIT).clamp(1, 200)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchReport {
    pub suggestion: SuggestedPrice,
    pub analysis: QueryAnalysis,
    pub tiers: Vec<TierOutcome>,
    pub comparables: Vec<Comparable>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierOutcome {
    pub label: String,
    pub query: String,
    pub weight: f64,
    pub result_count: usize,
    pub failed: bool,
}

struct SearchTier {
    label: &'static str,
    query: String,
    weight: f64,
}

/// Ordered most-specific-first. Tiers whose query collapses to an earlier
/// one are dropped.
fn build_tiers(analysis: &QueryAnalysis) -> Vec<SearchTier> {
    let mut tiers = vec![SearchTier {
        label: "literal",
        query: analysis.original.clone(),
        weight: 1.0,
    }];
    let mut push_unique = |tiers: &mut Vec<SearchTier>, label, query: String, weight| {
        let normalized = query.trim().to_lowercase();
        if normalized.is_empty() {
            return;
        }
        if tiers
            .iter()
            .any(|tier: &SearchTier| tier.query.trim().to_lowercase() == normalized)
        {
            return;
        }
        tiers.push(SearchTier {
            label,
            query,
            weight,
        });
    };

    if let (Some(brand), Some(part)) = (&analysis.brand, analysis.part_numbers.first()) {
        push_unique(&mut tiers, "brand_part", format!("{brand} {part}"), 0.9);
    }
    if let Some(part) = analysis.part_numbers.first() {
        push_unique(&mut tiers, "part", part.clone(), 0.75);
    }
    if let Some(brand) = &analysis.brand {
        let mut pieces = vec![brand.clone()];
        if let Some(model) = &analysis.model {
            pieces.push(model.clone());
        }
        if let Some(product_type) = &analysis.product_type {
            pieces.push(product_type.clone());
        }
        if pieces.len() > 1 {
            push_unique(&mut tiers, "brand_model_type", pieces.join(" "), 0.6);
        }
    }
    tiers
}

fn condition_bucket(condition: &str) -> Option<&'static str> {
    let lower = condition.to_lowercase();
    if lower.contains("new") {
        Some("new")
    } else if lower.contains("used") || lower.contains("good") || lower.contains("fair") {
        Some("used")
    } else {
        None
    }
}

fn conditions_match(requested: &str, observed: Option<&str>) -> bool {
    match (condition_bucket(requested), observed.and_then(condition_bucket)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// Derives fuzzy search tiers from a free-text query, fans them out against
/// one marketplace's search API, and reduces the merged comparables to a
/// suggested price with a confidence grade.
pub struct PriceResearcher {
    adapters: AdapterRegistry,
    tokens: Arc<TokenManager>,
}

impl PriceResearcher {
    pub fn new(adapters: AdapterRegistry, tokens: Arc<TokenManager>) -> Self {
        Self { adapters, tokens }
    }

    pub async fn research(
        &self,
        user_id: Uuid,
        request: &ResearchRequest,
    ) -> Result<ResearchReport, SyncError> {
        let started = std::time::Instant::now();
        let platform = request.effective_platform();
        let limit = request.effective_limit();
        let token = self.tokens.ensure_valid_token(user_id, platform).await?;
        let adapter = self.adapters.get(platform)?;

        let analysis = query::analyze(&request.query, request.brand.as_deref());
        let tiers = build_tiers(&analysis);
        let filters = SearchFilters {
            condition: request.condition.clone(),
        };

        let searches = tiers.iter().map(|tier| {
            let token = token.as_str();
            let adapter = adapter.clone();
            let filters = &filters;
            async move {
                match timeout(
                    platform_call_timeout(),
                    adapter.search_comparables(token, &tier.query, filters, limit),
                )
                .await
                {
                    Ok(Ok(results)) => (tier, results, false),
                    Ok(Err(err)) => {
                        warn!(
                            target = "syndic.research",
                            tier = tier.label,
                            query = %tier.query,
                            error = %err,
                            "search tier failed; degrading to empty"
                        );
                        (tier, Vec::new(), true)
                    }
                    Err(_) => {
                        warn!(
                            target = "syndic.research",
                            tier = tier.label,
                            query = %tier.query,
                            "search tier timed out; degrading to empty"
                        );
                        (tier, Vec::new(), true)
                    }
                }
            }
        });
        let settled = join_all(searches).await;

        let mut tier_outcomes = Vec::with_capacity(settled.len());
        let mut merged: HashMap<String, (Comparable, f64)> = HashMap::new();
        for (tier, results, failed) in settled {
            tier_outcomes.push(TierOutcome {
                label: tier.label.to_string(),
                query: tier.query.clone(),
                weight: tier.weight,
                result_count: results.len(),
                failed,
            });
            for comparable in results {
                match merged.get_mut(&comparable.external_id) {
                    Some((_, score)) => *score += tier.weight,
                    None => {
                        let mut score = tier.weight;
                        if let Some(requested) = &request.condition
                            && conditions_match(requested, comparable.condition.as_deref())
                        {
                            score += CONDITION_BONUS;
                        }
                        merged.insert(comparable.external_id.clone(), (comparable, score));
                    }
                }
            }
        }

        let mut ranked: Vec<(Comparable, f64)> = merged.into_values().collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.external_id.cmp(&b.0.external_id)));
        ranked.truncate(limit);
        let comparables: Vec<Comparable> = ranked.into_iter().map(|(c, _)| c).collect();

        debug!(
            target = "syndic.research",
            user_id = %user_id,
            platform = %platform,
            tiers = tier_outcomes.len(),
            merged = comparables.len(),
            "research pass merged comparables"
        );

        crate::metrics::stage_elapsed("research_pass", started.elapsed().as_millis());
        let suggestion = aggregate::suggest(&comparables, "USD");
        Ok(ResearchReport {
            suggestion,
            analysis,
            tiers: tier_outcomes,
            comparables,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::models::Confidence;
    use crate::store::Store;
    use crate::testutil::{self, FakeMarketplace, StaticRefresher};

    struct Harness {
        researcher: PriceResearcher,
        ebay: Arc<FakeMarketplace>,
        mercari: Arc<FakeMarketplace>,
        user_id: Uuid,
    }

    async fn harness() -> Harness {
        let store = Store::new(EventBus::default());
        let user_id = Uuid::new_v4();
        store
            .put_account(testutil::account(user_id, Platform::Ebay))
            .await;
        store
            .put_account(testutil::account(user_id, Platform::Mercari))
            .await;
        let ebay = Arc::new(FakeMarketplace::new(Platform::Ebay));
        let mercari = Arc::new(FakeMarketplace::new(Platform::Mercari));
        let mut adapters = AdapterRegistry::new();
        adapters.register(ebay.clone());
        adapters.register(mercari.clone());
        let tokens = Arc::new(TokenManager::new(store, Arc::new(StaticRefresher)));
        Harness {
            researcher: PriceResearcher::new(adapters, tokens),
            ebay,
            mercari,
            user_id,
        }
    }

    fn request(query: &str) -> ResearchRequest {
        ResearchRequest {
            query: query.into(),
            brand: None,
            condition: None,
            platform: None,
            limit: None,
        }
    }

    #[test]
    fn tiers_run_most_specific_first_without_duplicates() {
        let analysis = query::analyze("DeWalt DCD791 20V drill driver", None);
        let tiers = build_tiers(&analysis);
        let labels: Vec<&str> = tiers.iter().map(|tier| tier.label).collect();
        assert_eq!(
            labels,
            vec!["literal", "brand_part", "part", "brand_model_type"]
        );
        assert_eq!(tiers[1].query, "DeWalt DCD791");
        assert_eq!(tiers[2].query, "DCD791");
        assert!(tiers.windows(2).all(|pair| pair[0].weight > pair[1].weight));
    }

    #[test]
    fn bare_query_builds_only_the_literal_tier() {
        let analysis = query::analyze("vintage leather jacket", None);
        let tiers = build_tiers(&analysis);
        assert_eq!(tiers.len(), 1);
        assert_eq!(tiers[0].label, "literal");
    }

    #[tokio::test]
    async fn comparables_seen_by_more_tiers_rank_higher() {
        let h = harness().await;
        let query_text = "DeWalt DCD791 20V drill driver";
        let analysis = query::analyze(query_text, None);
        let tiers = build_tiers(&analysis);

        // "both" appears in the literal and part tiers; "once" only in part.
        h.ebay.stub_search(
            &tiers[0].query,
            vec![testutil::comparable("both", 80.0)],
        );
        h.ebay.stub_search(
            &tiers[2].query,
            vec![
                testutil::comparable("both", 80.0),
                testutil::comparable("once", 70.0),
            ],
        );

        let report = h
            .researcher
            .research(h.user_id, &request(query_text))
            .await
            .expect("report");
        assert_eq!(report.comparables.len(), 2);
        assert_eq!(report.comparables[0].external_id, "both");
        assert_eq!(report.comparables[1].external_id, "once");
        assert_eq!(report.suggestion.sample_size, 2);
    }

    #[tokio::test]
    async fn failing_tier_degrades_to_empty_and_others_still_count() {
        let h = harness().await;
        let query_text = "Makita XDT13 18V impact driver";
        let analysis = query::analyze(query_text, None);
        let tiers = build_tiers(&analysis);

        h.ebay.fail_query(&tiers[0].query);
        h.ebay.stub_search(
            &tiers[1].query,
            vec![
                testutil::comparable("a", 60.0),
                testutil::comparable("b", 64.0),
            ],
        );

        let report = h
            .researcher
            .research(h.user_id, &request(query_text))
            .await
            .expect("report");
        let literal = report
            .tiers
            .iter()
            .find(|tier| tier.label == "literal")
            .expect("literal tier");
        assert!(literal.failed);
        assert_eq!(report.suggestion.sample_size, 2);
    }

    #[tokio::test]
    async fn condition_match_outranks_equal_tier_weight() {
        let h = harness().await;
        let query_text = "vintage leather jacket";
        let mut matching = testutil::comparable("match", 90.0);
        matching.condition = Some("USED".into());
        let mut other = testutil::comparable("aother", 95.0);
        other.condition = Some("NEW".into());
        h.ebay.stub_search(query_text, vec![other, matching]);

        let mut req = request(query_text);
        req.condition = Some("used_good".into());
        let report = h
            .researcher
            .research(h.user_id, &req)
            .await
            .expect("report");
        assert_eq!(report.comparables[0].external_id, "match");
    }

    #[tokio::test]
    async fn empty_results_degrade_to_zero_price_low_confidence() {
        let h = harness().await;
        let report = h
            .researcher
            .research(h.user_id, &request("completely unknown widget"))
            .await
            .expect("report");
        assert_eq!(report.suggestion.price, 0.0);
        assert_eq!(report.suggestion.confidence, Confidence::Low);
        assert!(report.suggestion.reason.is_some());
        assert!(report.comparables.is_empty());
    }

    #[tokio::test]
    async fn research_targets_the_requested_platform_only() {
        let h = harness().await;
        let query_text = "vintage leather jacket";
        h.mercari
            .stub_search(query_text, vec![testutil::comparable("m", 40.0)]);

        let mut req = request(query_text);
        req.platform = Some(Platform::Mercari);
        let report = h
            .researcher
            .research(h.user_id, &req)
            .await
            .expect("report");
        assert_eq!(report.suggestion.sample_size, 1);
        assert!(h.ebay.search_queries.lock().expect("lock").is_empty());
        assert!(!h.mercari.search_queries.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn missing_account_surfaces_no_active_account() {
        let h = harness().await;
        let err = h
            .researcher
            .research(Uuid::new_v4(), &request("anything"))
            .await
            .expect_err("no account");
        assert!(matches!(err, SyncError::NoActiveAccount { .. }));
    }
}
