use crate::models::{Comparable, Confidence, PriceRange, SuggestedPrice};
use std::collections::HashMap;

/// Reduces a merged comparable set to one suggested price. Never fails: an
/// empty or worthless sample yields price 0 with low confidence and a reason.
pub fn suggest(comparables: &[Comparable], fallback_currency: &str) -> SuggestedPrice {
    let mut prices: Vec<f64> = comparables
        .iter()
        .map(|comparable| comparable.price)
        .filter(|price| price.is_finite() && *price > 0.0)
        .collect();
    prices.sort_by(|a, b| a.total_cmp(b));

    let currency = dominant_currency(comparables).unwrap_or_else(|| fallback_currency.to_string());
    let dominant_category_id = dominant_category(comparables);

    if prices.is_empty() {
        return SuggestedPrice {
            price: 0.0,
            currency,
            confidence: Confidence::Low,
            sample_size: 0,
            median: None,
            mean: None,
            price_range: None,
            discount_applied: None,
            dominant_category_id,
            reason: Some("no valid comparable prices found".into()),
        };
    }

    let n = prices.len();
    let mean = prices.iter().sum::<f64>() / n as f64;
    let median = if n % 2 == 1 {
        prices[n / 2]
    } else {
        (prices[n / 2 - 1] + prices[n / 2]) / 2.0
    };
    let variance = prices
        .iter()
        .map(|price| (price - mean).powi(2))
        .sum::<f64>()
        / n as f64;
    let cv = if mean > 0.0 { variance.sqrt() / mean } else { 0.0 };

    // Half median, half mean: the median resists outliers, the mean keeps
    // the sample's weight. The competitive discount widens as the sample
    // disagrees with itself.
    let blended = 0.5 * median + 0.5 * mean;
    let discount = competitive_discount(cv);
    let price = round2(blended * (1.0 - discount));

    let confidence = if n >= 10 && cv < 0.3 {
        Confidence::High
    } else if n >= 5 || (n >= 10 && cv < 0.5) {
        Confidence::Medium
    } else {
        Confidence::Low
    };

    SuggestedPrice {
        price,
        currency,
        confidence,
        sample_size: n,
        median: Some(round2(median)),
        mean: Some(round2(mean)),
        price_range: Some(PriceRange {
            low: prices[0],
            high: prices[n - 1],
        }),
        discount_applied: Some(discount),
        dominant_category_id,
        reason: None,
    }
}

fn competitive_discount(cv: f64) -> f64 {
    if cv < 0.15 {
        0.01
    } else if cv < 0.3 {
        0.02
    } else if cv < 0.5 {
        0.03
    } else {
        0.04
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn dominant_currency(comparables: &[Comparable]) -> Option<String> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for comparable in comparables {
        *counts.entry(comparable.currency.as_str()).or_default() += 1;
    }
    counts
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(a.0)))
        .map(|(currency, _)| currency.to_string())
}

/// Most frequent external category, ties broken lexicographically so the
/// answer is stable across runs.
fn dominant_category(comparables: &[Comparable]) -> Option<String> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for category in comparables
        .iter()
        .filter_map(|comparable| comparable.category_id.as_deref())
    {
        *counts.entry(category).or_default() += 1;
    }
    counts
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(a.0)))
        .map(|(category, _)| category.to_string())
}
