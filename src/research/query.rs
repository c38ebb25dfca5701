use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z0-9][A-Za-z0-9-]*").expect("token regex"));
static YEAR: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(19|20)\d{2}$").expect("year regex"));
static YEAR_RANGE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(19|20)\d{2}-(19|20)?\d{2}$").expect("year range regex"));

/// Brands recognized without a caller hint. Lowercase; matched per token.
const KNOWN_BRANDS: &[&str] = &[
    "apple", "bosch", "canon", "dell", "dewalt", "dyson", "fender", "garmin", "gibson", "hilti",
    "honda", "kitchenaid", "lego", "lenovo", "makita", "milwaukee", "nikon", "nintendo", "pioneer",
    "ridgid", "ryobi", "samsung", "sony", "stihl", "technics", "toro", "yamaha",
];

const STOPWORDS: &[&str] = &[
    "a", "and", "for", "in", "new", "of", "or", "the", "used", "with",
];

/// Structured view of a free-text item query: candidate part numbers, brand,
/// model, year and product type, feeding the fallback search tiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryAnalysis {
    pub original: String,
    pub part_numbers: Vec<String>,
    pub brand: Option<String>,
    pub model: Option<String>,
    pub year: Option<String>,
    pub product_type: Option<String>,
}

pub fn analyze(query: &str, brand_hint: Option<&str>) -> QueryAnalysis {
    let tokens: Vec<String> = TOKEN
        .find_iter(query)
        .map(|token| token.as_str().to_string())
        .collect();

    let year = tokens.iter().find(|token| YEAR.is_match(token)).cloned();

    let part_numbers: Vec<String> = tokens
        .iter()
        .filter(|token| is_part_number(token))
        .cloned()
        .collect();

    let brand_index = tokens
        .iter()
        .position(|token| KNOWN_BRANDS.contains(&token.to_lowercase().as_str()));
    let brand = brand_hint
        .map(|hint| hint.trim().to_string())
        .filter(|hint| !hint.is_empty())
        .or_else(|| brand_index.map(|index| tokens[index].clone()));

    // The token right after the brand is usually the model; otherwise the
    // first part-number-like token stands in.
    let model = brand_index
        .and_then(|index| tokens.get(index + 1))
        .filter(|token| token.chars().any(|c| c.is_ascii_digit()) && !YEAR.is_match(token))
        .cloned()
        .or_else(|| part_numbers.first().cloned());

    let product_type = tokens
        .iter()
        .rev()
        .find(|token| {
            let lower = token.to_lowercase();
            token.chars().all(|c| c.is_ascii_alphabetic())
                && !STOPWORDS.contains(&lower.as_str())
                && !KNOWN_BRANDS.contains(&lower.as_str())
        })
        .map(|token| token.to_lowercase());

    QueryAnalysis {
        original: query.trim().to_string(),
        part_numbers,
        brand,
        model,
        year,
        product_type,
    }
}

/// Part numbers mix letters and digits (or are long digit runs) and are
/// never year or year-range tokens.
fn is_part_number(token: &str) -> bool {
    if YEAR.is_match(token) || YEAR_RANGE.is_match(token) {
        return false;
    }
    let has_digit = token.chars().any(|c| c.is_ascii_digit());
    if !has_digit {
        return false;
    }
    let has_letter = token.chars().any(|c| c.is_ascii_alphabetic());
    if has_letter {
        token.len() >= 4
    } else {
        token.chars().filter(|c| c.is_ascii_digit()).count() >= 5
    }
}
