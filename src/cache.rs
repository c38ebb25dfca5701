use crate::models::Platform;
use crate::research::{ResearchReport, ResearchRequest};
use redis::AsyncCommands;
use urlencoding::encode;

/// Research results are seller-independent, so the cache key is built only
/// from the normalized request.
pub fn research_cache_key(platform: Platform, request: &ResearchRequest, limit: usize) -> String {
    let query = request.query.trim().to_lowercase();
    let brand = request
        .brand
        .as_deref()
        .map(|b| b.trim().to_lowercase())
        .unwrap_or_default();
    let condition = request
        .condition
        .as_deref()
        .map(|c| c.trim().to_lowercase())
        .unwrap_or_default();
    format!(
        "syndic:research:v1:{}:{}:{}:{}:{}",
        platform.code().to_lowercase(),
        encode(&query),
        encode(&brand),
        encode(&condition),
        limit
    )
}

pub async fn redis_get(client: &redis::Client, key: &str) -> Option<ResearchReport> {
    let mut conn = match client.get_multiplexed_async_connection().await {
        Ok(c) => c,
        Err(_) => return None,
    };
    let s: Option<String> = conn.get(key).await.ok();
    s.and_then(|v| serde_json::from_str(&v).ok())
}

pub async fn redis_set(client: &redis::Client, key: &str, value: &ResearchReport, ttl_secs: u64) {
    if let Ok(mut conn) = client.get_multiplexed_async_connection().await
        && let Ok(json) = serde_json::to_string(value)
    {
        let _: Result<(), _> = conn.set_ex(key, json, ttl_secs).await;
    }
}

pub fn cache_ttl_from_env() -> u64 {
    std::env::var("RESEARCH_CACHE_TTL_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(900)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(query: &str, condition: Option<&str>) -> ResearchRequest {
        ResearchRequest {
            query: query.into(),
            brand: None,
            condition: condition.map(str::to_string),
            platform: None,
            limit: None,
        }
    }

    #[test]
    fn keys_normalize_case_and_whitespace() {
        let a = research_cache_key(Platform::Ebay, &request("  DeWalt DCD791 ", None), 50);
        let b = research_cache_key(Platform::Ebay, &request("dewalt dcd791", None), 50);
        assert_eq!(a, b);
    }

    #[test]
    fn keys_differ_per_platform_condition_and_limit() {
        let base = research_cache_key(Platform::Ebay, &request("drill", None), 50);
        assert_ne!(
            base,
            research_cache_key(Platform::Mercari, &request("drill", None), 50)
        );
        assert_ne!(
            base,
            research_cache_key(Platform::Ebay, &request("drill", Some("used")), 50)
        );
        assert_ne!(
            base,
            research_cache_key(Platform::Ebay, &request("drill", None), 10)
        );
    }

    #[test]
    fn keys_are_redis_safe() {
        let key = research_cache_key(
            Platform::Ebay,
            &request("weird: query/with spaces?", None),
            25,
        );
        assert!(!key.contains(' '));
        assert!(key.starts_with("syndic:research:v1:ebay:"));
    }
}
