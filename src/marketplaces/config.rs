use crate::models::Platform;
use once_cell::sync::Lazy;
use std::env;

pub static EBAY_ENV: Lazy<String> =
    Lazy::new(|| env::var("EBAY_ENV").unwrap_or_else(|_| "SANDBOX".to_string()));

pub static EBAY_ROOT: Lazy<String> = Lazy::new(|| {
    if EBAY_ENV.as_str().eq_ignore_ascii_case("PROD") {
        "https://api.ebay.com".to_string()
    } else {
        "https://api.sandbox.ebay.com".to_string()
    }
});

pub static EBAY_TOKEN_URL: Lazy<String> =
    Lazy::new(|| format!("{}/identity/v1/oauth2/token", *EBAY_ROOT));

pub static EBAY_CLIENT_ID: Lazy<String> =
    Lazy::new(|| env::var("EBAY_CLIENT_ID").unwrap_or_default());

pub static EBAY_CLIENT_SECRET: Lazy<String> =
    Lazy::new(|| env::var("EBAY_CLIENT_SECRET").unwrap_or_default());

pub static EBAY_DEFAULT_MARKETPLACE: Lazy<String> =
    Lazy::new(|| env::var("EBAY_MARKETPLACE_ID").unwrap_or_else(|_| "EBAY_US".to_string()));

pub static MERCARI_ROOT: Lazy<String> =
    Lazy::new(|| env::var("MERCARI_API_ROOT").unwrap_or_else(|_| "https://api.mercari.com".into()));

pub static MERCARI_TOKEN_URL: Lazy<String> =
    Lazy::new(|| format!("{}/v1/oauth/token", *MERCARI_ROOT));

pub static MERCARI_CLIENT_ID: Lazy<String> =
    Lazy::new(|| env::var("MERCARI_CLIENT_ID").unwrap_or_default());

pub static MERCARI_CLIENT_SECRET: Lazy<String> =
    Lazy::new(|| env::var("MERCARI_CLIENT_SECRET").unwrap_or_default());

/// OAuth endpoint + app credentials for one platform's token exchange.
#[derive(Debug, Clone)]
pub struct OauthConfig {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
}

impl OauthConfig {
    pub fn for_platform(platform: Platform) -> Self {
        match platform {
            Platform::Ebay => Self {
                token_url: EBAY_TOKEN_URL.clone(),
                client_id: EBAY_CLIENT_ID.clone(),
                client_secret: EBAY_CLIENT_SECRET.clone(),
            },
            Platform::Mercari => Self {
                token_url: MERCARI_TOKEN_URL.clone(),
                client_id: MERCARI_CLIENT_ID.clone(),
                client_secret: MERCARI_CLIENT_SECRET.clone(),
            },
        }
    }
}
