use crate::error::SyncError;
use crate::http::build_client;
use crate::marketplaces::config::OauthConfig;
use crate::models::{MarketplaceAccount, Platform};
use crate::store::{Store, StoreError};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

/// Tokens within this margin of expiry are refreshed before use, so a token
/// handed to a sync pass cannot expire mid-flight.
static REFRESH_MARGIN_MINS: Lazy<i64> = Lazy::new(|| {
    env::var("TOKEN_REFRESH_MARGIN_MINS")
        .ok()
        .and_then(|raw| raw.parse::<i64>().ok())
        .filter(|mins| *mins > 0)
        .unwrap_or(30)
});

#[derive(Debug, Clone)]
pub struct RefreshedToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

/// How a refresh attempt failed. `Rejected` means the platform refused the
/// refresh token itself (revoked, reused, descoped) and the account must be
/// reconnected; `Transient` covers outages and transport errors.
#[derive(Debug)]
pub enum RefreshError {
    Rejected(String),
    Transient(String),
}

#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(
        &self,
        platform: Platform,
        refresh_token: &str,
    ) -> Result<RefreshedToken, RefreshError>;
}

/// Exchanges refresh tokens at each platform's OAuth token endpoint.
pub struct HttpRefresher {
    http: Client,
}

impl HttpRefresher {
    pub fn new() -> Self {
        Self {
            http: build_client(),
        }
    }
}

impl Default for HttpRefresher {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
    refresh_token: Option<String>,
}

#[async_trait]
impl TokenRefresher for HttpRefresher {
    async fn refresh(
        &self,
        platform: Platform,
        refresh_token: &str,
    ) -> Result<RefreshedToken, RefreshError> {
        let oauth = OauthConfig::for_platform(platform);
        let basic = BASE64.encode(format!("{}:{}", oauth.client_id, oauth.client_secret));
        let response = self
            .http
            .post(&oauth.token_url)
            .header("Authorization", format!("Basic {basic}"))
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ])
            .send()
            .await
            .map_err(|err| RefreshError::Transient(err.to_string()))?;

        let status = response.status();
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(RefreshError::Rejected(format!("HTTP {status}: {body}")));
        }
        if !status.is_success() {
            return Err(RefreshError::Transient(format!("HTTP {status}")));
        }
        let payload: TokenResponse = response
            .json()
            .await
            .map_err(|err| RefreshError::Transient(err.to_string()))?;
        Ok(RefreshedToken {
            access_token: payload.access_token,
            refresh_token: payload.refresh_token,
            expires_at: Utc::now() + Duration::seconds(payload.expires_in),
        })
    }
}

/// Owns the credential lifecycle: hands out access tokens, refreshing them
/// ahead of expiry, and deactivates accounts whose refresh token is gone or
/// refused. Refreshes for the same account are serialized so two concurrent
/// passes cannot burn the same refresh token twice.
pub struct TokenManager {
    store: Store,
    refresher: Arc<dyn TokenRefresher>,
    margin: Duration,
    refresh_locks: Mutex<HashMap<(Uuid, Platform), Arc<Mutex<()>>>>,
}

impl TokenManager {
    pub fn new(store: Store, refresher: Arc<dyn TokenRefresher>) -> Self {
        Self::with_margin(store, refresher, Duration::minutes(*REFRESH_MARGIN_MINS))
    }

    pub fn with_margin(store: Store, refresher: Arc<dyn TokenRefresher>, margin: Duration) -> Self {
        Self {
            store,
            refresher,
            margin,
            refresh_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Returns an access token good for at least the refresh margin, or a
    /// fatal error telling the caller the account needs reconnecting.
    pub async fn ensure_valid_token(
        &self,
        user_id: Uuid,
        platform: Platform,
    ) -> Result<String, SyncError> {
        let account = self.active_account(user_id, platform).await?;
        if !self.needs_refresh(&account) {
            return Ok(account.access_token);
        }

        let lock = self.refresh_lock(user_id, platform).await;
        let _held = lock.lock().await;

        // Another caller may have refreshed while we waited on the lock.
        let account = self.active_account(user_id, platform).await?;
        if !self.needs_refresh(&account) {
            return Ok(account.access_token);
        }
        self.refresh_account(&account).await
    }

    fn needs_refresh(&self, account: &MarketplaceAccount) -> bool {
        account.expires_at - Utc::now() <= self.margin
    }

    async fn active_account(
        &self,
        user_id: Uuid,
        platform: Platform,
    ) -> Result<MarketplaceAccount, SyncError> {
        let account = match self.store.account(user_id, platform).await {
            Ok(account) => account,
            Err(StoreError::AccountNotFound { .. }) => {
                return Err(SyncError::NoActiveAccount { platform });
            }
            Err(err) => {
                return Err(SyncError::PlatformRequestFailed {
                    platform,
                    detail: err.to_string(),
                });
            }
        };
        if !account.connected || !account.active {
            return Err(SyncError::NoActiveAccount { platform });
        }
        Ok(account)
    }

    async fn refresh_account(&self, account: &MarketplaceAccount) -> Result<String, SyncError> {
        let platform = account.platform;
        let Some(refresh_token) = account.refresh_token.as_deref() else {
            // Nothing to refresh with; stop targeting this account until the
            // user reconnects.
            let _ = self
                .store
                .deactivate_account(account.user_id, platform)
                .await;
            warn!(
                target = "syndic.tokens",
                user_id = %account.user_id,
                platform = %platform,
                "no refresh token stored; account deactivated"
            );
            return Err(SyncError::NoRefreshToken { platform });
        };

        match self.refresher.refresh(platform, refresh_token).await {
            Ok(refreshed) => {
                let saved = self
                    .store
                    .save_token_pair(
                        account.user_id,
                        platform,
                        refreshed.access_token,
                        refreshed.refresh_token,
                        refreshed.expires_at,
                    )
                    .await
                    .map_err(|err| SyncError::RefreshFailed {
                        platform,
                        detail: err.to_string(),
                    })?;
                info!(
                    target = "syndic.tokens",
                    user_id = %account.user_id,
                    platform = %platform,
                    expires_at = %saved.expires_at,
                    "access token refreshed"
                );
                Ok(saved.access_token)
            }
            Err(RefreshError::Rejected(detail)) => {
                let _ = self
                    .store
                    .deactivate_account(account.user_id, platform)
                    .await;
                warn!(
                    target = "syndic.tokens",
                    user_id = %account.user_id,
                    platform = %platform,
                    detail = %detail,
                    "refresh token rejected; account deactivated"
                );
                Err(SyncError::RefreshFailed { platform, detail })
            }
            Err(RefreshError::Transient(detail)) => {
                warn!(
                    target = "syndic.tokens",
                    user_id = %account.user_id,
                    platform = %platform,
                    detail = %detail,
                    "token refresh failed transiently"
                );
                Err(SyncError::RefreshFailed { platform, detail })
            }
        }
    }

    async fn refresh_lock(&self, user_id: Uuid, platform: Platform) -> Arc<Mutex<()>> {
        let mut locks = self.refresh_locks.lock().await;
        locks
            .entry((user_id, platform))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
