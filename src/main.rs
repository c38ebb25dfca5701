mod auth;
mod cache;
mod conflict;
mod error;
mod events;
mod http;
mod jobs;
mod marketplaces;
mod metrics;
mod models;
mod research;
mod store;
mod sync;
#[cfg(test)]
mod testutil;
mod tokens;

use auth::{AuthState, SellerContext, require_api_auth};
use axum::{
    Json, Router,
    extract::{Extension, Path, State},
    http::StatusCode,
    middleware,
    response::{
        IntoResponse, Response,
        sse::{Event as SseEvent, KeepAlive, Sse},
    },
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use conflict::ConflictResolver;
use error::{ErrorKind, SyncError};
use marketplaces::{AdapterRegistry, ListingSpec};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{
    ApiError, Listing, ListingStatus, MarketplaceAccount, Platform, PlatformListing, SyncReport,
};
use research::{PriceResearcher, ResearchReport, ResearchRequest};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{convert::Infallible, net::SocketAddr, sync::Arc};
use store::{Store, StoreError};
use sync::SyncEngine;
use tokens::{HttpRefresher, TokenManager};
use tokio::sync::broadcast;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};
use uuid::Uuid;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "syndic.api", "server crashed: {err}");
    }
}

async fn run() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let auth_state = AuthState::from_env();
    let store = Store::new(events::EventBus::default());
    let adapters = AdapterRegistry::production();
    let tokens = Arc::new(TokenManager::new(
        store.clone(),
        Arc::new(HttpRefresher::new()),
    ));
    let resolver = ConflictResolver::new(store.clone(), adapters.clone(), tokens.clone());
    let engine = Arc::new(SyncEngine::new(
        store.clone(),
        adapters.clone(),
        tokens.clone(),
        resolver,
    ));
    let researcher = Arc::new(PriceResearcher::new(adapters, tokens));
    let (queue, _worker) = jobs::SyncJobQueue::spawn(engine.clone());

    let openapi: serde_json::Value = serde_yaml::from_str(include_str!("../docs/openapi.yaml"))
        .unwrap_or(serde_json::json!({"openapi": "3.0.3"}));
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("prom recorder");
    let redis = std::env::var("REDIS_URL")
        .ok()
        .and_then(|u| redis::Client::open(u).ok());

    let state = AppState {
        store,
        engine,
        researcher,
        queue,
        openapi: Arc::new(openapi),
        prometheus_handle,
        redis,
    };

    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let protected = Router::new()
        .route("/listings", post(create_listing))
        .route("/listings/{id}/sync", post(sync_listing))
        .route("/listings/{id}/status", get(listing_status))
        .route(
            "/listings/{id}/platforms/{platform}/sale",
            post(report_sale),
        )
        .route("/accounts", post(connect_account))
        .route("/research/price", post(research_price))
        .route("/events", get(event_stream))
        .nest(
            "/jobs",
            Router::new()
                .route("/sync", post(enqueue_sync_job))
                .route("/{id}", get(get_job_status)),
        )
        .route_layer(middleware::from_fn_with_state(auth_state, require_api_auth));

    let app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/openapi.json", get(openapi_json))
        .route("/docs", get(swagger_ui))
        .merge(protected)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(body_limit_from_env()));

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8000);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(target = "syndic.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    store: Store,
    engine: Arc<SyncEngine>,
    researcher: Arc<PriceResearcher>,
    queue: jobs::SyncJobQueue,
    openapi: Arc<serde_json::Value>,
    prometheus_handle: PrometheusHandle,
    redis: Option<redis::Client>,
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "syndic-api",
    }))
}

async fn openapi_json(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    if let Ok(key) = std::env::var("OPENAPI_KEY") {
        let presented = headers
            .get("X-Docs-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != key {
            return Err(AppError::Unauthorized("docs key required"));
        }
    }
    Ok(Json((*state.openapi).clone()))
}

async fn swagger_ui() -> axum::http::Response<String> {
    let html = r#"<!doctype html>
<html>
<head>
  <meta charset='utf-8'/>
  <title>Syndic API Docs</title>
  <link rel="stylesheet" href="https://unpkg.com/swagger-ui-dist@5/swagger-ui.css" />
</head>
<body>
  <div id="swagger-ui"></div>
  <script src="https://unpkg.com/swagger-ui-dist@5/swagger-ui-bundle.js"></script>
  <script>
    window.onload = () => {
      window.ui = SwaggerUIBundle({ url: '/openapi.json', dom_id: '#swagger-ui' });
    };
  </script>
</body>
</html>"#;
    axum::http::Response::builder()
        .header("Content-Type", "text/html; charset=utf-8")
        .body(html.to_string())
        .unwrap()
}

fn body_limit_from_env() -> usize {
    std::env::var("REQUEST_MAX_BYTES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(256 * 1024)
}

async fn metrics_endpoint(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
) -> axum::http::Response<String> {
    if let Ok(secret) = std::env::var("METRICS_KEY") {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return axum::http::Response::builder()
                .status(axum::http::StatusCode::UNAUTHORIZED)
                .body("unauthorized".into())
                .unwrap();
        }
    }
    let body = state.prometheus_handle.render();
    axum::http::Response::builder()
        .header("Content-Type", "text/plain; version=0.0.4")
        .body(body)
        .unwrap()
}

#[derive(Debug, Deserialize)]
struct CreateListingRequest {
    title: String,
    #[serde(default)]
    description: String,
    price: f64,
    #[serde(default)]
    currency: Option<String>,
    #[serde(default)]
    condition: Option<String>,
    #[serde(default)]
    photos: Vec<String>,
    #[serde(default)]
    draft: bool,
}

/// Create the canonical listing record.
///
/// - Method: `POST`
/// - Path: `/listings`
/// - Auth: `Authorization: Bearer <key>` or `X-Syndic-Key: <key>`
///
/// Non-draft listings are validated up front so a broken record fails here
/// instead of on every platform during the first sync pass.
async fn create_listing(
    State(state): State<AppState>,
    Extension(context): Extension<SellerContext>,
    Json(payload): Json<CreateListingRequest>,
) -> Result<Json<Listing>, AppError> {
    crate::metrics::inc_requests("/listings");
    let now = Utc::now();
    let listing = Listing {
        id: Uuid::new_v4(),
        user_id: context.user_id,
        title: payload.title.trim().to_string(),
        description: payload.description,
        price: payload.price,
        currency: payload.currency.unwrap_or_else(|| "USD".to_string()),
        condition: payload.condition,
        photos: payload.photos,
        status: if payload.draft {
            ListingStatus::Draft
        } else {
            ListingStatus::Active
        },
        sold_at: None,
        created_at: now,
        updated_at: now,
    };
    if !payload.draft {
        ListingSpec::from_listing(&listing).validate()?;
    }
    state.store.put_listing(listing.clone()).await;
    info!(
        target = "syndic.api",
        listing_id = %listing.id,
        user_id = %context.user_id,
        api_key = %context.api_key_id,
        "listing created"
    );
    Ok(Json(listing))
}

#[derive(Debug, Deserialize)]
struct ConnectAccountRequest {
    platform: Platform,
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in_secs: Option<i64>,
    #[serde(default = "default_auto_list")]
    auto_list: bool,
}

fn default_auto_list() -> bool {
    true
}

/// Store a marketplace OAuth credential for the calling seller. Connecting
/// the same platform twice replaces the stored tokens.
async fn connect_account(
    State(state): State<AppState>,
    Extension(context): Extension<SellerContext>,
    Json(payload): Json<ConnectAccountRequest>,
) -> Result<Json<MarketplaceAccount>, AppError> {
    crate::metrics::inc_requests("/accounts");
    if payload.access_token.trim().is_empty() {
        return Err(AppError::Sync(SyncError::ValidationFailed {
            detail: "access_token must not be empty".into(),
        }));
    }
    let now = Utc::now();
    let account = MarketplaceAccount {
        id: Uuid::new_v4(),
        user_id: context.user_id,
        platform: payload.platform,
        access_token: payload.access_token,
        refresh_token: payload.refresh_token,
        expires_at: now + chrono::Duration::seconds(payload.expires_in_secs.unwrap_or(7200).max(0)),
        connected: true,
        active: true,
        auto_list: payload.auto_list,
        updated_at: now,
    };
    state.store.put_account(account.clone()).await;
    info!(
        target = "syndic.api",
        user_id = %context.user_id,
        platform = %account.platform,
        auto_list = account.auto_list,
        "marketplace account connected"
    );
    Ok(Json(account))
}

/// Run one synchronous orchestration pass over the listing.
///
/// - Method: `POST`
/// - Path: `/listings/{id}/sync`
/// - Response: `SyncReport` with per-platform outcomes and any conflicts
async fn sync_listing(
    State(state): State<AppState>,
    Extension(context): Extension<SellerContext>,
    Path(id): Path<String>,
) -> Result<Json<SyncReport>, AppError> {
    crate::metrics::inc_requests("/listings/sync");
    let listing_id = parse_uuid(&id)?;
    owned_listing(&state, &context, listing_id).await?;
    let report = state.engine.sync_listing(listing_id).await?;
    Ok(Json(report))
}

#[derive(Debug, Serialize)]
struct ListingStatusResponse {
    listing: Listing,
    platforms: Vec<PlatformListing>,
}

async fn listing_status(
    State(state): State<AppState>,
    Extension(context): Extension<SellerContext>,
    Path(id): Path<String>,
) -> Result<Json<ListingStatusResponse>, AppError> {
    crate::metrics::inc_requests("/listings/status");
    let listing_id = parse_uuid(&id)?;
    let listing = owned_listing(&state, &context, listing_id).await?;
    let platforms = state.store.rows_for_listing(listing_id).await;
    Ok(Json(ListingStatusResponse { listing, platforms }))
}

#[derive(Debug, Deserialize)]
struct SaleNotice {
    #[serde(default)]
    sold_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
struct SaleAck {
    row: PlatformListing,
    #[serde(skip_serializing_if = "Option::is_none")]
    sync_job_id: Option<String>,
}

/// Ingress for marketplace sale notifications (webhook or order import).
///
/// Records the sale on the platform row only; the winner/loser decision is
/// made by the next sync pass, which this handler schedules best-effort.
async fn report_sale(
    State(state): State<AppState>,
    Extension(context): Extension<SellerContext>,
    Path((id, platform)): Path<(String, String)>,
    Json(payload): Json<SaleNotice>,
) -> Result<Json<SaleAck>, AppError> {
    crate::metrics::inc_requests("/listings/sale");
    let listing_id = parse_uuid(&id)?;
    let platform = parse_platform(&platform)?;
    owned_listing(&state, &context, listing_id).await?;

    let sold_at = payload.sold_at.unwrap_or_else(Utc::now);
    let row = state.store.record_sale(listing_id, platform, sold_at).await?;
    info!(
        target = "syndic.api",
        listing_id = %listing_id,
        platform = %platform,
        sold_at = %sold_at,
        "sale reported"
    );

    let sync_job_id = match state.queue.enqueue(listing_id).await {
        Ok(job_id) => Some(job_id.to_string()),
        Err(err) => {
            warn!(
                target = "syndic.api",
                listing_id = %listing_id,
                error = %err,
                "sale recorded but follow-up sync could not be queued"
            );
            None
        }
    };
    Ok(Json(SaleAck { row, sync_job_id }))
}

/// Price research over one marketplace's comparable sales.
///
/// - Method: `POST`
/// - Path: `/research/price`
/// - Body: `ResearchRequest`
/// - Response: `ResearchReport`
///
/// Reports are cached in Redis keyed by the normalized request, so repeat
/// queries skip the marketplace entirely until the TTL lapses.
async fn research_price(
    State(state): State<AppState>,
    Extension(context): Extension<SellerContext>,
    Json(payload): Json<ResearchRequest>,
) -> Result<Json<ResearchReport>, AppError> {
    crate::metrics::inc_requests("/research/price");
    if payload.query.trim().is_empty() {
        return Err(AppError::Sync(SyncError::ValidationFailed {
            detail: "query must not be empty".into(),
        }));
    }

    if let Some(client) = &state.redis {
        let key = cache::research_cache_key(
            payload.effective_platform(),
            &payload,
            payload.effective_limit(),
        );
        if let Some(cached) = cache::redis_get(client, &key).await {
            return Ok(Json(cached));
        }
        let report = state.researcher.research(context.user_id, &payload).await?;
        cache::redis_set(client, &key, &report, cache::cache_ttl_from_env()).await;
        return Ok(Json(report));
    }

    let report = state.researcher.research(context.user_id, &payload).await?;
    Ok(Json(report))
}

#[derive(Debug, Deserialize)]
struct EnqueueSyncRequest {
    listing_id: Uuid,
}

#[derive(Debug, Serialize)]
struct EnqueueResponse {
    job_id: String,
}

async fn enqueue_sync_job(
    State(state): State<AppState>,
    Extension(context): Extension<SellerContext>,
    Json(payload): Json<EnqueueSyncRequest>,
) -> Result<Json<EnqueueResponse>, AppError> {
    crate::metrics::inc_requests("/jobs/sync");
    owned_listing(&state, &context, payload.listing_id).await?;
    let id = state.queue.enqueue(payload.listing_id).await?;
    Ok(Json(EnqueueResponse {
        job_id: id.to_string(),
    }))
}

async fn get_job_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<jobs::JobInfo>, AppError> {
    let Ok(job_id) = Uuid::parse_str(&id) else {
        return Err(AppError::BadRequest("invalid_job_id"));
    };
    match state.queue.get(job_id).await {
        Some(info) => Ok(Json(info)),
        None => Err(AppError::NotFound("job")),
    }
}

/// Live feed of sync status transitions as server-sent events. Slow
/// consumers that overflow the bus skip ahead rather than stalling writers.
async fn event_stream(
    State(state): State<AppState>,
) -> Sse<impl futures_util::Stream<Item = Result<SseEvent, Infallible>>> {
    crate::metrics::inc_requests("/events");
    let rx = state.store.events().subscribe();
    let stream = futures_util::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let Ok(frame) = SseEvent::default().json_data(&event) else {
                        continue;
                    };
                    return Some((Ok(frame), rx));
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(target = "syndic.api", skipped, "event stream lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn owned_listing(
    state: &AppState,
    context: &SellerContext,
    listing_id: Uuid,
) -> Result<Listing, AppError> {
    let listing = state.store.listing(listing_id).await?;
    if listing.user_id != context.user_id {
        // Cross-seller ids read as missing.
        return Err(AppError::NotFound("listing"));
    }
    Ok(listing)
}

fn parse_uuid(raw: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw).map_err(|_| AppError::BadRequest("invalid_id"))
}

fn parse_platform(raw: &str) -> Result<Platform, AppError> {
    Platform::from_code(raw).ok_or(AppError::BadRequest("unknown_platform"))
}

#[derive(Debug)]
enum AppError {
    Sync(SyncError),
    Store(StoreError),
    Queue(jobs::QueueError),
    BadRequest(&'static str),
    NotFound(&'static str),
    Unauthorized(&'static str),
}

impl From<SyncError> for AppError {
    fn from(value: SyncError) -> Self {
        Self::Sync(value)
    }
}

impl From<StoreError> for AppError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

impl From<jobs::QueueError> for AppError {
    fn from(value: jobs::QueueError) -> Self {
        Self::Queue(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, detail) = match self {
            AppError::Sync(err) => {
                let status = match err.kind() {
                    ErrorKind::ValidationFailed => StatusCode::BAD_REQUEST,
                    ErrorKind::SyncInProgress
                    | ErrorKind::NoActiveAccount
                    | ErrorKind::NoRefreshToken => StatusCode::CONFLICT,
                    ErrorKind::RefreshFailed
                    | ErrorKind::PlatformRequestFailed
                    | ErrorKind::ConflictUnresolved => StatusCode::BAD_GATEWAY,
                };
                (
                    status,
                    err.kind().as_str().to_string(),
                    Some(err.to_string()),
                )
            }
            AppError::Store(err) => {
                let status = match &err {
                    StoreError::TransitionRefused { .. } => StatusCode::CONFLICT,
                    _ => StatusCode::NOT_FOUND,
                };
                let code = match &err {
                    StoreError::ListingNotFound(_) => "listing_not_found",
                    StoreError::RowNotFound { .. } => "platform_listing_not_found",
                    StoreError::AccountNotFound { .. } => "account_not_found",
                    StoreError::TransitionRefused { .. } => "transition_refused",
                };
                (status, code.to_string(), Some(err.to_string()))
            }
            AppError::Queue(err) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "queue_unavailable".to_string(),
                Some(err.to_string()),
            ),
            AppError::BadRequest(code) => (StatusCode::BAD_REQUEST, code.to_string(), None),
            AppError::NotFound(what) => (
                StatusCode::NOT_FOUND,
                "not_found".to_string(),
                Some(format!("{what} not found")),
            ),
            AppError::Unauthorized(detail) => (
                StatusCode::UNAUTHORIZED,
                "unauthorized".to_string(),
                Some(detail.to_string()),
            ),
        };
        let payload = ApiError {
            error: code,
            detail,
        };
        (status, Json(payload)).into_response()
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}
