mod audit;
mod captcha;
mod config;
mod feed;
mod http;
mod idempotency;
mod jobs;
mod leads;
mod manual;
mod metrics;
mod models;
mod normalize;
mod orchestrator;
mod reconcile;
mod security;
mod store;
mod sweeper;
mod text;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query, State},
    http::{HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use captcha::{CaptchaError, CaptchaVerifier};
use config::{Settings, StoreBackend};
use idempotency::IdempotencyCache;
use jobs::JobQueue;
use leads::{LeadError, LeadRequest};
use manual::{ManualError, ManualListingRequest};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{ApiError, ListingStatus, SyncMode};
use orchestrator::{BatchRequest, DealerOutcome, Orchestrator, SyncError, SyncErrorKind};
use security::{
    AuthState, ClientIp, Principal, RateGuard, RateLimiter, limit_by_client,
    require_dealer_key, require_secret_or_dealer, require_sync_secret,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::{net::SocketAddr, process::ExitCode, sync::Arc, time::Instant};
use store::{ListingFilter, ListingStore, MemoryStore, Store, StoreError, SupabaseStore, bounded};
use sweeper::{SweepConfig, SweepReport};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";
const DEFAULT_SEARCH_LIMIT: usize = 50;
const MAX_SEARCH_LIMIT: usize = 200;

#[tokio::main]
async fn main() -> ExitCode {
    exit_code(run().await)
}

fn exit_code(result: eyre::Result<()>) -> ExitCode {
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(target = "dealer_sync.api", "server crashed: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let settings = Arc::new(Settings::from_env());
    if settings.require_sync_secret().is_err() {
        warn!(
            target = "dealer_sync.api",
            "SYNC_SECRET is not set; operator routes will refuse every call"
        );
    }
    let store: Arc<dyn Store> = match settings.store_backend {
        StoreBackend::Memory => {
            warn!(
                target = "dealer_sync.api",
                "LISTING_STORE=memory; listings are kept in process and lost on restart"
            );
            Arc::new(MemoryStore::new())
        }
        StoreBackend::Supabase => Arc::new(SupabaseStore::from_env(settings.store_timeout)?),
    };

    let prometheus_handle = PrometheusBuilder::new().install_recorder()?;
    let redis = std::env::var("REDIS_URL")
        .ok()
        .and_then(|u| redis::Client::open(u).ok());

    let orchestrator = Orchestrator::new(store, settings.clone());
    let (queue, _worker) = JobQueue::spawn(orchestrator.clone());
    let state = AppState {
        orchestrator,
        queue,
        idempotency: IdempotencyCache::from_env(redis.clone()),
        captcha: CaptchaVerifier::from_env(),
        prometheus_handle,
    };
    if settings.trust_proxy_headers {
        info!(
            target = "dealer_sync.api",
            "TRUST_PROXY_HEADERS set; client identity comes from X-Forwarded-For"
        );
    }
    let app = build_router(
        state,
        AuthState::from_settings(&settings),
        RateLimiter::from_env(redis),
        settings.trust_proxy_headers,
    );

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8000);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(target = "dealer_sync.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    orchestrator: Orchestrator,
    queue: JobQueue,
    idempotency: IdempotencyCache,
    captcha: CaptchaVerifier,
    prometheus_handle: PrometheusHandle,
}

fn build_router(
    state: AppState,
    auth: AuthState,
    limiter: RateLimiter,
    trust_proxy: bool,
) -> Router {
    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let operator = Router::new()
        .route("/sync", post(sync_fleet))
        .route("/maintenance/lifecycle", post(lifecycle))
        .route("/jobs/{id}", get(get_job_status))
        .route_layer(middleware::from_fn_with_state(
            auth.clone(),
            require_sync_secret,
        ));

    let dealer_sync = Router::new()
        .route("/dealers/{dealer_id}/sync", post(sync_dealer))
        .route_layer(middleware::from_fn_with_state(
            auth.clone(),
            require_secret_or_dealer,
        ));

    // Auth runs before the rate limiter: the last layer added is the outermost.
    let manual = Router::new()
        .route("/listings/manual", post(create_manual_listing))
        .route_layer(middleware::from_fn_with_state(
            RateGuard {
                limiter: limiter.clone(),
                bucket: "manual_listing",
                trust_proxy,
            },
            limit_by_client,
        ))
        .route_layer(middleware::from_fn_with_state(auth, require_dealer_key));

    let leads = Router::new()
        .route("/leads", post(create_lead))
        .route_layer(middleware::from_fn_with_state(
            RateGuard {
                limiter,
                bucket: "lead",
                trust_proxy,
            },
            limit_by_client,
        ));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/listings", get(search_listings))
        .merge(operator)
        .merge(dealer_sync)
        .merge(manual)
        .merge(leads)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(body_limit_from_env()))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}

fn body_limit_from_env() -> usize {
    std::env::var("REQUEST_MAX_BYTES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(256 * 1024)
}

/// Liveness check.
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "dealer-sync",
    }))
}

async fn metrics_endpoint(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Ok(secret) = std::env::var("METRICS_KEY") {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
        }
    }
    (
        [("Content-Type", "text/plain; version=0.0.4")],
        state.prometheus_handle.render(),
    )
        .into_response()
}

// Query values arrive as raw strings; malformed numbers fall back to their defaults.

fn number<T: std::str::FromStr>(raw: &Option<String>) -> Option<T> {
    raw.as_deref().and_then(|v| v.trim().parse::<T>().ok())
}

fn flag(raw: &Option<String>, default: bool) -> bool {
    match raw.as_deref().map(|v| v.trim().to_ascii_lowercase()) {
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => true,
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => false,
        _ => default,
    }
}

fn parse_mode(raw: &Option<String>) -> Result<SyncMode, AppError> {
    SyncMode::parse(raw.as_deref()).ok_or_else(|| AppError::Invalid {
        code: "invalid_mode",
        detail: "mode must be one of auto, csv, sitemap, page".into(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct DealerSyncQuery {
    mode: Option<String>,
}

/// Sync one dealer now.
///
/// - Method: `POST`
/// - Path: `/dealers/{dealer_id}/sync?mode=`
/// - Auth: sync secret, or the dealer's own `X-Dealer-Key`
async fn sync_dealer(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(dealer_id): Path<String>,
    Query(query): Query<DealerSyncQuery>,
) -> Result<Response, AppError> {
    metrics::inc_requests("/dealers/{dealer_id}/sync");
    if !principal.can_act_for(&dealer_id) {
        return Err(AppError::Forbidden(format!(
            "key is not valid for dealer `{dealer_id}`"
        )));
    }
    let mode = parse_mode(&query.mode)?;
    let started = Instant::now();
    let outcome = match state
        .orchestrator
        .sync_dealer(&dealer_id, mode, &principal.actor())
        .await
    {
        Ok(outcome) => outcome,
        Err(err) => {
            let elapsed_ms = started.elapsed().as_millis() as u64;
            let status = sync_error_status(err.kind());
            if status.is_server_error() {
                error!(
                    target = "dealer_sync.api",
                    code = err.code(),
                    detail = %err.detail(),
                    "dealer sync failed"
                );
            }
            let failed = DealerOutcome::failed(&dealer_id, &err, elapsed_ms);
            return Ok((status, Json(failed)).into_response());
        }
    };
    let status = outcome_status(&outcome);
    Ok((status, Json(outcome)).into_response())
}

fn sync_error_status(kind: SyncErrorKind) -> StatusCode {
    match kind {
        SyncErrorKind::DealerNotFound => StatusCode::NOT_FOUND,
        SyncErrorKind::NoSource => StatusCode::UNPROCESSABLE_ENTITY,
        SyncErrorKind::Fetch => StatusCode::BAD_GATEWAY,
        SyncErrorKind::Store => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn outcome_status(outcome: &DealerOutcome) -> StatusCode {
    match outcome.error_code {
        None => StatusCode::OK,
        Some("fetch_failed" | "parse_failed") => StatusCode::BAD_GATEWAY,
        Some("unsupported_source") => StatusCode::UNPROCESSABLE_ENTITY,
        Some(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[derive(Debug, Default, Deserialize)]
struct FleetSyncQuery {
    mode: Option<String>,
    limit: Option<String>,
    offset: Option<String>,
    cleanup: Option<String>,
    sold_after_days: Option<String>,
    expire_after_days: Option<String>,
    #[serde(rename = "async")]
    run_async: Option<String>,
}

/// Sync one page of dealers, then sweep.
///
/// - Method: `POST`
/// - Path: `/sync?mode&limit&offset&cleanup&sold_after_days&expire_after_days&async`
/// - Response: batch report, or `202 {job_id}` with `async=1`
async fn sync_fleet(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<FleetSyncQuery>,
) -> Result<Response, AppError> {
    metrics::inc_requests("/sync");
    let settings = state.orchestrator.settings();
    let request = BatchRequest {
        mode: parse_mode(&query.mode)?,
        offset: number(&query.offset).unwrap_or(0),
        limit: number(&query.limit),
        cleanup: flag(&query.cleanup, true),
        sweep: SweepConfig::resolve(
            number(&query.sold_after_days),
            number(&query.expire_after_days),
            false,
            (settings.sold_after_days, settings.expire_after_days),
        ),
    };

    if flag(&query.run_async, false) {
        let id = state
            .queue
            .enqueue_batch(request, &principal.actor())
            .await
            .map_err(|err| AppError::Internal(err.detail.unwrap_or(err.error)))?;
        return Ok((
            StatusCode::ACCEPTED,
            Json(json!({ "ok": true, "job_id": id.to_string() })),
        )
            .into_response());
    }
    let report = state
        .orchestrator
        .run_batch(request, &principal.actor())
        .await?;
    Ok(Json(report).into_response())
}

#[derive(Debug, Default, Deserialize)]
struct LifecycleQuery {
    dry_run: Option<String>,
    sold_after_days: Option<String>,
    expire_after_days: Option<String>,
}

#[derive(Serialize)]
struct LifecycleResponse {
    ok: bool,
    #[serde(flatten)]
    report: SweepReport,
}

async fn lifecycle(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<LifecycleQuery>,
) -> Result<Json<LifecycleResponse>, AppError> {
    metrics::inc_requests("/maintenance/lifecycle");
    let settings = state.orchestrator.settings();
    let config = SweepConfig::resolve(
        number(&query.sold_after_days),
        number(&query.expire_after_days),
        flag(&query.dry_run, false),
        (settings.sold_after_days, settings.expire_after_days),
    );
    let report = state
        .orchestrator
        .sweep(&config, &principal.actor())
        .await?;
    Ok(Json(LifecycleResponse { ok: true, report }))
}

#[derive(Debug, Default, Deserialize)]
struct SearchQuery {
    q: Option<String>,
    make: Option<String>,
    dealer_id: Option<String>,
    status: Option<String>,
    limit: Option<String>,
}

async fn search_listings(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Value>, AppError> {
    metrics::inc_requests("/listings");
    let status = match query.status.as_deref().map(|s| s.trim().to_ascii_lowercase()) {
        None => None,
        Some(s) if s.is_empty() => None,
        Some(s) if s == "available" => Some(ListingStatus::Available),
        Some(s) if s == "sold" => Some(ListingStatus::Sold),
        Some(_) => {
            return Err(AppError::Invalid {
                code: "invalid_status",
                detail: "status must be available or sold".into(),
            });
        }
    };
    let non_blank = |v: Option<String>| v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
    let limit = number::<usize>(&query.limit)
        .filter(|l| *l > 0)
        .unwrap_or(DEFAULT_SEARCH_LIMIT)
        .min(MAX_SEARCH_LIMIT);
    let filter = ListingFilter {
        dealer_id: non_blank(query.dealer_id),
        make: non_blank(query.make),
        search: non_blank(query.q),
        status,
        limit: Some(limit),
        ..Default::default()
    };
    let store = state.orchestrator.store();
    let listings = bounded(
        state.orchestrator.settings().store_timeout,
        store.select_listings(&filter),
    )
    .await?;
    Ok(Json(json!({
        "ok": true,
        "count": listings.len(),
        "listings": listings,
    })))
}

/// Public lead capture.
///
/// - Method: `POST`
/// - Path: `/leads`
/// - Body: `LeadRequest`; `captcha_token` is required when `CAPTCHA_SECRET` is set
async fn create_lead(
    State(state): State<AppState>,
    Extension(ClientIp(ip)): Extension<ClientIp>,
    Json(payload): Json<LeadRequest>,
) -> Result<Json<leads::LeadReceipt>, AppError> {
    metrics::inc_requests("/leads");
    state
        .captcha
        .verify(payload.captcha_token.as_deref(), Some(ip.as_str()))
        .await?;
    let receipt = leads::submit(
        state.orchestrator.store().as_ref(),
        payload,
        state.orchestrator.settings().store_timeout,
    )
    .await?;
    Ok(Json(receipt))
}

/// Dealer free-text listing.
///
/// - Method: `POST`
/// - Path: `/listings/manual`
/// - Auth: `X-Dealer-Key`
/// - Idempotency: optional `Idempotency-Key` replays the first successful response
async fn create_manual_listing(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    headers: HeaderMap,
    Json(payload): Json<ManualListingRequest>,
) -> Result<Json<Value>, AppError> {
    metrics::inc_requests("/listings/manual");
    let Principal::Dealer { dealer_id, .. } = &principal else {
        return Err(AppError::Forbidden(
            "manual listings are posted with a dealer key".into(),
        ));
    };
    let idem_key = headers
        .get(IDEMPOTENCY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    if let Some(key) = &idem_key
        && let Some(cached) = state.idempotency.get(dealer_id, key).await
    {
        info!(
            target = "dealer_sync.api",
            dealer_id = %dealer_id,
            "replaying manual listing for idempotency key"
        );
        return Ok(Json(cached));
    }

    let response = manual::submit(
        state.orchestrator.store().as_ref(),
        dealer_id,
        &principal.actor(),
        payload,
        state.orchestrator.settings().store_timeout,
    )
    .await?;
    let value = serde_json::to_value(&response)
        .map_err(|err| AppError::Internal(err.to_string()))?;
    if let Some(key) = &idem_key {
        state.idempotency.put(dealer_id, key, &value).await;
    }
    Ok(Json(value))
}

async fn get_job_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<jobs::JobInfo>, AppError> {
    let Ok(uuid) = uuid::Uuid::parse_str(&id) else {
        return Err(AppError::Invalid {
            code: "invalid_job_id",
            detail: format!("`{id}` is not a job id"),
        });
    };
    match state.queue.get(uuid).await {
        Some(info) => Ok(Json(info)),
        None => Err(AppError::NotFound {
            code: "job_not_found",
            detail: format!("no job `{id}`"),
        }),
    }
}

#[derive(Debug)]
enum AppError {
    Sync(SyncError),
    Store(StoreError),
    Lead(LeadError),
    Manual(ManualError),
    Captcha(CaptchaError),
    Invalid { code: &'static str, detail: String },
    NotFound { code: &'static str, detail: String },
    Forbidden(String),
    Internal(String),
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

impl From<LeadError> for AppError {
    fn from(value: LeadError) -> Self {
        Self::Lead(value)
    }
}

impl From<ManualError> for AppError {
    fn from(value: ManualError) -> Self {
        Self::Manual(value)
    }
}

impl From<CaptchaError> for AppError {
    fn from(value: CaptchaError) -> Self {
        Self::Captcha(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, detail) = match self {
            AppError::Sync(err) => (
                sync_error_status(err.kind()),
                err.code(),
                err.detail().to_string(),
            ),
            AppError::Store(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.code(), err.to_string()),
            AppError::Lead(err) => {
                let status = match err {
                    LeadError::Invalid { .. } => StatusCode::BAD_REQUEST,
                    LeadError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, err.code(), err.to_string())
            }
            AppError::Manual(err) => {
                let status = match err {
                    ManualError::EmptyMessage => StatusCode::BAD_REQUEST,
                    ManualError::MissingMakeModel { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                    ManualError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, err.code(), err.to_string())
            }
            AppError::Captcha(err) => {
                let status = match err {
                    CaptchaError::Missing => StatusCode::BAD_REQUEST,
                    CaptchaError::Rejected => StatusCode::FORBIDDEN,
                    CaptchaError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                };
                (status, err.code(), err.to_string())
            }
            AppError::Invalid { code, detail } => (StatusCode::BAD_REQUEST, code, detail),
            AppError::NotFound { code, detail } => (StatusCode::NOT_FOUND, code, detail),
            AppError::Forbidden(detail) => (StatusCode::FORBIDDEN, "forbidden", detail),
            AppError::Internal(detail) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", detail)
            }
        };
        if status.is_server_error() {
            error!(target = "dealer_sync.api", code, %detail, "request failed");
        }
        (status, Json(ApiError::new(code, detail))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        feed::test_server,
        models::{Dealer, ListingDraft, ListingOrigin, Listing},
        security::TokenBuckets,
    };
    use axum::{body::Body, extract::ConnectInfo, http::Request};
    use chrono::Utc;
    use tower::ServiceExt;

    const SECRET: &str = "s3cret";

    struct Harness {
        app: Router,
        store: MemoryStore,
    }

    async fn harness_with(dealers: Vec<Dealer>, secret: Option<&str>, limiter: RateLimiter) -> Harness {
        harness_full(dealers, secret, limiter, false).await
    }

    async fn harness_full(
        dealers: Vec<Dealer>,
        secret: Option<&str>,
        limiter: RateLimiter,
        trust_proxy: bool,
    ) -> Harness {
        let store = MemoryStore::with_dealers(dealers);
        let settings = Arc::new(Settings {
            sync_secret: secret.map(str::to_string),
            feed_timeout: std::time::Duration::from_secs(2),
            ..Settings::default()
        });
        let orchestrator = Orchestrator::new(Arc::new(store.clone()), settings.clone());
        let (queue, _worker) = JobQueue::spawn(orchestrator.clone());
        let state = AppState {
            orchestrator,
            queue,
            idempotency: IdempotencyCache::new(None, std::time::Duration::from_secs(60)),
            captcha: CaptchaVerifier::disabled(),
            prometheus_handle: PrometheusBuilder::new().build_recorder().handle(),
        };
        let auth = AuthState::new(settings.sync_secret.clone(), "d-1:key-one,d-2:key-two");
        Harness {
            app: build_router(state, auth, limiter, trust_proxy),
            store,
        }
    }

    async fn harness(dealers: Vec<Dealer>) -> Harness {
        harness_with(
            dealers,
            Some(SECRET),
            RateLimiter::Memory(TokenBuckets::new(100.0, 100.0)),
        )
        .await
    }

    fn dealer(id: &str, feed_url: Option<String>) -> Dealer {
        Dealer {
            id: id.into(),
            name: Some(format!("Dealer {id}")),
            feed_url,
            ..Default::default()
        }
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn post(uri: &str) -> axum::http::request::Builder {
        Request::builder().method("POST").uri(uri)
    }

    fn json_body(value: Value) -> Body {
        Body::from(value.to_string())
    }

    /// Lead submission arriving from socket peer `192.0.2.<peer>` carrying `forwarded_for`.
    fn lead_from(peer: u8, forwarded_for: &str) -> Request<Body> {
        let mut request = post("/leads")
            .header("Content-Type", "application/json")
            .header("X-Forwarded-For", forwarded_for)
            .body(json_body(json!({
                "dealer_id": "d-1",
                "name": "Ravi",
                "phone": "9876543210",
            })))
            .unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([192, 0, 2, peer], 40_000))));
        request
    }

    #[test]
    fn failed_startup_exits_non_zero() {
        assert_eq!(exit_code(Ok(())), ExitCode::SUCCESS);
        let err = SupabaseStore::from_vars(|_| None, std::time::Duration::from_secs(1))
            .map(|_| ())
            .map_err(eyre::Report::from);
        assert_eq!(exit_code(err), ExitCode::FAILURE);
    }

    #[tokio::test]
    async fn health_is_public() {
        let h = harness(vec![]).await;
        let (status, body) = send(
            &h.app,
            Request::builder().uri("/health").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["service"], "dealer-sync");
    }

    #[tokio::test]
    async fn fleet_sync_requires_secret() {
        let h = harness(vec![]).await;
        let (status, body) = send(&h.app, post("/sync").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "unauthorized");

        let (status, _) = send(
            &h.app,
            post("/sync")
                .header("X-Dealer-Key", "key-one")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn unconfigured_secret_is_a_server_error() {
        let h = harness_with(
            vec![],
            None,
            RateLimiter::Memory(TokenBuckets::new(100.0, 100.0)),
        )
        .await;
        let (status, body) = send(
            &h.app,
            post("/sync")
                .header("Authorization", "Bearer anything")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "missing_sync_secret");
    }

    #[tokio::test]
    async fn fleet_sync_reports_each_dealer() {
        let addr = test_server::spawn().await;
        let h = harness(vec![
            dealer("d-1", Some(format!("http://{addr}/ok.csv"))),
            dealer("d-2", Some(format!("http://{addr}/broken.csv"))),
            dealer("d-3", None),
        ])
        .await;
        let (status, body) = send(
            &h.app,
            post(&format!("/sync?token={SECRET}&cleanup=0&limit=oops"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
        assert_eq!(body["total"], 2);
        assert_eq!(body["processed"], 2);
        assert_eq!(body["failed"], 1);
        assert_eq!(body["results"][0]["rows"], 3);
        assert_eq!(body["results"][1]["error_code"], "fetch_failed");
        assert!(body.get("sweep").is_none());
        assert_eq!(h.store.all_listings().await.len(), 3);
    }

    #[tokio::test]
    async fn async_sync_is_queued_and_pollable() {
        let h = harness(vec![]).await;
        let (status, body) = send(
            &h.app,
            post("/sync?async=1")
                .header("X-Sync-Secret", SECRET)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let job_id = body["job_id"].as_str().unwrap().to_string();

        let mut state = Value::Null;
        for _ in 0..50 {
            let (_, job) = send(
                &h.app,
                Request::builder()
                    .uri(format!("/jobs/{job_id}"))
                    .header("X-Sync-Secret", SECRET)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
            state = job["state"].clone();
            if state == "completed" {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(state, "completed");

        let (status, body) = send(
            &h.app,
            Request::builder()
                .uri("/jobs/not-a-uuid")
                .header("X-Sync-Secret", SECRET)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_job_id");
    }

    #[tokio::test]
    async fn dealer_key_only_syncs_its_own_dealer() {
        let addr = test_server::spawn().await;
        let h = harness(vec![
            dealer("d-1", Some(format!("http://{addr}/ok.csv"))),
            dealer("d-2", Some(format!("http://{addr}/broken.csv"))),
        ])
        .await;

        let (status, body) = send(
            &h.app,
            post("/dealers/d-2/sync")
                .header("X-Dealer-Key", "key-one")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "forbidden");

        let (status, body) = send(
            &h.app,
            post("/dealers/d-1/sync?mode=csv")
                .header("X-Dealer-Key", "key-one")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
        assert_eq!(body["rows"], 3);
        assert_eq!(body["skipped"], 1);

        let (status, body) = send(
            &h.app,
            post("/dealers/d-2/sync")
                .header("X-Dealer-Key", "key-two")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["ok"], false);
        assert_eq!(body["error_code"], "fetch_failed");

        let (status, _) = send(
            &h.app,
            post("/dealers/d-1/sync")
                .header("X-Dealer-Key", "nope")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn dealer_sync_maps_typed_errors() {
        let h = harness(vec![dealer("d-1", None)]).await;
        let (status, body) = send(
            &h.app,
            post("/dealers/ghost/sync")
                .header("X-Sync-Secret", SECRET)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["ok"], false);
        assert_eq!(body["dealer_id"], "ghost");
        assert_eq!(body["error_code"], "dealer_not_found");
        assert!(body["error"].as_str().unwrap().contains("ghost"));

        let (status, body) = send(
            &h.app,
            post("/dealers/d-1/sync")
                .header("X-Sync-Secret", SECRET)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["ok"], false);
        assert_eq!(body["dealer_id"], "d-1");
        assert_eq!(body["error_code"], "no_source");

        let (status, body) = send(
            &h.app,
            post("/dealers/d-1/sync?mode=carrier-pigeon")
                .header("X-Sync-Secret", SECRET)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_mode");
    }

    #[tokio::test]
    async fn lifecycle_dry_run_counts_only() {
        let h = harness(vec![]).await;
        let now = Utc::now();
        h.store
            .put(Listing {
                id: uuid::Uuid::new_v4(),
                draft: ListingDraft {
                    dealer_id: "d-1".into(),
                    origin: ListingOrigin::DealerFeed,
                    stock_id: Some("S1".into()),
                    ..Default::default()
                },
                last_seen_at: Some(now - chrono::Duration::days(40)),
                created_at: now - chrono::Duration::days(40),
                updated_at: now - chrono::Duration::days(40),
            })
            .await;
        let (status, body) = send(
            &h.app,
            post("/maintenance/lifecycle?dry_run=1&sold_after_days=30")
                .header("X-Sync-Secret", SECRET)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
        assert_eq!(body["dry_run"], true);
        assert_eq!(body["candidates"], 1);
        assert_eq!(body["updated"], 0);
        assert_eq!(
            h.store.all_listings().await[0].draft.status,
            ListingStatus::Available
        );
    }

    #[tokio::test]
    async fn manual_listing_replays_idempotent_requests() {
        let h = harness(vec![]).await;
        let request = || {
            post("/listings/manual")
                .header("X-Dealer-Key", "key-one")
                .header("Content-Type", "application/json")
                .header(IDEMPOTENCY_HEADER, "post-1")
                .body(json_body(json!({
                    "message": "2019 Hyundai Creta SX diesel 45000 km Delhi",
                })))
                .unwrap()
        };
        let (status, first) = send(&h.app, request()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first["listing"]["make"], "Hyundai");
        assert_eq!(first["listing"]["dealer_id"], "d-1");

        let (status, second) = send(&h.app, request()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first, second);
        assert_eq!(h.store.all_listings().await.len(), 1);
    }

    #[tokio::test]
    async fn manual_listing_rejections() {
        let h = harness(vec![]).await;
        let submit = |message: &str| {
            post("/listings/manual")
                .header("X-Dealer-Key", "key-two")
                .header("Content-Type", "application/json")
                .body(json_body(json!({ "message": message })))
                .unwrap()
        };
        let (status, body) = send(&h.app, submit("   ")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "empty_message");

        let (status, body) = send(&h.app, submit("great deal, call now")).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"], "missing_make_model");

        let (status, _) = send(
            &h.app,
            post("/listings/manual")
                .header("X-Sync-Secret", SECRET)
                .header("Content-Type", "application/json")
                .body(json_body(json!({ "message": "Tata Nexon" })))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn leads_validate_then_store() {
        let h = harness(vec![]).await;
        let lead = |phone: &str| {
            post("/leads")
                .header("Content-Type", "application/json")
                .header("X-Forwarded-For", "203.0.113.9")
                .body(json_body(json!({
                    "dealer_id": "d-1",
                    "name": "Asha",
                    "phone": phone,
                })))
                .unwrap()
        };
        let (status, body) = send(&h.app, lead("12")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_phone");
        assert!(h.store.rows(leads::LEADS_TABLE).await.is_empty());

        let (status, body) = send(&h.app, lead("+91 98765 43210")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
        assert_eq!(body["degraded"], false);
        assert_eq!(h.store.rows(leads::LEADS_TABLE).await.len(), 1);
    }

    #[tokio::test]
    async fn lead_bucket_limits_per_client() {
        let h = harness_with(
            vec![],
            Some(SECRET),
            RateLimiter::Memory(TokenBuckets::new(0.001, 1.0)),
        )
        .await;
        let (status, _) = send(&h.app, lead_from(1, "198.51.100.7")).await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = send(&h.app, lead_from(1, "198.51.100.8")).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["error"], "rate_limited");
        // a different peer has its own bucket
        let (status, _) = send(&h.app, lead_from(2, "198.51.100.7")).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn forwarded_for_counts_only_behind_trusted_proxy() {
        let h = harness_full(
            vec![],
            Some(SECRET),
            RateLimiter::Memory(TokenBuckets::new(0.001, 1.0)),
            true,
        )
        .await;
        // one proxy peer, distinct forwarded clients
        for client in ["198.51.100.7", "198.51.100.8"] {
            let (status, _) = send(&h.app, lead_from(1, client)).await;
            assert_eq!(status, StatusCode::OK);
        }
        let (status, _) = send(&h.app, lead_from(1, "198.51.100.7")).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn search_filters_and_rejects_bad_status() {
        let h = harness(vec![]).await;
        let now = Utc::now();
        for (make, model) in [("Hyundai", "Creta"), ("Tata", "Nexon")] {
            h.store
                .put(Listing {
                    id: uuid::Uuid::new_v4(),
                    draft: ListingDraft {
                        dealer_id: "d-1".into(),
                        make: Some(make.into()),
                        model: Some(model.into()),
                        ..Default::default()
                    },
                    last_seen_at: None,
                    created_at: now,
                    updated_at: now,
                })
                .await;
        }
        let get = |uri: &str| Request::builder().uri(uri).body(Body::empty()).unwrap();
        let (status, body) = send(&h.app, get("/listings?q=creta")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);
        assert_eq!(body["listings"][0]["model"], "Creta");

        let (status, body) = send(&h.app, get("/listings?status=pending")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_status");
    }
}
