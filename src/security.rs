use crate::{
    config::{ConfigError, Settings},
    metrics,
    models::ApiError,
};
use axum::{
    Json,
    body::Body,
    extract::{ConnectInfo, Query, State},
    http::{self, Request, StatusCode, header::HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use redis::AsyncCommands;
use serde::Deserialize;
use std::{
    collections::HashMap, convert::Infallible, env, net::SocketAddr, sync::Arc, time::Instant,
};
use tokio::sync::Mutex;
use tracing::{info, warn};

const SYNC_SECRET_HEADER: &str = "X-Sync-Secret";
const DEALER_KEY_HEADER: &str = "X-Dealer-Key";

/// Who is calling: the scheduler/operator holding the shared secret, or one dealer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Principal {
    Operator,
    Dealer { dealer_id: String, key_id: String },
}

impl Principal {
    pub fn actor(&self) -> String {
        match self {
            Principal::Operator => "operator".to_string(),
            Principal::Dealer { dealer_id, .. } => format!("dealer:{dealer_id}"),
        }
    }

    pub fn can_act_for(&self, dealer_id: &str) -> bool {
        match self {
            Principal::Operator => true,
            Principal::Dealer { dealer_id: own, .. } => own == dealer_id,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Accept {
    Secret,
    DealerKey,
    Either,
}

#[derive(Clone)]
pub struct AuthState {
    sync_secret: Option<Arc<str>>,
    dealer_keys: Arc<HashMap<String, DealerKey>>,
}

#[derive(Clone)]
struct DealerKey {
    dealer_id: String,
    key_id: String,
}

#[derive(Debug, Default, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

impl AuthState {
    pub fn from_settings(settings: &Settings) -> Self {
        let secret = settings.require_sync_secret().ok().map(str::to_string);
        Self::new(secret, &env::var("DEALER_API_KEYS").unwrap_or_default())
    }

    pub fn new(sync_secret: Option<String>, dealer_keys: &str) -> Self {
        Self {
            sync_secret: sync_secret.map(Arc::from),
            dealer_keys: Arc::new(parse_dealer_keys(dealer_keys)),
        }
    }

    fn check(&self, request: &Request<Body>, accept: Accept) -> Result<Principal, Response> {
        let headers = request.headers();
        if accept != Accept::DealerKey {
            let presented = extract_secret(headers).or_else(|| {
                Query::<TokenQuery>::try_from_uri(request.uri())
                    .ok()
                    .and_then(|Query(q)| q.token)
                    .map(|t| t.trim().to_string())
                    .filter(|t| !t.is_empty())
            });
            match (&self.sync_secret, presented) {
                (Some(secret), Some(given)) if constant_time_eq(secret.as_bytes(), given.as_bytes()) => {
                    return Ok(Principal::Operator);
                }
                (None, _) if accept == Accept::Secret => {
                    let err = ConfigError::MissingSyncSecret;
                    return Err(error_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        err.code(),
                        &err.to_string(),
                    ));
                }
                _ => {}
            }
        }
        if accept != Accept::Secret
            && let Some(key) = header_value(headers, DEALER_KEY_HEADER)
        {
            return match self.dealer_keys.get(&key) {
                Some(record) => Ok(Principal::Dealer {
                    dealer_id: record.dealer_id.clone(),
                    key_id: record.key_id.clone(),
                }),
                None => Err(error_response(
                    StatusCode::UNAUTHORIZED,
                    "invalid_dealer_key",
                    "Key not recognized",
                )),
            };
        }
        let hint = match accept {
            Accept::Secret => "Provide the sync secret as a Bearer token, X-Sync-Secret or ?token=",
            Accept::DealerKey => "Provide X-Dealer-Key",
            Accept::Either => "Provide the sync secret or X-Dealer-Key",
        };
        Err(error_response(StatusCode::UNAUTHORIZED, "unauthorized", hint))
    }
}

async fn authorize(
    state: &AuthState,
    mut request: Request<Body>,
    next: Next,
    accept: Accept,
) -> Result<Response, Infallible> {
    match state.check(&request, accept) {
        Ok(principal) => {
            request.extensions_mut().insert(principal);
            Ok(next.run(request).await)
        }
        Err(response) => Ok(response),
    }
}

/// Shared-secret only: fleet sync and maintenance triggers.
pub async fn require_sync_secret(
    State(state): State<AuthState>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, Infallible> {
    authorize(&state, request, next, Accept::Secret).await
}

/// Dealer key only: dealer-facing ingestion.
pub async fn require_dealer_key(
    State(state): State<AuthState>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, Infallible> {
    authorize(&state, request, next, Accept::DealerKey).await
}

/// Shared secret or a dealer key; handlers check ownership with [`Principal::can_act_for`].
pub async fn require_secret_or_dealer(
    State(state): State<AuthState>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, Infallible> {
    authorize(&state, request, next, Accept::Either).await
}

fn header_value(headers: &http::HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn extract_secret(headers: &http::HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(http::header::AUTHORIZATION)
        && let Ok(raw) = value.to_str()
        && raw.len() >= 7
        && raw[..6].eq_ignore_ascii_case("bearer")
    {
        return Some(raw[6..].trim().to_string()).filter(|s| !s.is_empty());
    }
    header_value(headers, SYNC_SECRET_HEADER)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

pub fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    (status, Json(ApiError::new(code, message))).into_response()
}

fn parse_dealer_keys(raw: &str) -> HashMap<String, DealerKey> {
    let mut entries = HashMap::new();
    for (idx, token) in raw.split(',').enumerate() {
        let trimmed = token.trim();
        if trimmed.is_empty() {
            continue;
        }
        let mut parts = trimmed.splitn(2, ':');
        let dealer_id = parts.next().map(str::trim).filter(|s| !s.is_empty());
        let key = parts.next().map(str::trim).filter(|s| !s.is_empty());
        match (dealer_id, key) {
            (Some(dealer), Some(secret)) => {
                entries.insert(
                    secret.to_string(),
                    DealerKey {
                        dealer_id: dealer.to_string(),
                        key_id: format!("key-{:02}", idx + 1),
                    },
                );
            }
            _ => warn!(
                target = "dealer_sync.auth",
                "ignored malformed DEALER_API_KEYS entry at position {}",
                idx + 1
            ),
        }
    }
    if entries.is_empty() {
        warn!(
            target = "dealer_sync.auth",
            "DEALER_API_KEYS produced no keys; dealer endpoints will reject every caller"
        );
    } else {
        info!(
            target = "dealer_sync.auth",
            key_count = entries.len(),
            "loaded dealer keys from env"
        );
    }
    entries
}

/// Client address. Behind a trusted proxy: first `X-Forwarded-For` hop, then
/// `X-Real-IP`. Otherwise, and as the fallback, the socket peer.
pub fn client_ip(request: &Request<Body>, trust_proxy: bool) -> String {
    let headers = request.headers();
    if trust_proxy {
        if let Some(forwarded) = header_value(headers, "X-Forwarded-For")
            && let Some(first) = forwarded.split(',').map(str::trim).find(|s| !s.is_empty())
        {
            return first.to_string();
        }
        if let Some(real) = header_value(headers, "X-Real-IP") {
            return real;
        }
    }
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Per-bucket, per-client limiter. In-process token buckets for a single instance, a
/// Redis fixed window when limits must hold across instances.
#[derive(Clone)]
pub enum RateLimiter {
    Memory(TokenBuckets),
    Redis(RedisWindow),
}

impl RateLimiter {
    pub fn from_env(redis: Option<redis::Client>) -> Self {
        let buckets = TokenBuckets::from_env();
        match redis {
            Some(client) => {
                let window_secs = env::var("RATE_LIMIT_WINDOW_SECS")
                    .ok()
                    .and_then(|value| value.parse::<u64>().ok())
                    .filter(|value| *value > 0)
                    .unwrap_or(60);
                let limit = (buckets.rate_per_sec * window_secs as f64)
                    .ceil()
                    .max(buckets.capacity) as u64;
                RateLimiter::Redis(RedisWindow {
                    client,
                    limit,
                    window_secs,
                    fallback: buckets,
                })
            }
            None => RateLimiter::Memory(buckets),
        }
    }

    pub async fn check(&self, bucket: &str, client: &str) -> Result<RatePermit, RateExceeded> {
        let key = format!("{bucket}:{client}");
        match self {
            RateLimiter::Memory(buckets) => buckets.consume(&key).await,
            RateLimiter::Redis(window) => window.consume(&key).await,
        }
    }
}

/// Resolved client address, available to handlers behind [`limit_by_client`].
#[derive(Clone, Debug)]
pub struct ClientIp(pub String);

#[derive(Clone)]
pub struct RateGuard {
    pub limiter: RateLimiter,
    pub bucket: &'static str,
    pub trust_proxy: bool,
}

/// Applies the guard's bucket to the calling client and stamps rate headers.
pub async fn limit_by_client(
    State(guard): State<RateGuard>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, Infallible> {
    let ip = client_ip(&request, guard.trust_proxy);
    match guard.limiter.check(guard.bucket, &ip).await {
        Ok(permit) => {
            request.extensions_mut().insert(ClientIp(ip));
            let mut response = next.run(request).await;
            permit.apply_headers(response.headers_mut());
            Ok(response)
        }
        Err(exceeded) => {
            metrics::rate_limited(guard.bucket);
            let mut response =
                error_response(StatusCode::TOO_MANY_REQUESTS, "rate_limited", "Too many requests");
            exceeded.apply_headers(response.headers_mut());
            Ok(response)
        }
    }
}

/// In-process token buckets. Idle buckets that have refilled completely are
/// indistinguishable from new ones and are dropped once the map passes `prune_above`.
#[derive(Clone)]
pub struct TokenBuckets {
    rate_per_sec: f64,
    capacity: f64,
    prune_above: usize,
    buckets: Arc<Mutex<HashMap<String, BucketState>>>,
}

const DEFAULT_PRUNE_ABOVE: usize = 4_096;

impl TokenBuckets {
    fn from_env() -> Self {
        let rate_per_sec = env::var("RATE_LIMIT_PER_SEC")
            .ok()
            .and_then(|value| value.parse::<f64>().ok())
            .filter(|value| value.is_finite() && *value > 0.0)
            .unwrap_or(5.0);
        let capacity = env::var("RATE_LIMIT_CAPACITY")
            .ok()
            .and_then(|value| value.parse::<f64>().ok())
            .filter(|value| value.is_finite() && *value >= 1.0)
            .unwrap_or(10.0);
        Self::new(rate_per_sec, capacity)
    }

    pub fn new(rate_per_sec: f64, capacity: f64) -> Self {
        Self::with_prune_threshold(rate_per_sec, capacity, DEFAULT_PRUNE_ABOVE)
    }

    pub fn with_prune_threshold(rate_per_sec: f64, capacity: f64, prune_above: usize) -> Self {
        Self {
            rate_per_sec,
            capacity,
            prune_above: prune_above.max(1),
            buckets: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn consume(&self, key: &str) -> Result<RatePermit, RateExceeded> {
        let mut guard = self.buckets.lock().await;
        let now = Instant::now();
        if guard.len() >= self.prune_above && !guard.contains_key(key) {
            let (rate, capacity) = (self.rate_per_sec, self.capacity);
            guard.retain(|_, b| {
                b.tokens + now.duration_since(b.last_refill).as_secs_f64() * rate < capacity
            });
        }
        let state = guard.entry(key.to_string()).or_insert_with(|| BucketState {
            tokens: self.capacity,
            last_refill: now,
        });

        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            state.tokens = (state.tokens + elapsed * self.rate_per_sec).min(self.capacity);
            state.last_refill = now;
        }

        let reset_secs = ((self.capacity - state.tokens) / self.rate_per_sec)
            .ceil()
            .max(0.0) as u64;
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(RatePermit {
                limit: self.capacity as u64,
                remaining: state.tokens.max(0.0).floor() as u64,
                reset_secs,
            })
        } else {
            let deficit = 1.0 - state.tokens;
            Err(RateExceeded {
                limit: self.capacity as u64,
                retry_after: (deficit / self.rate_per_sec).ceil().max(1.0) as u64,
                reset_secs,
            })
        }
    }
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

#[cfg(test)]
impl TokenBuckets {
    async fn tracked(&self) -> usize {
        self.buckets.lock().await.len()
    }
}

#[derive(Clone)]
pub struct RedisWindow {
    client: redis::Client,
    limit: u64,
    window_secs: u64,
    fallback: TokenBuckets,
}

impl RedisWindow {
    async fn consume(&self, key: &str) -> Result<RatePermit, RateExceeded> {
        match self.count(key).await {
            Ok((count, ttl)) => {
                let reset_secs = if ttl > 0 { ttl as u64 } else { self.window_secs };
                if count <= self.limit {
                    Ok(RatePermit {
                        limit: self.limit,
                        remaining: self.limit - count,
                        reset_secs,
                    })
                } else {
                    Err(RateExceeded {
                        limit: self.limit,
                        retry_after: reset_secs.max(1),
                        reset_secs,
                    })
                }
            }
            Err(err) => {
                warn!(
                    target = "dealer_sync.ratelimit",
                    error = %err,
                    "redis rate limit unavailable; using in-process buckets"
                );
                self.fallback.consume(key).await
            }
        }
    }

    async fn count(&self, key: &str) -> redis::RedisResult<(u64, i64)> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let redis_key = format!("ratelimit:{key}");
        let count: u64 = conn.incr(&redis_key, 1).await?;
        if count == 1 {
            let _: () = conn.expire(&redis_key, self.window_secs as i64).await?;
        }
        let ttl: i64 = conn.ttl(&redis_key).await?;
        Ok((count, ttl))
    }
}

#[derive(Debug, Clone)]
pub struct RatePermit {
    limit: u64,
    remaining: u64,
    reset_secs: u64,
}

fn numeric_header(value: u64) -> HeaderValue {
    HeaderValue::from_str(&value.to_string()).unwrap_or_else(|_| HeaderValue::from_static("0"))
}

impl RatePermit {
    fn apply_headers(&self, headers: &mut http::HeaderMap) {
        headers.insert("X-RateLimit-Limit", numeric_header(self.limit));
        headers.insert("X-RateLimit-Remaining", numeric_header(self.remaining));
        headers.insert("X-RateLimit-Reset", numeric_header(self.reset_secs));
    }
}

#[derive(Debug, Clone)]
pub struct RateExceeded {
    limit: u64,
    retry_after: u64,
    reset_secs: u64,
}

impl RateExceeded {
    pub fn retry_after(&self) -> u64 {
        self.retry_after
    }

    fn apply_headers(&self, headers: &mut http::HeaderMap) {
        headers.insert(http::header::RETRY_AFTER, numeric_header(self.retry_after));
        headers.insert("X-RateLimit-Limit", numeric_header(self.limit));
        headers.insert("X-RateLimit-Remaining", HeaderValue::from_static("0"));
        headers.insert("X-RateLimit-Reset", numeric_header(self.reset_secs));
    }
}
