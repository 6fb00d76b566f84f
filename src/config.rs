use std::{env, time::Duration};
use thiserror::Error;

pub const DEFAULT_SOLD_AFTER_DAYS: f64 = 14.0;
pub const DEFAULT_EXPIRE_AFTER_DAYS: f64 = 60.0;
pub const DEFAULT_MAX_BATCH: usize = 20;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("SYNC_SECRET is not configured")]
    MissingSyncSecret,
    #[error("listing store credentials are missing (set SUPABASE_URL and SUPABASE_SERVICE_ROLE_KEY, or LISTING_STORE=memory)")]
    MissingStoreCredentials,
}

impl ConfigError {
    pub fn code(&self) -> &'static str {
        match self {
            ConfigError::MissingSyncSecret => "missing_sync_secret",
            ConfigError::MissingStoreCredentials => "missing_store_credentials",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Supabase,
    Memory,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub sync_secret: Option<String>,
    pub max_batch: usize,
    pub sold_after_days: f64,
    pub expire_after_days: f64,
    pub feed_timeout: Duration,
    pub store_timeout: Duration,
    pub store_backend: StoreBackend,
    /// Honor `X-Forwarded-For`/`X-Real-IP` for client identity. Only enable behind a
    /// proxy that overwrites them.
    pub trust_proxy_headers: bool,
}

impl Settings {
    pub fn from_env() -> Self {
        let store_backend = match env::var("LISTING_STORE")
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase()
            .as_str()
        {
            "memory" => StoreBackend::Memory,
            _ => StoreBackend::Supabase,
        };
        Self {
            sync_secret: env::var("SYNC_SECRET")
                .ok()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
            max_batch: env_parse::<usize>("SYNC_MAX_BATCH")
                .filter(|v| *v > 0)
                .unwrap_or(DEFAULT_MAX_BATCH),
            sold_after_days: positive_days(env_parse("SOLD_AFTER_DAYS"), DEFAULT_SOLD_AFTER_DAYS),
            expire_after_days: positive_days(
                env_parse("EXPIRE_AFTER_DAYS"),
                DEFAULT_EXPIRE_AFTER_DAYS,
            ),
            feed_timeout: Duration::from_secs(
                env_parse::<u64>("FEED_TIMEOUT_SECS")
                    .filter(|v| *v > 0)
                    .unwrap_or(20),
            ),
            store_timeout: Duration::from_secs(
                env_parse::<u64>("STORE_TIMEOUT_SECS")
                    .filter(|v| *v > 0)
                    .unwrap_or(10),
            ),
            store_backend,
            trust_proxy_headers: env::var("TRUST_PROXY_HEADERS")
                .map(|v| truthy(&v))
                .unwrap_or(false),
        }
    }

    pub fn require_sync_secret(&self) -> Result<&str, ConfigError> {
        self.sync_secret
            .as_deref()
            .ok_or(ConfigError::MissingSyncSecret)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            sync_secret: None,
            max_batch: DEFAULT_MAX_BATCH,
            sold_after_days: DEFAULT_SOLD_AFTER_DAYS,
            expire_after_days: DEFAULT_EXPIRE_AFTER_DAYS,
            feed_timeout: Duration::from_secs(20),
            store_timeout: Duration::from_secs(10),
            store_backend: StoreBackend::Memory,
            trust_proxy_headers: false,
        }
    }
}

pub fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}

pub fn truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Thresholds must be positive and finite; anything else yields the default.
pub fn positive_days(value: Option<f64>, default: f64) -> f64 {
    value.filter(|v| v.is_finite() && *v > 0.0).unwrap_or(default)
}
