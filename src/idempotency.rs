use redis::AsyncCommands;
use serde_json::Value;
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::Mutex;

/// Remembers successful responses by `Idempotency-Key`, scoped per caller.
///
/// Redis when configured, otherwise an in-process map with the same TTL.
#[derive(Clone)]
pub struct IdempotencyCache {
    redis: Option<redis::Client>,
    local: Arc<Mutex<HashMap<String, (Instant, Value)>>>,
    ttl: Duration,
}

impl IdempotencyCache {
    pub fn new(redis: Option<redis::Client>, ttl: Duration) -> Self {
        Self {
            redis,
            local: Arc::new(Mutex::new(HashMap::new())),
            ttl,
        }
    }

    pub fn from_env(redis: Option<redis::Client>) -> Self {
        let ttl = std::env::var("IDEMPOTENCY_TTL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(3600);
        Self::new(redis, Duration::from_secs(ttl))
    }

    fn cache_key(scope: &str, key: &str) -> String {
        format!("idem:{scope}:{key}")
    }

    pub async fn get(&self, scope: &str, key: &str) -> Option<Value> {
        let cache_key = Self::cache_key(scope, key);
        if let Some(client) = &self.redis {
            return redis_get(client, &cache_key).await;
        }
        let mut local = self.local.lock().await;
        match local.get(&cache_key) {
            Some((stored, value)) if stored.elapsed() < self.ttl => Some(value.clone()),
            Some(_) => {
                local.remove(&cache_key);
                None
            }
            None => None,
        }
    }

    pub async fn put(&self, scope: &str, key: &str, value: &Value) {
        let cache_key = Self::cache_key(scope, key);
        if let Some(client) = &self.redis {
            redis_set(client, &cache_key, value, self.ttl.as_secs()).await;
            return;
        }
        let mut local = self.local.lock().await;
        local.retain(|_, (stored, _)| stored.elapsed() < self.ttl);
        local.insert(cache_key, (Instant::now(), value.clone()));
    }
}

async fn redis_get(client: &redis::Client, key: &str) -> Option<Value> {
    let mut conn = match client.get_multiplexed_async_connection().await {
        Ok(c) => c,
        Err(_) => return None,
    };
    let s = conn.get::<_, Option<String>>(key).await.ok().flatten();
    s.and_then(|v| serde_json::from_str(&v).ok())
}

async fn redis_set(client: &redis::Client, key: &str, value: &Value, ttl_secs: u64) {
    if let Ok(mut conn) = client.get_multiplexed_async_connection().await
        && let Ok(json) = serde_json::to_string(value)
    {
        let _: Result<(), _> = conn.set_ex(key, json, ttl_secs).await;
    }
}
