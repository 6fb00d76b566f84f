use super::{DealerDirectory, ListingFilter, ListingStore, RowSink, StoreError};
use crate::config::ConfigError;
use crate::http::build_client_with_timeout;
use crate::models::{Dealer, Listing, ListingDraft, ListingStatus};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, RequestBuilder, Response, header::CONTENT_RANGE};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use std::time::Duration;
use urlencoding::encode;
use uuid::Uuid;

const LISTINGS: &str = "listings";
const DEALERS: &str = "dealers";
const DEALER_COLUMNS: &str = "id,name,phone,email,city,feed_url,inventory_url,sitemap_url";

/// Listing store backed by a Supabase (PostgREST) project.
#[derive(Debug, Clone)]
pub struct SupabaseStore {
    base_url: String,
    service_key: String,
    http: Client,
}

#[derive(Debug, Deserialize)]
struct PostgrestError {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IdRow {
    #[allow(dead_code)]
    id: Uuid,
}

/// Descriptive columns written explicitly as `null` so an upsert overwrites stale values.
const NULLABLE_COLUMNS: [&str; 11] = [
    "stock_id",
    "make",
    "model",
    "variant",
    "year",
    "km",
    "fuel",
    "transmission",
    "price",
    "location",
    "description",
];

#[derive(Serialize)]
struct InsertRow<'a> {
    #[serde(flatten)]
    draft: &'a ListingDraft,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl SupabaseStore {
    pub fn from_env(timeout: Duration) -> Result<Self, ConfigError> {
        Self::from_vars(|key| std::env::var(key).ok(), timeout)
    }

    pub fn from_vars(
        lookup: impl Fn(&str) -> Option<String>,
        timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let present = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let base_url = present("SUPABASE_URL").ok_or(ConfigError::MissingStoreCredentials)?;
        let service_key = ["SUPABASE_SERVICE_ROLE_KEY", "SUPABASE_SERVICE_KEY", "SUPABASE_KEY"]
            .into_iter()
            .find_map(present)
            .ok_or(ConfigError::MissingStoreCredentials)?;
        Ok(Self::new(&base_url, &service_key, timeout))
    }

    pub fn new(base_url: &str, service_key: &str, timeout: Duration) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            service_key: service_key.to_string(),
            http: build_client_with_timeout(timeout),
        }
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
    }

    async fn send(&self, table: &str, builder: RequestBuilder) -> Result<Response, StoreError> {
        let response = self.authed(builder).send().await.map_err(|err| {
            if err.is_timeout() {
                StoreError::Timeout
            } else {
                StoreError::Request(err.to_string())
            }
        })?;
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Err(classify_error(table, status, &body))
    }

    /// Reads the exact row count PostgREST reports in `Content-Range`.
    async fn send_counted(&self, table: &str, builder: RequestBuilder) -> Result<usize, StoreError> {
        let response = self.send(table, builder).await?;
        let header = response
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        parse_content_range(header)
            .ok_or_else(|| StoreError::Decode(format!("unreadable content-range {header:?}")))
    }

    async fn fetch_json<T: DeserializeOwned>(
        &self,
        table: &str,
        builder: RequestBuilder,
    ) -> Result<T, StoreError> {
        self.send(table, builder)
            .await?
            .json::<T>()
            .await
            .map_err(|err| StoreError::Decode(err.to_string()))
    }
}

/// Maps a PostgREST error payload onto typed store errors by error code.
pub fn classify_error(table: &str, status: u16, body: &str) -> StoreError {
    let parsed: Option<PostgrestError> = serde_json::from_str(body).ok();
    let message = parsed
        .as_ref()
        .and_then(|p| p.message.clone())
        .unwrap_or_else(|| body.trim().to_string());
    let code = parsed.and_then(|p| p.code).unwrap_or_default();
    match code.as_str() {
        "42P01" | "PGRST205" => StoreError::SchemaMissing {
            relation: table.to_string(),
        },
        "42703" | "PGRST204" => StoreError::UnknownColumn {
            column: quoted_name(&message).unwrap_or_else(|| "unknown".to_string()),
        },
        "23505" => StoreError::Conflict(message),
        _ => StoreError::Status { status, message },
    }
}

/// First identifier wrapped in single or double quotes within a store message.
fn quoted_name(message: &str) -> Option<String> {
    let start = message.find(['"', '\''])?;
    let quote = message[start..].chars().next()?;
    let rest = &message[start + 1..];
    let end = rest.find(quote)?;
    Some(rest[..end].to_string()).filter(|s| !s.is_empty())
}

/// Total from a `Content-Range` header such as `0-24/311` or `*/0`. Falls back to
/// the span of the range when the total is `*`.
pub fn parse_content_range(header: &str) -> Option<usize> {
    let (range, total) = header.trim().split_once('/')?;
    if let Ok(total) = total.parse::<usize>() {
        return Some(total);
    }
    if range == "*" {
        return Some(0);
    }
    let (start, end) = range.split_once('-')?;
    let (start, end) = (start.parse::<usize>().ok()?, end.parse::<usize>().ok()?);
    end.checked_sub(start).map(|span| span + 1)
}

/// Upsert payload. `status` is only sent when it is `sold`: new rows take the
/// column default and a stored `sold` is never revived. `last_seen_at` is clamped
/// on conflict by the trigger in `migrations/0001_listings.sql`.
fn upsert_body(draft: &ListingDraft, seen_at: DateTime<Utc>) -> Result<Value, StoreError> {
    let mut value =
        serde_json::to_value(draft).map_err(|err| StoreError::Invalid(err.to_string()))?;
    let Some(row) = value.as_object_mut() else {
        return Err(StoreError::Invalid("listing did not serialize to an object".into()));
    };
    for column in NULLABLE_COLUMNS {
        row.entry(column).or_insert(Value::Null);
    }
    if draft.status != ListingStatus::Sold {
        row.remove("status");
    }
    row.insert("last_seen_at".into(), serde_json::json!(seen_at));
    row.insert("updated_at".into(), serde_json::json!(seen_at));
    Ok(value)
}

fn timestamp(at: DateTime<Utc>) -> String {
    encode(&at.to_rfc3339_opts(SecondsFormat::Millis, true)).into_owned()
}

/// PostgREST predicates for a listing filter (no `select`, ordering or `limit`).
pub fn filter_query(filter: &ListingFilter) -> Vec<String> {
    let mut params = Vec::new();
    if let Some(dealer) = &filter.dealer_id {
        params.push(format!("dealer_id=eq.{}", encode(dealer)));
    }
    if let Some(origin) = filter.origin {
        params.push(format!("origin=eq.{}", origin.as_str()));
    }
    if let Some(status) = filter.status {
        params.push(format!("status=eq.{}", status.as_str()));
    }
    if let Some(bound) = filter.seen_before {
        params.push(format!("last_seen_at=lt.{}", timestamp(bound)));
    }
    if let Some(bound) = filter.created_before {
        params.push(format!("created_at=lt.{}", timestamp(bound)));
    }
    if let Some(make) = filter.make.as_deref().map(str::trim).filter(|m| !m.is_empty()) {
        params.push(format!("make=ilike.{}", encode(make)));
    }
    if let Some(q) = filter.search.as_deref().map(str::trim).filter(|q| !q.is_empty()) {
        let cleaned: String = q
            .chars()
            .filter(|c| !matches!(c, ',' | '(' | ')' | '*' | '"'))
            .collect();
        let pattern = format!("*{cleaned}*");
        let clauses = ["make", "model", "variant", "description"]
            .iter()
            .map(|col| format!("{col}.ilike.{pattern}"))
            .collect::<Vec<_>>()
            .join(",");
        params.push(format!("or={}", encode(&format!("({clauses})"))));
    }
    params
}

fn filtered_url(base: &str, head: Option<&str>, filter: &ListingFilter) -> String {
    let params: Vec<String> = head
        .map(str::to_string)
        .into_iter()
        .chain(filter_query(filter))
        .collect();
    if params.is_empty() {
        base.to_string()
    } else {
        format!("{base}?{}", params.join("&"))
    }
}

/// Newest-first page of rows for a filter.
pub fn select_url(base: &str, filter: &ListingFilter) -> String {
    let mut url = filtered_url(base, Some("select=*"), filter);
    url.push_str("&order=created_at.desc");
    if let Some(limit) = filter.limit {
        url.push_str(&format!("&limit={limit}"));
    }
    url
}

#[async_trait]
impl ListingStore for SupabaseStore {
    async fn upsert_listing(
        &self,
        draft: &ListingDraft,
        seen_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if draft.natural_key().is_none() {
            return Err(StoreError::Invalid("upsert requires a stock_id".into()));
        }
        let url = format!("{}?on_conflict=dealer_id,stock_id", self.table_url(LISTINGS));
        let row = upsert_body(draft, seen_at)?;
        self.send(
            LISTINGS,
            self.http
                .post(url)
                .header("Prefer", "resolution=merge-duplicates,return=minimal")
                .json(&row),
        )
        .await?;
        Ok(())
    }

    async fn insert_listing(&self, draft: &ListingDraft) -> Result<Listing, StoreError> {
        let now = Utc::now();
        let row = InsertRow {
            draft,
            created_at: now,
            updated_at: now,
        };
        let mut rows: Vec<Listing> = self
            .fetch_json(
                LISTINGS,
                self.http
                    .post(self.table_url(LISTINGS))
                    .header("Prefer", "return=representation")
                    .json(&row),
            )
            .await?;
        rows.pop()
            .ok_or_else(|| StoreError::Decode("insert returned no row".into()))
    }

    async fn select_listings(&self, filter: &ListingFilter) -> Result<Vec<Listing>, StoreError> {
        let url = select_url(&self.table_url(LISTINGS), filter);
        self.fetch_json(LISTINGS, self.http.get(url)).await
    }

    async fn count_listings(&self, filter: &ListingFilter) -> Result<usize, StoreError> {
        let url = filtered_url(&self.table_url(LISTINGS), Some("select=id"), filter);
        self.send_counted(
            LISTINGS,
            self.http.head(url).header("Prefer", "count=exact"),
        )
        .await
    }

    async fn set_status(
        &self,
        filter: &ListingFilter,
        status: ListingStatus,
        at: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let url = filtered_url(&self.table_url(LISTINGS), None, filter);
        self.send_counted(
            LISTINGS,
            self.http
                .patch(url)
                .header("Prefer", "return=minimal,count=exact")
                .json(&serde_json::json!({
                    "status": status.as_str(),
                    "updated_at": at,
                })),
        )
        .await
    }

    async fn delete_listing(&self, id: Uuid) -> Result<bool, StoreError> {
        let url = format!("{}?id=eq.{}&select=id", self.table_url(LISTINGS), id);
        let rows: Vec<IdRow> = self
            .fetch_json(
                LISTINGS,
                self.http
                    .delete(url)
                    .header("Prefer", "return=representation"),
            )
            .await?;
        Ok(!rows.is_empty())
    }
}

#[async_trait]
impl DealerDirectory for SupabaseStore {
    async fn list_dealers(&self) -> Result<Vec<Dealer>, StoreError> {
        let url = format!(
            "{}?select={}&order=id.asc",
            self.table_url(DEALERS),
            DEALER_COLUMNS
        );
        self.fetch_json(DEALERS, self.http.get(url)).await
    }

    async fn get_dealer(&self, id: &str) -> Result<Option<Dealer>, StoreError> {
        let url = format!(
            "{}?select={}&id=eq.{}&limit=1",
            self.table_url(DEALERS),
            DEALER_COLUMNS,
            encode(id)
        );
        let mut rows: Vec<Dealer> = self.fetch_json(DEALERS, self.http.get(url)).await?;
        Ok(rows.pop())
    }
}

#[async_trait]
impl RowSink for SupabaseStore {
    async fn insert_row(&self, table: &str, row: &Value) -> Result<(), StoreError> {
        self.send(
            table,
            self.http
                .post(self.table_url(table))
                .header("Prefer", "return=minimal")
                .json(row),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ListingOrigin;
    use chrono::TimeZone;

    #[test]
    fn classify_maps_codes_not_text() {
        let missing = classify_error(
            "leads",
            404,
            r#"{"code":"42P01","message":"relation \"public.leads\" does not exist"}"#,
        );
        assert_eq!(
            missing,
            StoreError::SchemaMissing {
                relation: "leads".into()
            }
        );
        assert_eq!(missing.code(), "schema_not_provisioned");

        let cache_miss = classify_error(
            "audit_log",
            404,
            r#"{"code":"PGRST205","message":"Could not find the table 'public.audit_log' in the schema cache"}"#,
        );
        assert!(matches!(cache_miss, StoreError::SchemaMissing { .. }));

        let column = classify_error(
            "leads",
            400,
            r#"{"code":"PGRST204","message":"Could not find the 'email' column of 'leads' in the schema cache"}"#,
        );
        assert_eq!(
            column,
            StoreError::UnknownColumn {
                column: "email".into()
            }
        );

        // a message that merely mentions a missing table is still a plain failure
        let generic = classify_error("leads", 500, "relation does not exist");
        assert!(matches!(generic, StoreError::Status { status: 500, .. }));
    }

    #[test]
    fn filter_query_encodes_predicates() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let filter = ListingFilter {
            origin: Some(ListingOrigin::DealerFeed),
            status: Some(ListingStatus::Available),
            seen_before: Some(at),
            search: Some("creta".into()),
            limit: Some(10),
            ..Default::default()
        };
        let params = filter_query(&filter);
        assert!(params.contains(&"origin=eq.dealer_feed".to_string()));
        assert!(params.contains(&"status=eq.available".to_string()));
        assert!(params.contains(&"last_seen_at=lt.2024-05-01T12%3A00%3A00.000Z".to_string()));
        assert!(params.iter().any(|p| p.starts_with("or=%28make.ilike.%2Acreta%2A")));
        assert!(!params.iter().any(|p| p.starts_with("limit=") || p.starts_with("order=")));
        let url = select_url("https://x.supabase.co/rest/v1/listings", &filter);
        assert!(url.starts_with("https://x.supabase.co/rest/v1/listings?select=*&origin=eq.dealer_feed"));
        assert!(url.ends_with("&order=created_at.desc&limit=10"));
    }

    #[test]
    fn sweep_patch_targets_the_filter_not_a_page() {
        let cutoff = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let stale = ListingFilter {
            origin: Some(ListingOrigin::DealerFeed),
            status: Some(ListingStatus::Available),
            seen_before: Some(cutoff),
            limit: Some(5),
            ..Default::default()
        };
        let url = filtered_url("https://x.supabase.co/rest/v1/listings", None, &stale);
        assert_eq!(
            url,
            "https://x.supabase.co/rest/v1/listings?origin=eq.dealer_feed&status=eq.available\
             &last_seen_at=lt.2024-05-01T00%3A00%3A00.000Z"
        );
        let everything = ListingFilter::default();
        assert_eq!(
            filtered_url("https://x.supabase.co/rest/v1/listings", Some("select=id"), &everything),
            "https://x.supabase.co/rest/v1/listings?select=id"
        );
    }

    #[test]
    fn content_range_totals() {
        assert_eq!(parse_content_range("0-24/3573"), Some(3573));
        assert_eq!(parse_content_range("*/0"), Some(0));
        assert_eq!(parse_content_range("0-4/*"), Some(5));
        assert_eq!(parse_content_range("*/*"), Some(0));
        assert_eq!(parse_content_range(""), None);
        assert_eq!(parse_content_range("items"), None);
    }

    #[test]
    fn missing_credentials_are_a_config_error() {
        let timeout = Duration::from_secs(1);
        let err = SupabaseStore::from_vars(|_| None, timeout).unwrap_err();
        assert!(matches!(err, ConfigError::MissingStoreCredentials));

        let url_only = SupabaseStore::from_vars(
            |key| (key == "SUPABASE_URL").then(|| "https://x.supabase.co".to_string()),
            timeout,
        );
        assert!(matches!(url_only, Err(ConfigError::MissingStoreCredentials)));

        let store = SupabaseStore::from_vars(
            |key| match key {
                "SUPABASE_URL" => Some("https://x.supabase.co/".into()),
                "SUPABASE_SERVICE_ROLE_KEY" => Some(" ".into()),
                "SUPABASE_KEY" => Some("anon".into()),
                _ => None,
            },
            timeout,
        )
        .unwrap();
        assert_eq!(store.service_key, "anon");
        assert_eq!(store.table_url("listings"), "https://x.supabase.co/rest/v1/listings");
    }

    #[test]
    fn upsert_body_overwrites_every_descriptive_column() {
        let draft = ListingDraft {
            dealer_id: "d-1".into(),
            origin: ListingOrigin::DealerFeed,
            stock_id: Some("S1".into()),
            ..Default::default()
        };
        let value = upsert_body(&draft, Utc::now()).unwrap();
        assert!(value.get("id").is_none());
        assert!(value.get("created_at").is_none());
        assert_eq!(value["stock_id"], "S1");
        assert_eq!(value["type"], "used");
        assert!(value["price"].is_null());
        assert!(value["description"].is_null());
        assert!(value["last_seen_at"].is_string());
    }

    #[test]
    fn upsert_body_never_revives_sold_rows() {
        let seen = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let draft = ListingDraft {
            dealer_id: "d-1".into(),
            origin: ListingOrigin::DealerFeed,
            stock_id: Some("S1".into()),
            ..Default::default()
        };
        let value = upsert_body(&draft, seen).unwrap();
        assert!(value.get("status").is_none());
        assert_eq!(value["last_seen_at"], serde_json::json!(seen));
        assert_eq!(value["updated_at"], serde_json::json!(seen));

        let sold = ListingDraft {
            status: ListingStatus::Sold,
            ..draft
        };
        assert_eq!(upsert_body(&sold, seen).unwrap()["status"], "sold");
    }

    #[test]
    fn schema_keeps_freshness_monotonic() {
        let sql = include_str!("../../migrations/0001_listings.sql").to_lowercase();
        assert!(sql.contains("create trigger listings_last_seen_monotonic"));
        assert!(sql.contains("greatest(old.last_seen_at, new.last_seen_at)"));
        assert!(sql.contains("status text not null default 'available'"));
        assert!(sql.contains("unique (dealer_id, stock_id)"));
    }
}
