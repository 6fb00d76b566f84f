use super::{DealerDirectory, ListingFilter, ListingStore, RowSink, StoreError};
use crate::models::{Dealer, Listing, ListingDraft, ListingStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};
use tokio::sync::Mutex;
use uuid::Uuid;

/// In-process store used for local runs and tests.
///
/// All mutations happen under one lock, which gives the per-row atomicity the
/// reconciler relies on.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryState>>,
}

struct MemoryState {
    dealers: Vec<Dealer>,
    listings: Vec<Listing>,
    tables: HashMap<String, MemoryTable>,
}

#[derive(Default)]
struct MemoryTable {
    columns: Option<HashSet<String>>,
    rows: Vec<Value>,
}

impl MemoryStore {
    /// Store with the `leads` and `audit_log` tables provisioned.
    pub fn new() -> Self {
        Self::with_dealers(Vec::new())
    }

    pub fn with_dealers(dealers: Vec<Dealer>) -> Self {
        let tables = ["leads", "audit_log"]
            .into_iter()
            .map(|t| (t.to_string(), MemoryTable::default()))
            .collect();
        Self {
            inner: Arc::new(Mutex::new(MemoryState {
                dealers,
                listings: Vec::new(),
                tables,
            })),
        }
    }
}

#[cfg(test)]
impl MemoryStore {
    /// Drops an auxiliary table so writes to it report `SchemaMissing`.
    pub async fn drop_table(&self, table: &str) {
        self.inner.lock().await.tables.remove(table);
    }

    /// Restricts a table to the given columns; other keys report `UnknownColumn`.
    pub async fn restrict_columns(&self, table: &str, columns: &[&str]) {
        let mut state = self.inner.lock().await;
        let entry = state.tables.entry(table.to_string()).or_default();
        entry.columns = Some(columns.iter().map(|c| c.to_string()).collect());
    }

    pub async fn rows(&self, table: &str) -> Vec<Value> {
        self.inner
            .lock()
            .await
            .tables
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    /// Places a fully formed row, bypassing upsert semantics.
    pub async fn put(&self, listing: Listing) {
        self.inner.lock().await.listings.push(listing);
    }

    pub async fn all_listings(&self) -> Vec<Listing> {
        self.inner.lock().await.listings.clone()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ListingStore for MemoryStore {
    async fn upsert_listing(
        &self,
        draft: &ListingDraft,
        seen_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let Some((dealer_id, stock_id)) = draft.natural_key() else {
            return Err(StoreError::Invalid("upsert requires a stock_id".into()));
        };
        let mut state = self.inner.lock().await;
        let existing = state.listings.iter().position(|l| {
            l.draft.dealer_id == dealer_id
                && l.draft.stock_id.as_deref().map(str::trim) == Some(stock_id)
        });
        match existing {
            Some(idx) => {
                let row = &mut state.listings[idx];
                let kept = row.draft.status;
                row.draft = draft.clone();
                if kept == ListingStatus::Sold {
                    row.draft.status = ListingStatus::Sold;
                }
                row.last_seen_at =
                    Some(row.last_seen_at.map_or(seen_at, |prev| prev.max(seen_at)));
                row.updated_at = seen_at;
            }
            None => {
                state.listings.push(Listing {
                    id: Uuid::new_v4(),
                    draft: draft.clone(),
                    last_seen_at: Some(seen_at),
                    created_at: seen_at,
                    updated_at: seen_at,
                });
            }
        }
        Ok(())
    }

    async fn insert_listing(&self, draft: &ListingDraft) -> Result<Listing, StoreError> {
        let now = Utc::now();
        let listing = Listing {
            id: Uuid::new_v4(),
            draft: draft.clone(),
            last_seen_at: None,
            created_at: now,
            updated_at: now,
        };
        self.inner.lock().await.listings.push(listing.clone());
        Ok(listing)
    }

    async fn select_listings(&self, filter: &ListingFilter) -> Result<Vec<Listing>, StoreError> {
        let state = self.inner.lock().await;
        let mut rows: Vec<Listing> = state
            .listings
            .iter()
            .filter(|l| filter.matches(l))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn count_listings(&self, filter: &ListingFilter) -> Result<usize, StoreError> {
        let state = self.inner.lock().await;
        Ok(state.listings.iter().filter(|l| filter.matches(l)).count())
    }

    async fn set_status(
        &self,
        filter: &ListingFilter,
        status: ListingStatus,
        at: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let mut state = self.inner.lock().await;
        let mut changed = 0;
        for row in state.listings.iter_mut().filter(|l| filter.matches(l)) {
            row.draft.status = status;
            row.updated_at = at;
            changed += 1;
        }
        Ok(changed)
    }

    async fn delete_listing(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut state = self.inner.lock().await;
        let before = state.listings.len();
        state.listings.retain(|l| l.id != id);
        Ok(state.listings.len() != before)
    }
}

#[async_trait]
impl DealerDirectory for MemoryStore {
    async fn list_dealers(&self) -> Result<Vec<Dealer>, StoreError> {
        Ok(self.inner.lock().await.dealers.clone())
    }

    async fn get_dealer(&self, id: &str) -> Result<Option<Dealer>, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .dealers
            .iter()
            .find(|d| d.id == id)
            .cloned())
    }
}

#[async_trait]
impl RowSink for MemoryStore {
    async fn insert_row(&self, table: &str, row: &Value) -> Result<(), StoreError> {
        let mut state = self.inner.lock().await;
        let Some(target) = state.tables.get_mut(table) else {
            return Err(StoreError::SchemaMissing {
                relation: table.to_string(),
            });
        };
        if let (Some(columns), Some(object)) = (&target.columns, row.as_object())
            && let Some(unknown) = object.keys().find(|k| !columns.contains(*k))
        {
            return Err(StoreError::UnknownColumn {
                column: unknown.clone(),
            });
        }
        target.rows.push(row.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ListingOrigin;
    use chrono::Duration;
    use serde_json::json;

    fn draft(stock: &str, price: i64) -> ListingDraft {
        ListingDraft {
            dealer_id: "d-1".into(),
            origin: ListingOrigin::DealerFeed,
            stock_id: Some(stock.into()),
            make: Some("Tata".into()),
            price: Some(price),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn upsert_overwrites_and_keeps_identity() {
        let store = MemoryStore::new();
        let t0 = Utc::now();
        store.upsert_listing(&draft("S1", 100), t0).await.unwrap();
        let first = store.all_listings().await[0].clone();
        store
            .upsert_listing(&draft("S1", 200), t0 + Duration::hours(1))
            .await
            .unwrap();
        let rows = store.all_listings().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, first.id);
        assert_eq!(rows[0].created_at, first.created_at);
        assert_eq!(rows[0].draft.price, Some(200));
        assert_eq!(rows[0].last_seen_at, Some(t0 + Duration::hours(1)));
    }

    #[tokio::test]
    async fn freshness_never_moves_backwards() {
        let store = MemoryStore::new();
        let t0 = Utc::now();
        store.upsert_listing(&draft("S1", 1), t0).await.unwrap();
        store
            .upsert_listing(&draft("S1", 1), t0 - Duration::days(2))
            .await
            .unwrap();
        assert_eq!(store.all_listings().await[0].last_seen_at, Some(t0));
    }

    #[tokio::test]
    async fn upsert_keeps_sold_status() {
        let store = MemoryStore::new();
        let t0 = Utc::now();
        store.upsert_listing(&draft("S1", 100), t0).await.unwrap();
        let sold = ListingFilter {
            dealer_id: Some("d-1".into()),
            ..Default::default()
        };
        assert_eq!(
            store.set_status(&sold, ListingStatus::Sold, t0).await.unwrap(),
            1
        );
        store
            .upsert_listing(&draft("S1", 90), t0 + Duration::hours(1))
            .await
            .unwrap();
        let row = &store.all_listings().await[0];
        assert_eq!(row.draft.status, ListingStatus::Sold);
        assert_eq!(row.draft.price, Some(90));
    }

    #[tokio::test]
    async fn count_and_set_status_ignore_limit() {
        let store = MemoryStore::new();
        let t0 = Utc::now();
        for stock in ["S1", "S2", "S3"] {
            store.upsert_listing(&draft(stock, 1), t0).await.unwrap();
        }
        let filter = ListingFilter {
            status: Some(ListingStatus::Available),
            limit: Some(1),
            ..Default::default()
        };
        assert_eq!(store.count_listings(&filter).await.unwrap(), 3);
        assert_eq!(
            store.set_status(&filter, ListingStatus::Sold, t0).await.unwrap(),
            3
        );
        assert_eq!(store.count_listings(&filter).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn upsert_without_stock_id_is_rejected() {
        let store = MemoryStore::new();
        let mut d = draft("", 1);
        d.stock_id = Some("  ".into());
        let err = store.upsert_listing(&d, Utc::now()).await.unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));
    }

    #[tokio::test]
    async fn row_sink_reports_schema_problems() {
        let store = MemoryStore::new();
        store.insert_row("leads", &json!({"name": "A"})).await.unwrap();
        assert_eq!(store.rows("leads").await.len(), 1);

        let err = store.insert_row("nope", &json!({})).await.unwrap_err();
        assert_eq!(err.code(), "schema_not_provisioned");

        store.restrict_columns("leads", &["name"]).await;
        let err = store
            .insert_row("leads", &json!({"name": "A", "email": "x"}))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            StoreError::UnknownColumn {
                column: "email".into()
            }
        );
    }

    #[tokio::test]
    async fn delete_removes_row() {
        let store = MemoryStore::new();
        let row = store.insert_listing(&draft("S9", 1)).await.unwrap();
        assert!(store.delete_listing(row.id).await.unwrap());
        assert!(!store.delete_listing(row.id).await.unwrap());
    }
}
