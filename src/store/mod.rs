pub mod memory;
pub mod supabase;

use crate::models::{Dealer, Listing, ListingDraft, ListingOrigin, ListingStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::{future::Future, time::Duration};
use thiserror::Error;
use uuid::Uuid;

pub use memory::MemoryStore;
pub use supabase::SupabaseStore;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store request failed: {0}")]
    Request(String),
    #[error("store responded with HTTP {status}: {message}")]
    Status { status: u16, message: String },
    #[error("store call timed out")]
    Timeout,
    #[error("invalid store response: {0}")]
    Decode(String),
    #[error("`{relation}` is not provisioned in the listing store; apply the schema migration")]
    SchemaMissing { relation: String },
    #[error("column `{column}` does not exist in the listing store")]
    UnknownColumn { column: String },
    #[error("conflicting row: {0}")]
    Conflict(String),
    #[error("rejected by store: {0}")]
    Invalid(String),
}

impl StoreError {
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::Timeout => "store_timeout",
            StoreError::SchemaMissing { .. } => "schema_not_provisioned",
            StoreError::UnknownColumn { .. } => "schema_outdated",
            _ => "store_failed",
        }
    }
}

/// Filter predicates understood by every store backend.
///
/// Timestamp bounds are strict (`<`) and never match rows whose timestamp is absent.
#[derive(Debug, Clone, Default)]
pub struct ListingFilter {
    pub dealer_id: Option<String>,
    pub origin: Option<ListingOrigin>,
    pub status: Option<ListingStatus>,
    pub seen_before: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    /// Case-insensitive exact make.
    pub make: Option<String>,
    /// Case-insensitive substring over make, model, variant and description.
    pub search: Option<String>,
    pub limit: Option<usize>,
}

impl ListingFilter {
    pub fn matches(&self, listing: &Listing) -> bool {
        let draft = &listing.draft;
        if let Some(dealer) = &self.dealer_id
            && &draft.dealer_id != dealer
        {
            return false;
        }
        if self.origin.is_some_and(|o| o != draft.origin) {
            return false;
        }
        if self.status.is_some_and(|s| s != draft.status) {
            return false;
        }
        if let Some(bound) = self.seen_before
            && !listing.last_seen_at.is_some_and(|seen| seen < bound)
        {
            return false;
        }
        if self.created_before.is_some_and(|bound| listing.created_at >= bound) {
            return false;
        }
        if let Some(make) = &self.make
            && !draft
                .make
                .as_deref()
                .is_some_and(|m| m.eq_ignore_ascii_case(make.trim()))
        {
            return false;
        }
        if let Some(needle) = self.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            let needle = needle.to_lowercase();
            let hit = [&draft.make, &draft.model, &draft.variant, &draft.description]
                .into_iter()
                .flatten()
                .any(|field| field.to_lowercase().contains(&needle));
            if !hit {
                return false;
            }
        }
        true
    }
}

#[async_trait]
pub trait ListingStore: Send + Sync {
    /// Inserts or overwrites the row keyed on `(dealer_id, stock_id)`, stamping
    /// `last_seen_at`. Atomic per row. A stored `sold` status survives the overwrite
    /// and `last_seen_at` never moves backwards.
    async fn upsert_listing(
        &self,
        draft: &ListingDraft,
        seen_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Plain insert; never deduplicated.
    async fn insert_listing(&self, draft: &ListingDraft) -> Result<Listing, StoreError>;

    async fn select_listings(&self, filter: &ListingFilter) -> Result<Vec<Listing>, StoreError>;

    /// Counts every row matching the filter, ignoring `limit`.
    async fn count_listings(&self, filter: &ListingFilter) -> Result<usize, StoreError>;

    /// Moves every row matching the filter to `status` in one statement, ignoring
    /// `limit`. Returns the number of rows changed.
    async fn set_status(
        &self,
        filter: &ListingFilter,
        status: ListingStatus,
        at: DateTime<Utc>,
    ) -> Result<usize, StoreError>;

    async fn delete_listing(&self, id: Uuid) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait DealerDirectory: Send + Sync {
    async fn list_dealers(&self) -> Result<Vec<Dealer>, StoreError>;
    async fn get_dealer(&self, id: &str) -> Result<Option<Dealer>, StoreError>;
}

/// Append-only writes into auxiliary tables (leads, audit log).
#[async_trait]
pub trait RowSink: Send + Sync {
    async fn insert_row(&self, table: &str, row: &Value) -> Result<(), StoreError>;
}

pub trait Store: ListingStore + DealerDirectory + RowSink {}

impl<T: ListingStore + DealerDirectory + RowSink> Store for T {}

/// Bounds a single store call so one slow backend cannot stall a batch.
pub async fn bounded<T, F>(limit: Duration, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .unwrap_or(Err(StoreError::Timeout))
}
