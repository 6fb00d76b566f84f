use crate::{
    models::ListingDraft,
    store::{ListingStore, StoreError, bounded},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileOutcome {
    /// Rows upserted, whether inserted or overwritten.
    pub rows: usize,
    /// Candidates dropped for lacking a stock id.
    pub skipped: usize,
}

/// Upserts one sync pass worth of candidates for a dealer, in source order.
///
/// Listings absent from the pass are left untouched; the sweeper ages them out later.
/// The first store error ends the pass.
pub async fn reconcile<S>(
    store: &S,
    dealer_id: &str,
    drafts: Vec<ListingDraft>,
    timeout: Duration,
) -> Result<ReconcileOutcome, StoreError>
where
    S: ListingStore + ?Sized,
{
    reconcile_at(store, dealer_id, drafts, timeout, Utc::now()).await
}

pub async fn reconcile_at<S>(
    store: &S,
    dealer_id: &str,
    drafts: Vec<ListingDraft>,
    timeout: Duration,
    seen_at: DateTime<Utc>,
) -> Result<ReconcileOutcome, StoreError>
where
    S: ListingStore + ?Sized,
{
    let mut outcome = ReconcileOutcome::default();
    for mut draft in drafts {
        if draft.dealer_id != dealer_id {
            draft.dealer_id = dealer_id.to_string();
        }
        if draft.natural_key().is_none() {
            outcome.skipped += 1;
            continue;
        }
        if let Some(stock) = draft.stock_id.as_mut() {
            *stock = stock.trim().to_string();
        }
        bounded(timeout, store.upsert_listing(&draft, seen_at)).await?;
        outcome.rows += 1;
    }
    debug!(
        target = "dealer_sync.reconcile",
        dealer_id,
        rows = outcome.rows,
        skipped = outcome.skipped,
        "pass reconciled"
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::{ListingOrigin, ListingStatus},
        store::MemoryStore,
        sweeper::{SweepConfig, sweep},
    };
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use std::collections::HashSet;
    use uuid::Uuid;

    const LIMIT: Duration = Duration::from_secs(5);

    fn draft(stock: &str, price: i64) -> ListingDraft {
        ListingDraft {
            dealer_id: "d-1".into(),
            origin: ListingOrigin::DealerFeed,
            stock_id: Some(stock.into()),
            make: Some("Maruti Suzuki".into()),
            model: Some("Swift".into()),
            price: Some(price),
            ..Default::default()
        }
    }

    fn strip_times(store_rows: Vec<crate::models::Listing>) -> Vec<(Option<String>, ListingDraft)> {
        let mut rows: Vec<_> = store_rows
            .into_iter()
            .map(|l| (l.draft.stock_id.clone(), l.draft))
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows
    }

    #[tokio::test]
    async fn reconciling_twice_is_idempotent() {
        let store = MemoryStore::new();
        let batch = vec![draft("A1", 100), draft("A2", 200), draft("A3", 300)];
        let first = reconcile(&store, "d-1", batch.clone(), LIMIT).await.unwrap();
        let after_first = strip_times(store.all_listings().await);
        let second = reconcile(&store, "d-1", batch, LIMIT).await.unwrap();
        let after_second = strip_times(store.all_listings().await);
        assert_eq!(first, second);
        assert_eq!(first.rows, 3);
        assert_eq!(after_first, after_second);
    }

    #[tokio::test]
    async fn natural_keys_stay_unique() {
        let store = MemoryStore::new();
        let passes = vec![
            vec![draft("A1", 1), draft("A2", 1), draft("A1", 2)],
            vec![draft(" A2 ", 3), draft("A3", 1)],
            vec![draft("A1", 9)],
        ];
        for pass in passes {
            reconcile(&store, "d-1", pass, LIMIT).await.unwrap();
        }
        let rows = store.all_listings().await;
        let keys: HashSet<_> = rows
            .iter()
            .map(|l| (l.draft.dealer_id.clone(), l.draft.stock_id.clone()))
            .collect();
        assert_eq!(keys.len(), rows.len());
        assert_eq!(rows.len(), 3);
        let a1 = rows
            .iter()
            .find(|l| l.draft.stock_id.as_deref() == Some("A1"))
            .unwrap();
        assert_eq!(a1.draft.price, Some(9));
    }

    #[tokio::test]
    async fn rows_without_stock_id_are_skipped() {
        let store = MemoryStore::new();
        let mut blank = draft("", 1);
        blank.stock_id = None;
        let outcome = reconcile(&store, "d-1", vec![blank, draft("  ", 1), draft("B1", 1)], LIMIT)
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome { rows: 1, skipped: 2 });
    }

    #[tokio::test]
    async fn drafts_are_owned_by_the_pass_dealer() {
        let store = MemoryStore::new();
        let mut foreign = draft("X1", 1);
        foreign.dealer_id = "someone-else".into();
        reconcile(&store, "d-2", vec![foreign], LIMIT).await.unwrap();
        assert_eq!(store.all_listings().await[0].draft.dealer_id, "d-2");
    }

    #[tokio::test]
    async fn freshness_is_monotonic() {
        let store = MemoryStore::new();
        let t0 = Utc::now();
        reconcile_at(&store, "d-1", vec![draft("A1", 1)], LIMIT, t0)
            .await
            .unwrap();
        let later = t0 + ChronoDuration::minutes(5);
        reconcile_at(&store, "d-1", vec![draft("A1", 1)], LIMIT, later)
            .await
            .unwrap();
        assert_eq!(store.all_listings().await[0].last_seen_at, Some(later));
        reconcile_at(&store, "d-1", vec![draft("A1", 1)], LIMIT, t0)
            .await
            .unwrap();
        assert_eq!(store.all_listings().await[0].last_seen_at, Some(later));
    }

    #[tokio::test]
    async fn omitted_rows_keep_their_state_until_swept() {
        let store = MemoryStore::new();
        let long_ago = Utc::now() - ChronoDuration::days(40);
        reconcile_at(&store, "d-1", vec![draft("A1", 1), draft("A2", 1)], LIMIT, long_ago)
            .await
            .unwrap();
        // A2 is missing from the next pass.
        reconcile(&store, "d-1", vec![draft("A1", 1)], LIMIT).await.unwrap();
        let rows = store.all_listings().await;
        assert!(rows.iter().all(|l| l.draft.status == ListingStatus::Available));

        let report = sweep(
            &store,
            &SweepConfig {
                sold_after_days: 30.0,
                expire_after_days: 60.0,
                dry_run: false,
            },
            Utc::now(),
            LIMIT,
        )
        .await
        .unwrap();
        assert_eq!(report.updated, 1);
        let a2 = store
            .all_listings()
            .await
            .into_iter()
            .find(|l| l.draft.stock_id.as_deref() == Some("A2"))
            .unwrap();
        assert_eq!(a2.draft.status, ListingStatus::Sold);
    }

    #[tokio::test]
    async fn swept_rows_stay_sold_when_they_reappear() {
        let store = MemoryStore::new();
        let long_ago = Utc::now() - ChronoDuration::days(40);
        reconcile_at(&store, "d-1", vec![draft("A1", 500)], LIMIT, long_ago)
            .await
            .unwrap();
        let config = SweepConfig {
            sold_after_days: 30.0,
            expire_after_days: 60.0,
            dry_run: false,
        };
        let report = sweep(&store, &config, Utc::now(), LIMIT).await.unwrap();
        assert_eq!(report.updated, 1);

        // the dealer feed still carries the car
        let now = Utc::now();
        reconcile_at(&store, "d-1", vec![draft("A1", 450)], LIMIT, now)
            .await
            .unwrap();
        let rows = store.all_listings().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].draft.status, ListingStatus::Sold);
        assert_eq!(rows[0].draft.price, Some(450));
        assert_eq!(rows[0].last_seen_at, Some(now));

        let again = sweep(&store, &config, Utc::now(), LIMIT).await.unwrap();
        assert_eq!(again.candidates, 0);
    }

    struct StalledStore;

    #[async_trait]
    impl ListingStore for StalledStore {
        async fn upsert_listing(&self, _: &ListingDraft, _: DateTime<Utc>) -> Result<(), StoreError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }
        async fn insert_listing(&self, _: &ListingDraft) -> Result<crate::models::Listing, StoreError> {
            Err(StoreError::Invalid("unused".into()))
        }
        async fn select_listings(
            &self,
            _: &crate::store::ListingFilter,
        ) -> Result<Vec<crate::models::Listing>, StoreError> {
            Ok(Vec::new())
        }
        async fn count_listings(&self, _: &crate::store::ListingFilter) -> Result<usize, StoreError> {
            Ok(0)
        }
        async fn set_status(
            &self,
            _: &crate::store::ListingFilter,
            _: ListingStatus,
            _: DateTime<Utc>,
        ) -> Result<usize, StoreError> {
            Ok(0)
        }
        async fn delete_listing(&self, _: Uuid) -> Result<bool, StoreError> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn hung_store_call_times_out() {
        let err = reconcile(
            &StalledStore,
            "d-1",
            vec![draft("A1", 1)],
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();
        assert_eq!(err, StoreError::Timeout);
    }
}
