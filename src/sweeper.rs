use crate::{
    config::positive_days,
    models::{ListingOrigin, ListingStatus},
    store::{ListingFilter, ListingStore, StoreError, bounded},
};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::time::Duration as StdDuration;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SweepConfig {
    pub sold_after_days: f64,
    pub expire_after_days: f64,
    pub dry_run: bool,
}

impl SweepConfig {
    /// Falls back to the defaults for absent, non-finite or non-positive thresholds.
    pub fn resolve(
        sold_after_days: Option<f64>,
        expire_after_days: Option<f64>,
        dry_run: bool,
        defaults: (f64, f64),
    ) -> Self {
        Self {
            sold_after_days: positive_days(sold_after_days, defaults.0),
            expire_after_days: positive_days(expire_after_days, defaults.1),
            dry_run,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SweepReport {
    pub dry_run: bool,
    pub sold_after_days: f64,
    pub expire_after_days: f64,
    pub stale_feed: usize,
    pub expired_manual: usize,
    pub candidates: usize,
    pub updated: usize,
}

fn cutoff(now: DateTime<Utc>, days: f64) -> DateTime<Utc> {
    let millis = (days * 86_400_000.0).min(i64::MAX as f64) as i64;
    Duration::try_milliseconds(millis)
        .and_then(|span| now.checked_sub_signed(span))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Marks stale feed listings and expired manual listings as sold.
///
/// Feed rows age on `last_seen_at`; manual rows on `created_at`. `sold` is terminal.
/// Each category is one filtered store call, bounded by `timeout` on its own; a dry
/// run counts instead of writing.
pub async fn sweep<S>(
    store: &S,
    config: &SweepConfig,
    now: DateTime<Utc>,
    timeout: StdDuration,
) -> Result<SweepReport, StoreError>
where
    S: ListingStore + ?Sized,
{
    let stale = ListingFilter {
        origin: Some(ListingOrigin::DealerFeed),
        status: Some(ListingStatus::Available),
        seen_before: Some(cutoff(now, config.sold_after_days)),
        ..Default::default()
    };
    let expired = ListingFilter {
        origin: Some(ListingOrigin::Manual),
        status: Some(ListingStatus::Available),
        created_before: Some(cutoff(now, config.expire_after_days)),
        ..Default::default()
    };

    let (stale_feed, expired_manual) = if config.dry_run {
        (
            bounded(timeout, store.count_listings(&stale)).await?,
            bounded(timeout, store.count_listings(&expired)).await?,
        )
    } else {
        (
            bounded(timeout, store.set_status(&stale, ListingStatus::Sold, now)).await?,
            bounded(timeout, store.set_status(&expired, ListingStatus::Sold, now)).await?,
        )
    };
    let candidates = stale_feed + expired_manual;
    let report = SweepReport {
        dry_run: config.dry_run,
        sold_after_days: config.sold_after_days,
        expire_after_days: config.expire_after_days,
        stale_feed,
        expired_manual,
        candidates,
        updated: if config.dry_run { 0 } else { candidates },
    };

    info!(
        target = "dealer_sync.sweep",
        dry_run = report.dry_run,
        stale_feed = report.stale_feed,
        expired_manual = report.expired_manual,
        updated = report.updated,
        "lifecycle sweep finished"
    );
    Ok(report)
}
