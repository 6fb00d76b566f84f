use crate::{
    audit::{self, AuditEvent},
    config::Settings,
    feed::{FeedFetcher, FetchError},
    metrics,
    models::{Dealer, ListingOrigin, SourceKind, SyncMode},
    normalize::{PhotoDelimiter, normalize_record},
    reconcile::reconcile,
    store::{Store, StoreError, bounded},
    sweeper::{SweepConfig, SweepReport, sweep},
};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use serde_with::skip_serializing_none;
use std::{sync::Arc, time::Instant};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
#[error("sync `{stage}` failed: {message}")]
pub struct SyncError {
    stage: &'static str,
    code: &'static str,
    message: String,
    kind: SyncErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncErrorKind {
    DealerNotFound,
    NoSource,
    Fetch,
    Store,
}

impl SyncError {
    fn new(stage: &'static str, code: &'static str, kind: SyncErrorKind, message: impl Into<String>) -> Self {
        Self {
            stage,
            code,
            message: message.into(),
            kind,
        }
    }

    fn fetch(err: FetchError) -> Self {
        Self::new("fetch", err.code(), SyncErrorKind::Fetch, err.to_string())
    }

    fn store(stage: &'static str, err: StoreError) -> Self {
        Self::new(stage, err.code(), SyncErrorKind::Store, err.to_string())
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    pub fn kind(&self) -> SyncErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }
}

/// Result of one sync pass for one dealer.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
pub struct DealerOutcome {
    pub dealer_id: String,
    pub ok: bool,
    pub source: Option<SourceKind>,
    pub rows: Option<usize>,
    pub skipped: Option<usize>,
    pub error: Option<String>,
    pub error_code: Option<&'static str>,
    pub elapsed_ms: u64,
}

impl DealerOutcome {
    pub fn failed(dealer_id: &str, err: &SyncError, elapsed_ms: u64) -> Self {
        Self {
            dealer_id: dealer_id.to_string(),
            ok: false,
            source: None,
            rows: None,
            skipped: None,
            error: Some(err.detail().to_string()),
            error_code: Some(err.code()),
            elapsed_ms,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub mode: SyncMode,
    pub offset: usize,
    pub limit: Option<usize>,
    pub cleanup: bool,
    pub sweep: SweepConfig,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub ok: bool,
    pub mode: &'static str,
    pub total: usize,
    pub processed: usize,
    pub failed: usize,
    pub offset: usize,
    pub limit: usize,
    pub next_offset: Option<usize>,
    pub results: Vec<DealerOutcome>,
    pub sweep: Option<SweepReport>,
    pub sweep_error: Option<String>,
}

/// Runs dealer sync passes one after another and the trailing lifecycle sweep.
#[derive(Clone)]
pub struct Orchestrator {
    store: Arc<dyn Store>,
    fetcher: FeedFetcher,
    settings: Arc<Settings>,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn Store>, settings: Arc<Settings>) -> Self {
        Self {
            fetcher: FeedFetcher::new(settings.feed_timeout),
            store,
            settings,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Syncs a single dealer. Lookup and source selection problems are returned as
    /// errors; fetch and store failures too.
    pub async fn sync_dealer(
        &self,
        dealer_id: &str,
        mode: SyncMode,
        actor: &str,
    ) -> Result<DealerOutcome, SyncError> {
        let dealer = bounded(self.settings.store_timeout, self.store.get_dealer(dealer_id))
            .await
            .map_err(|err| SyncError::store("dealer_lookup", err))?
            .ok_or_else(|| {
                SyncError::new(
                    "dealer_lookup",
                    "dealer_not_found",
                    SyncErrorKind::DealerNotFound,
                    format!("dealer `{dealer_id}` does not exist"),
                )
            })?;
        if dealer.source_for(mode).is_none() {
            return Err(SyncError::new(
                "select_source",
                "no_source",
                SyncErrorKind::NoSource,
                format!("dealer `{dealer_id}` has no {} source", mode.as_str()),
            ));
        }

        let outcome = self.pass(&dealer, mode).await;
        audit::append(
            self.store.as_ref(),
            AuditEvent::new("sync.dealer", actor, "dealer")
                .entity(&dealer.id)
                .detail(json!({
                    "mode": mode.as_str(),
                    "ok": outcome.ok,
                    "rows": outcome.rows,
                    "error_code": outcome.error_code,
                })),
        )
        .await;
        Ok(outcome)
    }

    /// One fetch, normalize and reconcile cycle. Never fails; errors land in the outcome.
    async fn pass(&self, dealer: &Dealer, mode: SyncMode) -> DealerOutcome {
        let started = Instant::now();
        let source = dealer.source_for(mode);
        let result = match &source {
            Some(source) => self.run_source(dealer, source).await,
            None => Err(SyncError::new(
                "select_source",
                "no_source",
                SyncErrorKind::NoSource,
                "dealer has no usable source",
            )),
        };
        let elapsed_ms = started.elapsed().as_millis();
        let outcome = match result {
            Ok(reconciled) => DealerOutcome {
                dealer_id: dealer.id.clone(),
                ok: true,
                source: source.map(|s| s.kind),
                rows: Some(reconciled.rows),
                skipped: Some(reconciled.skipped),
                error: None,
                error_code: None,
                elapsed_ms: elapsed_ms as u64,
            },
            Err(err) => {
                warn!(
                    target = "dealer_sync.orchestrator",
                    dealer_id = %dealer.id,
                    stage = err.stage(),
                    code = err.code(),
                    error = %err.detail(),
                    "dealer sync failed"
                );
                DealerOutcome {
                    source: source.map(|s| s.kind),
                    ..DealerOutcome::failed(&dealer.id, &err, elapsed_ms as u64)
                }
            }
        };
        metrics::dealer_synced(outcome.ok, outcome.rows.unwrap_or(0), elapsed_ms);
        outcome
    }

    async fn run_source(
        &self,
        dealer: &Dealer,
        source: &crate::models::SourceDescriptor,
    ) -> Result<crate::reconcile::ReconcileOutcome, SyncError> {
        let records = self.fetcher.fetch(source).await.map_err(SyncError::fetch)?;
        let drafts = records
            .iter()
            .map(|record| {
                normalize_record(record, &dealer.id, ListingOrigin::DealerFeed, PhotoDelimiter::Pipe)
            })
            .collect();
        reconcile(
            self.store.as_ref(),
            &dealer.id,
            drafts,
            self.settings.store_timeout,
        )
        .await
        .map_err(|err| SyncError::store("reconcile", err))
    }

    /// Syncs one page of eligible dealers, isolating per-dealer failures.
    pub async fn run_batch(&self, request: BatchRequest, actor: &str) -> Result<BatchReport, SyncError> {
        let started = Instant::now();
        let limit = request
            .limit
            .filter(|l| *l > 0)
            .map(|l| l.min(self.settings.max_batch))
            .unwrap_or(self.settings.max_batch);

        let dealers = bounded(self.settings.store_timeout, self.store.list_dealers())
            .await
            .map_err(|err| SyncError::store("dealer_directory", err))?;
        let eligible: Vec<Dealer> = dealers
            .into_iter()
            .filter(|d| d.source_for(request.mode).is_some())
            .collect();
        let total = eligible.len();

        let mut results = Vec::new();
        for dealer in eligible.iter().skip(request.offset).take(limit) {
            results.push(self.pass(dealer, request.mode).await);
        }
        let processed = results.len();
        let failed = results.iter().filter(|r| !r.ok).count();
        let next_offset = Some(request.offset.saturating_add(processed))
            .filter(|next| processed > 0 && *next < total);

        let (sweep, sweep_error) = if request.cleanup {
            match self.sweep(&request.sweep, actor).await {
                Ok(report) => (Some(report), None),
                Err(err) => (None, Some(err.to_string())),
            }
        } else {
            (None, None)
        };

        let report = BatchReport {
            ok: true,
            mode: request.mode.as_str(),
            total,
            processed,
            failed,
            offset: request.offset,
            limit,
            next_offset,
            results,
            sweep,
            sweep_error,
        };
        let elapsed_ms = started.elapsed().as_millis();
        metrics::batch_elapsed(processed, failed, elapsed_ms);
        info!(
            target = "dealer_sync.orchestrator",
            mode = report.mode,
            total,
            processed,
            failed,
            offset = report.offset,
            elapsed_ms = elapsed_ms as u64,
            "sync batch finished"
        );
        audit::append(
            self.store.as_ref(),
            AuditEvent::new("sync.batch", actor, "batch").detail(json!({
                "mode": report.mode,
                "total": total,
                "processed": processed,
                "failed": failed,
                "offset": report.offset,
                "swept": report.sweep.as_ref().map(|s| s.updated),
            })),
        )
        .await;
        Ok(report)
    }

    /// Lifecycle sweep; every store call inside it carries the store timeout.
    pub async fn sweep(&self, config: &SweepConfig, actor: &str) -> Result<SweepReport, StoreError> {
        let report = sweep(
            self.store.as_ref(),
            config,
            Utc::now(),
            self.settings.store_timeout,
        )
        .await?;
        metrics::listings_swept(report.updated, report.dry_run);
        if !report.dry_run {
            audit::append(
                self.store.as_ref(),
                AuditEvent::new("lifecycle.sweep", actor, "listing").detail(json!({
                    "sold_after_days": report.sold_after_days,
                    "expire_after_days": report.expire_after_days,
                    "updated": report.updated,
                })),
            )
            .await;
        }
        Ok(report)
    }
}
