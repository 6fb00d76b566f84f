use tracing::trace;

// Counters are emitted as trace events under `dealer_sync.metrics`.

pub fn inc_requests(route: &'static str) {
    trace!(
        target = "dealer_sync.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn dealer_synced(ok: bool, rows: usize, elapsed_ms: u128) {
    trace!(
        target = "dealer_sync.metrics",
        ok = ok,
        rows = rows as u64,
        elapsed_ms = elapsed_ms as u64,
        "dealer_sync_total_inc"
    );
}

pub fn batch_elapsed(processed: usize, failed: usize, elapsed_ms: u128) {
    trace!(
        target = "dealer_sync.metrics",
        processed = processed as u64,
        failed = failed as u64,
        elapsed_ms = elapsed_ms as u64,
        "sync_batch_elapsed"
    );
}

pub fn listings_swept(updated: usize, dry_run: bool) {
    trace!(
        target = "dealer_sync.metrics",
        updated = updated as u64,
        dry_run = dry_run,
        "listings_swept_total_inc"
    );
}

pub fn rate_limited(bucket: &'static str) {
    trace!(
        target = "dealer_sync.metrics",
        bucket = bucket,
        "rate_limited_total_inc"
    );
}
