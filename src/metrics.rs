use tracing::trace;

// Trace-based counters. Kept macro-free so offline builds stay lean; a real
// metrics exporter can subscribe to the `mailroom.metrics` target.

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    trace!(
        target = "mailroom.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}

pub fn retry_scheduled(remote: &str, attempt: u32) {
    trace!(
        target = "mailroom.metrics",
        remote = remote,
        attempt = attempt,
        "retry_scheduled"
    );
}

pub fn cache_hit(kind: &'static str) {
    trace!(target = "mailroom.metrics", kind = kind, "cache_hit");
}

pub fn rows_flushed(sheet: &str, rows: usize) {
    trace!(
        target = "mailroom.metrics",
        sheet = sheet,
        rows = rows,
        "rows_flushed"
    );
}
