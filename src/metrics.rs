use tracing::trace;

// Lightweight metrics helpers. Request and stage activity is narrated on
// a trace target instead of coupling handlers to metrics macros; the
// Prometheus recorder installed in main keeps /metrics serving either way.

pub fn inc_requests(route: &'static str) {
    trace!(
        target = "watch.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn stage_elapsed(stage: &str, elapsed_ms: u128) {
    trace!(
        target = "watch.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}
