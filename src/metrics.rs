use tracing::trace;

// Counter and timing helpers emitted under the syndic.metrics target so the
// same names show up in scrapes and in structured logs.

pub fn inc_requests(route: &'static str) {
    trace!(
        target = "syndic.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn inc_conflicts(platform: &'static str) {
    trace!(
        target = "syndic.metrics",
        platform = platform,
        "conflicts_resolved_inc"
    );
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    trace!(
        target = "syndic.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}
