use tracing::trace;

// Trace-level counters; the Prometheus recorder in main picks up the real
// request histograms, these cover domain events.

pub fn inc_requests(route: &'static str) {
    trace!(
        target = "restitch.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn signal_fallback(signal: &'static str) {
    trace!(
        target = "restitch.metrics",
        signal = signal,
        "signal_fallback_inc"
    );
}

pub fn settlement_result(outcome: &'static str) {
    trace!(
        target = "restitch.metrics",
        outcome = outcome,
        "settlement_result_inc"
    );
}
