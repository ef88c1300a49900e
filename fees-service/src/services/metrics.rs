//! Prometheus metrics for fees-service.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, HistogramVec, TextEncoder,
};

/// HTTP request counter by method, path and status.
pub static HTTP_REQUESTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "fees_http_requests_total",
        "Total number of HTTP requests",
        &["method", "path", "status"]
    )
    .expect("Failed to register http_requests_total")
});

/// HTTP request duration histogram by method and path.
pub static HTTP_REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "fees_http_request_duration_seconds",
        "HTTP request duration in seconds",
        &["method", "path"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
    )
    .expect("Failed to register http_request_duration")
});

/// Payments applied to invoices, by method.
pub static PAYMENTS_APPLIED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "fees_payments_applied_total",
        "Total number of payments applied to invoices",
        &["method"]
    )
    .expect("Failed to register payments_applied_total")
});

/// Payments flagged for manual review, by flag.
pub static PAYMENTS_FLAGGED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "fees_payments_flagged_total",
        "Total number of payments flagged for manual review",
        &["flag"] // OVER_CONFIRMATION, ORPHANED
    )
    .expect("Failed to register payments_flagged_total")
});

/// Invoice counter by status transition target.
pub static INVOICES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "fees_invoices_total",
        "Total number of invoices by status",
        &["status"]
    )
    .expect("Failed to register invoices_total")
});

/// Reconciliation sweep outcomes.
pub static RECONCILIATION_OUTCOMES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "fees_reconciliation_outcomes_total",
        "Reconciliation outcomes for pending gateway payments",
        &["outcome"] // recovered, failed, timed_out, still_pending, error
    )
    .expect("Failed to register reconciliation_outcomes_total")
});

/// Database query duration histogram.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "fees_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    )
    .expect("Failed to register db_query_duration")
});

/// Gateway call counter by provider and outcome.
pub static GATEWAY_CALLS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "fees_gateway_calls_total",
        "Gateway calls by provider, operation and outcome",
        &["provider", "operation", "outcome"]
    )
    .expect("Failed to register gateway_calls_total")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&HTTP_REQUESTS_TOTAL);
    Lazy::force(&HTTP_REQUEST_DURATION);
    Lazy::force(&PAYMENTS_APPLIED_TOTAL);
    Lazy::force(&PAYMENTS_FLAGGED_TOTAL);
    Lazy::force(&INVOICES_TOTAL);
    Lazy::force(&RECONCILIATION_OUTCOMES_TOTAL);
    Lazy::force(&DB_QUERY_DURATION);
    Lazy::force(&GATEWAY_CALLS_TOTAL);
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_default()
}
