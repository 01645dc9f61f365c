//! Prometheus metrics for the relay
//!
//! Registered once in the default registry and exposed as text at `/metrics`.

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_gauge_vec,
    register_histogram, Counter, CounterVec, Encoder, Gauge, GaugeVec, Histogram, TextEncoder,
};

lazy_static! {
    /// Counter: delivery attempts by outcome
    pub static ref DELIVERIES: CounterVec = register_counter_vec!(
        "relaymail_deliveries_total",
        "Delivery attempts by outcome",
        &["outcome"]
    )
    .expect("Failed to create deliveries metric");

    /// Gauge: messages per queue section
    pub static ref QUEUE_DEPTH: GaugeVec = register_gauge_vec!(
        "relaymail_queue_depth",
        "Number of messages in each queue section",
        &["section"]
    )
    .expect("Failed to create queue_depth metric");

    /// Counter: tickets issued by the server, by kind
    pub static ref TICKETS_ISSUED: CounterVec = register_counter_vec!(
        "relaymail_tickets_issued_total",
        "Tickets issued by kind",
        &["kind"]
    )
    .expect("Failed to create tickets_issued metric");

    /// Histogram: time spent solving ticket puzzles (seconds)
    pub static ref POW_SOLVE_DURATION: Histogram = register_histogram!(
        "relaymail_pow_solve_seconds",
        "Time spent solving proof-of-work puzzles",
        vec![0.01, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0]
    )
    .expect("Failed to create pow_solve_duration metric");

    /// Counter: remote uploads rolled back after a failed part
    pub static ref UPLOAD_ROLLBACKS: Counter = register_counter!(
        "relaymail_upload_rollbacks_total",
        "Remote uploads deleted after a failure"
    )
    .expect("Failed to create upload_rollbacks metric");

    /// Gauge: dispatcher health (1 = running, 0 = stopped)
    pub static ref HEALTH_STATUS: Gauge = register_gauge!(
        "relaymail_health_status",
        "Dispatcher health status (1 = running, 0 = stopped)"
    )
    .expect("Failed to create health_status metric");
}

/// Record the outcome of one delivery attempt
pub fn record_delivery(outcome: &str) {
    DELIVERIES.with_label_values(&[outcome]).inc();
}

pub fn set_queue_depth(section: &str, depth: usize) {
    QUEUE_DEPTH.with_label_values(&[section]).set(depth as f64);
}

pub fn record_ticket_issued(kind: &str) {
    TICKETS_ISSUED.with_label_values(&[kind]).inc();
}

pub fn record_pow_solve(duration_secs: f64) {
    POW_SOLVE_DURATION.observe(duration_secs);
}

pub fn record_rollback() {
    UPLOAD_ROLLBACKS.inc();
}

pub fn set_health_status(healthy: bool) {
    HEALTH_STATUS.set(if healthy { 1.0 } else { 0.0 });
}

/// Encode all metrics as Prometheus text format
pub fn encode_metrics() -> crate::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| crate::RelayError::Other(format!("failed to encode metrics: {}", e)))?;
    String::from_utf8(buffer)
        .map_err(|e| crate::RelayError::Other(format!("metrics are not utf-8: {}", e)))
}
