//! Prometheus metrics for the approval workflow.
//!
//! Exposes a standard `/metrics` endpoint that Prometheus can scrape.

use once_cell::sync::Lazy;
use prometheus::{opts, register_int_counter_vec, Encoder, IntCounterVec, TextEncoder};

static TRANSITIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("sshgate_transitions_total", "Approval state transitions by audit action"),
        &["action"]
    )
    .expect("failed to register sshgate_transitions_total")
});

static REFUSED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("sshgate_refused_total", "Transitions refused by a state guard"),
        &["operation"]
    )
    .expect("failed to register sshgate_refused_total")
});

static EXECUTIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("sshgate_executions_total", "Remote executions by outcome"),
        &["outcome"]
    )
    .expect("failed to register sshgate_executions_total")
});

pub fn record_transition(action: &str) {
    TRANSITIONS_TOTAL.with_label_values(&[action]).inc();
}

pub fn record_refused(operation: &str) {
    REFUSED_TOTAL.with_label_values(&[operation]).inc();
}

/// `outcome` is one of "success", "failed", "timeout".
pub fn record_execution(outcome: &str) {
    EXECUTIONS_TOTAL.with_label_values(&[outcome]).inc();
}

/// Encode all registered metrics as Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap_or_default();
    String::from_utf8(buffer).unwrap_or_default()
}
