//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Nonce assignment outcomes
//! - Reconciliation and resends
//! - Dispatch outcomes, queue depth and flush latency

use crate::error::{SequencerError, SequencerResult};

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};

lazy_static! {
    // Sequencer metrics
    pub static ref NONCE_ASSIGNMENTS: CounterVec = register_counter_vec!(
        "tx_sequencer_nonce_assignments_total",
        "Nonce assignment attempts by outcome",
        &["outcome"]
    ).unwrap();

    pub static ref ACTIVE_SEQUENCERS: GaugeVec = register_gauge_vec!(
        "tx_sequencer_active_sequencers",
        "Addresses with a live sequencer",
        &[]
    ).unwrap();

    pub static ref RECONCILIATIONS: CounterVec = register_counter_vec!(
        "tx_sequencer_reconciliations_total",
        "Ledger reconciliations by result",
        &["result"]
    ).unwrap();

    pub static ref TX_RESENT: CounterVec = register_counter_vec!(
        "tx_sequencer_transactions_resent_total",
        "Transactions resent after reconciliation",
        &[]
    ).unwrap();

    // Dispatch metrics
    pub static ref TX_DISPATCHED: CounterVec = register_counter_vec!(
        "tx_sequencer_transactions_dispatched_total",
        "Dispatched transactions by outcome",
        &["outcome"]
    ).unwrap();

    pub static ref DISPATCH_QUEUE_DEPTH: GaugeVec = register_gauge_vec!(
        "tx_sequencer_dispatch_queue_depth",
        "Transactions waiting for the next flush",
        &[]
    ).unwrap();

    pub static ref FLUSH_LATENCY: HistogramVec = register_histogram_vec!(
        "tx_sequencer_flush_latency_seconds",
        "Time spent submitting one flush cycle",
        &[],
        vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    ).unwrap();
}

/// Render every registered metric in the text exposition format
pub fn render() -> SequencerResult<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| SequencerError::Internal(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| SequencerError::Internal(e.to_string()))
}

// Helper functions to record metrics

pub fn record_nonce_assignment(outcome: &str) {
    NONCE_ASSIGNMENTS.with_label_values(&[outcome]).inc();
}

pub fn record_active_sequencers(count: usize) {
    ACTIVE_SEQUENCERS.with_label_values(&[]).set(count as f64);
}

pub fn record_reconciliation(result: &str) {
    RECONCILIATIONS.with_label_values(&[result]).inc();
}

pub fn record_resent(count: usize) {
    TX_RESENT.with_label_values(&[]).inc_by(count as f64);
}

/// Classify a dispatch result into an outcome label
pub fn record_dispatch(result: &SequencerResult<String>) {
    let outcome = match result {
        Ok(_) => "accepted",
        Err(SequencerError::Rejected { .. }) => "rejected",
        Err(SequencerError::DuplicateNonce { .. }) => "duplicate",
        Err(SequencerError::Cancelled { .. }) | Err(SequencerError::Closed) => "cancelled",
        Err(_) => "failed",
    };
    TX_DISPATCHED.with_label_values(&[outcome]).inc();
}

pub fn record_queue_depth(depth: usize) {
    DISPATCH_QUEUE_DEPTH.with_label_values(&[]).set(depth as f64);
}

pub fn record_flush_latency(latency_secs: f64) {
    FLUSH_LATENCY.with_label_values(&[]).observe(latency_secs);
}
