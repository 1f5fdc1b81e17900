// ============================================================================
// PROMETHEUS METRICS
// ============================================================================

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter_vec, Histogram, IntCounterVec, TextEncoder,
};

lazy_static! {
    // ========================================================================
    // WEBHOOK METRICS
    // ========================================================================

    /// Webhook deliveries by source and outcome
    /// (processed | rejected | malformed | ignored | retried).
    pub static ref WEBHOOKS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "webhooks_total",
        "Webhook deliveries by source and outcome",
        &["source", "outcome"]
    )
    .unwrap();

    // ========================================================================
    // LEDGER & SETTLEMENT METRICS
    // ========================================================================

    /// Ledger rows written by entry type.
    pub static ref LEDGER_ENTRIES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "ledger_entries_total",
        "Ledger entries written by entry type",
        &["entry_type"]
    )
    .unwrap();

    /// Settlement attempts by outcome (completed | failed | ignored).
    pub static ref SETTLEMENTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "settlements_total",
        "Upload settlements by outcome",
        &["outcome"]
    )
    .unwrap();

    /// End-to-end settlement duration, HEAD included.
    pub static ref SETTLEMENT_DURATION: Histogram = register_histogram!(
        "settlement_duration_seconds",
        "Upload settlement duration in seconds",
        vec![0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0, 2.5, 5.0]
    )
    .unwrap();

    // ========================================================================
    // QUEUE METRICS
    // ========================================================================

    /// Jobs pushed back for another attempt, by kind.
    pub static ref QUEUE_RETRIES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "queue_retries_total",
        "Queue jobs retried by kind",
        &["kind"]
    )
    .unwrap();
}

// ============================================================================
// RECORDING HELPERS
// ============================================================================

pub fn record_webhook(source: &str, outcome: &str) {
    WEBHOOKS_TOTAL.with_label_values(&[source, outcome]).inc();
}

pub fn record_ledger_entry(entry_type: &str) {
    LEDGER_ENTRIES_TOTAL.with_label_values(&[entry_type]).inc();
}

pub fn record_settlement(outcome: &str) {
    SETTLEMENTS_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_queue_retry(kind: &str) {
    QUEUE_RETRIES_TOTAL.with_label_values(&[kind]).inc();
}

/// Render the registry for the /metrics endpoint.
pub fn render() -> String {
    let encoder = TextEncoder::new();
    encoder.encode_to_string(&prometheus::gather()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_register_and_render() {
        record_webhook("payment", "processed");
        record_settlement("completed");
        record_queue_retry("settle_upload");
        let rendered = render();
        assert!(rendered.contains("webhooks_total"));
        assert!(rendered.contains("settlements_total"));
    }
}
