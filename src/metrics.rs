//! Prometheus metrics for the bridge relayer
//!
//! Registered in the default registry and exposed on the `/metrics` endpoint.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram_vec, CounterVec,
    Encoder, Gauge, GaugeVec, HistogramVec, TextEncoder,
};

use crate::db::StateCounts;
use crate::types::{EventState, FailureClass};

lazy_static! {
    // Observer
    pub static ref BLOCKS_PROCESSED: CounterVec = register_counter_vec!(
        "relayer_blocks_processed_total",
        "Total number of blocks scanned by the observers",
        &["chain"]
    ).unwrap();

    pub static ref LATEST_BLOCK: GaugeVec = register_gauge_vec!(
        "relayer_latest_block",
        "Latest block number fully processed",
        &["chain"]
    ).unwrap();

    pub static ref EVENTS_OBSERVED: CounterVec = register_counter_vec!(
        "relayer_events_observed_total",
        "Bridge events inserted into the event store",
        &["chain", "direction"]
    ).unwrap();

    pub static ref DUPLICATE_OBSERVATIONS: CounterVec = register_counter_vec!(
        "relayer_duplicate_observations_total",
        "Observations collapsed onto an existing idempotency key",
        &["chain"]
    ).unwrap();

    pub static ref PAYLOAD_CONFLICTS: CounterVec = register_counter_vec!(
        "relayer_payload_conflicts_total",
        "Duplicate observations whose payload differs from the stored event",
        &["chain"]
    ).unwrap();

    pub static ref SKIPPED_LOGS: CounterVec = register_counter_vec!(
        "relayer_skipped_logs_total",
        "Logs that could not be normalized into a bridge event",
        &["chain"]
    ).unwrap();

    // State machine
    pub static ref TRANSITIONS: CounterVec = register_counter_vec!(
        "relayer_state_transitions_total",
        "Event state transitions applied",
        &["from", "to"]
    ).unwrap();

    pub static ref EVENTS_BY_STATE: GaugeVec = register_gauge_vec!(
        "relayer_events_by_state",
        "Events currently in each state",
        &["state"]
    ).unwrap();

    pub static ref ACTIONS_SUBMITTED: CounterVec = register_counter_vec!(
        "relayer_actions_submitted_total",
        "Action executor invocations by outcome",
        &["chain", "action", "outcome"]
    ).unwrap();

    pub static ref DEAD_LETTERS: CounterVec = register_counter_vec!(
        "relayer_dead_letters_total",
        "Events moved to the dead-letter state",
        &["class"]
    ).unwrap();

    pub static ref RECONCILIATIONS: CounterVec = register_counter_vec!(
        "relayer_reconciliations_total",
        "Reconciliation sweep decisions",
        &["decision"]
    ).unwrap();

    pub static ref PROCESSING_LATENCY: HistogramVec = register_histogram_vec!(
        "relayer_processing_latency_seconds",
        "Time from first observation to finalization",
        &["direction"],
        vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 900.0, 3600.0]
    ).unwrap();

    // Errors / health
    pub static ref ERRORS: CounterVec = register_counter_vec!(
        "relayer_errors_total",
        "Total number of errors",
        &["component", "type"]
    ).unwrap();

    pub static ref CONSECUTIVE_FAILURES: GaugeVec = register_gauge_vec!(
        "relayer_consecutive_failures",
        "Number of consecutive failures (circuit breaker)",
        &["component"]
    ).unwrap();

    pub static ref UP: Gauge = register_gauge!(
        "relayer_up",
        "Whether the relayer is up and running"
    ).unwrap();

    pub static ref LAST_SUCCESSFUL_POLL: GaugeVec = register_gauge_vec!(
        "relayer_last_successful_poll_timestamp",
        "Unix timestamp of last successful poll",
        &["chain"]
    ).unwrap();
}

/// Record a block range processed by an observer
pub fn record_blocks_processed(chain: &str, from: u64, to: u64) {
    BLOCKS_PROCESSED
        .with_label_values(&[chain])
        .inc_by((to.saturating_sub(from) + 1) as f64);
    LATEST_BLOCK.with_label_values(&[chain]).set(to as f64);
}

pub fn record_event_observed(chain: &str, direction: &str) {
    EVENTS_OBSERVED.with_label_values(&[chain, direction]).inc();
}

pub fn record_duplicate_observation(chain: &str) {
    DUPLICATE_OBSERVATIONS.with_label_values(&[chain]).inc();
}

pub fn record_payload_conflict(chain: &str) {
    PAYLOAD_CONFLICTS.with_label_values(&[chain]).inc();
}

pub fn record_skipped_log(chain: &str) {
    SKIPPED_LOGS.with_label_values(&[chain]).inc();
}

pub fn record_transition(from: EventState, to: EventState) {
    TRANSITIONS
        .with_label_values(&[from.as_str(), to.as_str()])
        .inc();
}

/// Record an executor outcome (`submitted`, `already_processed`, `transient`, ...)
pub fn record_action(chain: &str, action: &str, outcome: &str) {
    ACTIONS_SUBMITTED
        .with_label_values(&[chain, action, outcome])
        .inc();
}

pub fn record_dead_letter(class: Option<FailureClass>) {
    let label = class.map(|c| c.as_str()).unwrap_or("unknown");
    DEAD_LETTERS.with_label_values(&[label]).inc();
}

pub fn record_reconciliation(decision: &str) {
    RECONCILIATIONS.with_label_values(&[decision]).inc();
}

pub fn record_latency(direction: &str, seconds: f64) {
    PROCESSING_LATENCY
        .with_label_values(&[direction])
        .observe(seconds);
}

pub fn set_state_counts(counts: &StateCounts) {
    for (state, count) in &counts.by_state {
        EVENTS_BY_STATE
            .with_label_values(&[state.as_str()])
            .set(*count as f64);
    }
}

pub fn record_error(component: &str, error_type: &str) {
    ERRORS.with_label_values(&[component, error_type]).inc();
}

pub fn set_consecutive_failures(component: &str, count: u32) {
    CONSECUTIVE_FAILURES
        .with_label_values(&[component])
        .set(count as f64);
}

/// Record last successful poll
pub fn record_successful_poll(chain: &str) {
    LAST_SUCCESSFUL_POLL
        .with_label_values(&[chain])
        .set(chrono::Utc::now().timestamp() as f64);
}

/// Encode the default registry in the Prometheus text format
pub fn encode() -> Result<(String, Vec<u8>), prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    Ok((encoder.format_type().to_string(), buffer))
}
