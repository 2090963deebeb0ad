//! Prometheus metrics for the bridge coordinator
//!
//! Exposed on `/metrics` for Prometheus scraping.

use async_trait::async_trait;
use chrono::Utc;
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram, CounterVec,
    Gauge, GaugeVec, Histogram,
};

use crate::audit::AuditSink;
use crate::models::TransitionEvent;

lazy_static! {
    // Ingestion
    pub static ref DEPOSITS: CounterVec = register_counter_vec!(
        "bridge_deposits_total",
        "Deposit reports by result (created, duplicate, rejected)",
        &["result"]
    ).unwrap();

    // State machine
    pub static ref TRANSITIONS: CounterVec = register_counter_vec!(
        "bridge_transitions_total",
        "Transaction status transitions",
        &["from", "to"]
    ).unwrap();

    pub static ref ATTESTATIONS: CounterVec = register_counter_vec!(
        "bridge_attestations_total",
        "Attestation submissions by result (accepted, duplicate, rejected)",
        &["result"]
    ).unwrap();

    pub static ref EXECUTIONS: CounterVec = register_counter_vec!(
        "bridge_executions_total",
        "Target execution submissions by outcome",
        &["outcome"]
    ).unwrap();

    pub static ref SETTLEMENT_LATENCY: Histogram = register_histogram!(
        "bridge_settlement_latency_seconds",
        "Time from deposit to COMPLETED",
        vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0]
    ).unwrap();

    // Queue and set sizes
    pub static ref PENDING_TRANSACTIONS: GaugeVec = register_gauge_vec!(
        "bridge_pending_transactions",
        "Non-terminal transactions per status",
        &["status"]
    ).unwrap();

    pub static ref ACTIVE_VALIDATORS: GaugeVec = register_gauge_vec!(
        "bridge_active_validators",
        "Quorum-eligible validators per bridge",
        &["bridge"]
    ).unwrap();

    // Processor health
    pub static ref CONSECUTIVE_FAILURES: Gauge = register_gauge!(
        "bridge_processor_consecutive_failures",
        "Consecutive processor poll failures (circuit breaker)"
    ).unwrap();

    pub static ref LAST_SUCCESSFUL_POLL: Gauge = register_gauge!(
        "bridge_processor_last_successful_poll_timestamp",
        "Unix timestamp of last successful processor poll"
    ).unwrap();

    pub static ref UP: Gauge = register_gauge!(
        "bridge_coordinator_up",
        "Whether the coordinator is up and running"
    ).unwrap();
}

pub fn record_deposit(result: &str) {
    DEPOSITS.with_label_values(&[result]).inc();
}

pub fn record_attestation(result: &str) {
    ATTESTATIONS.with_label_values(&[result]).inc();
}

pub fn record_execution(outcome: &str) {
    EXECUTIONS.with_label_values(&[outcome]).inc();
}

pub fn record_settlement_latency(seconds: f64) {
    SETTLEMENT_LATENCY.observe(seconds.max(0.0));
}

pub fn set_pending_transactions(status: &str, count: i64) {
    PENDING_TRANSACTIONS
        .with_label_values(&[status])
        .set(count as f64);
}

pub fn set_active_validators(bridge_id: i64, count: usize) {
    ACTIVE_VALIDATORS
        .with_label_values(&[&bridge_id.to_string()])
        .set(count as f64);
}

/// Update consecutive failures (circuit breaker)
pub fn set_consecutive_failures(count: u32) {
    CONSECUTIVE_FAILURES.set(count as f64);
}

pub fn record_successful_poll() {
    LAST_SUCCESSFUL_POLL.set(Utc::now().timestamp() as f64);
}

/// Counts every stored transition
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsAuditSink;

#[async_trait]
impl AuditSink for MetricsAuditSink {
    async fn record_transition(&self, event: &TransitionEvent) {
        TRANSITIONS
            .with_label_values(&[event.from.as_str(), event.to.as_str()])
            .inc();
    }
}
