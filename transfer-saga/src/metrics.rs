//! Prometheus metrics for saga steps

use lazy_static::lazy_static;
use prometheus::{register_int_counter_vec, IntCounterVec};

lazy_static! {
    /// Saga steps applied, by role, step and resulting status
    pub static ref SAGA_STEPS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "saga_steps_total",
        "Saga steps applied by participants",
        &["role", "step", "status"]
    )
    .unwrap();

    /// Outbox relay results, by outcome
    pub static ref RELAY_RECORDS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "saga_relay_records_total",
        "Outbox records handled by the relay",
        &["outcome"]
    )
    .unwrap();
}

/// Count one saga step
pub fn record_step(role: &str, step: &str, status: &str) {
    SAGA_STEPS_TOTAL
        .with_label_values(&[role, step, status])
        .inc();
}
