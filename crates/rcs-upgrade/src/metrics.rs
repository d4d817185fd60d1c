//! ---
//! rcs_section: "02-upgrade-engine"
//! rcs_subsection: "module"
//! rcs_type: "source"
//! rcs_scope: "code"
//! rcs_description: "OTA upgrade orchestration for dual-bank devices."
//! rcs_version: "v0.0.0-prealpha"
//! rcs_owner: "tbd"
//! ---
use once_cell::sync::Lazy;
use prometheus::{register_int_counter, register_int_counter_vec, IntCounter, IntCounterVec};

pub(crate) static SESSIONS_STARTED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "rcs_upgrade_sessions_started_total",
        "Total number of upgrade sessions started"
    )
    .expect("metric registration to succeed")
});

pub(crate) static SESSIONS_FINISHED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "rcs_upgrade_sessions_total",
        "Upgrade sessions by terminal outcome",
        &["outcome"]
    )
    .expect("metric registration to succeed")
});

pub(crate) fn record_started() {
    SESSIONS_STARTED_TOTAL.inc();
}

pub(crate) fn record_outcome(outcome: &str) {
    SESSIONS_FINISHED_TOTAL.with_label_values(&[outcome]).inc();
}

/// Number of sessions that ended with `outcome` (`done`, `failed`, `cancelled`).
pub fn sessions_finished(outcome: &str) -> u64 {
    SESSIONS_FINISHED_TOTAL.with_label_values(&[outcome]).get()
}

pub fn sessions_started() -> u64 {
    SESSIONS_STARTED_TOTAL.get()
}
