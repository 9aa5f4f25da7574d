//! Logging bootstrap and Prometheus metrics for recovery tasks

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, Encoder,
    HistogramVec, IntCounter, IntCounterVec, TextEncoder,
};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

lazy_static! {
    /// Finished recovery tasks by engine and outcome
    static ref TASKS: IntCounterVec = register_int_counter_vec!(
        "pitr_tasks_total",
        "Total number of finished recovery tasks",
        &["engine", "status"]
    ).unwrap();

    /// Duration of each state machine step
    static ref STEP_DURATION: HistogramVec = register_histogram_vec!(
        "pitr_step_duration_seconds",
        "Recovery step duration in seconds",
        &["engine", "step"],
        vec![0.1, 1.0, 10.0, 60.0, 300.0, 900.0, 3600.0, 14400.0]
    ).unwrap();

    /// Binlog files replayed into targets
    static ref BINLOGS_REPLAYED: IntCounterVec = register_int_counter_vec!(
        "pitr_binlogs_replayed_total",
        "Total number of binlog files replayed",
        &["engine"]
    ).unwrap();

    static ref BYTES_DECOMPRESSED: IntCounter = register_int_counter!(
        "pitr_decompressed_bytes_total",
        "Total bytes written by artifact decompression"
    ).unwrap();

    /// Non-fatal warnings by kind
    static ref WARNINGS: IntCounterVec = register_int_counter_vec!(
        "pitr_warnings_total",
        "Total number of recovery warnings",
        &["kind"]
    ).unwrap();
}

/// Install a `tracing` subscriber filtered by `RUST_LOG`, or `default_filter`
///
/// Safe to call more than once; only the first call installs anything.
pub fn init_tracing(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

pub fn record_task(engine: &str, status: &str) {
    TASKS.with_label_values(&[engine, status]).inc();
}

pub fn record_step(engine: &str, step: &str, elapsed: Duration) {
    STEP_DURATION
        .with_label_values(&[engine, step])
        .observe(elapsed.as_secs_f64());
}

pub fn record_binlog_replayed(engine: &str) {
    BINLOGS_REPLAYED.with_label_values(&[engine]).inc();
}

pub fn record_decompressed(bytes: u64) {
    BYTES_DECOMPRESSED.inc_by(bytes);
}

pub fn record_warning(kind: &str) {
    WARNINGS.with_label_values(&[kind]).inc();
}

/// Render every registered metric in the Prometheus text format
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
