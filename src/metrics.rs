//! Prometheus metrics for cycle runs and script execution
//!
//! Everything registers into the default registry; [`render`] produces the
//! text exposition format.

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_histogram_vec, register_int_counter, register_int_counter_vec,
    register_int_gauge, Encoder, Histogram, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    TextEncoder,
};

lazy_static! {
    // ─────────────────────────────────────────────────────────────────────────────
    // Cycle Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Finished cycle runs.
    ///
    /// Labels:
    /// - outcome: "completed", "cycle_limit", "retries_exhausted", "invalid_document",
    ///   "model_error", "session_error"
    pub static ref CYCLE_RUNS: IntCounterVec = register_int_counter_vec!(
        "codeact_cycle_runs_total",
        "Cycle runs by outcome",
        &["outcome"]
    ).expect("failed to register CYCLE_RUNS metric");

    /// Steps taken per run (agent and execute steps both count).
    pub static ref CYCLE_STEPS: Histogram = register_histogram!(
        "codeact_cycle_steps",
        "Steps taken per cycle run",
        vec![1.0, 2.0, 3.0, 5.0, 8.0, 13.0, 21.0]
    ).expect("failed to register CYCLE_STEPS metric");

    /// Step attempts that failed with a retryable error.
    ///
    /// Labels:
    /// - step: "agent" or "execute"
    pub static ref STEP_RETRIES: IntCounterVec = register_int_counter_vec!(
        "codeact_step_retries_total",
        "Retryable step failures",
        &["step"]
    ).expect("failed to register STEP_RETRIES metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Model Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Chat completion latency in seconds.
    ///
    /// Labels:
    /// - model: "provider:model"
    pub static ref MODEL_CALL_DURATION: HistogramVec = register_histogram_vec!(
        "codeact_model_call_duration_seconds",
        "Chat completion latency",
        &["model"],
        vec![0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]
    ).expect("failed to register MODEL_CALL_DURATION metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Script Execution Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Script executions.
    ///
    /// Labels:
    /// - status: "success", "error", "timeout"
    pub static ref SCRIPT_EXECUTIONS: IntCounterVec = register_int_counter_vec!(
        "codeact_script_executions_total",
        "Script executions by status",
        &["status"]
    ).expect("failed to register SCRIPT_EXECUTIONS metric");

    /// Wall-clock time of one script execution in seconds.
    pub static ref SCRIPT_EXECUTION_DURATION: Histogram = register_histogram!(
        "codeact_script_execution_duration_seconds",
        "Script execution wall-clock time",
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0]
    ).expect("failed to register SCRIPT_EXECUTION_DURATION metric");

    /// Interpreter processes started (first use, or restart after timeout/crash).
    pub static ref WORKER_STARTS: IntCounter = register_int_counter!(
        "codeact_worker_starts_total",
        "Interpreter processes started"
    ).expect("failed to register WORKER_STARTS metric");

    /// Interpreter processes currently running.
    pub static ref LIVE_WORKERS: IntGauge = register_int_gauge!(
        "codeact_live_workers",
        "Interpreter processes currently running"
    ).expect("failed to register LIVE_WORKERS metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Registry Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Sessions currently held by the registry.
    pub static ref LIVE_SESSIONS: IntGauge = register_int_gauge!(
        "codeact_live_sessions",
        "Script sessions held by the registry"
    ).expect("failed to register LIVE_SESSIONS metric");
}

/// Encode every registered metric in the Prometheus text format
pub fn render() -> Result<String, prometheus::Error> {
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
