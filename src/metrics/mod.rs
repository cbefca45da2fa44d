//! Prometheus metrics for the yeoul pipeline
//!
//! Call `init_metrics()` at application startup to register all metrics.
//! If initialization fails, metrics operations become no-ops.

use prometheus::{
    register_counter_vec, register_gauge, CounterVec, Encoder, Gauge, TextEncoder,
};
use std::sync::OnceLock;

/// Container for all pipeline metrics
struct PipelineMetrics {
    admissions: CounterVec,
    quota_denials: CounterVec,
    provider_calls: CounterVec,
    stage_transitions: CounterVec,
    overload_marks: CounterVec,
    overloaded_models: Gauge,
}

/// Global storage for pipeline metrics
static METRICS: OnceLock<PipelineMetrics> = OnceLock::new();

/// Flag to track if initialization was attempted
static METRICS_INIT_ATTEMPTED: OnceLock<bool> = OnceLock::new();

/// Initialize all Prometheus metrics
///
/// This function should be called once at application startup.
/// If metric registration fails, errors are logged and subsequent
/// metric operations become no-ops.
pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    // Prevent double initialization
    if METRICS_INIT_ATTEMPTED.get().is_some() {
        return Ok(());
    }
    METRICS_INIT_ATTEMPTED.set(true).ok();

    let metrics = PipelineMetrics {
        admissions: register_counter_vec!(
            "yeoul_admissions_total",
            "Admission decisions by model and outcome",
            &["model", "outcome"]
        )?,
        quota_denials: register_counter_vec!(
            "yeoul_quota_denials_total",
            "Quota denials by model and violated dimension",
            &["model", "dimension"]
        )?,
        provider_calls: register_counter_vec!(
            "yeoul_provider_calls_total",
            "Inference provider calls by model and outcome",
            &["model", "outcome"]
        )?,
        stage_transitions: register_counter_vec!(
            "yeoul_stage_transitions_total",
            "Content status transitions by target status",
            &["to_status"]
        )?,
        overload_marks: register_counter_vec!(
            "yeoul_overload_marks_total",
            "Overload marks by model",
            &["model"]
        )?,
        overloaded_models: register_gauge!(
            "yeoul_overloaded_models",
            "Number of models currently marked overloaded"
        )?,
    };

    METRICS
        .set(metrics)
        .map_err(|_| "Pipeline metrics already initialized")?;

    tracing::info!("Prometheus metrics initialized successfully");
    Ok(())
}

/// Check if metrics have been initialized
pub fn metrics_initialized() -> bool {
    METRICS.get().is_some()
}

/// Record an admission decision
pub fn record_admission(model: &str, allowed: bool) {
    if let Some(m) = METRICS.get() {
        let outcome = if allowed { "allowed" } else { "denied" };
        m.admissions.with_label_values(&[model, outcome]).inc();
    }
}

/// Record a quota denial with its dimension
pub fn record_quota_denial(model: &str, dimension: &str) {
    if let Some(m) = METRICS.get() {
        m.quota_denials.with_label_values(&[model, dimension]).inc();
    }
}

/// Record a provider call outcome
pub fn record_provider_call(model: &str, outcome: &str) {
    if let Some(m) = METRICS.get() {
        m.provider_calls.with_label_values(&[model, outcome]).inc();
    }
}

/// Record a content status transition
pub fn record_stage_transition(to_status: &str) {
    if let Some(m) = METRICS.get() {
        m.stage_transitions.with_label_values(&[to_status]).inc();
    }
}

/// Record an overload mark
pub fn record_overload_mark(model: &str) {
    if let Some(m) = METRICS.get() {
        m.overload_marks.with_label_values(&[model]).inc();
    }
}

/// Update the overloaded-models gauge
pub fn set_overloaded_models(count: usize) {
    if let Some(m) = METRICS.get() {
        m.overloaded_models.set(count as f64);
    }
}

/// Encode all registered metrics in the Prometheus text format
pub fn metrics_text() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
