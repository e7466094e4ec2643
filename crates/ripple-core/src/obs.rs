//! Structured lifecycle events for cascade executions.
//!
//! Every record carries an `event` field (`cascade.started`,
//! `layer.finished`, ...) so log pipelines can filter on it. The execution
//! driver runs inside [`execution_span`], attached with
//! `tracing::Instrument`.

use tracing::{info, warn, Span};

/// Span for one execution's driver task.
pub fn execution_span(execution_id: &str) -> Span {
    tracing::info_span!("ripple.execution", execution_id = %execution_id)
}

pub fn emit_cascade_started(execution_id: &str, source_id: &str, layers: usize, repos: usize) {
    info!(
        event = "cascade.started",
        execution_id = %execution_id,
        source_id = %source_id,
        layers = layers,
        repos = repos,
    );
}

/// `reason` is `requested` or `step_failures`.
pub fn emit_cascade_paused(execution_id: &str, layer: usize, reason: &str) {
    info!(event = "cascade.paused", execution_id = %execution_id, layer = layer, reason = %reason);
}

pub fn emit_cascade_resumed(execution_id: &str, layer: usize) {
    info!(event = "cascade.resumed", execution_id = %execution_id, layer = layer);
}

pub fn emit_cascade_finished(
    execution_id: &str,
    status: &str,
    completed: usize,
    failed: usize,
    skipped: usize,
    duration_ms: u64,
) {
    info!(
        event = "cascade.finished",
        execution_id = %execution_id,
        status = %status,
        completed = completed,
        failed = failed,
        skipped = skipped,
        duration_ms = duration_ms,
    );
}

pub fn emit_layer_finished(execution_id: &str, layer: usize, done: usize, failed: usize) {
    info!(
        event = "layer.finished",
        execution_id = %execution_id,
        layer = layer,
        done = done,
        failed = failed,
    );
}

pub fn emit_step_failed(execution_id: &str, repo_id: &str, stage: &str, error: &str) {
    warn!(
        event = "step.failed",
        execution_id = %execution_id,
        repo_id = %repo_id,
        stage = %stage,
        error = %error,
    );
}

pub fn emit_ci_finished(execution_id: &str, repo_id: &str, status: &str, url: Option<&str>) {
    info!(
        event = "ci.finished",
        execution_id = %execution_id,
        repo_id = %repo_id,
        status = %status,
        url = url.unwrap_or(""),
    );
}

/// History persistence failed; the execution itself still finished.
pub fn emit_history_error(execution_id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "history.save_failed", execution_id = %execution_id, error = %error);
}
