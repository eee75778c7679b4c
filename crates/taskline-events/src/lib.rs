//! Structured lifecycle events for step execution, plus the line-prefixing
//! renderer the CLI uses to interleave concurrent subprocess output.
//!
//! Every lifecycle transition is emitted as a `tracing` event under the
//! `taskline::step` target with an `event_type` field, so any `tracing`
//! subscriber (not just the renderer below) can observe scheduling.

mod renderer;

pub use renderer::{OutputRenderer, Stream};

/// Emitted when a step instance's Setup phase begins.
#[macro_export]
macro_rules! emit_setup_started {
    ($instance:expr) => {
        ::tracing::info!(
            target: "taskline::step",
            event_type = "setup_started",
            instance = %$instance,
        );
    };
}

/// Emitted when a step instance's Setup phase finishes.
#[macro_export]
macro_rules! emit_setup_completed {
    ($instance:expr, $success:expr, $duration_ms:expr) => {
        ::tracing::info!(
            target: "taskline::step",
            event_type = "setup_completed",
            instance = %$instance,
            success = $success,
            duration_ms = $duration_ms,
        );
    };
}

/// Emitted when a step instance's Run phase begins.
#[macro_export]
macro_rules! emit_run_started {
    ($instance:expr, $command:expr) => {
        ::tracing::info!(
            target: "taskline::step",
            event_type = "run_started",
            instance = %$instance,
            command = %$command,
        );
    };
}

/// Emitted for each line of subprocess output a step produces.
#[macro_export]
macro_rules! emit_output {
    ($instance:expr, $stream:expr, $line:expr) => {
        ::tracing::debug!(
            target: "taskline::output",
            event_type = "output",
            instance = %$instance,
            stream = %$stream,
            line = %$line,
        );
    };
}

/// Emitted when a step instance's Run phase finishes.
#[macro_export]
macro_rules! emit_run_completed {
    ($instance:expr, $success:expr, $exit_code:expr, $duration_ms:expr) => {
        ::tracing::info!(
            target: "taskline::step",
            event_type = "run_completed",
            instance = %$instance,
            success = $success,
            exit_code = ?$exit_code,
            duration_ms = $duration_ms,
        );
    };
}

/// Emitted once per pipeline run with the final aggregate counts.
#[macro_export]
macro_rules! emit_pipeline_summary {
    ($succeeded:expr, $failed:expr, $blocked:expr, $cancelled:expr) => {
        ::tracing::info!(
            target: "taskline::pipeline",
            event_type = "summary",
            succeeded = $succeeded,
            failed = $failed,
            blocked = $blocked,
            cancelled = $cancelled,
        );
    };
}
