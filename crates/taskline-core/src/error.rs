use miette::Diagnostic;
use thiserror::Error;

/// Every way a pipeline run can fail, grouped by the exit code it maps to.
///
/// Configuration errors (exit 2) are caught before any step runs. Environment
/// and step-body errors (exit 1) surface from running steps. `Aggregate`
/// (exit 1) is synthesized once at the end of a run that scheduled at least
/// one step that did not succeed.
#[derive(Debug, Error, Diagnostic)]
pub enum Error {
    #[error("step '{name}' is already registered")]
    #[diagnostic(code(taskline::config::duplicate_step))]
    DuplicateStep { name: String },

    #[error("unknown step(s): {}", .names.join(", "))]
    #[diagnostic(code(taskline::config::unknown_steps))]
    UnknownSteps { names: Vec<String> },

    #[error("cyclic dependency detected: {cycle}")]
    #[diagnostic(code(taskline::config::cyclic_dependencies))]
    CyclicStepDependencies { cycle: String },

    #[error("defaults already set for step '{name}'")]
    #[diagnostic(code(taskline::config::defaults_already_set))]
    DefaultsAlreadySet { name: String },

    #[error("parameter layer for '{name}' has {expected} names but {actual} values per row")]
    #[diagnostic(code(taskline::config::mismatched_parameters))]
    MismatchedNumberOfParameters {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("parameter '{parameter}' is set by more than one layer on step '{name}'")]
    #[diagnostic(code(taskline::config::parameter_conflict))]
    ParameterConflict { name: String, parameter: String },

    #[error("invalid PY_COLORS value '{value}': must be '0' or '1'")]
    #[diagnostic(code(taskline::config::invalid_py_colors))]
    InvalidPyColors { value: String },

    #[error("interpreter '{interpreter}' is not available on PATH")]
    #[diagnostic(code(taskline::environment::unavailable_interpreter))]
    UnavailableInterpreter { interpreter: String },

    #[error("command '{command}' was not found on the environment's PATH")]
    #[diagnostic(code(taskline::environment::command_not_found))]
    CommandNotFound { command: String },

    #[error(
        "command '{command}' resolved outside environment '{instance}' \
         without external_command=true"
    )]
    #[diagnostic(code(taskline::environment::command_not_in_environment))]
    CommandNotInEnvironment { instance: String, command: String },

    #[error("step '{instance}' failed: {reason}")]
    #[diagnostic(code(taskline::step::body_failed))]
    StepBodyFailed { instance: String, reason: String },

    #[error("{}", aggregate_message(*.failed, *.unrunnable, *.cancelled))]
    #[diagnostic(code(taskline::pipeline::aggregate_failure))]
    Aggregate {
        failed: usize,
        unrunnable: usize,
        cancelled: usize,
    },

    #[error(transparent)]
    #[diagnostic(code(taskline::io))]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    #[diagnostic(code(taskline::graph))]
    Graph(#[from] taskline_graph::Error),
}

impl Error {
    /// The process exit code this error corresponds to (spec.md §7).
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::DuplicateStep { .. }
            | Error::UnknownSteps { .. }
            | Error::CyclicStepDependencies { .. }
            | Error::DefaultsAlreadySet { .. }
            | Error::MismatchedNumberOfParameters { .. }
            | Error::ParameterConflict { .. }
            | Error::InvalidPyColors { .. } => 2,
            _ => 1,
        }
    }
}

fn pluralize(count: usize, noun: &str, verb_phrase: &str) -> String {
    let verb_phrase = if count == 1 {
        verb_phrase.replacen("were", "was", 1)
    } else {
        verb_phrase.to_string()
    };
    if count == 1 {
        format!("1 {noun} {verb_phrase}")
    } else {
        format!("{count} {noun}s {verb_phrase}")
    }
}

fn aggregate_message(failed: usize, unrunnable: usize, cancelled: usize) -> String {
    let mut message = pluralize(failed, "job", "failed");
    if unrunnable > 0 {
        message.push_str(&format!("\n+ {}", pluralize(unrunnable, "job", "could not run")));
    }
    if cancelled > 0 {
        message.push_str(&format!("\n+ {}", pluralize(cancelled, "job", "were cancelled")));
    }
    message
}

pub type Result<T> = std::result::Result<T, Error>;
