//! Example pipeline configuration.
//!
//! Stands in for the configuration script `taskline_core::cli::run` expects
//! a real deployment to evaluate (spec.md §6); registers a small, realistic
//! set of steps the way `original_source/wastfile.py` registers its own:
//! unmanaged formatting/lint steps that shell out to already-installed
//! tools, a managed build step, and a `pytest` step from
//! `taskline-predefined` gated on the build's artifacts.

use std::sync::Arc;

use clap::Parser;

use taskline_core::cli::{run, Cli};
use taskline_core::Pipeline;
use taskline_predefined::{pytest, PytestOptions};

fn configure(pipeline: &mut Pipeline) {
    pipeline
        .step("fmt")
        .callable(Arc::new(|runner| {
            let silent = runner.config().silent_on_success;
            block_on_runner(runner.run(
                &["cargo".to_string(), "fmt".to_string(), "--check".to_string()],
                &[],
                true,
                silent,
            ))
        }))
        .register()
        .expect("fmt is only registered once");

    pipeline
        .step("lint")
        .requires(vec!["fmt".to_string()])
        .callable(Arc::new(|runner| {
            let silent = runner.config().silent_on_success;
            block_on_runner(runner.run(
                &[
                    "cargo".to_string(),
                    "clippy".to_string(),
                    "--".to_string(),
                    "-D".to_string(),
                    "warnings".to_string(),
                ],
                &[],
                true,
                silent,
            ))
        }))
        .register()
        .expect("lint is only registered once");

    pipeline
        .managed_step("build")
        .dependencies(vec!["build".to_string(), "wheel".to_string()])
        .callable(Arc::new(|runner| {
            let silent = runner.config().silent_on_success;
            block_on_runner(runner.run(
                &[
                    "python".to_string(),
                    "-m".to_string(),
                    "build".to_string(),
                ],
                &[],
                false,
                silent,
            ))
        }))
        .register()
        .expect("build is only registered once");

    pytest(
        pipeline,
        PytestOptions {
            requires: Some(vec!["build".to_string()]),
            dependencies: Some(vec!["pytest-cov".to_string()]),
            ..PytestOptions::default()
        },
    )
    .expect("pytest is only registered once");

    pipeline
        .step_group("ci", vec!["lint".to_string(), "pytest".to_string()], true)
        .expect("ci is only registered once");
}

/// Step callables are synchronous; see `taskline_predefined::pytest`'s
/// `block_on_runner` for why blocking the callable's own Tokio task here is
/// safe.
fn block_on_runner<F: std::future::Future<Output = taskline_core::StepOutcome>>(
    future: F,
) -> taskline_core::StepOutcome {
    tokio::task::block_in_place(|| tokio::runtime::Handle::current().block_on(future))
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let exit_code = run(cli, configure).await;
    std::process::exit(exit_code);
}
