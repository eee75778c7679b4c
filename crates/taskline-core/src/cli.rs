use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::error::Error;
use crate::pipeline::Pipeline;

/// Flags for one pipeline invocation (spec.md §6).
///
/// Grounded on `original_source/src/wast/__main__.py`'s `_parse_args` and
/// `examples/cuenv-cuenv/crates/cuenv-cli/src/cli.rs`'s `clap`-derive shape.
#[derive(Parser, Debug)]
#[command(name = "taskline")]
#[command(about = "Hermetic, cached, DAG-based developer task orchestrator")]
#[command(version)]
pub struct Cli {
    /// Path to the user pipeline script (the configuration-loader contract
    /// lives outside this crate; the path is informational here).
    #[arg(long, default_value = "./taskline.rs")]
    pub config: PathBuf,

    /// Base run set.
    #[arg(short = 's', long = "step", value_delimiter = ',')]
    pub steps: Vec<String>,

    /// Exact run set (skips closure expansion of `requires`).
    #[arg(short = 'o', long = "only", value_delimiter = ',')]
    pub only: Vec<String>,

    /// Subtracted from the run set after closure.
    #[arg(short = 'e', long = "except", value_delimiter = ',')]
    pub except: Vec<String>,

    /// List only; do not execute.
    #[arg(short = 'l', long = "list")]
    pub list: bool,

    /// When listing, include each step's prerequisites.
    #[arg(long = "list-dependencies")]
    pub list_dependencies: bool,

    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[arg(short = 'q', long = "quiet", action = clap::ArgAction::Count)]
    pub quiet: u8,

    /// Parallelism; `0` means detected CPU count.
    #[arg(short = 'j', long = "jobs", default_value_t = 1)]
    pub jobs: usize,

    /// Only run setup actions, don't run.
    #[arg(long = "setup-only", conflicts_with = "no_setup")]
    pub setup_only: bool,

    /// Don't run setup actions, only the rest.
    #[arg(long = "no-setup")]
    pub no_setup: bool,

    /// Stop at the first error.
    #[arg(long = "ff", visible_alias = "fail-fast")]
    pub fail_fast: bool,

    /// Clear the cache before running.
    #[arg(short = 'c', long = "clean")]
    pub clean: bool,

    /// Force colored output on.
    #[arg(long = "colors", conflicts_with = "no_colors")]
    pub colors: bool,

    /// Force colored output off.
    #[arg(long = "no-colors")]
    pub no_colors: bool,

    /// Directory where to store the persistent cache.
    #[arg(long = "cache-path", default_value = "./.wast")]
    pub cache_path: PathBuf,

    /// Don't report a missing interpreter as a failure; skip the step.
    #[arg(long = "skip-missing-interpreters")]
    pub skip_missing_interpreters: bool,
}

impl Cli {
    fn explicit_colors(&self) -> Option<bool> {
        if self.colors {
            Some(true)
        } else if self.no_colors {
            Some(false)
        } else {
            None
        }
    }

    fn verbosity(&self) -> i64 {
        i64::from(self.verbose) - i64::from(self.quiet)
    }

    fn to_config(&self) -> crate::error::Result<Config> {
        Config::new(
            self.cache_path.clone(),
            self.jobs,
            self.fail_fast,
            self.no_setup,
            self.setup_only,
            self.skip_missing_interpreters,
            self.explicit_colors(),
            self.verbosity() < 2,
        )
    }
}

fn init_tracing(verbosity: i64) {
    let level = match verbosity {
        v if v <= -2 => "error",
        -1 => "warn",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

/// Runs one pipeline invocation end to end: builds `Config` from `cli`,
/// lets `configure` populate the registry (the configuration-script
/// contract, spec.md §6), resolves the selection, and either lists or
/// schedules it. Returns the process exit code (spec.md §6).
///
/// `configure` stands in for the out-of-scope configuration loader: a real
/// deployment would evaluate a user script here instead.
pub async fn run(cli: Cli, configure: impl FnOnce(&mut Pipeline)) -> i32 {
    init_tracing(cli.verbosity());

    let config = match cli.to_config() {
        Ok(config) => config,
        Err(err) => return report_error(&err),
    };
    let config = Arc::new(config);

    if cli.clean {
        tracing::debug!(path = %config.cache_path.display(), "cleaning cache");
        let _ = std::fs::remove_dir_all(&config.cache_path);
    }

    let mut pipeline = Pipeline::new(config);
    configure(&mut pipeline);

    let graph = match pipeline.build_graph() {
        Ok(graph) => graph,
        Err(err) => return report_error(&err),
    };

    let selected = match graph.select(&cli.steps, &cli.only, &cli.except) {
        Ok(selected) => selected,
        Err(err) => return report_error(&err),
    };

    if cli.list || cli.list_dependencies {
        for fqn in &selected {
            if cli.list_dependencies {
                let deps = graph.direct_prerequisites(fqn);
                println!("{fqn} <- [{}]", deps.join(", "));
            } else {
                println!("{fqn}");
            }
        }
        return 0;
    }

    let cancellation = CancellationToken::new();
    let watched = cancellation.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            watched.cancel();
        }
    });

    let report = match pipeline
        .execute(&cli.steps, &cli.only, &cli.except, cancellation)
        .await
    {
        Ok(report) => report,
        Err(err) => return report_error(&err),
    };

    for fqn in &report.order {
        tracing::info!(instance = %fqn, status = ?report.status_of(fqn), "step finished");
    }

    if report.exit_code() == 0 {
        return 0;
    }
    report_error(&Error::Aggregate {
        failed: report.count(crate::scheduler::InstanceStatus::Failed),
        unrunnable: report.count(crate::scheduler::InstanceStatus::Blocked),
        cancelled: report.count(crate::scheduler::InstanceStatus::Cancelled),
    })
}

fn report_error(err: &Error) -> i32 {
    tracing::error!("{err}");
    err.exit_code()
}
