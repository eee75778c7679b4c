use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use taskline_events::OutputRenderer;

use crate::artifacts::ArtifactBus;
use crate::config::Config;
use crate::env_cache::EnvironmentCache;
use crate::error::{Error, Result};
use crate::graph::PipelineGraph;
use crate::params::{ParamValue, ParameterLayer, ParameterMap};
use crate::registry::{Registry, StepCallable, StepDefinition};
use crate::scheduler::{ScheduleReport, Scheduler};

/// The host-binary-facing surface: owns the registry for one pipeline run
/// and exposes the fluent builder API a configuration script registers
/// steps through.
///
/// Replaces the source's process-wide "active pipeline" context variable
/// (REDESIGN FLAGS): a configuration script takes `&mut Pipeline`
/// explicitly instead of reaching for ambient global state.
pub struct Pipeline {
    registry: Registry,
    config: Arc<Config>,
}

impl Pipeline {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            registry: Registry::new(),
            config,
        }
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Starts building an unmanaged step: no isolated environment is
    /// provisioned for it, but it still gets a Setup phase for its optional
    /// `setup` callable.
    pub fn step(&mut self, name: impl Into<String>) -> StepBuilder<'_> {
        StepBuilder::new(self, name.into(), false)
    }

    /// Starts building a managed step: the environment cache provisions and
    /// owns an isolated interpreter environment for it.
    pub fn managed_step(&mut self, name: impl Into<String>) -> StepBuilder<'_> {
        StepBuilder::new(self, name.into(), true)
    }

    /// Registers a step group: a synthetic step with no body that succeeds
    /// iff every one of `requires` succeeds.
    pub fn step_group(
        &mut self,
        name: impl Into<String>,
        requires: Vec<String>,
        run_by_default: bool,
    ) -> Result<()> {
        self.registry
            .register(StepDefinition::group(name.into(), requires, run_by_default))
    }

    /// Builds the DAG from everything registered so far. Called once, after
    /// the configuration script has finished registering steps (spec.md
    /// §6's configuration-script contract: "after evaluation returns, no
    /// further registrations are accepted").
    pub fn build_graph(&self) -> Result<PipelineGraph> {
        PipelineGraph::build(&self.registry)
    }

    /// Resolves the selection algebra and schedules the result. Returns the
    /// aggregate report; callers map it to a process exit code via
    /// [`ScheduleReport::exit_code`].
    ///
    /// Spawns a dedicated task that drains scheduled steps' interleaved
    /// output and prints each line prefixed with its instance name (spec.md
    /// §4.F's "line-buffered, instance-name-prefixed interleaving"),
    /// colored per `Config::colors`.
    pub async fn execute(
        &self,
        steps: &[String],
        only: &[String],
        except: &[String],
        cancellation: CancellationToken,
    ) -> Result<ScheduleReport> {
        let graph = self.build_graph()?;
        let selected = graph.select(steps, only, except)?;
        let env_cache = Arc::new(EnvironmentCache::new(self.config.clone()));
        let artifact_bus = Arc::new(ArtifactBus::new());

        let (output_tx, mut output_rx) = tokio::sync::mpsc::unbounded_channel();
        let renderer = OutputRenderer::new(self.config.colors.as_bool());
        let render_task = tokio::spawn(async move {
            while let Some((instance, stream, line)) = output_rx.recv().await {
                println!("{}", renderer.prefix_line(&instance, stream, &line));
            }
        });

        let scheduler = Scheduler::new(self.config.clone(), env_cache, artifact_bus, Some(output_tx));
        let report = scheduler.run(&graph, &selected, cancellation).await;
        drop(scheduler);
        let _ = render_task.await;
        Ok(report)
    }
}

/// Fluent builder for one step registration.
///
/// Replaces the source's decorator-style parameter attachment
/// (`@parametrize(...)`, `@set_defaults(...)`) with chained builder methods
/// over a structured [`StepDefinition`] (REDESIGN FLAGS).
pub struct StepBuilder<'p> {
    pipeline: &'p mut Pipeline,
    definition: StepDefinition,
}

impl<'p> StepBuilder<'p> {
    fn new(pipeline: &'p mut Pipeline, name: String, is_managed: bool) -> Self {
        Self {
            pipeline,
            definition: StepDefinition {
                name,
                callable: None,
                setup: None,
                requires: Vec::new(),
                interpreter: None,
                dependencies: Vec::new(),
                run_by_default: true,
                parameter_layers: Vec::new(),
                defaults: None,
                is_setup_dependent: true,
                is_managed,
                is_group: false,
            },
        }
    }

    pub fn callable(mut self, callable: StepCallable) -> Self {
        self.definition.callable = Some(callable);
        self
    }

    pub fn setup(mut self, callable: StepCallable) -> Self {
        self.definition.setup = Some(callable);
        self
    }

    pub fn requires(mut self, requires: Vec<String>) -> Self {
        self.definition.requires = requires;
        self
    }

    pub fn python(mut self, interpreter: impl Into<String>) -> Self {
        self.definition.interpreter = Some(interpreter.into());
        self
    }

    pub fn dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.definition.dependencies = dependencies;
        self
    }

    pub fn run_by_default(mut self, flag: bool) -> Self {
        self.definition.run_by_default = flag;
        self
    }

    /// Whether this step's Setup phase waits for its prerequisites' Setup
    /// phases (the default) or is scheduled immediately regardless of them
    /// (spec.md §3's `is_setup_dependent`).
    pub fn setup_dependent(mut self, flag: bool) -> Self {
        self.definition.is_setup_dependent = flag;
        self
    }

    /// Attaches a parameter layer: `names.len()` must equal the arity of
    /// every row in `values`. `ids` defaults to one empty string per row
    /// when omitted.
    pub fn parametrize(
        mut self,
        names: Vec<String>,
        values: Vec<Vec<ParamValue>>,
        ids: Option<Vec<String>>,
    ) -> Self {
        let ids = ids.unwrap_or_else(|| values.iter().map(|_| String::new()).collect());
        self.definition
            .parameter_layers
            .push(ParameterLayer::new(names, values, ids));
        self
    }

    /// Convenience over `parametrize`: attaches one single-value layer per
    /// `(name, Some(value))` pair; `None` values are skipped so omitted
    /// CLI-style overrides fall through to defaults (spec.md §4.B).
    pub fn build_parameters(mut self, overrides: Vec<(String, Option<ParamValue>)>) -> Self {
        for (name, value) in overrides {
            if let Some(value) = value {
                self.definition.parameter_layers.push(ParameterLayer::new(
                    vec![name],
                    vec![vec![value]],
                    vec![String::new()],
                ));
            }
        }
        self
    }

    /// Attaches the step's defaults layer. Fails if one is already set.
    pub fn set_defaults(mut self, defaults: ParameterMap) -> Result<Self> {
        if self.definition.defaults.is_some() {
            return Err(Error::DefaultsAlreadySet {
                name: self.definition.name,
            });
        }
        self.definition.defaults = Some(defaults);
        Ok(self)
    }

    /// Finalizes the step into the pipeline's registry.
    pub fn register(self) -> Result<()> {
        self.pipeline.registry.register(self.definition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::path::PathBuf;
    use std::sync::Arc as StdArc;

    fn test_pipeline() -> Pipeline {
        let config = StdArc::new(
            Config::new(
                PathBuf::from("/tmp/taskline-pipeline-test"),
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
    fn register_and_build_graph() {
        let mut pipeline = test_pipeline();
        pipeline
            .step("fmt")
            .callable(StdArc::new(|_| Ok(())))
            .register()
            .unwrap();
        pipeline
            .step("lint")
            .callable(StdArc::new(|_| Ok(())))
            .requires(vec!["fmt".to_string()])
            .register()
            .unwrap();
        let graph = pipeline.build_graph().unwrap();
        assert_eq!(graph.topological_order(), vec!["fmt", "lint"]);
    }

    #[test]
    fn duplicate_step_name_is_rejected() {
        let mut pipeline = test_pipeline();
        pipeline
            .step("fmt")
            .callable(StdArc::new(|_| Ok(())))
            .register()
            .unwrap();
        let err = pipeline
            .step("fmt")
            .callable(StdArc::new(|_| Ok(())))
            .register()
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateStep { .. }));
    }

    #[test]
    fn set_defaults_twice_is_rejected() {
        let mut pipeline = test_pipeline();
        let builder = pipeline
            .step("fmt")
            .callable(StdArc::new(|_| Ok(())))
            .set_defaults(ParameterMap::new())
            .unwrap();
        let err = builder.set_defaults(ParameterMap::new()).unwrap_err();
        assert!(matches!(err, Error::DefaultsAlreadySet { .. }));
    }

    #[test]
    fn step_group_runs_alongside_regular_steps() {
        let mut pipeline = test_pipeline();
        pipeline
            .step("a")
            .callable(StdArc::new(|_| Ok(())))
            .register()
            .unwrap();
        pipeline
            .step_group("ci", vec!["a".to_string()], true)
            .unwrap();
        let graph = pipeline.build_graph().unwrap();
        assert_eq!(graph.topological_order(), vec!["a", "ci"]);
    }
}
