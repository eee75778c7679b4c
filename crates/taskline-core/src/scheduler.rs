use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use taskline_events::Stream;

use crate::artifacts::ArtifactBus;
use crate::config::Config;
use crate::env_cache::EnvironmentCache;
use crate::graph::PipelineGraph;
use crate::registry::StepDefinition;
use crate::runner::StepRunner;

/// The terminal state of one scheduled instance (spec.md §3's terminal
/// subset of `PipelineState`; non-terminal states are scheduler-internal
/// bookkeeping, not reported).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstanceStatus {
    Succeeded,
    Failed,
    Blocked,
    Cancelled,
    Skipped,
}

impl InstanceStatus {
    fn label(self) -> &'static str {
        match self {
            InstanceStatus::Succeeded => "succeeded",
            InstanceStatus::Failed => "failed",
            InstanceStatus::Blocked => "blocked",
            InstanceStatus::Cancelled => "cancelled",
            InstanceStatus::Skipped => "skipped",
        }
    }
}

/// The outcome of one whole scheduled run: every selected instance's final
/// status, in the order the graph was selected.
#[derive(Debug, Clone)]
pub struct ScheduleReport {
    pub order: Vec<String>,
    pub statuses: HashMap<String, InstanceStatus>,
}

impl ScheduleReport {
    pub fn status_of(&self, fqn: &str) -> InstanceStatus {
        self.statuses[fqn]
    }

    pub fn count(&self, status: InstanceStatus) -> usize {
        self.statuses.values().filter(|&&s| s == status).count()
    }

    /// `1` if any instance failed, was blocked, or was cancelled; `0`
    /// otherwise. `Skipped` counts as neither failure nor success (spec.md
    /// §6, §7).
    pub fn exit_code(&self) -> i32 {
        let unsuccessful = self.count(InstanceStatus::Failed)
            + self.count(InstanceStatus::Blocked)
            + self.count(InstanceStatus::Cancelled);
        if unsuccessful == 0 {
            0
        } else {
            1
        }
    }

    /// The "N jobs failed, plus blocked/cancelled" summary line (spec.md §7).
    pub fn summary_line(&self) -> String {
        let succeeded = self.count(InstanceStatus::Succeeded);
        if succeeded == self.statuses.len() {
            return format!("{succeeded} succeeded");
        }
        let mut parts = vec![pluralize(self.count(InstanceStatus::Failed), "job", "failed")];
        let blocked = self.count(InstanceStatus::Blocked);
        if blocked > 0 {
            parts.push(pluralize(blocked, "job", "could not run"));
        }
        let cancelled = self.count(InstanceStatus::Cancelled);
        if cancelled > 0 {
            parts.push(pluralize(cancelled, "job", "were cancelled"));
        }
        let skipped = self.count(InstanceStatus::Skipped);
        if skipped > 0 {
            parts.push(pluralize(skipped, "job", "were skipped"));
        }
        parts.join(", ")
    }
}

fn pluralize(count: usize, noun: &str, verb_phrase: &str) -> String {
    let verb_phrase = if count == 1 {
        verb_phrase.replacen("were", "was", 1)
    } else {
        verb_phrase.to_string()
    };
    if count == 1 {
        format!("{count} {noun} {verb_phrase}")
    } else {
        format!("{count} {noun}s {verb_phrase}")
    }
}

/// What a completed scheduler task (Setup or Run) reports back.
enum TaskOutcome {
    SetupDone {
        fqn: String,
        result: std::result::Result<(), TaskFailure>,
    },
    RunDone {
        fqn: String,
        result: std::result::Result<(), TaskFailure>,
    },
}

enum TaskFailure {
    UnavailableInterpreter,
    Other(String),
}

/// Concurrent ready-queue executor: a bounded pool of `n_jobs` in-flight
/// Setup/Run nodes, two scheduling phases per instance, fail-fast
/// cancellation, and full Blocked/Cancelled/Skipped accounting.
///
/// Grounded on `examples/cuenv-cuenv/crates/core/src/tasks/executor.rs`'s
/// `execute_graph` `JoinSet`-windowing pattern, generalized from
/// dependency-level groups to independent per-node readiness since a Run
/// node's eligibility depends on its own Setup plus its prerequisites' Run
/// phases, not on a single level number.
pub struct Scheduler {
    config: Arc<Config>,
    env_cache: Arc<EnvironmentCache>,
    artifact_bus: Arc<ArtifactBus>,
    output_tx: Option<UnboundedSender<(String, Stream, String)>>,
}

impl Scheduler {
    pub fn new(
        config: Arc<Config>,
        env_cache: Arc<EnvironmentCache>,
        artifact_bus: Arc<ArtifactBus>,
        output_tx: Option<UnboundedSender<(String, Stream, String)>>,
    ) -> Self {
        Self {
            config,
            env_cache,
            artifact_bus,
            output_tx,
        }
    }

    /// Runs every instance in `selected` to a terminal state and returns the
    /// aggregate report. `external_cancel` is honored the same way
    /// `fail_fast` is: it cancels all non-terminal nodes (spec.md §5).
    pub async fn run(
        &self,
        graph: &PipelineGraph,
        selected: &[String],
        external_cancel: CancellationToken,
    ) -> ScheduleReport {
        let selected_set: HashSet<String> = selected.iter().cloned().collect();
        let cancellation = external_cancel;

        // Setup phase bookkeeping.
        let mut setup_started: HashSet<String> = HashSet::new();
        let mut setup_succeeded: HashSet<String> = HashSet::new();
        let mut setup_failed: HashSet<String> = HashSet::new();

        // Run phase bookkeeping.
        let mut run_started: HashSet<String> = HashSet::new();

        let mut final_status: HashMap<String, InstanceStatus> = HashMap::new();
        let mut fail_fast_triggered = false;

        let mut join_set: JoinSet<TaskOutcome> = JoinSet::new();
        let mut in_flight = 0usize;

        loop {
            if cancellation.is_cancelled() && !fail_fast_triggered {
                self.cancel_non_terminal(
                    selected,
                    &setup_started,
                    &run_started,
                    &mut final_status,
                );
                fail_fast_triggered = true;
            }

            let mut spawned_any = false;
            if !fail_fast_triggered {
                for fqn in selected {
                    if final_status.contains_key(fqn) || in_flight >= self.config.n_jobs {
                        continue;
                    }
                    let Some(instance) = graph.instance(fqn) else {
                        continue;
                    };
                    let prerequisites = graph.direct_prerequisites(fqn);

                    if !setup_started.contains(fqn) {
                        match self.setup_readiness(&instance.definition, &prerequisites, &setup_succeeded, &setup_failed) {
                            Readiness::Ready => {
                                setup_started.insert(fqn.clone());
                                in_flight += 1;
                                spawned_any = true;
                                self.spawn_setup(&mut join_set, graph, fqn.clone());
                                continue;
                            }
                            Readiness::Blocked => {
                                setup_started.insert(fqn.clone());
                                setup_failed.insert(fqn.clone());
                                final_status.insert(fqn.clone(), InstanceStatus::Blocked);
                                spawned_any = true;
                                continue;
                            }
                            Readiness::NotYet => {}
                        }
                    }

                    if in_flight >= self.config.n_jobs {
                        continue;
                    }
                    if !run_started.contains(fqn) && setup_succeeded.contains(fqn) {
                        match self.run_readiness(&prerequisites, &final_status) {
                            Readiness::Ready => {
                                run_started.insert(fqn.clone());
                                in_flight += 1;
                                spawned_any = true;
                                self.spawn_run(&mut join_set, graph, fqn.clone());
                            }
                            Readiness::Blocked => {
                                run_started.insert(fqn.clone());
                                final_status.insert(fqn.clone(), InstanceStatus::Blocked);
                                spawned_any = true;
                            }
                            Readiness::NotYet => {}
                        }
                    }
                }
            }

            if join_set.is_empty() {
                if spawned_any {
                    continue;
                }
                break;
            }

            let Some(joined) = join_set.join_next().await else {
                break;
            };
            in_flight -= 1;
            match joined {
                Ok(TaskOutcome::SetupDone { fqn, result }) => match result {
                    Ok(()) => {
                        setup_succeeded.insert(fqn);
                    }
                    Err(failure) => {
                        let demoted_to_skip = matches!(failure, TaskFailure::UnavailableInterpreter)
                            && self.config.skip_missing_interpreters;
                        let status = if demoted_to_skip {
                            InstanceStatus::Skipped
                        } else {
                            InstanceStatus::Failed
                        };
                        if !demoted_to_skip && self.config.fail_fast {
                            cancellation.cancel();
                        }
                        setup_failed.insert(fqn.clone());
                        final_status.insert(fqn, status);
                    }
                },
                Ok(TaskOutcome::RunDone { fqn, result }) => match result {
                    Ok(()) => {
                        self.artifact_bus.mark_succeeded(&fqn);
                        final_status.insert(fqn, InstanceStatus::Succeeded);
                    }
                    Err(_failure) => {
                        if self.config.fail_fast {
                            cancellation.cancel();
                        }
                        final_status.insert(fqn, InstanceStatus::Failed);
                    }
                },
                Err(join_err) => {
                    tracing::error!(error = %join_err, "scheduler task panicked");
                }
            }
        }

        // Anything selected but never resolved (can happen if the pool was
        // too small to ever reach it before fail-fast fired) is cancelled.
        for fqn in selected {
            final_status.entry(fqn.clone()).or_insert(InstanceStatus::Cancelled);
        }

        ScheduleReport {
            order: selected.to_vec(),
            statuses: final_status,
        }
        .also_log(selected_set.len())
    }

    fn cancel_non_terminal(
        &self,
        selected: &[String],
        setup_started: &HashSet<String>,
        run_started: &HashSet<String>,
        final_status: &mut HashMap<String, InstanceStatus>,
    ) {
        for fqn in selected {
            if final_status.contains_key(fqn) {
                continue;
            }
            let _ = (setup_started.contains(fqn), run_started.contains(fqn));
            final_status.insert(fqn.clone(), InstanceStatus::Cancelled);
        }
    }

    /// Setup readiness (spec.md §4.F): `is_setup_dependent` gates on
    /// prerequisites' Setup having succeeded; otherwise Setup is ready as
    /// soon as it's considered (no upstream gating at all). `skip_setup`
    /// resolves every Setup to `Ready` instantly without real provisioning
    /// (handled by `spawn_setup`, not here).
    fn setup_readiness(
        &self,
        definition: &StepDefinition,
        prerequisites: &[String],
        setup_succeeded: &HashSet<String>,
        setup_failed: &HashSet<String>,
    ) -> Readiness {
        if !definition.is_setup_dependent {
            return Readiness::Ready;
        }
        let mut all_ready = true;
        for dep in prerequisites {
            if setup_succeeded.contains(dep) {
                continue;
            }
            if setup_failed.contains(dep) {
                return Readiness::Blocked;
            }
            all_ready = false;
        }
        if all_ready {
            Readiness::Ready
        } else {
            Readiness::NotYet
        }
    }

    /// Run readiness (spec.md §4.F item 2): every direct prerequisite's Run
    /// must have Succeeded, unconditionally.
    fn run_readiness(
        &self,
        prerequisites: &[String],
        final_status: &HashMap<String, InstanceStatus>,
    ) -> Readiness {
        let mut all_succeeded = true;
        for dep in prerequisites {
            match final_status.get(dep) {
                Some(InstanceStatus::Succeeded) => {}
                Some(_) => return Readiness::Blocked,
                None => all_succeeded = false,
            }
        }
        if all_succeeded {
            Readiness::Ready
        } else {
            Readiness::NotYet
        }
    }

    fn spawn_setup(&self, join_set: &mut JoinSet<TaskOutcome>, graph: &PipelineGraph, fqn: String) {
        let Some(instance) = graph.instance(&fqn).cloned() else {
            return;
        };
        let config = self.config.clone();
        let env_cache = self.env_cache.clone();

        join_set.spawn(async move {
            taskline_events::emit_setup_started!(fqn);
            let started_at = Instant::now();
            let definition = &instance.definition;

            let result: std::result::Result<(), TaskFailure> = async {
                if definition.is_managed && !config.skip_setup {
                    let interpreter = definition.interpreter.as_deref().unwrap_or("python3");
                    env_cache
                        .prepare(&definition.name, interpreter, &definition.dependencies)
                        .await
                        .map_err(|err| match err {
                            crate::error::Error::UnavailableInterpreter { .. } => {
                                TaskFailure::UnavailableInterpreter
                            }
                            other => TaskFailure::Other(other.to_string()),
                        })?;
                }
                if let Some(setup_callable) = definition.setup.clone() {
                    let env_handle = if definition.is_managed {
                        let interpreter = definition.interpreter.as_deref().unwrap_or("python3");
                        env_cache
                            .prepare(&definition.name, interpreter, &definition.dependencies)
                            .await
                            .ok()
                    } else {
                        None
                    };
                    let runner = StepRunner::new(
                        config.clone(),
                        fqn.clone(),
                        instance.parameters.clone(),
                        env_handle,
                        Arc::new(ArtifactBus::new()),
                        Vec::new(),
                        CancellationToken::new(),
                        None,
                    );
                    setup_callable(&runner).map_err(TaskFailure::Other)?;
                }
                Ok(())
            }
            .await;

            taskline_events::emit_setup_completed!(
                fqn,
                result.is_ok(),
                started_at.elapsed().as_millis() as u64
            );
            TaskOutcome::SetupDone { fqn, result }
        });
    }

    fn spawn_run(&self, join_set: &mut JoinSet<TaskOutcome>, graph: &PipelineGraph, fqn: String) {
        let Some(instance) = graph.instance(&fqn).cloned() else {
            return;
        };
        let artifact_sources = graph.artifact_sources(&fqn);
        let config = self.config.clone();
        let env_cache = self.env_cache.clone();
        let artifact_bus = self.artifact_bus.clone();
        let output_tx = self.output_tx.clone();
        let skip_run = self.config.skip_run;
        let skip_setup = self.config.skip_setup;

        join_set.spawn(async move {
            let definition = &instance.definition;

            let result: std::result::Result<(), TaskFailure> = async {
                let env_handle = if definition.is_managed {
                    let interpreter = definition.interpreter.as_deref().unwrap_or("python3");
                    if skip_setup {
                        env_cache
                            .existing(&definition.name, interpreter)
                            .map_err(|err| match err {
                                crate::error::Error::UnavailableInterpreter { .. } => {
                                    TaskFailure::UnavailableInterpreter
                                }
                                other => TaskFailure::Other(other.to_string()),
                            })?
                    } else {
                        Some(
                            env_cache
                                .prepare(&definition.name, interpreter, &definition.dependencies)
                                .await
                                .map_err(|err| TaskFailure::Other(err.to_string()))?,
                        )
                    }
                } else {
                    None
                };

                if skip_run || definition.callable.is_none() {
                    return Ok(());
                }

                let runner = StepRunner::new(
                    config.clone(),
                    fqn.clone(),
                    instance.parameters.clone(),
                    env_handle,
                    artifact_bus.clone(),
                    artifact_sources.clone(),
                    CancellationToken::new(),
                    output_tx.clone(),
                );
                let callable = definition.callable.clone().expect("checked above");
                callable(&runner).map_err(TaskFailure::Other)
            }
            .await;

            TaskOutcome::RunDone { fqn, result }
        });
    }
}

enum Readiness {
    Ready,
    NotYet,
    Blocked,
}

impl ScheduleReport {
    fn also_log(self, scheduled: usize) -> Self {
        taskline_events::emit_pipeline_summary!(
            self.count(InstanceStatus::Succeeded),
            self.count(InstanceStatus::Failed),
            self.count(InstanceStatus::Blocked),
            self.count(InstanceStatus::Cancelled)
        );
        debug_assert_eq!(self.statuses.len(), scheduled);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::graph::PipelineGraph;
    use crate::registry::{Registry, StepDefinition};
    use std::path::PathBuf;
    use std::sync::Arc as StdArc;

    fn test_config() -> Arc<Config> {
        Arc::new(
            Config::new(
                PathBuf::from("/tmp/taskline-scheduler-test"),
                2,
                false,
                false,
                false,
                false,
                Some(false),
                false,
            )
            .unwrap(),
        )
    }

    fn unmanaged_step(
        name: &str,
        requires: &[&str],
        callable: crate::registry::StepCallable,
    ) -> StepDefinition {
        StepDefinition {
            name: name.to_string(),
            callable: Some(callable),
            setup: None,
            requires: requires.iter().map(|s| s.to_string()).collect(),
            interpreter: None,
            dependencies: Vec::new(),
            run_by_default: true,
            parameter_layers: Vec::new(),
            defaults: None,
            is_setup_dependent: true,
            is_managed: false,
            is_group: false,
        }
    }

    async fn run_scheduler(registry: Registry) -> ScheduleReport {
        let graph = PipelineGraph::build(&registry).unwrap();
        let selected = graph.select(&[], &[], &[]).unwrap();
        let config = test_config();
        let env_cache = StdArc::new(EnvironmentCache::new(config.clone()));
        let artifact_bus = StdArc::new(ArtifactBus::new());
        let scheduler = Scheduler::new(config, env_cache, artifact_bus, None);
        scheduler.run(&graph, &selected, CancellationToken::new()).await
    }

    #[tokio::test]
    async fn linear_pipeline_all_succeed() {
        let mut registry = Registry::new();
        registry
            .register(unmanaged_step("a", &[], StdArc::new(|_| Ok(()))))
            .unwrap();
        registry
            .register(unmanaged_step("b", &["a"], StdArc::new(|_| Ok(()))))
            .unwrap();
        let report = run_scheduler(registry).await;
        assert_eq!(report.status_of("a"), InstanceStatus::Succeeded);
        assert_eq!(report.status_of("b"), InstanceStatus::Succeeded);
        assert_eq!(report.exit_code(), 0);
    }

    #[tokio::test]
    async fn failed_prerequisite_blocks_dependent() {
        let mut registry = Registry::new();
        registry
            .register(unmanaged_step(
                "a",
                &[],
                StdArc::new(|_| Err("boom".to_string())),
            ))
            .unwrap();
        registry
            .register(unmanaged_step("b", &["a"], StdArc::new(|_| Ok(()))))
            .unwrap();
        let report = run_scheduler(registry).await;
        assert_eq!(report.status_of("a"), InstanceStatus::Failed);
        assert_eq!(report.status_of("b"), InstanceStatus::Blocked);
        assert_eq!(report.exit_code(), 1);
        assert_eq!(report.summary_line(), "1 job failed, 1 job could not run");
    }

    #[tokio::test]
    async fn independent_steps_both_run() {
        let mut registry = Registry::new();
        registry
            .register(unmanaged_step("a", &[], StdArc::new(|_| Ok(()))))
            .unwrap();
        registry
            .register(unmanaged_step("b", &[], StdArc::new(|_| Ok(()))))
            .unwrap();
        let report = run_scheduler(registry).await;
        assert_eq!(report.status_of("a"), InstanceStatus::Succeeded);
        assert_eq!(report.status_of("b"), InstanceStatus::Succeeded);
    }

    #[test]
    fn skipped_only_run_exits_zero() {
        let report = ScheduleReport {
            order: vec!["a".to_string(), "b".to_string()],
            statuses: HashMap::from([
                ("a".to_string(), InstanceStatus::Succeeded),
                ("b".to_string(), InstanceStatus::Skipped),
            ]),
        };
        assert_eq!(report.exit_code(), 0);
    }

    #[tokio::test]
    async fn group_step_succeeds_when_prerequisites_succeed() {
        let mut registry = Registry::new();
        registry
            .register(unmanaged_step("a", &[], StdArc::new(|_| Ok(()))))
            .unwrap();
        registry
            .register(StepDefinition::group(
                "ci",
                vec!["a".to_string()],
                true,
            ))
            .unwrap();
        let report = run_scheduler(registry).await;
        assert_eq!(report.status_of("ci"), InstanceStatus::Succeeded);
    }
}
