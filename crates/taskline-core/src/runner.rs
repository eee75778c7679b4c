use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use taskline_events::Stream;

use crate::artifacts::{ArtifactBus, ArtifactValue};
use crate::config::Config;
use crate::env_cache::{validate_command, EnvironmentHandle};
use crate::params::{ParamValue, ParameterMap};
use crate::registry::StepOutcome;

/// The façade a step's callable is given. It exposes exactly the
/// capabilities spec.md §4.G grants a step body: config/cache-path lookup,
/// installing extra dependencies, running a command in the step's curated
/// environment, and the artifact bus — nothing else, since a callable only
/// ever receives `&StepRunner`, never the pipeline itself.
pub struct StepRunner {
    config: Arc<Config>,
    instance_name: String,
    parameters: ParameterMap,
    env_handle: Option<EnvironmentHandle>,
    artifact_bus: Arc<ArtifactBus>,
    direct_prerequisites: Vec<String>,
    cancellation: CancellationToken,
    output: Option<tokio::sync::mpsc::UnboundedSender<(String, Stream, String)>>,
}

impl StepRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        instance_name: String,
        parameters: ParameterMap,
        env_handle: Option<EnvironmentHandle>,
        artifact_bus: Arc<ArtifactBus>,
        direct_prerequisites: Vec<String>,
        cancellation: CancellationToken,
        output: Option<tokio::sync::mpsc::UnboundedSender<(String, Stream, String)>>,
    ) -> Self {
        Self {
            config,
            instance_name,
            parameters,
            env_handle,
            artifact_bus,
            direct_prerequisites,
            cancellation,
            output,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }

    pub fn cache_path(&self) -> std::path::PathBuf {
        self.config.step_cache_path(&self.instance_name)
    }

    pub fn parameters(&self) -> &ParameterMap {
        &self.parameters
    }

    pub fn parameter(&self, name: &str) -> Option<&ParamValue> {
        self.parameters.get(name)
    }

    pub fn get_artifacts(&self, name: &str) -> Vec<ArtifactValue> {
        self.artifact_bus
            .get_artifacts(name, &self.direct_prerequisites)
    }

    pub fn publish_artifact(&self, name: &str, value: ArtifactValue) {
        self.artifact_bus.publish(&self.instance_name, name, value);
    }

    /// Installs extra packages into this step's environment, beyond its
    /// static `dependencies` list. Grounded on `_runners.py`'s
    /// `VenvRunner.install`.
    pub async fn install(&self, packages: &[String]) -> StepOutcome {
        let handle = self
            .env_handle
            .as_ref()
            .ok_or_else(|| "step has no environment to install into".to_string())?;
        if packages.is_empty() {
            return Ok(());
        }
        let pip = handle
            .bin_dir()
            .join(if cfg!(windows) { "pip.exe" } else { "pip" });
        let status = Command::new(pip)
            .arg("install")
            .args(packages)
            .status()
            .await
            .map_err(|err| err.to_string())?;
        if status.success() {
            Ok(())
        } else {
            Err(format!("pip install exited with {status}"))
        }
    }

    /// Runs `command` inside this step's curated environment, streaming
    /// output line-by-line through the renderer channel. `silent_on_success`
    /// buffers lines and only emits them if the command fails.
    pub async fn run(
        &self,
        command: &[String],
        extra_env: &[(String, String)],
        external_command: bool,
        silent_on_success: bool,
    ) -> StepOutcome {
        let Some(program) = command.first() else {
            return Err("run() called with an empty command".to_string());
        };

        let mut env_vars = if let Some(handle) = &self.env_handle {
            validate_command(handle, program, external_command).map_err(|err| err.to_string())?;
            crate::config::curated_env(&handle.path, &self.config.pythonhashseed)
        } else {
            if which::which(program).is_err() {
                return Err(format!("command '{program}' was not found on PATH"));
            }
            let mut vars: Vec<(String, String)> = std::env::vars().collect();
            vars.retain(|(name, _)| name != "PYTHONHASHSEED");
            vars.push((
                "PYTHONHASHSEED".to_string(),
                self.config.pythonhashseed.clone(),
            ));
            vars
        };
        env_vars.extend(extra_env.iter().cloned());

        taskline_events::emit_run_started!(self.instance_name, program);
        let started_at = std::time::Instant::now();

        let mut builder = Command::new(program);
        builder
            .args(&command[1..])
            .env_clear()
            .envs(env_vars)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        builder.process_group(0);
        let mut child = builder.spawn().map_err(|err| err.to_string())?;

        let mut buffered = Vec::new();
        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<(Stream, String)>();
        let stdout_task = spawn_line_reader(stdout, Stream::Stdout, tx.clone());
        let stderr_task = spawn_line_reader(stderr, Stream::Stderr, tx.clone());
        drop(tx);

        let mut rx_open = true;
        let wait_result = loop {
            if rx_open {
                tokio::select! {
                    line = rx.recv() => {
                        match line {
                            Some((stream, line)) => self.handle_line(stream, line, silent_on_success, &mut buffered),
                            None => rx_open = false,
                        }
                    }
                    status = child.wait() => break Some(status),
                    () = self.cancellation.cancelled() => break None,
                }
            } else {
                tokio::select! {
                    status = child.wait() => break Some(status),
                    () = self.cancellation.cancelled() => break None,
                }
            }
        };
        let _ = stdout_task.await;
        let _ = stderr_task.await;

        let status = match wait_result {
            Some(status) => status.map_err(|err| err.to_string())?,
            None => {
                terminate_soft_then_hard(&mut child, self.config.cancellation_grace_period).await;
                return Err("cancelled".to_string());
            }
        };

        taskline_events::emit_run_completed!(
            self.instance_name,
            status.success(),
            status.code(),
            started_at.elapsed().as_millis() as u64
        );

        if status.success() {
            Ok(())
        } else {
            if silent_on_success {
                for (stream, line) in &buffered {
                    eprintln!("[{}] {stream} {line}", self.instance_name);
                }
            }
            Err(format!("command exited with {status}"))
        }
    }

    fn handle_line(
        &self,
        stream: Stream,
        line: String,
        silent_on_success: bool,
        buffered: &mut Vec<(Stream, String)>,
    ) {
        taskline_events::emit_output!(self.instance_name, stream, line);
        if silent_on_success {
            buffered.push((stream, line));
        } else if let Some(sender) = &self.output {
            let _ = sender.send((self.instance_name.clone(), stream, line));
        }
    }
}

fn spawn_line_reader<R>(
    reader: R,
    stream: Stream,
    sender: tokio::sync::mpsc::UnboundedSender<(Stream, String)>,
) -> tokio::task::JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if sender.send((stream, line)).is_err() {
                break;
            }
        }
    })
}

/// Sends SIGTERM to the child's process group, waits up to `grace` for it
/// to exit, and sends SIGKILL if it's still alive.
///
/// Grounded on `examples/cuenv-cuenv/crates/core/src/tasks/
/// process_registry.rs`'s soft-then-hard termination sequence.
async fn terminate_soft_then_hard(child: &mut Child, grace: Duration) {
    if let Some(pid) = child.id() {
        send_signal(pid, soft_signal());
        let deadline = tokio::time::Instant::now() + grace;
        while tokio::time::Instant::now() < deadline {
            if let Ok(Some(_)) = child.try_wait() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        if matches!(child.try_wait(), Ok(None)) {
            send_signal(pid, hard_signal());
        }
    }
    let _ = child.wait().await;
}

#[cfg(unix)]
fn soft_signal() -> i32 {
    libc::SIGTERM
}

#[cfg(unix)]
fn hard_signal() -> i32 {
    libc::SIGKILL
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: i32) {
    // SAFETY: kill() on a process group id we spawned and still track is a
    // well-defined POSIX signal send.
    unsafe {
        libc::kill(-(pid as i32), signal);
    }
}

#[cfg(not(unix))]
fn soft_signal() -> i32 {
    0
}

#[cfg(not(unix))]
fn hard_signal() -> i32 {
    0
}

#[cfg(not(unix))]
fn send_signal(_pid: u32, _signal: i32) {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn test_config() -> Arc<Config> {
        Arc::new(
            Config::new(
                PathBuf::from("/tmp/taskline-runner-test"),
                1,
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

    #[tokio::test]
    async fn run_rejects_empty_command() {
        let runner = StepRunner::new(
            test_config(),
            "build".to_string(),
            ParameterMap::new(),
            None,
            Arc::new(ArtifactBus::new()),
            Vec::new(),
            CancellationToken::new(),
            None,
        );
        let result = runner.run(&[], &[], false, false).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn run_succeeds_for_a_trivial_command() {
        let runner = StepRunner::new(
            test_config(),
            "build".to_string(),
            ParameterMap::new(),
            None,
            Arc::new(ArtifactBus::new()),
            Vec::new(),
            CancellationToken::new(),
            None,
        );
        let result = runner
            .run(&["true".to_string()], &[], true, false)
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn run_reports_failure_for_nonzero_exit() {
        let runner = StepRunner::new(
            test_config(),
            "build".to_string(),
            ParameterMap::new(),
            None,
            Arc::new(ArtifactBus::new()),
            Vec::new(),
            CancellationToken::new(),
            None,
        );
        let result = runner
            .run(&["false".to_string()], &[], true, false)
            .await;
        assert!(result.is_err());
    }
}
