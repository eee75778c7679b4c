use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::sync::Mutex as AsyncMutex;

use crate::config::{venv_bin_dir, Config};
use crate::error::{Error, Result};

/// Identity of one cached environment: one virtualenv per (step, interpreter)
/// pair, reused across every instance of a parametrized step that shares an
/// interpreter (spec.md §3).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EnvironmentKey {
    pub step_name: String,
    pub interpreter: String,
}

/// A prepared, ready-to-use virtualenv.
#[derive(Debug, Clone)]
pub struct EnvironmentHandle {
    pub key: EnvironmentKey,
    pub path: PathBuf,
}

impl EnvironmentHandle {
    pub fn bin_dir(&self) -> PathBuf {
        venv_bin_dir(&self.path)
    }
}

/// Idempotent, per-key-serialized virtualenv creation and reuse.
///
/// Grounded directly on `original_source/src/wast/_runners.py`'s
/// `VenvRunner.prepare` (python -m venv, then `pip install`), made async and
/// safe under concurrent scheduling by locking per [`EnvironmentKey`] the
/// way `cuenv-hooks` locks per resource hash.
pub struct EnvironmentCache {
    config: Arc<Config>,
    locks: Mutex<HashMap<EnvironmentKey, Arc<AsyncMutex<()>>>>,
    handles: Mutex<HashMap<EnvironmentKey, EnvironmentHandle>>,
}

impl EnvironmentCache {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            locks: Mutex::new(HashMap::new()),
            handles: Mutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, key: &EnvironmentKey) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().expect("env cache lock poisoned");
        locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Creates the venv for `(step_name, interpreter)` if it doesn't exist
    /// yet, installs `dependencies` into it, and returns a handle. Safe to
    /// call concurrently for the same key: the second caller waits for the
    /// first and then reuses its result without reinstalling.
    pub async fn prepare(
        &self,
        step_name: &str,
        interpreter: &str,
        dependencies: &[String],
    ) -> Result<EnvironmentHandle> {
        let interpreter_path = which::which(interpreter)
            .map_err(|_| Error::UnavailableInterpreter {
                interpreter: interpreter.to_string(),
            })?;

        let key = EnvironmentKey {
            step_name: step_name.to_string(),
            interpreter: interpreter.to_string(),
        };
        let lock = self.lock_for(&key);
        let _guard = lock.lock().await;

        if let Some(handle) = self.handles.lock().expect("env cache lock poisoned").get(&key) {
            return Ok(handle.clone());
        }

        let venv_path = self.config.venv_path(step_name, interpreter);
        if !venv_path.exists() {
            create_venv(&interpreter_path, &venv_path).await?;
            if !dependencies.is_empty() {
                install_dependencies(&venv_path, dependencies).await?;
            }
        }

        let handle = EnvironmentHandle {
            key: key.clone(),
            path: venv_path,
        };
        self.handles
            .lock()
            .expect("env cache lock poisoned")
            .insert(key, handle.clone());
        Ok(handle)
    }

    /// Looks up an already-materialized environment without creating one.
    /// Used for `skip_setup`, where Run still needs a prepared environment
    /// but must never provision one itself (spec.md §4.F).
    pub fn existing(&self, step_name: &str, interpreter: &str) -> Result<Option<EnvironmentHandle>> {
        let key = EnvironmentKey {
            step_name: step_name.to_string(),
            interpreter: interpreter.to_string(),
        };
        if let Some(handle) = self.handles.lock().expect("env cache lock poisoned").get(&key) {
            return Ok(Some(handle.clone()));
        }
        let venv_path = self.config.venv_path(step_name, interpreter);
        if !venv_path.exists() {
            return Err(Error::UnavailableInterpreter {
                interpreter: interpreter.to_string(),
            });
        }
        Ok(Some(EnvironmentHandle { key, path: venv_path }))
    }
}

/// Builds the venv into a temporary sibling directory and renames it into
/// place on success, so a process crash mid-install never leaves behind a
/// directory `prepare` would mistake for a ready environment.
async fn create_venv(interpreter: &Path, venv_path: &Path) -> Result<()> {
    if let Some(parent) = venv_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let temp_path = venv_path.with_extension(format!("tmp-{}", std::process::id()));
    let status = tokio::process::Command::new(interpreter)
        .arg("-m")
        .arg("venv")
        .arg(&temp_path)
        .status()
        .await?;
    if !status.success() {
        let _ = tokio::fs::remove_dir_all(&temp_path).await;
        return Err(Error::StepBodyFailed {
            instance: venv_path.display().to_string(),
            reason: format!("python -m venv exited with {status}"),
        });
    }
    if let Err(err) = tokio::fs::rename(&temp_path, venv_path).await {
        let _ = tokio::fs::remove_dir_all(&temp_path).await;
        return Err(err.into());
    }
    Ok(())
}

async fn install_dependencies(venv_path: &Path, dependencies: &[String]) -> Result<()> {
    let pip = venv_bin_dir(venv_path).join(if cfg!(windows) { "pip.exe" } else { "pip" });
    let status = tokio::process::Command::new(pip)
        .arg("install")
        .args(dependencies)
        .status()
        .await?;
    if !status.success() {
        return Err(Error::StepBodyFailed {
            instance: venv_path.display().to_string(),
            reason: format!("pip install exited with {status}"),
        });
    }
    Ok(())
}

/// Resolves `command` the way the child process would see it: against the
/// venv's bin directory prefixed onto the host `PATH`. Returns
/// [`Error::CommandNotFound`] if it can't be resolved at all, and
/// [`Error::CommandNotInEnvironment`] if it resolves outside the venv
/// without `external_command` set.
pub fn validate_command(
    handle: &EnvironmentHandle,
    command: &str,
    external_command: bool,
) -> Result<PathBuf> {
    let bin_dir = handle.bin_dir();
    let existing_path = std::env::var("PATH").unwrap_or_default();
    let curated_path = format!("{}:{existing_path}", bin_dir.display());

    let resolved = which::which_in(command, Some(curated_path), std::env::current_dir()?)
        .map_err(|_| Error::CommandNotFound {
            command: command.to_string(),
        })?;

    let resolved_inside_venv = resolved.starts_with(&bin_dir);
    if resolved_inside_venv && external_command {
        tracing::warn!(
            command = %command,
            instance = %handle.key.step_name,
            "external_command=true passed for a command that resolves inside the environment",
        );
    }
    if !resolved_inside_venv && !external_command {
        return Err(Error::CommandNotInEnvironment {
            instance: handle.key.step_name.clone(),
            command: command.to_string(),
        });
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn validate_command_rejects_unresolvable_commands() {
        let temp = TempDir::new().unwrap();
        let handle = EnvironmentHandle {
            key: EnvironmentKey {
                step_name: "lint".to_string(),
                interpreter: "python3".to_string(),
            },
            path: temp.path().to_path_buf(),
        };
        std::fs::create_dir_all(handle.bin_dir()).unwrap();
        let err = validate_command(&handle, "definitely-not-a-real-command", false).unwrap_err();
        assert!(matches!(err, Error::CommandNotFound { .. }));
    }

    #[test]
    fn validate_command_accepts_venv_binaries() {
        let temp = TempDir::new().unwrap();
        let handle = EnvironmentHandle {
            key: EnvironmentKey {
                step_name: "lint".to_string(),
                interpreter: "python3".to_string(),
            },
            path: temp.path().to_path_buf(),
        };
        let bin_dir = handle.bin_dir();
        std::fs::create_dir_all(&bin_dir).unwrap();
        let tool_path = bin_dir.join("mytool");
        std::fs::write(&tool_path, "#!/bin/sh\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tool_path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        let resolved = validate_command(&handle, "mytool", false).unwrap();
        assert!(resolved.starts_with(&bin_dir));
    }
}
