use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::Rng;

use crate::error::{Error, Result};

/// Environment variables copied from the host process into every curated
/// child environment (spec.md §6). Values are copied if present; absent
/// variables are simply not forwarded.
pub const ALLOWED_ENV_VARS: &[&str] = &[
    "URL_CA_BUNDLE",
    "PATH",
    "LANG",
    "LANGUAGE",
    "LD_LIBRARY_PATH",
    "PIP_INDEX_URL",
    "PIP_EXTRA_INDEX_URL",
    "PYTHONHASHSEED",
    "REQUESTS_CA_BUNDLE",
    "SSL_CERT_FILE",
    "HTTP_PROXY",
    "HTTPS_PROXY",
    "NO_PROXY",
    "TMPDIR",
];

/// Whether the CLI should render colored output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorMode {
    Always,
    Never,
}

impl ColorMode {
    pub fn as_bool(self) -> bool {
        matches!(self, ColorMode::Always)
    }
}

/// Global settings for one pipeline run, built once from CLI flags and the
/// process environment and then shared read-only for the rest of the run.
///
/// Grounded on `original_source/src/wast/_config.py`'s `Config` class.
#[derive(Debug, Clone)]
pub struct Config {
    pub cache_path: PathBuf,
    pub n_jobs: usize,
    pub fail_fast: bool,
    pub skip_setup: bool,
    pub skip_run: bool,
    pub skip_missing_interpreters: bool,
    pub colors: ColorMode,
    pub cancellation_grace_period: Duration,
    pub silent_on_success: bool,
    /// Resolved once here and held immutable for the rest of the run
    /// (spec.md §5): the host's value if `PYTHONHASHSEED` is already set,
    /// otherwise a uniform random value in `[1, 2^32-1]` (spec.md §6).
    pub pythonhashseed: String,
}

impl Config {
    /// Builds a `Config`, resolving `n_jobs == 0` to the available
    /// parallelism and the color mode via the precedence chain in
    /// spec.md §6: explicit flag, then `PY_COLORS`, then `NO_COLOR`, then
    /// `FORCE_COLOR`, then a tty check.
    pub fn new(
        cache_path: PathBuf,
        requested_jobs: usize,
        fail_fast: bool,
        skip_setup: bool,
        skip_run: bool,
        skip_missing_interpreters: bool,
        explicit_colors: Option<bool>,
        silent_on_success: bool,
    ) -> Result<Self> {
        let n_jobs = if requested_jobs == 0 {
            std::thread::available_parallelism()
                .map(std::num::NonZeroUsize::get)
                .unwrap_or(1)
        } else {
            requested_jobs
        };
        let colors = resolve_color_mode(explicit_colors)?;
        let pythonhashseed = std::env::var("PYTHONHASHSEED").unwrap_or_else(|_| {
            rand::thread_rng()
                .gen_range(1..=u32::MAX)
                .to_string()
        });
        Ok(Self {
            cache_path,
            n_jobs,
            fail_fast,
            skip_setup,
            skip_run,
            skip_missing_interpreters,
            colors,
            cancellation_grace_period: Duration::from_secs(5),
            silent_on_success,
            pythonhashseed,
        })
    }

    pub fn venv_path(&self, step_name: &str, interpreter: &str) -> PathBuf {
        let interpreter = interpreter.replace([':', '/'], "-");
        self.cache_path
            .join("venvs")
            .join(format!("{step_name}-{interpreter}"))
    }

    pub fn step_cache_path(&self, fully_qualified_name: &str) -> PathBuf {
        self.cache_path.join("steps").join(fully_qualified_name)
    }
}

/// `PY_COLORS=1`/`PY_COLORS=0` take precedence over everything except an
/// explicit CLI flag; an unrecognized value is a configuration error. Then
/// `NO_COLOR` (any value disables color), then `FORCE_COLOR` (any value
/// enables it), then a tty probe on stdout.
fn resolve_color_mode(explicit: Option<bool>) -> Result<ColorMode> {
    if let Some(value) = explicit {
        return Ok(if value { ColorMode::Always } else { ColorMode::Never });
    }
    if let Ok(value) = std::env::var("PY_COLORS") {
        return match value.as_str() {
            "1" => Ok(ColorMode::Always),
            "0" => Ok(ColorMode::Never),
            _ => Err(Error::InvalidPyColors { value }),
        };
    }
    if std::env::var_os("NO_COLOR").is_some() {
        return Ok(ColorMode::Never);
    }
    if std::env::var_os("FORCE_COLOR").is_some() {
        return Ok(ColorMode::Always);
    }
    Ok(if is_stdout_tty() {
        ColorMode::Always
    } else {
        ColorMode::Never
    })
}

#[cfg(unix)]
fn is_stdout_tty() -> bool {
    // SAFETY: isatty is a pure query of an already-open, always-valid fd.
    unsafe { libc::isatty(libc::STDOUT_FILENO) == 1 }
}

#[cfg(not(unix))]
fn is_stdout_tty() -> bool {
    false
}

/// Builds the curated, allow-listed environment for a child process: the
/// venv's `bin`/`Scripts` directory prefixed onto `PATH`, `VIRTUAL_ENV` set,
/// `PYTHONHASHSEED` pinned to the value `Config` resolved at construction,
/// and every other variable in [`ALLOWED_ENV_VARS`] copied from the host
/// process if present.
pub fn curated_env(venv_path: &Path, pythonhashseed: &str) -> Vec<(String, String)> {
    let bin_dir = venv_bin_dir(venv_path);
    let mut vars = Vec::new();
    let existing_path = std::env::var("PATH").unwrap_or_default();
    vars.push((
        "PATH".to_string(),
        format!("{}:{existing_path}", bin_dir.display()),
    ));
    vars.push((
        "VIRTUAL_ENV".to_string(),
        venv_path.display().to_string(),
    ));
    vars.push(("PYTHONHASHSEED".to_string(), pythonhashseed.to_string()));
    for name in ALLOWED_ENV_VARS {
        if *name == "PATH" || *name == "PYTHONHASHSEED" {
            continue;
        }
        if let Ok(value) = std::env::var(name) {
            vars.push(((*name).to_string(), value));
        }
    }
    vars
}

/// Platform-specific location of executables inside a venv.
pub fn venv_bin_dir(venv_path: &Path) -> PathBuf {
    if cfg!(windows) {
        venv_path.join("Scripts")
    } else {
        venv_path.join("bin")
    }
}
