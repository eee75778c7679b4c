use std::fmt;

/// Which stream a line of subprocess output came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stream::Stdout => write!(f, "stdout"),
            Stream::Stderr => write!(f, "stderr"),
        }
    }
}

/// Formats lines of interleaved subprocess output with the emitting
/// instance's name, optionally colored.
///
/// Scheduler-level buffering policy (e.g. `silent_on_success`, which
/// withholds a step's output entirely unless it fails) is the caller's
/// responsibility; this type only knows how to format one already-decided
/// line.
#[derive(Debug, Clone)]
pub struct OutputRenderer {
    use_color: bool,
}

const DIM: &str = "\x1b[2m";
const RED: &str = "\x1b[31m";
const RESET: &str = "\x1b[0m";

impl OutputRenderer {
    pub fn new(use_color: bool) -> Self {
        Self { use_color }
    }

    /// Formats one line of output, prefixed with `instance`.
    pub fn prefix_line(&self, instance: &str, stream: Stream, line: &str) -> String {
        if !self.use_color {
            return format!("[{instance}] {line}");
        }
        let color = match stream {
            Stream::Stdout => DIM,
            Stream::Stderr => RED,
        };
        format!("{color}[{instance}]{RESET} {line}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_prefix_has_no_escape_codes() {
        let renderer = OutputRenderer::new(false);
        let line = renderer.prefix_line("build", Stream::Stdout, "ok");
        assert_eq!(line, "[build] ok");
    }

    #[test]
    fn colored_prefix_differs_by_stream() {
        let renderer = OutputRenderer::new(true);
        let stdout = renderer.prefix_line("build", Stream::Stdout, "ok");
        let stderr = renderer.prefix_line("build", Stream::Stderr, "fail");
        assert_ne!(stdout, stderr);
        assert!(stdout.contains("[build]"));
        assert!(stderr.contains("[build]"));
    }
}
