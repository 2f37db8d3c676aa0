//! Logging: global subscriber setup and run/task spans.
//!
//! Stderr gets a compact layer filtered with precedence `MDRUN_LOG` env
//! var > configured directive > `info`. When a log file is configured it
//! gets an unfiltered JSON layer, so the file keeps the full record even
//! when stderr is quiet. The runner enters [`run_span`] for a DAG walk
//! and [`task_span`] per task, which is how `task_id` and `notebook`
//! reach every event emitted inside the built-in handler.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::OnceLock;

use tracing::{Span, info_span};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::error::MdrunError;

const ENV_FILTER_VAR: &str = "MDRUN_LOG";
const FALLBACK_DIRECTIVE: &str = "info";

static INSTALLED: OnceLock<()> = OnceLock::new();

/// Install the process-wide subscriber. Only the first call takes effect;
/// later calls (and tests, which share one process) are no-ops.
pub fn init(directive: Option<&str>, json_log: Option<&Path>) -> anyhow::Result<()> {
    if INSTALLED.set(()).is_err() {
        return Ok(());
    }

    let env_value = std::env::var(ENV_FILTER_VAR).ok();
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .with_filter(filter_from(env_value.as_deref(), directive));

    let base = tracing_subscriber::registry().with(stderr_layer);
    let result = match json_log {
        Some(path) => {
            let json_layer = tracing_subscriber::fmt::layer()
                .with_writer(json_sink(path)?)
                .with_ansi(false)
                .json();
            base.with(json_layer).try_init()
        }
        None => base.try_init(),
    };
    result.map_err(|e| anyhow::anyhow!("failed to install subscriber: {e}"))
}

/// Span covering one full DAG walk.
pub fn run_span(tasks: usize) -> Span {
    info_span!("run", tasks)
}

/// Span entered for the duration of one task execution. Events inside the
/// handler inherit `task_id` and `notebook` from here instead of
/// repeating them per call site.
pub fn task_span(task_id: &str, notebook: &str) -> Span {
    info_span!("task", task_id, notebook)
}

/// Resolve the stderr filter. A source that fails to parse as a filter
/// directive falls through to the next one rather than erroring the run.
fn filter_from(env_value: Option<&str>, directive: Option<&str>) -> EnvFilter {
    env_value
        .and_then(|v| EnvFilter::try_new(v).ok())
        .or_else(|| directive.and_then(|d| EnvFilter::try_new(d).ok()))
        .unwrap_or_else(|| EnvFilter::new(FALLBACK_DIRECTIVE))
}

/// Open the JSON log for appending, creating missing parent directories.
fn json_sink(path: &Path) -> Result<File, MdrunError> {
    let unavailable = |detail: String| MdrunError::LogFileUnavailable {
        path: path.to_path_buf(),
        detail,
    };
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).map_err(|e| unavailable(e.to_string()))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| unavailable(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_value_outranks_configured_directive() {
        let filter = filter_from(Some("trace"), Some("warn"));
        let display = format!("{filter}");
        assert!(display.contains("trace"), "env should win, got: {display}");
    }

    #[test]
    fn unparseable_env_value_falls_back_to_directive() {
        let filter = filter_from(Some("==="), Some("warn"));
        let display = format!("{filter}");
        assert!(display.contains("warn"), "got: {display}");
    }

    #[test]
    fn default_filter_is_info() {
        let display = format!("{}", filter_from(None, None));
        assert!(display.contains("info"), "got: {display}");
    }

    #[test]
    fn per_target_directives_are_accepted() {
        let filter = filter_from(None, Some("mdrun=debug,warn"));
        let display = format!("{filter}");
        assert!(display.contains("mdrun=debug"), "got: {display}");
    }

    #[test]
    fn json_sink_creates_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("run").join("mdrun.json");
        assert!(json_sink(&path).is_ok());
        assert!(path.exists());
    }

    #[test]
    fn json_sink_appends_between_opens() {
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mdrun.json");
        writeln!(json_sink(&path).unwrap(), "first").unwrap();
        writeln!(json_sink(&path).unwrap(), "second").unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(
            contents.contains("first") && contents.contains("second"),
            "both writes should survive, got: {contents}"
        );
    }

    #[test]
    fn json_sink_reports_unusable_path() {
        let err = json_sink(Path::new("/proc/no-such-dir/mdrun.json")).unwrap_err();
        assert!(matches!(err, MdrunError::LogFileUnavailable { .. }));
    }

    #[test]
    fn init_is_idempotent() {
        init(Some("debug"), None).unwrap();
        init(None, None).unwrap();
    }

    #[test]
    fn spans_can_be_entered_without_a_subscriber() {
        let _run = run_span(3).entered();
        let _task = task_span("build", "Runbook.md").entered();
    }
}
