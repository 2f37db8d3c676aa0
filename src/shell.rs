//! Shell strategy for task sources.
//!
//! A source whose first line is a shebang is written to an executable temp
//! file and spawned directly, letting the kernel honor the interpreter.
//! Anything else is evaluated line by line through a deterministic
//! platform runner (`sh -c` per line on Unix). Output capture is
//! best-effort and bounded: the exit status decides success, the streams
//! are kept for diagnostics and `--capture`.

use std::io::{Read, Write};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::MdrunError;

/// Per-stream cap on captured bytes (8 MiB); anything past it is dropped.
const OUTPUT_LIMIT_BYTES: u64 = 8 * 1024 * 1024;

/// How often a timed child is checked against its deadline.
const REAP_INTERVAL: Duration = Duration::from_millis(25);

/// Captured output of one spawned process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the child was killed at the deadline or died to a signal.
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out
    }
}

/// Result of one evaluated source line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineResult {
    pub line: String,
    pub output: ExecOutput,
}

/// What [`auto`] produced: a single shebang-script result or a per-line list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellResult {
    Script(ExecOutput),
    Lines(Vec<LineResult>),
}

impl ShellResult {
    pub fn success(&self) -> bool {
        match self {
            ShellResult::Script(out) => out.success(),
            ShellResult::Lines(lines) => lines.iter().all(|l| l.output.success()),
        }
    }

    /// Combined stdout: the script's, or every line's concatenated.
    pub fn stdout(&self) -> String {
        match self {
            ShellResult::Script(out) => out.stdout.clone(),
            ShellResult::Lines(lines) => lines.iter().map(|l| l.output.stdout.as_str()).collect(),
        }
    }

    pub fn stderr(&self) -> String {
        match self {
            ShellResult::Script(out) => out.stderr.clone(),
            ShellResult::Lines(lines) => lines.iter().map(|l| l.output.stderr.as_str()).collect(),
        }
    }

    /// 0 on success, else the first failing exit code (1 for signals/timeouts).
    pub fn exit_code(&self) -> i32 {
        match self {
            ShellResult::Script(out) => out.exit_code.unwrap_or(1),
            ShellResult::Lines(lines) => lines
                .iter()
                .find(|l| !l.output.success())
                .map(|l| l.output.exit_code.unwrap_or(1))
                .unwrap_or(0),
        }
    }
}

/// True when the first line selects an interpreter.
pub fn is_shebang(source: &str) -> bool {
    source.lines().next().is_some_and(|l| l.starts_with("#!"))
}

/// Dispatch on the source shape: shebang script or per-line eval.
pub fn auto(source: &str, cwd: &Path, timeout: Option<Duration>) -> Result<ShellResult, MdrunError> {
    if is_shebang(source) {
        run_script(source, cwd, timeout).map(ShellResult::Script)
    } else {
        run_lines(source, cwd, timeout).map(ShellResult::Lines)
    }
}

/// Write `source` to an executable temp file and spawn it. The file lives
/// only for the duration of the call.
pub fn run_script(
    source: &str,
    cwd: &Path,
    timeout: Option<Duration>,
) -> Result<ExecOutput, MdrunError> {
    let script = materialize_script(source).map_err(|e| MdrunError::TaskSpawnFailed {
        detail: format!("could not stage script: {e}"),
    })?;

    let mut command = Command::new(script.as_os_str());
    command.current_dir(cwd);
    run_child(command, timeout)
}

/// Stage the script on disk: write, close, mark executable. Closing before
/// spawn matters; executing a file still open for writing is ETXTBSY on
/// Linux. The returned guard deletes the file on drop.
fn materialize_script(source: &str) -> std::io::Result<tempfile::TempPath> {
    let mut file = tempfile::Builder::new()
        .prefix("mdrun-task-")
        .suffix(".script")
        .tempfile()?;
    file.write_all(source.as_bytes())?;
    let path = file.into_temp_path();

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
    }

    Ok(path)
}

/// Evaluate each non-empty line through the platform runner.
pub fn run_lines(
    source: &str,
    cwd: &Path,
    timeout: Option<Duration>,
) -> Result<Vec<LineResult>, MdrunError> {
    let mut results = Vec::new();
    for line in source.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let (program, flag) = platform_runner();
        let mut command = Command::new(program);
        command.arg(flag).arg(trimmed).current_dir(cwd);
        results.push(LineResult {
            line: trimmed.to_owned(),
            output: run_child(command, timeout)?,
        });
    }
    Ok(results)
}

#[cfg(unix)]
fn platform_runner() -> (&'static str, &'static str) {
    ("sh", "-c")
}

#[cfg(not(unix))]
fn platform_runner() -> (&'static str, &'static str) {
    ("cmd", "/C")
}

/// Spawn one child and collect its streams and end state. Each stream is
/// drained concurrently so a chatty child cannot deadlock on a full pipe
/// while the parent waits.
fn run_child(mut command: Command, timeout: Option<Duration>) -> Result<ExecOutput, MdrunError> {
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| MdrunError::TaskSpawnFailed {
            detail: e.to_string(),
        })?;

    let out_drain = child.stdout.take().map(StreamDrain::start);
    let err_drain = child.stderr.take().map(StreamDrain::start);

    let end = await_child(&mut child, timeout).map_err(|e| MdrunError::TaskSpawnFailed {
        detail: format!("wait failed: {e}"),
    })?;

    let stdout = out_drain.map(StreamDrain::finish).unwrap_or_default();
    let stderr = err_drain.map(StreamDrain::finish).unwrap_or_default();

    Ok(match end {
        ChildEnd::Exited(exit_code) => ExecOutput {
            stdout,
            stderr,
            exit_code,
            timed_out: false,
        },
        ChildEnd::DeadlineKilled => ExecOutput {
            stdout,
            stderr,
            exit_code: None,
            timed_out: true,
        },
    })
}

/// Background reader for one child stream, capped at [`OUTPUT_LIMIT_BYTES`].
/// Capture is best-effort: a read error keeps whatever arrived before it,
/// and the child's exit status stays the authority on success.
struct StreamDrain {
    reader: JoinHandle<String>,
}

impl StreamDrain {
    fn start(stream: impl Read + Send + 'static) -> Self {
        let reader = std::thread::spawn(move || {
            let mut collected = Vec::new();
            let _ = stream.take(OUTPUT_LIMIT_BYTES).read_to_end(&mut collected);
            String::from_utf8_lossy(&collected).into_owned()
        });
        Self { reader }
    }

    fn finish(self) -> String {
        self.reader.join().unwrap_or_default()
    }
}

/// How a child ended: a normal exit (code absent on signal death) or
/// killed because the deadline passed.
enum ChildEnd {
    Exited(Option<i32>),
    DeadlineKilled,
}

/// Wait for the child, enforcing the deadline when one is set. The check
/// interval never sleeps past the deadline, so short timeouts stay
/// accurate. A child that exits in the same instant the deadline fires
/// may still be reported as killed.
fn await_child(child: &mut Child, timeout: Option<Duration>) -> std::io::Result<ChildEnd> {
    let Some(limit) = timeout else {
        return Ok(ChildEnd::Exited(child.wait()?.code()));
    };

    let deadline = Instant::now() + limit;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(ChildEnd::Exited(status.code()));
        }
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            let _ = child.kill();
            let _ = child.wait();
            return Ok(ChildEnd::DeadlineKilled);
        }
        std::thread::sleep(left.min(REAP_INTERVAL));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn tmp_dir() -> PathBuf {
        std::env::temp_dir()
    }

    #[test]
    fn shebang_detection() {
        assert!(is_shebang("#!/bin/sh\necho hi\n"));
        assert!(!is_shebang("echo hi\n"));
        assert!(!is_shebang(""));
        assert!(!is_shebang("  #!/bin/sh\n"));
    }

    #[test]
    fn shebang_script_runs_whole_source() {
        let source = "#!/bin/sh\nA=41\necho $((A + 1))\n";
        let result = auto(source, &tmp_dir(), None).unwrap();
        match &result {
            ShellResult::Script(out) => {
                assert_eq!(out.stdout.trim(), "42");
                assert!(out.success());
            }
            other => panic!("expected Script, got {other:?}"),
        }
        assert!(result.success());
        assert_eq!(result.exit_code(), 0);
    }

    #[test]
    fn plain_source_runs_per_line() {
        let source = "echo one\n\necho two\n";
        let result = auto(source, &tmp_dir(), None).unwrap();
        match &result {
            ShellResult::Lines(lines) => {
                assert_eq!(lines.len(), 2, "blank lines are skipped");
                assert_eq!(lines[0].output.stdout.trim(), "one");
                assert_eq!(lines[1].output.stdout.trim(), "two");
            }
            other => panic!("expected Lines, got {other:?}"),
        }
        assert_eq!(result.stdout(), "one\ntwo\n");
    }

    #[test]
    fn per_line_runner_supports_shell_syntax() {
        let result = run_lines("echo a b | wc -w\n", &tmp_dir(), None).unwrap();
        assert_eq!(result[0].output.stdout.trim(), "2");
    }

    #[test]
    fn failing_line_surfaces_exit_code() {
        let source = "true\nexit 3\necho after\n";
        let result = auto(source, &tmp_dir(), None).unwrap();
        assert!(!result.success());
        assert_eq!(result.exit_code(), 3);
    }

    #[test]
    fn captures_stderr() {
        let result = run_lines("echo err >&2\n", &tmp_dir(), None).unwrap();
        assert_eq!(result[0].output.stderr.trim(), "err");
        assert_eq!(result.iter().map(|l| l.output.stdout.as_str()).collect::<String>(), "");
    }

    #[test]
    fn respects_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let result = run_lines("pwd\n", dir.path(), None).unwrap();
        let expected = dir.path().canonicalize().unwrap();
        let actual: PathBuf = result[0].output.stdout.trim().into();
        let actual = actual.canonicalize().unwrap_or(actual);
        assert_eq!(actual, expected);
    }

    #[test]
    fn deadline_kills_long_running_script() {
        let source = "#!/bin/sh\nsleep 60\n";
        let result = run_script(source, &tmp_dir(), Some(Duration::from_millis(200))).unwrap();
        assert!(result.timed_out);
        assert_eq!(result.exit_code, None);
        assert!(!result.success());
    }

    #[test]
    fn fast_child_beats_its_deadline() {
        let result = run_lines("true\n", &tmp_dir(), Some(Duration::from_secs(5))).unwrap();
        assert!(!result[0].output.timed_out);
        assert!(result[0].output.success());
    }

    #[test]
    fn shebang_interpreter_is_honored() {
        let source = "#!/usr/bin/env sh\necho via-env\n";
        let result = run_script(source, &tmp_dir(), None).unwrap();
        assert_eq!(result.stdout.trim(), "via-env");
    }

    #[test]
    fn output_is_kept_when_the_deadline_fires() {
        let source = "#!/bin/sh\necho early\nsleep 60\n";
        let result = run_script(source, &tmp_dir(), Some(Duration::from_millis(300))).unwrap();
        assert!(result.timed_out);
        assert_eq!(result.stdout.trim(), "early");
    }

    #[test]
    fn empty_source_yields_no_line_results() {
        let result = run_lines("\n  \n", &tmp_dir(), None).unwrap();
        assert!(result.is_empty());
        assert!(ShellResult::Lines(result).success());
    }
}
