//! Output capture: a task's stdout (or a CONTENT directive's interpolated
//! text) lands either in a named slot of the run's capture map, where later
//! tasks can reference it during interpolation, or in a file when the
//! instruction starts with `./`. File captures overwrite existing content
//! and always end with exactly one trailing newline.

use std::fs;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde_json::{Map, Value};

use crate::error::MdrunError;
use crate::fence::FenceInfo;

/// Recorded output of a capture-enabled task.
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedExec {
    pub task_id: String,
    pub origin: PathBuf,
    /// True when interpolation rewrote the source before execution.
    pub interpolated: bool,
    /// Stdout for spawned tasks, effective source for CONTENT directives.
    pub text: String,
    /// Absent for CONTENT directives, which never spawn.
    pub exit_code: Option<i32>,
}

impl CapturedExec {
    pub fn text(&self) -> &str {
        &self.text
    }

    /// The captured text parsed as JSON, when it is valid JSON.
    pub fn json(&self) -> Option<Value> {
        serde_json::from_str(&self.text).ok()
    }
}

/// Named capture slots in insertion (execution) order.
pub type CaptureMap = IndexMap<String, CapturedExec>;

/// Snapshot of the capture map as template data: each slot exposes `text`
/// and `json` fields for `{{ captured.<name>.text }}` style access.
pub fn snapshot(map: &CaptureMap) -> Value {
    let mut out = Map::new();
    for (name, exec) in map {
        let mut entry = Map::new();
        entry.insert("text".to_owned(), Value::String(exec.text.clone()));
        entry.insert("json".to_owned(), exec.json().unwrap_or(Value::Null));
        entry.insert("taskId".to_owned(), Value::String(exec.task_id.clone()));
        out.insert(name.clone(), Value::Object(entry));
    }
    Value::Object(out)
}

/// Normalize `--capture` values into instructions: bare `--capture` means
/// one slot named after the task, strings and lists pass through.
pub fn instructions(info: &FenceInfo, task_id: &str) -> Vec<String> {
    let values = info.flag_values(&["capture", "C"]);
    let mut out = Vec::new();
    for value in values {
        match value {
            Value::Bool(true) => out.push(task_id.to_owned()),
            Value::String(s) => out.push(s.clone()),
            Value::Array(items) => {
                out.extend(items.iter().filter_map(|v| v.as_str().map(str::to_owned)));
            }
            _ => {}
        }
    }
    out
}

/// True when the instruction targets the filesystem rather than a slot.
pub fn is_path_instruction(instruction: &str) -> bool {
    instruction.starts_with("./")
}

/// Write captured text to `path`, creating parent directories and
/// appending a trailing newline when the text lacks one. Pre-existing
/// files are overwritten.
pub fn write_file(path: &Path, text: &str) -> Result<(), MdrunError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| MdrunError::CaptureWriteFailed {
                path: path.to_path_buf(),
                detail: format!("failed to create parent directory: {e}"),
            })?;
        }
    }
    let mut contents = text.to_owned();
    if !contents.ends_with('\n') {
        contents.push('\n');
    }
    fs::write(path, contents).map_err(|e| MdrunError::CaptureWriteFailed {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })
}

/// Append `entry` to the `.gitignore` next to `root` unless already listed.
/// Each appended entry is preceded by a `# label` comment line.
pub fn append_gitignore(root: &Path, entry: &str, label: &str) -> std::io::Result<()> {
    let path = root.join(".gitignore");
    let existing = match fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e),
    };

    if existing.lines().any(|l| l.trim() == entry) {
        return Ok(());
    }

    let mut next = existing;
    if !next.is_empty() && !next.ends_with('\n') {
        next.push('\n');
    }
    next.push_str(&format!("# {label}\n{entry}\n"));
    fs::write(&path, next)
}
