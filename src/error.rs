use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum MdrunError {
    #[error("Runbook file does not exist: {path}")]
    NotebookNotFound { path: PathBuf },

    #[error("Invalid or unreadable runbook file: {path}")]
    InvalidNotebook { path: PathBuf },

    #[error("Task '{id}' not found; available tasks: {}", available.join(", "))]
    TaskNotFound { id: String, available: Vec<String> },

    #[error("Invalid attribute block: {detail}")]
    AttrsParseFailed { detail: String },

    #[error("Partial '{identity}' is already registered")]
    DuplicatePartial { identity: String },

    #[error("Invalid attrs_policy '{value}' (expected ignore, store, or error)")]
    InvalidAttrsPolicy { value: String },

    #[error("Invalid on_duplicate_partial '{value}' (expected overwrite, ignore, or error)")]
    InvalidDuplicatePolicy { value: String },

    #[error("Failed to write capture file {path}: {detail}")]
    CaptureWriteFailed { path: PathBuf, detail: String },

    #[error("Failed to spawn task process: {detail}")]
    TaskSpawnFailed { detail: String },

    #[error("Log file {path} is unavailable: {detail}")]
    LogFileUnavailable { path: PathBuf, detail: String },
}
