//! Run summary: build and optionally persist a JSON summary under
//! `--summarize`.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;

use crate::executor::RunReport;
use crate::plan::ExecutionPlan;

/// Summary of a completed run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// Task ids that ran and succeeded, in execution order.
    pub tasks_succeeded: Vec<String>,
    /// Task ids that ran and failed, in execution order.
    pub tasks_failed: Vec<String>,
    /// Ids never scheduled (cycle or unmet chain).
    pub unresolved: Vec<String>,
    /// Task id → dep names absent from the task set.
    /// `BTreeMap` keeps JSON keys in deterministic order.
    pub missing_deps: BTreeMap<String, Vec<String>>,
    /// True when a handler terminated the run early.
    pub terminated: bool,
    pub exit_code: u8,
    /// Runbook sources consulted for this run.
    pub runbooks: Vec<String>,
    pub duration_ms: u64,
    /// ISO8601 timestamp when the run completed.
    pub completed_at: String,
}

/// Build a summary from the run report and plan diagnostics.
pub fn build_summary(
    report: &RunReport,
    plan: &ExecutionPlan<'_>,
    runbooks: &[PathBuf],
    exit_code: u8,
) -> RunSummary {
    let tasks_succeeded: Vec<String> = report
        .sections
        .iter()
        .filter(|f| f.result.success)
        .map(|f| f.task_id.clone())
        .collect();
    let tasks_failed: Vec<String> = report
        .sections
        .iter()
        .filter(|f| !f.result.success)
        .map(|f| f.task_id.clone())
        .collect();

    RunSummary {
        tasks_succeeded,
        tasks_failed,
        unresolved: plan.unresolved.clone(),
        missing_deps: plan
            .missing_deps
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        terminated: report.terminated,
        exit_code,
        runbooks: runbooks.iter().map(|p| p.display().to_string()).collect(),
        duration_ms: (report.ended_at - report.started_at).num_milliseconds().max(0) as u64,
        completed_at: Utc::now().to_rfc3339(),
    }
}

/// Print the summary as pretty JSON on stdout.
pub fn print_summary(summary: &RunSummary) {
    match serde_json::to_string_pretty(summary) {
        Ok(json) => println!("{json}"),
        Err(e) => tracing::warn!(err = %e, "failed to serialize run summary"),
    }
}

/// Write the summary to `path`. Creates parent dirs if needed; writes
/// atomically (temp then rename). Best-effort: on failure logs a warning.
pub fn write_summary(summary: &RunSummary, path: &Path) {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(e) = fs::create_dir_all(parent) {
                tracing::warn!(
                    path = %path.display(),
                    err = %e,
                    "failed to create parent directory for run summary"
                );
                return;
            }
        }
    }

    let json = match serde_json::to_string_pretty(summary) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                err = %e,
                "failed to serialize run summary"
            );
            return;
        }
    };

    let tmp_path = path.with_extension("json.tmp");
    if let Err(e) = (|| -> std::io::Result<()> {
        let mut f = fs::File::create(&tmp_path)?;
        f.write_all(json.as_bytes())?;
        f.sync_all()?;
        Ok(())
    })() {
        tracing::warn!(
            path = %path.display(),
            err = %e,
            "failed to write run summary (temp file)"
        );
        let _ = fs::remove_file(&tmp_path);
        return;
    }

    if fs::rename(&tmp_path, path).is_err() {
        if let Err(e) = fs::write(path, &json) {
            tracing::warn!(
                path = %path.display(),
                err = %e,
                "failed to write run summary (fallback)"
            );
        }
        let _ = fs::remove_file(&tmp_path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directive::{TaskCell, TaskSpec};
    use crate::events::EventBus;
    use crate::executor::{self, Disposition, ExecuteOutcome, TaskExecutionResult};
    use crate::fence::{FenceInfo, FenceInfoOptions};
    use crate::notebook::Cell;
    use crate::plan::execution_plan;

    fn task(info: &str) -> TaskCell {
        let parsed = FenceInfo::parse(info, &FenceInfoOptions::default()).unwrap();
        let identity = parsed.first_bare_word().unwrap().to_owned();
        let deps: Vec<String> = parsed
            .flag_values(&["dep"])
            .iter()
            .filter_map(|v| v.as_str().map(str::to_owned))
            .collect();
        TaskCell {
            cell: Cell {
                lang: Some("bash".to_owned()),
                info: info.to_owned(),
                body: String::new(),
                start_line: 1,
                end_line: 2,
            },
            info: parsed,
            spec: TaskSpec {
                identity,
                language: "shell".to_owned(),
                source: String::new(),
                deps,
            },
            origin: PathBuf::from("book.md"),
            is_content: false,
        }
    }

    #[test]
    fn summary_partitions_succeeded_and_failed() {
        let tasks = vec![task("bash good"), task("bash bad --dep ghost")];
        let plan = execution_plan(&tasks);
        let report = executor::execute_dag(&plan, &EventBus::new(), |t, _| {
            let result = if t.task_id() == "bad" {
                TaskExecutionResult::fail(t.task_id(), Utc::now(), 2, None)
            } else {
                TaskExecutionResult::ok(t.task_id(), Utc::now())
            };
            Ok(ExecuteOutcome {
                result,
                disposition: Disposition::Continue,
            })
        });

        let summary = build_summary(&report, &plan, &[PathBuf::from("book.md")], 1);
        assert_eq!(summary.tasks_succeeded, vec!["good"]);
        assert_eq!(summary.tasks_failed, vec!["bad"]);
        assert_eq!(summary.missing_deps["bad"], vec!["ghost"]);
        assert_eq!(summary.exit_code, 1);
        assert!(!summary.terminated);
        assert_eq!(summary.runbooks, vec!["book.md"]);
    }

    #[test]
    fn write_summary_creates_parents_and_valid_json() {
        let tasks = vec![task("bash only")];
        let plan = execution_plan(&tasks);
        let report = executor::execute_dag(&plan, &EventBus::new(), |t, _| {
            Ok(ExecuteOutcome {
                result: TaskExecutionResult::ok(t.task_id(), Utc::now()),
                disposition: Disposition::Continue,
            })
        });
        let summary = build_summary(&report, &plan, &[], 0);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("summary.json");
        write_summary(&summary, &path);

        let contents = fs::read_to_string(&path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed["tasks_succeeded"], serde_json::json!(["only"]));
        assert_eq!(parsed["exit_code"], serde_json::json!(0));
    }
}
