//! Serial DAG execution.
//!
//! The walk is strictly serial: one task completes (and its section frame
//! is pushed) before the next is scheduled, so capture semantics and the
//! section stack are deterministic. Given identical inputs and a
//! deterministic handler, the sequence of scheduled ids and emitted events
//! is identical run to run.

use chrono::{DateTime, Utc};
use tracing::{debug, error};

use crate::directive::TaskCell;
use crate::events::{EventBus, RunEvent, RunTotals};
use crate::plan::ExecutionPlan;

/// Outcome of one executed task.
///
/// `exit_code == 0` iff `success`; `ended_at >= started_at`.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskExecutionResult {
    pub task_id: String,
    pub success: bool,
    pub exit_code: i32,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub error: Option<String>,
}

impl TaskExecutionResult {
    pub fn ok(task_id: &str, started_at: DateTime<Utc>) -> Self {
        Self {
            task_id: task_id.to_owned(),
            success: true,
            exit_code: 0,
            started_at,
            ended_at: Utc::now(),
            stdout: None,
            stderr: None,
            error: None,
        }
    }

    pub fn fail(task_id: &str, started_at: DateTime<Utc>, exit_code: i32, error: Option<String>) -> Self {
        Self {
            task_id: task_id.to_owned(),
            success: false,
            exit_code: if exit_code == 0 { 1 } else { exit_code },
            started_at,
            ended_at: Utc::now(),
            stdout: None,
            stderr: None,
            error,
        }
    }

    pub fn with_output(mut self, stdout: String, stderr: String) -> Self {
        self.stdout = Some(stdout);
        self.stderr = Some(stderr);
        self
    }
}

/// Whether scheduling continues after a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Disposition {
    #[default]
    Continue,
    /// Stop immediately; successors of the current task are not released.
    Terminate,
}

/// What a task handler returns.
#[derive(Debug, Clone)]
pub struct ExecuteOutcome {
    pub result: TaskExecutionResult,
    pub disposition: Disposition,
}

/// A completed task visible to later tasks during the same run.
#[derive(Debug, Clone)]
pub struct SectionFrame {
    pub task_id: String,
    pub result: TaskExecutionResult,
}

/// What a full DAG walk produced.
#[derive(Debug)]
pub struct RunReport {
    /// Section frames in execution order.
    pub sections: Vec<SectionFrame>,
    /// Ids actually executed, in order.
    pub ran: Vec<String>,
    /// True when a handler requested termination or threw.
    pub terminated: bool,
    pub totals: RunTotals,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

impl RunReport {
    pub fn all_succeeded(&self) -> bool {
        self.totals.failed == 0 && !self.terminated
    }
}

/// Walk the plan serially, emitting lifecycle events on `bus`.
///
/// The handler receives the task and the section stack so far and returns
/// a result plus disposition; `Err` synthesizes a failing result, emits an
/// `error{stage: "task-run"}` event, and terminates the run. The plan's
/// indegree snapshot is copied, never mutated.
pub fn execute_dag<F>(plan: &ExecutionPlan<'_>, bus: &EventBus, mut execute: F) -> RunReport
where
    F: FnMut(&TaskCell, &[SectionFrame]) -> Result<ExecuteOutcome, String>,
{
    let started_at = Utc::now();
    bus.emit(&RunEvent::RunStart {
        started_at,
        task_count: plan.ids.len(),
    });
    bus.emit(&RunEvent::PlanReady {
        ids: plan.ids.clone(),
        unresolved: plan.unresolved.clone(),
        missing_deps: plan.missing_deps.clone(),
    });

    let mut remaining: Vec<usize> = plan.indegree.values().copied().collect();
    let mut ready: Vec<String> = plan.initial_ready();
    bus.emit(&RunEvent::DagReady {
        ready: ready.clone(),
    });

    let mut sections: Vec<SectionFrame> = Vec::new();
    let mut ran: Vec<String> = Vec::new();
    let mut failed = 0usize;
    let mut terminated = false;

    while !ready.is_empty() {
        let id = ready.remove(0);
        bus.emit(&RunEvent::TaskScheduled { id: id.clone() });

        let task = plan.by_id[id.as_str()];
        let task_started = Utc::now();
        bus.emit(&RunEvent::TaskStart {
            id: id.clone(),
            at: task_started,
        });

        let (result, disposition) = match execute(task, &sections) {
            Ok(outcome) => (outcome.result, outcome.disposition),
            Err(cause) => {
                error!(task_id = %id, cause = %cause, "task handler failed");
                bus.emit(&RunEvent::Error {
                    stage: "task-run".to_owned(),
                    message: cause.clone(),
                    task_id: Some(id.clone()),
                });
                (
                    TaskExecutionResult::fail(&id, task_started, 1, Some(cause)),
                    Disposition::Terminate,
                )
            }
        };

        if !result.success {
            failed += 1;
        }
        ran.push(id.clone());
        sections.push(SectionFrame {
            task_id: id.clone(),
            result: result.clone(),
        });
        bus.emit(&RunEvent::TaskEnd {
            id: id.clone(),
            result,
        });

        if disposition == Disposition::Terminate {
            debug!(task_id = %id, "run terminated by task disposition");
            terminated = true;
            break;
        }

        let mut released: Vec<String> = Vec::new();
        if let Some(successors) = plan.adjacency.get(id.as_str()) {
            for succ in successors {
                let idx = plan
                    .indegree
                    .get_index_of(succ.as_str())
                    .expect("successor is a known id");
                remaining[idx] -= 1;
                if remaining[idx] == 0 {
                    released.push(succ.clone());
                }
            }
        }
        if !released.is_empty() {
            bus.emit(&RunEvent::DagRelease {
                from: id.clone(),
                to: released.clone(),
            });
            for succ in released {
                insert_by_rank(&mut ready, succ, plan);
            }
        }
    }

    let ended_at = Utc::now();
    let totals = RunTotals {
        tasks: plan.ids.len(),
        failed,
        succeeded: ran.len() - failed,
        unresolved: plan.unresolved.len(),
        missing_deps: plan.missing_deps.len(),
    };
    bus.emit(&RunEvent::RunEnd {
        ended_at,
        duration_ms: (ended_at - started_at).num_milliseconds().max(0) as u64,
        totals,
    });

    RunReport {
        sections,
        ran,
        terminated,
        totals,
        started_at,
        ended_at,
    }
}

/// Keep the ready queue ordered by definition rank.
fn insert_by_rank(ready: &mut Vec<String>, id: String, plan: &ExecutionPlan<'_>) {
    let rank = |s: &str| plan.by_id.get_index_of(s).unwrap_or(usize::MAX);
    let id_rank = rank(&id);
    let pos = ready
        .iter()
        .position(|existing| rank(existing) > id_rank)
        .unwrap_or(ready.len());
    ready.insert(pos, id);
}
