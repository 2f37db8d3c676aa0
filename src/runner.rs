//! End-to-end orchestration: runbooks → directives → plan → execution.
//!
//! Loading walks every source, classifies fences, and fills the partials
//! registry and task list. Running wires the built-in task handler
//! (interpolate → spawn → capture) into the serial DAG executor and
//! reports per-task progress according to the verbose mode.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::capture::{self, CaptureMap, CapturedExec};
use crate::cli::VerboseMode;
use crate::config::MdrunConfig;
use crate::directive::{
    AnyNamedContentInspector, Directive, Inspector, InspectorPipeline, Issue, IssueKind, LangSpec,
    PartialDirective, PartialInspector, SpawnableInspector, TaskCell,
};
use crate::events::{EventBus, EventKind, RunEvent};
use crate::executor::{self, Disposition, ExecuteOutcome, RunReport, TaskExecutionResult};
use crate::interp::{self, InterpOutcome, RenderData};
use crate::logging;
use crate::notebook::{self, Notebook};
use crate::partials::{Composition, PartialsRegistry};
use crate::plan::{DepResolver, ExecutionPlan};
use crate::shell;
use crate::viz::TaskRow;

/// Everything parsing produced across all sources. The registry is frozen
/// behind an `Arc` once loading completes; execution only reads it.
pub struct LoadedRunbooks {
    pub tasks: Vec<TaskCell>,
    pub registry: Arc<PartialsRegistry>,
    pub issues: Vec<Issue>,
    /// Sources that were read (for reporting).
    pub sources: Vec<PathBuf>,
}

/// Resolve which sources to read: explicit paths win, then configured
/// files that exist, then stdin.
pub fn resolve_sources(config: &MdrunConfig, paths: &[PathBuf]) -> Vec<PathBuf> {
    if !paths.is_empty() {
        return paths.to_vec();
    }
    let existing: Vec<PathBuf> = config
        .files
        .iter()
        .filter(|p| p.is_file())
        .cloned()
        .collect();
    if existing.is_empty() {
        vec![PathBuf::from("-")]
    } else {
        existing
    }
}

/// Load and classify every fence across the given sources.
///
/// A notebook whose frontmatter fails to parse is skipped with a recorded
/// issue; the other notebooks proceed. Fence-level problems accumulate as
/// issues without aborting the load.
pub fn load_runbooks(config: &MdrunConfig, paths: &[PathBuf]) -> anyhow::Result<LoadedRunbooks> {
    let sources = resolve_sources(config, paths);

    let pipeline = build_pipeline(config);

    let mut tasks: Vec<TaskCell> = Vec::new();
    let mut registry = PartialsRegistry::new();
    let mut issues: Vec<Issue> = Vec::new();

    for source in &sources {
        let content = if source.as_os_str() == "-" {
            notebook::read_stdin()?
        } else {
            notebook::read_source(source)?
        };

        let book = match notebook::parse(source, &content, None) {
            Ok(book) => book,
            Err(message) => {
                warn!(notebook = %source.display(), %message, "skipping notebook");
                issues.push(Issue {
                    kind: IssueKind::FrontmatterParse,
                    disposition: "error",
                    provenance: source.clone(),
                    start_line: 1,
                    end_line: 1,
                    message,
                    error: None,
                });
                continue;
            }
        };

        admit_notebook(&book, &pipeline, config, &mut tasks, &mut registry, &mut issues)?;
    }

    info!(
        tasks = tasks.len(),
        issues = issues.len(),
        sources = sources.len(),
        "runbooks loaded"
    );
    Ok(LoadedRunbooks {
        tasks,
        registry: Arc::new(registry),
        issues,
        sources,
    })
}

/// Inspector chain per config: partial, spawnable (with the configured
/// language allow-list), and optionally the content catch-all.
fn build_pipeline(config: &MdrunConfig) -> InspectorPipeline {
    let mut inspectors: Vec<Box<dyn Inspector>> = vec![
        Box::new(PartialInspector),
        Box::new(SpawnableInspector {
            langs: vec![LangSpec {
                name: "shell".to_owned(),
                aliases: config.langs.clone(),
            }],
        }),
    ];
    if config.content_tasks {
        inspectors.push(Box::new(AnyNamedContentInspector));
    }
    InspectorPipeline::new(inspectors, config.fence_options())
}

fn admit_notebook(
    book: &Notebook,
    pipeline: &InspectorPipeline,
    config: &MdrunConfig,
    tasks: &mut Vec<TaskCell>,
    registry: &mut PartialsRegistry,
    issues: &mut Vec<Issue>,
) -> anyhow::Result<()> {
    for cell in &book.cells {
        let (info, directive) = pipeline.inspect(cell, &book.origin, issues)?;
        match directive {
            Some(Directive::Task(spec)) => tasks.push(TaskCell {
                cell: cell.clone(),
                info,
                spec,
                origin: book.origin.clone(),
                is_content: false,
            }),
            Some(Directive::Content(spec)) => tasks.push(TaskCell {
                cell: cell.clone(),
                info,
                spec,
                origin: book.origin.clone(),
                is_content: true,
            }),
            Some(Directive::Partial(partial)) => {
                let result = match partial {
                    PartialDirective::Plain(p) => registry.register(p, config.duplicate_policy()),
                    PartialDirective::Injectable(inj) => {
                        registry.register_injectable(inj, config.duplicate_policy())
                    }
                };
                if let Err(e) = result {
                    issues.push(
                        Issue::fence(cell, &book.origin, "partial registration rejected")
                            .with_error(e.to_string()),
                    );
                }
            }
            None => {
                debug!(
                    notebook = %book.origin.display(),
                    start_line = cell.start_line,
                    "fence not claimed by any inspector"
                );
            }
        }
    }
    Ok(())
}

/// Rows for `mdrun ls`, with effective (implicit + explicit) deps.
pub fn task_rows(tasks: &[TaskCell]) -> Vec<TaskRow> {
    let resolver = DepResolver::new(tasks);
    tasks
        .iter()
        .map(|task| {
            let flags: Vec<String> = task
                .info
                .flags
                .keys()
                .filter(|key| !task.info.pos.contains(*key))
                .cloned()
                .collect();
            let description = task
                .info
                .attrs
                .as_ref()
                .and_then(|a| a.get("description"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned();
            TaskRow {
                name: task.task_id().to_owned(),
                deps: resolver.deps_for(task),
                flags,
                description,
                origin: task.origin.display().to_string(),
                engine: task.spec.language.clone(),
            }
        })
        .collect()
}

/// Knobs for one execution.
pub struct RunOptions {
    pub verbose: VerboseMode,
    pub timeout: Option<Duration>,
    /// Working directory for spawned tasks and `./` captures.
    pub cwd: PathBuf,
}

/// Execute a plan with the built-in handler. The registry must be frozen
/// before this call; it is only read from here on.
pub fn run_plan(
    plan: &ExecutionPlan<'_>,
    registry: Arc<PartialsRegistry>,
    options: &RunOptions,
) -> RunReport {
    let _walk = logging::run_span(plan.ids.len()).entered();

    let mut bus = EventBus::new();
    attach_progress_listeners(&mut bus, options.verbose);

    let mut captures = CaptureMap::new();
    let cwd = options.cwd.clone();
    let timeout = options.timeout;

    executor::execute_dag(plan, &bus, move |task, _sections| {
        run_one_task(task, &registry, &mut captures, &cwd, timeout)
    })
}

/// The built-in execute function: interpolate, spawn (unless CONTENT),
/// then capture. Failures land in the result; only engine-level I/O
/// errors (spawn, capture write) abort the run.
fn run_one_task(
    task: &TaskCell,
    registry: &Arc<PartialsRegistry>,
    captures: &mut CaptureMap,
    cwd: &Path,
    timeout: Option<Duration>,
) -> Result<ExecuteOutcome, String> {
    let id = task.task_id().to_owned();
    let notebook = task.origin.display().to_string();
    let _scope = logging::task_span(&id, &notebook).entered();
    let started_at = chrono::Utc::now();
    let started = Instant::now();

    let ctx = json!({
        "taskId": id,
        "language": task.spec.language,
        "origin": task.origin.display().to_string(),
        "content": task.is_content,
    });
    let cell_meta = json!({
        "origin": task.origin.display().to_string(),
        "startLine": task.cell.start_line,
        "endLine": task.cell.end_line,
        "lang": task.cell.lang,
        "info": task.cell.info,
    });

    let enabled = task.info.is_enabled(&["interpolate", "I"]);
    let data = RenderData::new(Arc::clone(registry), ctx, cell_meta, capture::snapshot(captures));
    let outcome = interp::interpolate(&task.spec.source, enabled, &data);

    if let InterpOutcome::Failed(message) = &outcome {
        warn!(error = %message, "interpolation failed");
        return Ok(ExecuteOutcome {
            result: TaskExecutionResult::fail(&id, started_at, 1, Some(message.clone())),
            disposition: Disposition::Continue,
        });
    }
    let interpolated = matches!(outcome, InterpOutcome::Mutated(_));
    let source = outcome.effective(&task.spec.source);

    let (result, capture_text, exit_code) = if task.is_content {
        let result = TaskExecutionResult::ok(&id, started_at);
        (result, source.to_owned(), None)
    } else {
        let shell_result = shell::auto(source, cwd, timeout).map_err(|e| format!("task '{id}': {e}"))?;
        let stdout = shell_result.stdout();
        let stderr = shell_result.stderr();
        let exit_code = shell_result.exit_code();

        let result = if shell_result.success() {
            TaskExecutionResult::ok(&id, started_at).with_output(stdout.clone(), stderr)
        } else {
            TaskExecutionResult::fail(&id, started_at, exit_code, None)
                .with_output(stdout.clone(), stderr)
        };
        (result, stdout, Some(exit_code))
    };

    apply_captures(task, &id, capture_text, interpolated, exit_code, registry, captures, cwd)?;

    info!(
        exit_code = result.exit_code,
        success = result.success,
        duration_ms = started.elapsed().as_millis() as u64,
        "task finished"
    );

    Ok(ExecuteOutcome {
        result,
        disposition: Disposition::Continue,
    })
}

#[allow(clippy::too_many_arguments)]
fn apply_captures(
    task: &TaskCell,
    id: &str,
    text: String,
    interpolated: bool,
    exit_code: Option<i32>,
    registry: &Arc<PartialsRegistry>,
    captures: &mut CaptureMap,
    cwd: &Path,
) -> Result<(), String> {
    let instructions = capture::instructions(&task.info, id);
    if instructions.is_empty() {
        return Ok(());
    }

    let locals = json!({"taskId": id});
    for instruction in instructions {
        if capture::is_path_instruction(&instruction) {
            let composed = registry.compose(
                Composition {
                    content: text.clone(),
                    interpolate: false,
                    locals: locals.clone(),
                },
                instruction.trim_start_matches("./"),
            );
            let path = cwd.join(instruction.trim_start_matches("./"));
            capture::write_file(&path, &composed.content).map_err(|e| e.to_string())?;
            debug!(path = %path.display(), "capture written to file");

            if task.info.is_enabled(&["gitignore"]) {
                let label = task
                    .info
                    .flag_str(&["gitignore"])
                    .filter(|v| v != "true")
                    .unwrap_or_else(|| "mdrun captures".to_owned());
                if let Err(e) =
                    capture::append_gitignore(cwd, instruction.trim_start_matches("./"), &label)
                {
                    warn!(error = %e, "gitignore append failed");
                }
            }
        } else {
            captures.insert(
                instruction.clone(),
                CapturedExec {
                    task_id: id.to_owned(),
                    origin: task.origin.clone(),
                    interpolated,
                    text: text.clone(),
                    exit_code,
                },
            );
            debug!(slot = %instruction, "capture stored");
        }
    }
    Ok(())
}

fn attach_progress_listeners(bus: &mut EventBus, verbose: VerboseMode) {
    match verbose {
        VerboseMode::Plain => {}
        VerboseMode::Rich => {
            bus.on(EventKind::TaskEnd, |event| {
                if let RunEvent::TaskEnd { id, result } = event {
                    let millis = (result.ended_at - result.started_at)
                        .num_milliseconds()
                        .max(0);
                    if result.success {
                        println!("✓ {id} ({millis}ms)");
                    } else {
                        println!("✗ {id} (exit {}, {millis}ms)", result.exit_code);
                    }
                }
            });
        }
        VerboseMode::Markdown => {
            bus.on(EventKind::TaskStart, |event| {
                if let RunEvent::TaskStart { id, .. } = event {
                    println!("## {id}\n");
                }
            });
            bus.on(EventKind::TaskEnd, |event| {
                if let RunEvent::TaskEnd { id: _, result } = event {
                    let status = if result.success { "ok" } else { "failed" };
                    let stdout = result.stdout.as_deref().unwrap_or("");
                    println!("```\n{stdout}```\n\n_status: {status}_\n");
                }
            });
        }
    }
}
