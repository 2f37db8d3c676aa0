use std::process::ExitCode;

use clap::Parser;

use mdrun::cli::{Cli, Commands, VerboseMode, VisualizeMode};
use mdrun::config::MdrunConfig;
use mdrun::directive::Issue;
use mdrun::error::MdrunError;
use mdrun::plan::{self, ExecutionPlan};
use mdrun::runner::{self, LoadedRunbooks, RunOptions};
use mdrun::{logging, summary, viz};

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("mdrun: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<bool> {
    let config = MdrunConfig::load(cli.command.common())?;
    logging::init(config.log_level.as_deref(), config.log_file.as_deref())?;

    match cli.command {
        Commands::Ls { paths, .. } => {
            let loaded = runner::load_runbooks(&config, &paths)?;
            report_issues(&loaded.issues);
            let rows = runner::task_rows(&loaded.tasks);
            print!("{}", viz::task_table(&rows));
            Ok(true)
        }

        Commands::Run {
            paths,
            verbose,
            summarize,
            visualize,
            ..
        } => {
            let loaded = runner::load_runbooks(&config, &paths)?;
            report_issues(&loaded.issues);
            let execution_plan = plan::execution_plan(&loaded.tasks);

            if let Some(mode) = visualize {
                print!("{}", render_visualization(&execution_plan, mode));
                return Ok(true);
            }

            execute(&config, &loaded, &execution_plan, verbose, summarize)
        }

        Commands::Task {
            task_id,
            paths,
            verbose,
            summarize,
            ..
        } => {
            let loaded = runner::load_runbooks(&config, &paths)?;
            report_issues(&loaded.issues);
            let full_plan = plan::execution_plan(&loaded.tasks);

            if !full_plan.by_id.contains_key(task_id.as_str()) {
                return Err(MdrunError::TaskNotFound {
                    id: task_id,
                    available: full_plan.ids.clone(),
                }
                .into());
            }

            let subplan = full_plan.subplan(&[task_id.as_str()]);
            execute(&config, &loaded, &subplan, verbose, summarize)
        }
    }
}

/// Run a plan with the built-in handler; returns whether every executed
/// task succeeded.
fn execute(
    config: &MdrunConfig,
    loaded: &LoadedRunbooks,
    execution_plan: &ExecutionPlan<'_>,
    verbose: VerboseMode,
    summarize: bool,
) -> anyhow::Result<bool> {
    let options = RunOptions {
        verbose,
        timeout: config.task_timeout(),
        cwd: std::env::current_dir()?,
    };

    let report = runner::run_plan(execution_plan, loaded.registry.clone(), &options);
    let ok = report.all_succeeded();

    if summarize {
        let exit_code = u8::from(!ok);
        let run_summary = summary::build_summary(&report, execution_plan, &loaded.sources, exit_code);
        summary::print_summary(&run_summary);
        if let Some(path) = &config.summary_path {
            summary::write_summary(&run_summary, path);
        }
    }

    if !ok {
        eprintln!(
            "mdrun: {} of {} task(s) failed",
            report.totals.failed, report.totals.tasks
        );
    }
    Ok(ok)
}

fn render_visualization(execution_plan: &ExecutionPlan<'_>, mode: VisualizeMode) -> String {
    match mode {
        VisualizeMode::AsciiTree => viz::ascii_tree(execution_plan),
        VisualizeMode::AsciiWorkflow => viz::ascii_workflow(execution_plan),
        VisualizeMode::AsciiFlowchart => viz::ascii_flowchart(execution_plan),
        VisualizeMode::MermaidJs => viz::mermaid(execution_plan),
    }
}

fn report_issues(issues: &[Issue]) {
    for issue in issues {
        tracing::warn!(
            kind = issue.kind.as_str(),
            disposition = issue.disposition,
            provenance = %issue.provenance.display(),
            start_line = issue.start_line,
            end_line = issue.end_line,
            error = issue.error.as_deref().unwrap_or(""),
            "{}",
            issue.message
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args.iter().copied()).expect("args should parse")
    }

    #[test]
    fn run_fails_when_runbook_missing() {
        let cli = parse(&["mdrun", "run", "/nonexistent/runbook.md"]);
        let err = run(cli).unwrap_err();
        let msg = format!("{err}");
        assert!(
            msg.contains("does not exist"),
            "expected missing-file error, got: {msg}"
        );
    }

    #[test]
    fn task_fails_for_unknown_identity_listing_available() {
        let dir = tempfile::tempdir().unwrap();
        let book = dir.path().join("ops.md");
        fs::write(&book, "```bash build\ntrue\n```\n").unwrap();

        let cli = parse(&["mdrun", "task", "missing", book.to_str().unwrap()]);
        let err = run(cli).unwrap_err();
        let msg = format!("{err}");
        assert!(msg.contains("'missing' not found"), "got: {msg}");
        assert!(msg.contains("build"), "available tasks listed: {msg}");
    }

    #[test]
    fn run_succeeds_for_trivial_runbook() {
        let dir = tempfile::tempdir().unwrap();
        let book = dir.path().join("ops.md");
        fs::write(&book, "```bash hello\necho hi\n```\n").unwrap();

        let cli = parse(&["mdrun", "run", book.to_str().unwrap()]);
        assert!(run(cli).expect("run should not error"));
    }

    #[test]
    fn run_reports_failure_exit_for_failing_task() {
        let dir = tempfile::tempdir().unwrap();
        let book = dir.path().join("ops.md");
        fs::write(&book, "```bash boom\nexit 1\n```\n").unwrap();

        let cli = parse(&["mdrun", "run", book.to_str().unwrap()]);
        assert!(!run(cli).expect("run itself should not error"));
    }

    #[test]
    fn visualize_prints_without_executing() {
        let dir = tempfile::tempdir().unwrap();
        let book = dir.path().join("ops.md");
        // A task that would fail if executed.
        fs::write(&book, "```bash boom --dep other\nexit 1\n```\n```bash other\nexit 1\n```\n").unwrap();

        let cli = parse(&[
            "mdrun",
            "run",
            book.to_str().unwrap(),
            "--visualize",
            "mermaid-js",
        ]);
        assert!(run(cli).expect("visualization never executes tasks"));
    }

    #[test]
    fn ls_lists_tasks_without_running_them() {
        let dir = tempfile::tempdir().unwrap();
        let book = dir.path().join("ops.md");
        fs::write(&book, "```bash never-run\nexit 1\n```\n").unwrap();

        let cli = parse(&["mdrun", "ls", book.to_str().unwrap()]);
        assert!(run(cli).expect("ls should succeed"));
    }
}
