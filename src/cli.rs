use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

/// mdrun: markdown-driven runbook engine.
///
/// Fenced code blocks annotated with POSIX-style processing instructions
/// become tasks; mdrun plans them as a dependency DAG and executes them
/// serially, capturing outputs into later tasks or the filesystem.
#[derive(Debug, Parser)]
#[command(name = "mdrun", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Options shared by every subcommand.
#[derive(Debug, Default, Args)]
pub struct CommonOpts {
    /// Path to a TOML config file (defaults to ./mdrun.toml when present).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Log filter directive (e.g. `debug` or `mdrun=trace,warn`).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Also write JSON logs to this file (appending).
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Per-task timeout in seconds; 0 disables the timeout.
    #[arg(long)]
    pub timeout: Option<u64>,
}

/// Progress rendering for `run` and `task`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum VerboseMode {
    /// Structured logs only.
    #[default]
    Plain,
    /// Per-task status lines on stdout.
    Rich,
    /// Markdown sections with fenced task output.
    Markdown,
}

/// Plan renderings for `run --visualize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum VisualizeMode {
    AsciiTree,
    AsciiWorkflow,
    AsciiFlowchart,
    MermaidJs,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// List every task found in the given runbooks.
    Ls {
        /// Runbook files; defaults to the configured files, then stdin (`-`).
        paths: Vec<PathBuf>,

        /// Reserved; table output is already colorless.
        #[arg(long)]
        no_color: bool,

        #[command(flatten)]
        common: CommonOpts,
    },

    /// Run one task and its ancestors (the minimal subplan).
    Task {
        /// Identity of the target task.
        task_id: String,

        /// Runbook files; defaults to the configured files, then stdin (`-`).
        paths: Vec<PathBuf>,

        #[arg(long, value_enum, default_value = "plain")]
        verbose: VerboseMode,

        /// Print a JSON run summary when the run finishes.
        #[arg(long)]
        summarize: bool,

        #[command(flatten)]
        common: CommonOpts,
    },

    /// Run the full DAG, or print a visualization of the plan.
    ///
    /// File captures (`--capture ./path`) overwrite pre-existing files.
    Run {
        /// Runbook files; defaults to the configured files, then stdin (`-`).
        paths: Vec<PathBuf>,

        #[arg(long, value_enum, default_value = "plain")]
        verbose: VerboseMode,

        /// Print a JSON run summary when the run finishes.
        #[arg(long)]
        summarize: bool,

        /// Print the selected rendering instead of executing.
        #[arg(long, value_enum)]
        visualize: Option<VisualizeMode>,

        #[command(flatten)]
        common: CommonOpts,
    },
}

impl Commands {
    pub fn common(&self) -> &CommonOpts {
        match self {
            Commands::Ls { common, .. }
            | Commands::Task { common, .. }
            | Commands::Run { common, .. } => common,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    #[test]
    fn run_parses_with_paths_and_flags() {
        let cli = Cli::try_parse_from([
            "mdrun",
            "run",
            "ops.md",
            "extra.md",
            "--verbose",
            "rich",
            "--summarize",
        ])
        .expect("should parse");

        match cli.command {
            Commands::Run {
                paths,
                verbose,
                summarize,
                visualize,
                ..
            } => {
                assert_eq!(paths, vec![PathBuf::from("ops.md"), PathBuf::from("extra.md")]);
                assert_eq!(verbose, VerboseMode::Rich);
                assert!(summarize);
                assert!(visualize.is_none());
            }
            other => panic!("expected Run, got {other:?}"),
        }
    }

    #[test]
    fn visualize_modes_parse_kebab_case() {
        for (text, mode) in [
            ("ascii-tree", VisualizeMode::AsciiTree),
            ("ascii-workflow", VisualizeMode::AsciiWorkflow),
            ("ascii-flowchart", VisualizeMode::AsciiFlowchart),
            ("mermaid-js", VisualizeMode::MermaidJs),
        ] {
            let cli = Cli::try_parse_from(["mdrun", "run", "--visualize", text])
                .expect("mode should parse");
            match cli.command {
                Commands::Run { visualize, .. } => assert_eq!(visualize, Some(mode)),
                other => panic!("expected Run, got {other:?}"),
            }
        }
    }

    #[test]
    fn task_requires_an_identity() {
        let err = Cli::try_parse_from(["mdrun", "task"]).expect_err("should fail");
        assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn task_parses_identity_then_paths() {
        let cli = Cli::try_parse_from(["mdrun", "task", "deploy", "ops.md"]).unwrap();
        match cli.command {
            Commands::Task { task_id, paths, .. } => {
                assert_eq!(task_id, "deploy");
                assert_eq!(paths, vec![PathBuf::from("ops.md")]);
            }
            other => panic!("expected Task, got {other:?}"),
        }
    }

    #[test]
    fn ls_accepts_no_color() {
        let cli = Cli::try_parse_from(["mdrun", "ls", "--no-color"]).unwrap();
        match cli.command {
            Commands::Ls { no_color, paths, .. } => {
                assert!(no_color);
                assert!(paths.is_empty());
            }
            other => panic!("expected Ls, got {other:?}"),
        }
    }

    #[test]
    fn invalid_verbose_mode_rejected() {
        let err = Cli::try_parse_from(["mdrun", "run", "--verbose", "loud"])
            .expect_err("should reject unknown mode");
        assert_eq!(err.kind(), ErrorKind::InvalidValue);
    }

    #[test]
    fn no_subcommand_shows_help_error() {
        let err = Cli::try_parse_from(["mdrun"]).expect_err("should fail");
        assert_eq!(
            err.kind(),
            ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
        );
    }

    #[test]
    fn common_opts_reachable_from_any_subcommand() {
        let cli = Cli::try_parse_from(["mdrun", "ls", "--timeout", "30"]).unwrap();
        assert_eq!(cli.command.common().timeout, Some(30));
    }
}
