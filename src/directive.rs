//! Directive classification: each fenced cell is examined by an ordered
//! chain of inspectors until one claims it as a TASK, CONTENT, or PARTIAL
//! directive. Unclaimed cells fall through to the pipeline's unknown hook.

use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::fence::{FenceInfo, FenceInfoOptions};
use crate::notebook::Cell;
use crate::partials::{InjectMode, Injectable, Partial};

/// Reserved first bare word marking a partial fence.
const PARTIAL_KEYWORD: &str = "partial";

/// Diagnostic attached to a fence that could not be admitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Issue {
    pub kind: IssueKind,
    /// Issues are always error-disposition today; warnings would be a new
    /// value here, not a new list.
    pub disposition: &'static str,
    pub provenance: PathBuf,
    pub start_line: usize,
    pub end_line: usize,
    pub message: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueKind {
    FenceIssue,
    FrontmatterParse,
}

impl IssueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueKind::FenceIssue => "fence-issue",
            IssueKind::FrontmatterParse => "frontmatter-parse",
        }
    }
}

impl Issue {
    pub fn fence(cell: &Cell, origin: &Path, message: impl Into<String>) -> Self {
        Self {
            kind: IssueKind::FenceIssue,
            disposition: "error",
            provenance: origin.to_path_buf(),
            start_line: cell.start_line,
            end_line: cell.end_line,
            message: message.into(),
            error: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// A task- or content-producing fence.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSpec {
    pub identity: String,
    pub language: String,
    pub source: String,
    /// Explicit `--dep` names as authored, in order.
    pub deps: Vec<String>,
}

/// The classified meaning of a fence.
#[derive(Debug)]
pub enum Directive {
    Task(TaskSpec),
    Content(TaskSpec),
    Partial(PartialDirective),
}

/// A partial fence resolves to either a plain partial or an injectable.
#[derive(Debug)]
pub enum PartialDirective {
    Plain(Partial),
    Injectable(Injectable),
}

/// A schedulable cell: the fence plus its parsed info and task spec.
#[derive(Debug, Clone)]
pub struct TaskCell {
    pub cell: Cell,
    pub info: FenceInfo,
    pub spec: TaskSpec,
    pub origin: PathBuf,
    /// CONTENT directives interpolate but are not spawned.
    pub is_content: bool,
}

impl TaskCell {
    pub fn task_id(&self) -> &str {
        &self.spec.identity
    }

    pub fn explicit_deps(&self) -> &[String] {
        &self.spec.deps
    }
}

/// A recognizer over the capability set {examine cell, emit directive,
/// register issue}. Returning `None` passes the cell to the next inspector.
pub trait Inspector {
    fn name(&self) -> &'static str;

    fn inspect(
        &self,
        cell: &Cell,
        info: &FenceInfo,
        origin: &Path,
        issues: &mut Vec<Issue>,
    ) -> Option<Directive>;
}

/// A spawnable language and the fence aliases that select it.
#[derive(Debug, Clone)]
pub struct LangSpec {
    pub name: String,
    pub aliases: Vec<String>,
}

impl LangSpec {
    pub fn shell() -> Self {
        Self {
            name: "shell".to_owned(),
            aliases: vec![
                "shell".to_owned(),
                "sh".to_owned(),
                "bash".to_owned(),
                "zsh".to_owned(),
            ],
        }
    }

    fn matches(&self, lang: &str) -> bool {
        self.aliases.iter().any(|a| a == lang)
    }
}

/// Claims `PARTIAL` fences and registers their partial or injectable.
pub struct PartialInspector;

impl Inspector for PartialInspector {
    fn name(&self) -> &'static str {
        "partial"
    }

    fn inspect(
        &self,
        cell: &Cell,
        info: &FenceInfo,
        origin: &Path,
        issues: &mut Vec<Issue>,
    ) -> Option<Directive> {
        let first = info.first_bare_word()?;
        if !first.eq_ignore_ascii_case(PARTIAL_KEYWORD) {
            return None;
        }

        let Some(identity) = info.bare_word(1).filter(|s| !s.is_empty()) else {
            issues.push(Issue::fence(
                cell,
                origin,
                "partial fence is missing an identity",
            ));
            return None;
        };

        let mut partial = Partial::new(identity, cell.body.clone());
        if let Some(attrs) = &info.attrs {
            if attrs.as_object().is_some_and(|o| !o.is_empty()) {
                partial = partial.with_schema(attrs.clone());
            }
        }

        let globs = flag_string_values(info, &["inject"]);
        if globs.is_empty() {
            return Some(Directive::Partial(PartialDirective::Plain(partial)));
        }

        let mode = inject_mode(info);
        match Injectable::new(partial, &globs, mode) {
            Ok(injectable) => Some(Directive::Partial(PartialDirective::Injectable(injectable))),
            Err(e) => {
                issues.push(
                    Issue::fence(cell, origin, "invalid injectable partial").with_error(e),
                );
                None
            }
        }
    }
}

/// Claims fences whose language is in the spawnable allow-list.
pub struct SpawnableInspector {
    pub langs: Vec<LangSpec>,
}

impl SpawnableInspector {
    pub fn with_default_langs() -> Self {
        Self {
            langs: vec![LangSpec::shell()],
        }
    }
}

impl Inspector for SpawnableInspector {
    fn name(&self) -> &'static str {
        "spawnable"
    }

    fn inspect(
        &self,
        cell: &Cell,
        info: &FenceInfo,
        _origin: &Path,
        _issues: &mut Vec<Issue>,
    ) -> Option<Directive> {
        let lang = cell.lang.as_deref()?;
        let spec = self.langs.iter().find(|l| l.matches(lang))?;
        let identity = info.first_bare_word()?;
        if identity.eq_ignore_ascii_case(PARTIAL_KEYWORD) {
            return None;
        }
        Some(Directive::Task(TaskSpec {
            identity: identity.to_owned(),
            language: spec.name.clone(),
            source: cell.body.clone(),
            deps: flag_string_values(info, &["dep"]),
        }))
    }
}

/// Opt-in catch-all: any named fence becomes a CONTENT directive.
pub struct AnyNamedContentInspector;

impl Inspector for AnyNamedContentInspector {
    fn name(&self) -> &'static str {
        "any-named-content"
    }

    fn inspect(
        &self,
        cell: &Cell,
        info: &FenceInfo,
        _origin: &Path,
        _issues: &mut Vec<Issue>,
    ) -> Option<Directive> {
        let identity = info.first_bare_word()?;
        if identity.eq_ignore_ascii_case(PARTIAL_KEYWORD) {
            return None;
        }
        Some(Directive::Content(TaskSpec {
            identity: identity.to_owned(),
            language: cell.lang.clone().unwrap_or_default(),
            source: cell.body.clone(),
            deps: flag_string_values(info, &["dep"]),
        }))
    }
}

/// Ordered inspector chain; the first non-`None` return claims the cell.
pub struct InspectorPipeline {
    inspectors: Vec<Box<dyn Inspector>>,
    pub fence_options: FenceInfoOptions,
}

impl InspectorPipeline {
    /// Build a pipeline from an explicit inspector chain.
    pub fn new(inspectors: Vec<Box<dyn Inspector>>, fence_options: FenceInfoOptions) -> Self {
        Self {
            inspectors,
            fence_options,
        }
    }

    /// Default chain: partial, then spawnable.
    pub fn standard(fence_options: FenceInfoOptions) -> Self {
        Self::new(
            vec![
                Box::new(PartialInspector),
                Box::new(SpawnableInspector::with_default_langs()),
            ],
            fence_options,
        )
    }

    /// Default chain plus the any-named-content catch-all.
    pub fn with_content_catch_all(fence_options: FenceInfoOptions) -> Self {
        let mut pipeline = Self::standard(fence_options);
        pipeline.push(Box::new(AnyNamedContentInspector));
        pipeline
    }

    pub fn push(&mut self, inspector: Box<dyn Inspector>) {
        self.inspectors.push(inspector);
    }

    /// Run the chain over one cell. `Err` carries the parsed info of an
    /// unclaimed cell so the caller's unknown hook can examine it.
    pub fn inspect(
        &self,
        cell: &Cell,
        origin: &Path,
        issues: &mut Vec<Issue>,
    ) -> Result<(FenceInfo, Option<Directive>), crate::error::MdrunError> {
        let info = FenceInfo::parse(&cell.info, &self.fence_options)?;
        for inspector in &self.inspectors {
            if let Some(directive) = inspector.inspect(cell, &info, origin, issues) {
                return Ok((info, Some(directive)));
            }
        }
        Ok((info, None))
    }
}

/// Flatten a flag's occurrences into strings; array values contribute each
/// element, booleans contribute nothing.
fn flag_string_values(info: &FenceInfo, names: &[&str]) -> Vec<String> {
    let mut out = Vec::new();
    for value in info.flag_values(names) {
        match value {
            Value::String(s) => out.push(s.clone()),
            Value::Number(n) => out.push(n.to_string()),
            Value::Array(items) => {
                out.extend(items.iter().filter_map(|v| v.as_str().map(str::to_owned)));
            }
            _ => {}
        }
    }
    out
}

fn inject_mode(info: &FenceInfo) -> InjectMode {
    let append = info.is_enabled(&["append"]);
    let prepend = info.is_enabled(&["prepend"]);
    if info.is_enabled(&["both"]) || (append && prepend) {
        InjectMode::Both
    } else if append {
        InjectMode::Append
    } else {
        InjectMode::Prepend
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cell(lang: &str, info: &str, body: &str) -> Cell {
        Cell {
            lang: if lang.is_empty() {
                None
            } else {
                Some(lang.to_owned())
            },
            info: info.to_owned(),
            body: body.to_owned(),
            start_line: 1,
            end_line: 3,
        }
    }

    fn inspect(pipeline: &InspectorPipeline, c: &Cell) -> (Option<Directive>, Vec<Issue>) {
        let mut issues = Vec::new();
        let (_, directive) = pipeline
            .inspect(c, Path::new("book.md"), &mut issues)
            .unwrap();
        (directive, issues)
    }

    #[test]
    fn shell_fence_with_identity_becomes_task() {
        let pipeline = InspectorPipeline::standard(FenceInfoOptions::default());
        let c = cell("bash", "bash build --dep lint --dep fmt", "make all\n");
        let (directive, issues) = inspect(&pipeline, &c);
        assert!(issues.is_empty());
        match directive {
            Some(Directive::Task(spec)) => {
                assert_eq!(spec.identity, "build");
                assert_eq!(spec.language, "shell");
                assert_eq!(spec.deps, vec!["lint", "fmt"]);
                assert_eq!(spec.source, "make all\n");
            }
            other => panic!("expected Task, got {other:?}"),
        }
    }

    #[test]
    fn sh_alias_maps_to_canonical_shell() {
        let pipeline = InspectorPipeline::standard(FenceInfoOptions::default());
        let (directive, _) = inspect(&pipeline, &cell("sh", "sh lint", "x\n"));
        match directive {
            Some(Directive::Task(spec)) => assert_eq!(spec.language, "shell"),
            other => panic!("expected Task, got {other:?}"),
        }
    }

    #[test]
    fn unnamed_shell_fence_is_unclaimed() {
        let pipeline = InspectorPipeline::standard(FenceInfoOptions::default());
        let (directive, issues) = inspect(&pipeline, &cell("bash", "bash", "x\n"));
        assert!(directive.is_none());
        assert!(issues.is_empty());
    }

    #[test]
    fn non_spawnable_lang_is_unclaimed_without_catch_all() {
        let pipeline = InspectorPipeline::standard(FenceInfoOptions::default());
        let (directive, _) = inspect(&pipeline, &cell("sql", "sql report", "SELECT 1;\n"));
        assert!(directive.is_none());
    }

    #[test]
    fn catch_all_claims_named_content() {
        let pipeline = InspectorPipeline::with_content_catch_all(FenceInfoOptions::default());
        let (directive, _) = inspect(&pipeline, &cell("sql", "sql report --dep gen", "SELECT 1;\n"));
        match directive {
            Some(Directive::Content(spec)) => {
                assert_eq!(spec.identity, "report");
                assert_eq!(spec.language, "sql");
                assert_eq!(spec.deps, vec!["gen"]);
            }
            other => panic!("expected Content, got {other:?}"),
        }
    }

    #[test]
    fn partial_fence_claimed_case_insensitively() {
        let pipeline = InspectorPipeline::standard(FenceInfoOptions::default());
        let (directive, issues) = inspect(&pipeline, &cell("sql", "sql Partial ftr", "-- footer\n"));
        assert!(issues.is_empty());
        match directive {
            Some(Directive::Partial(PartialDirective::Plain(p))) => {
                assert_eq!(p.identity, "ftr");
                assert_eq!(p.body, "-- footer\n");
            }
            other => panic!("expected Plain partial, got {other:?}"),
        }
    }

    #[test]
    fn partial_with_inject_becomes_injectable() {
        let pipeline = InspectorPipeline::standard(FenceInfoOptions::default());
        let c = cell("sql", "sql PARTIAL ftr --inject **/*.sql --append", "-- footer\n");
        let (directive, issues) = inspect(&pipeline, &c);
        assert!(issues.is_empty());
        match directive {
            Some(Directive::Partial(PartialDirective::Injectable(inj))) => {
                assert_eq!(inj.partial.identity, "ftr");
                assert_eq!(inj.mode, InjectMode::Append);
            }
            other => panic!("expected Injectable, got {other:?}"),
        }
    }

    #[test]
    fn partial_attrs_become_args_schema() {
        let pipeline = InspectorPipeline::standard(FenceInfoOptions::default());
        let c = cell(
            "sql",
            "sql PARTIAL hdr { env: { type: 'string' } }",
            "-- {{ env }}\n",
        );
        let (directive, _) = inspect(&pipeline, &c);
        match directive {
            Some(Directive::Partial(PartialDirective::Plain(p))) => {
                assert!(p.args_schema.is_some());
            }
            other => panic!("expected Plain partial, got {other:?}"),
        }
    }

    #[test]
    fn partial_without_identity_registers_issue() {
        let pipeline = InspectorPipeline::standard(FenceInfoOptions::default());
        let (directive, issues) = inspect(&pipeline, &cell("sql", "sql PARTIAL", "x\n"));
        assert!(directive.is_none());
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].kind, IssueKind::FenceIssue);
        assert_eq!(issues[0].start_line, 1);
        assert!(issues[0].message.contains("missing an identity"));
    }

    #[test]
    fn spawnable_never_claims_reserved_partial_identity() {
        // A PARTIAL fence in a shell language must not fall through into a
        // task named "PARTIAL" even when partial validation fails.
        let pipeline = InspectorPipeline::standard(FenceInfoOptions::default());
        let (directive, issues) = inspect(&pipeline, &cell("bash", "bash PARTIAL", "x\n"));
        assert!(directive.is_none());
        assert_eq!(issues.len(), 1);
    }

    #[test]
    fn inject_mode_resolution() {
        let parse = |s: &str| FenceInfo::parse(s, &FenceInfoOptions::default()).unwrap();
        assert_eq!(inject_mode(&parse("x PARTIAL p --inject a")), InjectMode::Prepend);
        assert_eq!(
            inject_mode(&parse("x PARTIAL p --inject a --append")),
            InjectMode::Append
        );
        assert_eq!(
            inject_mode(&parse("x PARTIAL p --inject a --both")),
            InjectMode::Both
        );
        assert_eq!(
            inject_mode(&parse("x PARTIAL p --inject a --append --prepend")),
            InjectMode::Both
        );
    }
}
