//! DAG planning: a task list becomes a deterministic scheduling artifact.
//!
//! Planning never fails on user data. Cycles and unmet chains surface as
//! the `unresolved` residue of Kahn's algorithm, unknown dependency names
//! land in `missing_deps`, and implicit-dep patterns that do not compile
//! are recorded and skipped.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;
use regex::Regex;
use serde_json::Value;
use tracing::warn;

use crate::directive::TaskCell;

/// An `--injected-dep` pattern that failed to compile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegexIssue {
    pub task_id: String,
    pub pattern: String,
}

/// Resolves a task's effective dependencies: implicit matches first, then
/// explicit `--dep` names, first occurrence kept, self-references dropped.
/// Results are cached per requesting identity.
pub struct DepResolver {
    matchers: Vec<InjectedMatcher>,
    pub regex_errors: Vec<RegexIssue>,
    cache: RefCell<HashMap<String, Vec<String>>>,
}

struct InjectedMatcher {
    owner: String,
    patterns: Vec<Regex>,
}

impl DepResolver {
    /// Compile every task's `--injected-dep` / `--implicit-dep` patterns.
    /// The two flag names are synonyms; patterns merge in declaration order.
    pub fn new(tasks: &[TaskCell]) -> Self {
        let mut matchers = Vec::new();
        let mut regex_errors = Vec::new();

        for task in tasks {
            let values = task.info.flag_values(&["injected-dep", "implicit-dep"]);
            if values.is_empty() {
                continue;
            }
            let mut patterns = Vec::new();
            for source in values.iter().flat_map(|v| normalize_pattern(v)) {
                match Regex::new(&source) {
                    Ok(re) => patterns.push(re),
                    Err(_) => regex_errors.push(RegexIssue {
                        task_id: task.task_id().to_owned(),
                        pattern: source,
                    }),
                }
            }
            if !patterns.is_empty() {
                matchers.push(InjectedMatcher {
                    owner: task.task_id().to_owned(),
                    patterns,
                });
            }
        }

        Self {
            matchers,
            regex_errors,
            cache: RefCell::new(HashMap::new()),
        }
    }

    /// Effective deps for `task`: injected first, then explicit, deduped.
    pub fn deps_for(&self, task: &TaskCell) -> Vec<String> {
        let id = task.task_id();
        if let Some(cached) = self.cache.borrow().get(id) {
            return cached.clone();
        }

        let mut deps: Vec<String> = Vec::new();
        let mut seen: HashSet<&str> = HashSet::new();

        for matcher in &self.matchers {
            if matcher.owner == id {
                continue;
            }
            if matcher.patterns.iter().any(|re| re.is_match(id))
                && seen.insert(matcher.owner.as_str())
            {
                deps.push(matcher.owner.clone());
            }
        }
        for dep in task.explicit_deps() {
            if dep != id && seen.insert(dep.as_str()) {
                deps.push(dep.clone());
            }
        }

        self.cache.borrow_mut().insert(id.to_owned(), deps.clone());
        deps
    }
}

/// Normalize one flag occurrence into regex sources: `true` and `"*"` mean
/// match-everything, arrays contribute each element.
fn normalize_pattern(value: &Value) -> Vec<String> {
    fn translate(s: &str) -> String {
        if s == "*" { ".*".to_owned() } else { s.to_owned() }
    }
    match value {
        Value::Bool(true) => vec![".*".to_owned()],
        Value::String(s) => vec![translate(s)],
        Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str().map(translate))
            .collect(),
        _ => Vec::new(),
    }
}

/// The deterministic scheduling artifact derived from a task list.
///
/// `dag ∪ unresolved` partitions `ids`; `indegree` is a snapshot that the
/// executor never mutates.
#[derive(Debug)]
pub struct ExecutionPlan<'a> {
    /// Task ids in definition order.
    pub ids: Vec<String>,
    /// Id → task, definition order preserved. Tasks are borrowed, not copied.
    pub by_id: IndexMap<String, &'a TaskCell>,
    /// Dep → task pairs in definition-stable order; missing deps excluded.
    pub edges: Vec<(String, String)>,
    /// Id → successor ids.
    pub adjacency: IndexMap<String, Vec<String>>,
    /// Snapshot of incoming-edge counts.
    pub indegree: IndexMap<String, usize>,
    /// Task id → dep names absent from the task set.
    pub missing_deps: IndexMap<String, Vec<String>>,
    /// Kahn waves; within a wave, definition rank order.
    pub layers: Vec<Vec<String>>,
    /// Concatenation of all waves: the topological order.
    pub dag: Vec<String>,
    /// Ids never emitted by Kahn (cycle or unmet chain), definition order.
    pub unresolved: Vec<String>,
    /// Implicit-dep patterns that failed to compile.
    pub regex_errors: Vec<RegexIssue>,
}

/// Compute the full plan for a task list.
pub fn execution_plan(tasks: &[TaskCell]) -> ExecutionPlan<'_> {
    let resolver = DepResolver::new(tasks);
    plan_with_resolver(tasks, &resolver)
}

fn plan_with_resolver<'a>(tasks: &'a [TaskCell], resolver: &DepResolver) -> ExecutionPlan<'a> {
    let mut by_id: IndexMap<String, &TaskCell> = IndexMap::new();
    for task in tasks {
        if by_id.contains_key(task.task_id()) {
            warn!(task_id = task.task_id(), "duplicate task id; keeping the first definition");
            continue;
        }
        by_id.insert(task.task_id().to_owned(), task);
    }
    let ids: Vec<String> = by_id.keys().cloned().collect();

    let mut edges: Vec<(String, String)> = Vec::new();
    let mut adjacency: IndexMap<String, Vec<String>> =
        ids.iter().map(|id| (id.clone(), Vec::new())).collect();
    let mut indegree: IndexMap<String, usize> = ids.iter().map(|id| (id.clone(), 0)).collect();
    let mut missing_deps: IndexMap<String, Vec<String>> = IndexMap::new();

    for id in &ids {
        let task = by_id[id.as_str()];
        for dep in resolver.deps_for(task) {
            if by_id.contains_key(dep.as_str()) {
                edges.push((dep.clone(), id.clone()));
                adjacency[dep.as_str()].push(id.clone());
                indegree[id.as_str()] += 1;
            } else {
                missing_deps.entry(id.clone()).or_default().push(dep);
            }
        }
    }

    let (layers, dag, unresolved) = kahn_layers(&ids, &adjacency, &indegree);

    ExecutionPlan {
        ids,
        by_id,
        edges,
        adjacency,
        indegree,
        missing_deps,
        layers,
        dag,
        unresolved,
        regex_errors: resolver.regex_errors.clone(),
    }
}

/// Layered Kahn over a copy of the indegree snapshot. Each wave takes all
/// currently-zero ids in definition rank order.
fn kahn_layers(
    ids: &[String],
    adjacency: &IndexMap<String, Vec<String>>,
    indegree: &IndexMap<String, usize>,
) -> (Vec<Vec<String>>, Vec<String>, Vec<String>) {
    let mut remaining: IndexMap<&str, usize> =
        indegree.iter().map(|(k, v)| (k.as_str(), *v)).collect();
    let mut emitted: HashSet<&str> = HashSet::new();
    let mut layers: Vec<Vec<String>> = Vec::new();

    loop {
        let wave: Vec<&str> = ids
            .iter()
            .map(String::as_str)
            .filter(|id| !emitted.contains(id) && remaining[id] == 0)
            .collect();
        if wave.is_empty() {
            break;
        }
        for id in &wave {
            emitted.insert(id);
            if let Some(successors) = adjacency.get(*id) {
                for succ in successors {
                    *remaining.get_mut(succ.as_str()).expect("successor is a known id") -= 1;
                }
            }
        }
        layers.push(wave.iter().map(|s| (*s).to_owned()).collect());
    }

    let dag: Vec<String> = layers.iter().flatten().cloned().collect();
    let unresolved: Vec<String> = ids
        .iter()
        .filter(|id| !emitted.contains(id.as_str()))
        .cloned()
        .collect();
    (layers, dag, unresolved)
}

impl<'a> ExecutionPlan<'a> {
    /// Restrict the plan to `targets` and their ancestor closure, then
    /// re-run Kahn on the restricted snapshot.
    pub fn subplan(&self, targets: &[&str]) -> ExecutionPlan<'a> {
        let mut incoming: HashMap<&str, Vec<&str>> = HashMap::new();
        for (dep, task) in &self.edges {
            incoming.entry(task.as_str()).or_default().push(dep.as_str());
        }

        let mut keep: HashSet<&str> = HashSet::new();
        let mut stack: Vec<&str> = targets
            .iter()
            .copied()
            .filter(|t| self.by_id.contains_key(*t))
            .collect();
        while let Some(id) = stack.pop() {
            if !keep.insert(id) {
                continue;
            }
            if let Some(deps) = incoming.get(id) {
                stack.extend(deps.iter().copied());
            }
        }

        let ids: Vec<String> = self
            .ids
            .iter()
            .filter(|id| keep.contains(id.as_str()))
            .cloned()
            .collect();
        let by_id: IndexMap<String, &TaskCell> = ids
            .iter()
            .map(|id| (id.clone(), self.by_id[id.as_str()]))
            .collect();
        let edges: Vec<(String, String)> = self
            .edges
            .iter()
            .filter(|(dep, task)| keep.contains(dep.as_str()) && keep.contains(task.as_str()))
            .cloned()
            .collect();

        let mut adjacency: IndexMap<String, Vec<String>> =
            ids.iter().map(|id| (id.clone(), Vec::new())).collect();
        let mut indegree: IndexMap<String, usize> = ids.iter().map(|id| (id.clone(), 0)).collect();
        for (dep, task) in &edges {
            adjacency[dep.as_str()].push(task.clone());
            indegree[task.as_str()] += 1;
        }

        let missing_deps: IndexMap<String, Vec<String>> = self
            .missing_deps
            .iter()
            .filter(|(id, _)| keep.contains(id.as_str()))
            .map(|(id, deps)| (id.clone(), deps.clone()))
            .collect();

        let (layers, dag, unresolved) = kahn_layers(&ids, &adjacency, &indegree);

        ExecutionPlan {
            ids,
            by_id,
            edges,
            adjacency,
            indegree,
            missing_deps,
            layers,
            dag,
            unresolved,
            regex_errors: self.regex_errors.clone(),
        }
    }

    /// Ready-queue seed: indegree-zero ids in definition rank order.
    pub fn initial_ready(&self) -> Vec<String> {
        self.ids
            .iter()
            .filter(|id| self.indegree[id.as_str()] == 0)
            .cloned()
            .collect()
    }
}
