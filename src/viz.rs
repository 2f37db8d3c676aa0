//! Plan visualizations and the `ls` task table.
//!
//! All output is plain UTF-8 text on stdout; color theming and TUI table
//! widgets are deliberately not part of this crate.

use std::collections::HashSet;

use crate::plan::ExecutionPlan;

/// One row of `mdrun ls` output.
#[derive(Debug, Clone)]
pub struct TaskRow {
    pub name: String,
    pub deps: Vec<String>,
    pub flags: Vec<String>,
    pub description: String,
    pub origin: String,
    pub engine: String,
}

/// Render the task table with padded columns.
pub fn task_table(rows: &[TaskRow]) -> String {
    let headers = ["NAME", "DEPS", "FLAGS", "DESCRIPTION", "ORIGIN", "ENGINE"];
    let cells: Vec<[String; 6]> = rows
        .iter()
        .map(|r| {
            [
                r.name.clone(),
                r.deps.join(", "),
                r.flags.join(", "),
                r.description.clone(),
                r.origin.clone(),
                r.engine.clone(),
            ]
        })
        .collect();

    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in &cells {
        for (i, cell) in row.iter().enumerate() {
            widths[i] = widths[i].max(cell.chars().count());
        }
    }

    let mut out = String::new();
    let render_row = |cols: &[&str], out: &mut String| {
        let line: Vec<String> = cols
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{:width$}", c, width = widths[i]))
            .collect();
        out.push_str(line.join("  ").trim_end());
        out.push('\n');
    };

    render_row(&headers, &mut out);
    for row in &cells {
        let cols: Vec<&str> = row.iter().map(String::as_str).collect();
        render_row(&cols, &mut out);
    }
    out
}

/// Per-source outgoing edges with branch glyphs; missing deps render as
/// `─x▶` from the absent name.
pub fn ascii_tree(plan: &ExecutionPlan<'_>) -> String {
    let mut out = String::new();
    for id in &plan.ids {
        let successors = &plan.adjacency[id.as_str()];
        if successors.is_empty() {
            continue;
        }
        out.push_str(id);
        out.push('\n');
        for (i, succ) in successors.iter().enumerate() {
            let glyph = if i + 1 == successors.len() {
                "└─▶"
            } else {
                "├─▶"
            };
            out.push_str(&format!("{glyph} {succ}\n"));
        }
    }

    // Unknown dep names, grouped under the name that does not exist.
    let mut missing_sources: Vec<&str> = plan
        .missing_deps
        .values()
        .flatten()
        .map(String::as_str)
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();
    missing_sources.sort_unstable();
    for source in missing_sources {
        out.push_str(&format!("{source} (missing)\n"));
        let dependents: Vec<&str> = plan
            .missing_deps
            .iter()
            .filter(|(_, deps)| deps.iter().any(|d| d == source))
            .map(|(id, _)| id.as_str())
            .collect();
        for (i, dependent) in dependents.iter().enumerate() {
            let glyph = if i + 1 == dependents.len() {
                "└─x▶"
            } else {
                "├─x▶"
            };
            out.push_str(&format!("{glyph} {dependent}\n"));
        }
    }
    out
}

/// Layered view: one phase heading per Kahn wave with deps / missing /
/// fan-out annotations per task.
pub fn ascii_workflow(plan: &ExecutionPlan<'_>) -> String {
    let mut out = String::new();
    for (n, layer) in plan.layers.iter().enumerate() {
        out.push_str(&format!("== Phase {} (parallel: {}) ==\n", n + 1, layer.len()));
        for id in layer {
            let mut line = id.clone();
            let deps: Vec<&str> = plan
                .edges
                .iter()
                .filter(|(_, task)| task == id)
                .map(|(dep, _)| dep.as_str())
                .collect();
            if !deps.is_empty() {
                line.push_str(&format!("  deps: {}", deps.join(", ")));
            }
            if let Some(missing) = plan.missing_deps.get(id.as_str()) {
                line.push_str(&format!("  missing: {}", missing.join(", ")));
            }
            let fan_out = &plan.adjacency[id.as_str()];
            if !fan_out.is_empty() {
                line.push_str(&format!("  fan-out: {}", fan_out.join(", ")));
            }
            out.push_str(&line);
            out.push('\n');
        }
    }
    if !plan.unresolved.is_empty() {
        out.push_str(&format!("== Unresolved: {} ==\n", plan.unresolved.join(", ")));
    }
    out
}

/// One lane per root; columns are phases, `|` separates parallel cells,
/// `->` separates phases.
pub fn ascii_flowchart(plan: &ExecutionPlan<'_>) -> String {
    let mut out = String::new();
    let Some(roots) = plan.layers.first() else {
        return out;
    };

    for root in roots {
        let mut reachable: HashSet<&str> = HashSet::new();
        let mut stack = vec![root.as_str()];
        while let Some(id) = stack.pop() {
            if !reachable.insert(id) {
                continue;
            }
            if let Some(successors) = plan.adjacency.get(id) {
                stack.extend(successors.iter().map(String::as_str));
            }
        }

        let mut phases: Vec<String> = vec![root.clone()];
        for layer in &plan.layers[1..] {
            let cells: Vec<&str> = layer
                .iter()
                .map(String::as_str)
                .filter(|id| reachable.contains(id))
                .collect();
            if !cells.is_empty() {
                phases.push(cells.join(" | "));
            }
        }
        out.push_str(&phases.join(" -> "));
        out.push('\n');
    }
    out
}

/// Mermaid flowchart; missing deps become dashed edges from the absent name.
pub fn mermaid(plan: &ExecutionPlan<'_>) -> String {
    let mut out = String::from("flowchart TD\n");
    let mut connected: HashSet<&str> = HashSet::new();
    for (dep, task) in &plan.edges {
        out.push_str(&format!("    {dep} --> {task}\n"));
        connected.insert(dep.as_str());
        connected.insert(task.as_str());
    }
    for (task, deps) in &plan.missing_deps {
        for dep in deps {
            out.push_str(&format!("    {dep} -.-> {task}\n"));
            connected.insert(task.as_str());
        }
    }
    for id in &plan.ids {
        if !connected.contains(id.as_str()) {
            out.push_str(&format!("    {id}\n"));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directive::{TaskCell, TaskSpec};
    use crate::fence::{FenceInfo, FenceInfoOptions};
    use crate::notebook::Cell;
    use crate::plan::execution_plan;
    use std::path::PathBuf;

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

    fn diamond() -> Vec<TaskCell> {
        vec![
            task("bash root"),
            task("bash a --dep root"),
            task("bash b --dep root"),
            task("bash leaf --dep a --dep b --dep ghost"),
        ]
    }

    #[test]
    fn tree_shows_branches_and_missing_edges() {
        let tasks = diamond();
        let plan = execution_plan(&tasks);
        let tree = ascii_tree(&plan);

        assert!(tree.contains("root\n├─▶ a\n└─▶ b\n"), "got:\n{tree}");
        assert!(tree.contains("a\n└─▶ leaf\n"));
        assert!(tree.contains("ghost (missing)\n└─x▶ leaf\n"));
    }

    #[test]
    fn workflow_lists_phases_with_annotations() {
        let tasks = diamond();
        let plan = execution_plan(&tasks);
        let wf = ascii_workflow(&plan);

        assert!(wf.contains("== Phase 1 (parallel: 1) =="), "got:\n{wf}");
        assert!(wf.contains("== Phase 2 (parallel: 2) =="));
        assert!(wf.contains("root  fan-out: a, b"));
        assert!(wf.contains("leaf  deps: a, b  missing: ghost"));
    }

    #[test]
    fn workflow_reports_unresolved() {
        let tasks = vec![task("bash a --dep b"), task("bash b --dep a")];
        let plan = execution_plan(&tasks);
        let wf = ascii_workflow(&plan);
        assert!(wf.contains("== Unresolved: a, b =="), "got:\n{wf}");
    }

    #[test]
    fn flowchart_draws_lanes_per_root() {
        let tasks = diamond();
        let plan = execution_plan(&tasks);
        let fc = ascii_flowchart(&plan);
        assert_eq!(fc, "root -> a | b -> leaf\n");
    }

    #[test]
    fn flowchart_separate_roots_get_separate_lanes() {
        let tasks = vec![
            task("bash x"),
            task("bash y"),
            task("bash z --dep y"),
        ];
        let plan = execution_plan(&tasks);
        let fc = ascii_flowchart(&plan);
        assert_eq!(fc, "x\ny -> z\n");
    }

    #[test]
    fn mermaid_lists_edges_and_isolated_nodes() {
        let tasks = vec![
            task("bash a"),
            task("bash b --dep a --dep ghost"),
            task("bash lonely"),
        ];
        let plan = execution_plan(&tasks);
        let mm = mermaid(&plan);

        assert!(mm.starts_with("flowchart TD\n"));
        assert!(mm.contains("    a --> b\n"));
        assert!(mm.contains("    ghost -.-> b\n"));
        assert!(mm.contains("    lonely\n"));
    }

    #[test]
    fn table_pads_columns_and_trims_trailing_space() {
        let rows = vec![
            TaskRow {
                name: "build".to_owned(),
                deps: vec!["lint".to_owned()],
                flags: vec!["interpolate".to_owned()],
                description: "compile it".to_owned(),
                origin: "Runbook.md".to_owned(),
                engine: "shell".to_owned(),
            },
            TaskRow {
                name: "x".to_owned(),
                deps: vec![],
                flags: vec![],
                description: String::new(),
                origin: "Runbook.md".to_owned(),
                engine: "shell".to_owned(),
            },
        ];
        let table = task_table(&rows);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("NAME   DEPS"));
        assert!(lines[1].contains("build  lint  interpolate  compile it"));
        assert!(!lines[2].ends_with(' '), "rows are right-trimmed");
    }
}
