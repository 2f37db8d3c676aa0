//! Template interpolation for `--interpolate` tasks.
//!
//! Rendering runs on `minijinja` over trusted runbook source. The template
//! context exposes `ctx` (task fields), `cell` (fence metadata), `captured`
//! (outputs of earlier capture-enabled tasks), and a `partial(name, locals)`
//! function that renders a registered partial and recursively interpolates
//! its text when the partial allows it.

use std::sync::Arc;

use minijinja::value::Value as MjValue;
use minijinja::{Environment, ErrorKind};
use serde_json::{Map, Value};

use crate::partials::PartialsRegistry;

/// Partial-within-partial rendering is bounded to keep a self-referencing
/// partial from looping forever.
const MAX_PARTIAL_DEPTH: usize = 16;

/// Result of interpolating one task source.
#[derive(Debug, Clone, PartialEq)]
pub enum InterpOutcome {
    /// No `--interpolate` flag, or rendering left the source unchanged.
    Unmodified,
    /// Rendering produced a new source.
    Mutated(String),
    /// Template evaluation failed; the payload is the diagnostic.
    Failed(String),
}

impl InterpOutcome {
    /// The effective source: the mutation if one happened, else the input.
    pub fn effective<'a>(&'a self, original: &'a str) -> &'a str {
        match self {
            InterpOutcome::Mutated(s) => s,
            _ => original,
        }
    }
}

/// Everything a render needs; cheap to clone into the `partial` callable.
#[derive(Clone)]
pub struct RenderData {
    pub registry: Arc<PartialsRegistry>,
    /// Task ctx fields, exposed as `ctx`.
    pub ctx: Value,
    /// Cell metadata, exposed as `cell`.
    pub cell: Value,
    /// Capture map snapshot, exposed as `captured`.
    pub captured: Value,
    /// Extra top-level variables (partial locals during recursion).
    pub locals: Value,
}

impl RenderData {
    pub fn new(registry: Arc<PartialsRegistry>, ctx: Value, cell: Value, captured: Value) -> Self {
        Self {
            registry,
            ctx,
            cell,
            captured,
            locals: Value::Object(Map::new()),
        }
    }

    fn with_locals(&self, locals: Value) -> Self {
        let mut next = self.clone();
        next.locals = locals;
        next
    }

    /// Template context: `ctx` / `cell` / `captured` plus locals on top.
    fn context(&self) -> Value {
        let mut map = Map::new();
        map.insert("ctx".to_owned(), self.ctx.clone());
        map.insert("cell".to_owned(), self.cell.clone());
        map.insert("captured".to_owned(), self.captured.clone());
        if let Some(locals) = self.locals.as_object() {
            for (k, v) in locals {
                map.insert(k.clone(), v.clone());
            }
        }
        Value::Object(map)
    }
}

/// Interpolate `source` when `enabled`; otherwise report it unmodified.
pub fn interpolate(source: &str, enabled: bool, data: &RenderData) -> InterpOutcome {
    if !enabled {
        return InterpOutcome::Unmodified;
    }
    match render(source, data, 0) {
        Ok(rendered) if rendered == source => InterpOutcome::Unmodified,
        Ok(rendered) => InterpOutcome::Mutated(rendered),
        Err(e) => InterpOutcome::Failed(e.to_string()),
    }
}

/// One rendering pass. Each call gets a fresh environment whose `partial`
/// function re-enters `render` at `depth + 1`.
fn render(source: &str, data: &RenderData, depth: usize) -> Result<String, minijinja::Error> {
    let mut env = Environment::new();
    let captured_data = data.clone();
    env.add_function(
        "partial",
        move |name: String, locals: Option<MjValue>| -> Result<MjValue, minijinja::Error> {
            let locals = match locals {
                Some(v) => serde_json::to_value(&v).map_err(|e| {
                    minijinja::Error::new(
                        ErrorKind::InvalidOperation,
                        format!("partial '{name}' locals are not serializable: {e}"),
                    )
                })?,
                None => Value::Object(Map::new()),
            };

            let Some(partial) = captured_data.registry.get(&name) else {
                return Err(minijinja::Error::new(
                    ErrorKind::InvalidOperation,
                    format!("unknown partial '{name}'"),
                ));
            };

            let content = partial.content(&locals);
            if !content.interpolate {
                // Schema diagnostic: surfaced inline, never re-rendered.
                return Ok(MjValue::from(content.text));
            }
            if depth + 1 > MAX_PARTIAL_DEPTH {
                return Err(minijinja::Error::new(
                    ErrorKind::InvalidOperation,
                    format!("partial '{name}' exceeds nesting depth {MAX_PARTIAL_DEPTH}"),
                ));
            }
            let nested = captured_data.with_locals(locals);
            let text = render(&content.text, &nested, depth + 1)?;
            Ok(MjValue::from(text))
        },
    );

    env.render_str(source, data.context())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partials::{DuplicatePolicy, Partial};
    use serde_json::json;

    fn data_with(registry: PartialsRegistry, captured: Value) -> RenderData {
        RenderData::new(
            Arc::new(registry),
            json!({"taskId": "gen", "language": "shell"}),
            json!({"origin": "book.md", "startLine": 3}),
            captured,
        )
    }

    fn empty_data() -> RenderData {
        data_with(PartialsRegistry::new(), json!({}))
    }

    #[test]
    fn disabled_interpolation_is_unmodified() {
        let out = interpolate("echo {{ ctx.taskId }}", false, &empty_data());
        assert_eq!(out, InterpOutcome::Unmodified);
    }

    #[test]
    fn unchanged_render_reports_unmodified() {
        let out = interpolate("echo plain", true, &empty_data());
        assert_eq!(out, InterpOutcome::Unmodified);
    }

    #[test]
    fn ctx_and_cell_fields_render() {
        let out = interpolate(
            "echo {{ ctx.taskId }} from {{ cell.origin }}",
            true,
            &empty_data(),
        );
        assert_eq!(
            out,
            InterpOutcome::Mutated("echo gen from book.md".to_owned())
        );
    }

    #[test]
    fn captured_map_is_indexable() {
        let captured = json!({"gen": {"text": "SELECT 42;\n", "json": null}});
        let out = interpolate(
            "run {{ captured.gen.text }}",
            true,
            &data_with(PartialsRegistry::new(), captured),
        );
        assert_eq!(out, InterpOutcome::Mutated("run SELECT 42;\n".to_owned()));
    }

    #[test]
    fn template_error_is_failed_with_payload() {
        let out = interpolate("{{ 1 / 0 }}", true, &empty_data());
        match out {
            InterpOutcome::Failed(msg) => assert!(!msg.is_empty()),
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[test]
    fn partial_function_renders_registered_partial() {
        let mut reg = PartialsRegistry::new();
        reg.register(
            Partial::new("greeting", "hello {{ name }}"),
            DuplicatePolicy::Overwrite,
        )
        .unwrap();
        let out = interpolate(
            "say: {{ partial('greeting', {'name': 'ada'}) }}",
            true,
            &data_with(reg, json!({})),
        );
        assert_eq!(out, InterpOutcome::Mutated("say: hello ada".to_owned()));
    }

    #[test]
    fn partial_recursion_interpolates_nested_partials() {
        let mut reg = PartialsRegistry::new();
        reg.register(
            Partial::new("outer", "[{{ partial('inner') }}]"),
            DuplicatePolicy::Overwrite,
        )
        .unwrap();
        reg.register(
            Partial::new("inner", "ctx={{ ctx.taskId }}"),
            DuplicatePolicy::Overwrite,
        )
        .unwrap();
        let out = interpolate(
            "{{ partial('outer') }}",
            true,
            &data_with(reg, json!({})),
        );
        assert_eq!(out, InterpOutcome::Mutated("[ctx=gen]".to_owned()));
    }

    #[test]
    fn unknown_partial_fails_the_render() {
        let out = interpolate("{{ partial('nope') }}", true, &empty_data());
        match out {
            InterpOutcome::Failed(msg) => assert!(msg.contains("unknown partial 'nope'")),
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[test]
    fn schema_rejected_partial_inlines_diagnostic() {
        let mut reg = PartialsRegistry::new();
        reg.register(
            Partial::new("strict", "ok").with_schema(json!({"n": {"type": "number"}})),
            DuplicatePolicy::Overwrite,
        )
        .unwrap();
        let out = interpolate(
            "{{ partial('strict', {'n': 'not-a-number'}) }}",
            true,
            &data_with(reg, json!({})),
        );
        match out {
            InterpOutcome::Mutated(text) => {
                assert!(text.contains("Invalid arguments passed to partial 'strict'"));
            }
            other => panic!("expected Mutated diagnostic, got {other:?}"),
        }
    }

    #[test]
    fn self_referencing_partial_hits_depth_guard() {
        let mut reg = PartialsRegistry::new();
        reg.register(
            Partial::new("loop", "{{ partial('loop') }}"),
            DuplicatePolicy::Overwrite,
        )
        .unwrap();
        let out = interpolate("{{ partial('loop') }}", true, &data_with(reg, json!({})));
        match out {
            InterpOutcome::Failed(msg) => assert!(msg.contains("nesting depth")),
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[test]
    fn effective_source_selection() {
        let mutated = InterpOutcome::Mutated("new".to_owned());
        assert_eq!(mutated.effective("old"), "new");
        assert_eq!(InterpOutcome::Unmodified.effective("old"), "old");
    }
}
