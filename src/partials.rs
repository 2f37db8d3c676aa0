//! Partials: reusable content fragments and glob-matched injectables.
//!
//! A partial is registered from a `PARTIAL` fence and later rendered with
//! locals; an injectable is a partial that additionally wraps the content
//! of files whose path matches one of its globs (prepend, append, or
//! both). The registry is populated during parsing and read-only during
//! execution.

use globset::{GlobBuilder, GlobMatcher};
use indexmap::IndexMap;
use serde_json::{Map, Value};

use crate::error::MdrunError;

/// Duplicate-identity handling for [`PartialsRegistry::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicatePolicy {
    #[default]
    Overwrite,
    Ignore,
    Error,
}

impl DuplicatePolicy {
    pub fn parse(value: &str) -> Result<Self, MdrunError> {
        match value {
            "overwrite" => Ok(Self::Overwrite),
            "ignore" => Ok(Self::Ignore),
            "error" => Ok(Self::Error),
            _ => Err(MdrunError::InvalidDuplicatePolicy {
                value: value.to_owned(),
            }),
        }
    }
}

/// How an injectable's wrapper text is merged around matched content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectMode {
    Prepend,
    Append,
    Both,
}

/// Result of rendering a partial's content against locals.
#[derive(Debug, Clone, PartialEq)]
pub struct PartialContent {
    pub text: String,
    /// False when the locals failed the partial's schema; the text is then
    /// a diagnostic and must not be fed to the interpolator.
    pub interpolate: bool,
    pub locals: Value,
}

/// A reusable content fragment keyed by identity.
#[derive(Debug, Clone)]
pub struct Partial {
    pub identity: String,
    /// Argument schema spec: `{key: {type: "string" | "number" | ...}}`.
    pub args_schema: Option<Value>,
    /// Fence body captured at registration.
    pub body: String,
}

impl Partial {
    pub fn new(identity: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            args_schema: None,
            body: body.into(),
        }
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.args_schema = Some(schema);
        self
    }

    /// Render this partial against `locals`: validate the schema first,
    /// then hand back the body for (optional) downstream interpolation.
    pub fn content(&self, locals: &Value) -> PartialContent {
        if let Some(schema) = &self.args_schema {
            if let Err(diagnostic) = validate_locals(schema, locals) {
                return PartialContent {
                    text: format!(
                        "Invalid arguments passed to partial '{}': {diagnostic}",
                        self.identity
                    ),
                    interpolate: false,
                    locals: locals.clone(),
                };
            }
        }
        PartialContent {
            text: self.body.clone(),
            interpolate: true,
            locals: locals.clone(),
        }
    }
}

/// A partial that wraps files matching its globs.
#[derive(Debug, Clone)]
pub struct Injectable {
    pub partial: Partial,
    pub mode: InjectMode,
    globs: Vec<CompiledGlob>,
}

#[derive(Debug, Clone)]
struct CompiledGlob {
    pattern: String,
    wildcards: usize,
    matcher: GlobMatcher,
}

impl Injectable {
    /// Compile the glob list. An invalid pattern or an empty list rejects
    /// the injectable; the caller records the issue against the fence.
    pub fn new(partial: Partial, globs: &[String], mode: InjectMode) -> Result<Self, String> {
        let mut compiled = Vec::new();
        for pattern in globs {
            match GlobBuilder::new(pattern).literal_separator(true).build() {
                Ok(glob) => compiled.push(CompiledGlob {
                    pattern: pattern.clone(),
                    wildcards: count_wildcards(pattern),
                    matcher: glob.compile_matcher(),
                }),
                Err(e) => {
                    return Err(format!("invalid glob '{pattern}': {e}"));
                }
            }
        }
        if compiled.is_empty() {
            return Err(format!(
                "injectable '{}' needs at least one glob",
                partial.identity
            ));
        }
        Ok(Self {
            partial,
            mode,
            globs: compiled,
        })
    }

    /// Best specificity rank among the globs matching `path`:
    /// `(wildcard count asc, pattern length desc)`.
    fn match_rank(&self, path: &str) -> Option<(usize, usize)> {
        self.globs
            .iter()
            .filter(|g| g.matcher.is_match(path))
            .map(|g| (g.wildcards, usize::MAX - g.pattern.len()))
            .min()
    }
}

/// Content flowing through [`PartialsRegistry::compose`].
#[derive(Debug, Clone, PartialEq)]
pub struct Composition {
    pub content: String,
    pub interpolate: bool,
    pub locals: Value,
}

/// Owns every registered partial and injectable for a run.
#[derive(Debug, Default)]
pub struct PartialsRegistry {
    partials: IndexMap<String, Partial>,
    injectables: IndexMap<String, Injectable>,
}

impl PartialsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.partials.is_empty() && self.injectables.is_empty()
    }

    pub fn register(
        &mut self,
        partial: Partial,
        on_duplicate: DuplicatePolicy,
    ) -> Result<(), MdrunError> {
        if self.partials.contains_key(&partial.identity) {
            match on_duplicate {
                DuplicatePolicy::Ignore => return Ok(()),
                DuplicatePolicy::Error => {
                    return Err(MdrunError::DuplicatePartial {
                        identity: partial.identity,
                    });
                }
                DuplicatePolicy::Overwrite => {}
            }
        }
        self.partials.insert(partial.identity.clone(), partial);
        Ok(())
    }

    pub fn register_injectable(
        &mut self,
        injectable: Injectable,
        on_duplicate: DuplicatePolicy,
    ) -> Result<(), MdrunError> {
        let identity = injectable.partial.identity.clone();
        if self.injectables.contains_key(&identity) {
            match on_duplicate {
                DuplicatePolicy::Ignore => return Ok(()),
                DuplicatePolicy::Error => {
                    return Err(MdrunError::DuplicatePartial { identity });
                }
                DuplicatePolicy::Overwrite => {}
            }
        }
        self.injectables.insert(identity, injectable);
        Ok(())
    }

    pub fn get(&self, identity: &str) -> Option<&Partial> {
        self.partials.get(identity)
    }

    /// The most specific injectable matching `path`: fewest wildcards
    /// (`**` counts 2, `*`/`?` count 1), then longest pattern, then
    /// registration order.
    pub fn find_injectable_for_path(&self, path: &str) -> Option<&Injectable> {
        self.injectables
            .values()
            .enumerate()
            .filter_map(|(i, inj)| inj.match_rank(path).map(|rank| (rank, i, inj)))
            .min_by_key(|(rank, i, _)| (*rank, *i))
            .map(|(_, _, inj)| inj)
    }

    /// Wrap `input` with the matching injectable for `path`, if any.
    ///
    /// A wrapper whose locals fail its schema replaces the content with
    /// the diagnostic and disables downstream interpolation, preserving
    /// the original locals.
    pub fn compose(&self, input: Composition, path: &str) -> Composition {
        let Some(injectable) = self.find_injectable_for_path(path) else {
            return input;
        };

        let wrapper = injectable.partial.content(&input.locals);
        if !wrapper.interpolate {
            return Composition {
                content: wrapper.text,
                interpolate: false,
                locals: input.locals,
            };
        }

        // Fence bodies and captured stdout usually end in a newline; strip
        // one per part so the seam is always a single newline.
        let body = trim_one_newline(&input.content);
        let wrap = trim_one_newline(&wrapper.text);
        let merged = match injectable.mode {
            InjectMode::Prepend => format!("{wrap}\n{body}"),
            InjectMode::Append => format!("{body}\n{wrap}"),
            InjectMode::Both => format!("{wrap}\n{body}\n{wrap}"),
        };

        Composition {
            content: merged,
            interpolate: input.interpolate,
            locals: input.locals,
        }
    }
}

fn trim_one_newline(text: &str) -> &str {
    text.strip_suffix('\n').unwrap_or(text)
}

/// `**` counts as 2 wildcards, `*` and `?` as 1 each.
fn count_wildcards(pattern: &str) -> usize {
    let mut count = 0;
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    count += 2;
                } else {
                    count += 1;
                }
            }
            '?' => count += 1,
            _ => {}
        }
    }
    count
}

/// Check `locals` against a `{key: {type: ...}}` schema spec. Every schema
/// key is required; extra locals pass through untouched.
fn validate_locals(schema: &Value, locals: &Value) -> Result<(), String> {
    let Some(spec) = schema.as_object() else {
        return Err("schema spec must be an object".to_owned());
    };
    let empty = Map::new();
    let given = locals.as_object().unwrap_or(&empty);

    let mut problems = Vec::new();
    for (key, entry) in spec {
        let expected = entry
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("string");
        match given.get(key) {
            None => problems.push(format!("missing '{key}' (expected {expected})")),
            Some(value) if !type_matches(expected, value) => problems.push(format!(
                "'{key}' expected {expected}, got {}",
                type_name(value)
            )),
            Some(_) => {}
        }
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(problems.join("; "))
    }
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "any" => true,
        _ => false,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
