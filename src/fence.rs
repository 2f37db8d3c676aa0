//! Fence info-string parsing.
//!
//! An info string like `bash myTask --flag=value --dep one --dep two pos`
//! is tokenized POSIX-style (quotes honored, then stripped) and classified
//! into a leading command language, flags, positional bare words, and an
//! optional trailing attribute object handled by [`crate::attrs`].

use std::sync::OnceLock;

use indexmap::IndexMap;
use regex::Regex;
use serde_json::Value;

use crate::attrs::{self, AttrsPolicy};
use crate::error::MdrunError;

/// Matches decimal integers and floats for value coercion. Booleans are
/// deliberately not coerced; `true`/`false` stay strings.
static NUMBER_RE: OnceLock<Regex> = OnceLock::new();

fn number_re() -> &'static Regex {
    NUMBER_RE.get_or_init(|| Regex::new(r"^[+-]?\d+(\.\d+)?$").expect("valid literal regex"))
}

/// Flag-key normalization hook. Identity when absent.
pub type NormalizeFlagKey = fn(&str) -> String;

/// Parser configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct FenceInfoOptions {
    /// Coerce values matching a decimal pattern into JSON numbers.
    pub coerce_numbers: bool,
    /// Process the leading language token as a regular bare token too.
    pub retain_cmd_lang: bool,
    /// Applied uniformly to `--key`, `-k`, `key=value`, and bare tokens.
    pub normalize_flag_key: Option<NormalizeFlagKey>,
    /// Behavior when the trailing `{...}` block fails to parse.
    pub attrs_policy: AttrsPolicy,
}

/// Structured form of a fence info string. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FenceInfo {
    /// Leading token when it does not start with `-`.
    pub cmd_lang: Option<String>,
    /// Tokens after the language, quotes already stripped, attrs removed.
    pub args: Vec<String>,
    /// Bare words in order, duplicates preserved.
    pub pos: Vec<String>,
    /// Flag occurrences in first-seen key order; repeats accumulate.
    pub flags: IndexMap<String, Vec<Value>>,
    /// Parsed trailing attribute object, if a block was present.
    pub attrs: Option<Value>,
    /// Raw source of the attribute block, braces included.
    pub attrs_text: Option<String>,
}

impl FenceInfo {
    /// Parse an info string. Tokenization itself never fails; a malformed
    /// attribute block behaves per `options.attrs_policy`.
    pub fn parse(info: &str, options: &FenceInfoOptions) -> Result<Self, MdrunError> {
        let mut out = FenceInfo::default();

        let mut remainder = info.to_owned();
        if let Some((start, end)) = attrs::find_attrs_block(info) {
            let block = info[start..end].to_owned();
            out.attrs = Some(attrs::parse_with_policy(&block, options.attrs_policy)?);
            out.attrs_text = Some(block);
            remainder = format!("{} {}", &info[..start], &info[end..]);
        }

        let tokens = tokenize(&remainder);
        let normalize = options.normalize_flag_key.unwrap_or(|k| k.to_owned());

        let mut i = 0;
        if let Some(first) = tokens.first() {
            if !first.starts_with('-') {
                out.cmd_lang = Some(first.clone());
                if !options.retain_cmd_lang {
                    i = 1;
                }
            }
        }

        out.args = tokens[i..].to_vec();

        while i < tokens.len() {
            let token = &tokens[i];
            if let Some(stripped) = strip_dashes(token) {
                if let Some((key, value)) = stripped.split_once('=') {
                    out.push_flag(normalize(key), coerce(value, options));
                } else {
                    // Two-token form: consume the next token as the value
                    // unless it looks like another flag.
                    let next = tokens.get(i + 1);
                    match next {
                        Some(v) if !v.starts_with('-') => {
                            out.push_flag(normalize(stripped), coerce(v, options));
                            i += 1;
                        }
                        _ => out.push_flag(normalize(stripped), Value::Bool(true)),
                    }
                }
            } else if let Some((key, value)) = token.split_once('=') {
                out.push_flag(normalize(key), coerce(value, options));
            } else {
                let word = normalize(token);
                out.push_flag(word.clone(), Value::Bool(true));
                out.pos.push(word);
            }
            i += 1;
        }

        Ok(out)
    }

    fn push_flag(&mut self, key: String, value: Value) {
        self.flags.entry(key).or_default().push(value);
    }

    /// First bare word, e.g. the task identity in `bash deploy --dep build`.
    pub fn first_bare_word(&self) -> Option<&str> {
        self.bare_word(0)
    }

    /// N-th bare word (0-based).
    pub fn bare_word(&self, n: usize) -> Option<&str> {
        self.pos.get(n).map(String::as_str)
    }

    /// True when any of the names was given as a flag.
    pub fn has_flag(&self, names: &[&str]) -> bool {
        names.iter().any(|n| self.flags.contains_key(*n))
    }

    /// First occurrence of the first present name.
    pub fn flag(&self, names: &[&str]) -> Option<&Value> {
        names
            .iter()
            .find_map(|n| self.flags.get(*n))
            .and_then(|vs| vs.first())
    }

    /// First occurrence of the first present name, as a string.
    pub fn flag_str(&self, names: &[&str]) -> Option<String> {
        self.flag(names).map(value_to_string)
    }

    /// All occurrences across all listed names, flattened in name order.
    pub fn flag_values(&self, names: &[&str]) -> Vec<&Value> {
        names
            .iter()
            .filter_map(|n| self.flags.get(*n))
            .flatten()
            .collect()
    }

    /// Truthy unless the flag's first value is strictly boolean `false`.
    /// Absent flags are not enabled.
    pub fn is_enabled(&self, names: &[&str]) -> bool {
        match self.flag(names) {
            Some(Value::Bool(false)) => false,
            Some(_) => true,
            None => false,
        }
    }

    /// Reconstruct an info string that reparses to the same `cmd_lang`,
    /// `pos`, and `flags`. Bare words render bare; everything else renders
    /// as `--key` / `--key=value` with shell quoting where needed.
    pub fn render(&self) -> String {
        let mut parts: Vec<String> = Vec::new();
        if let Some(lang) = &self.cmd_lang {
            parts.push(lang.clone());
        }

        let mut bare_remaining: IndexMap<&str, usize> = IndexMap::new();
        for word in &self.pos {
            *bare_remaining.entry(word.as_str()).or_insert(0) += 1;
        }

        for (key, values) in &self.flags {
            for value in values {
                let remaining = bare_remaining.get_mut(key.as_str());
                match (value, remaining) {
                    (Value::Bool(true), Some(n)) if *n > 0 => {
                        *n -= 1;
                        parts.push(shell_words::quote(key).into_owned());
                    }
                    (Value::Bool(true), _) => parts.push(format!("--{key}")),
                    (other, _) => {
                        let text = value_to_string(other);
                        parts.push(format!("--{key}={}", shell_words::quote(&text)));
                    }
                }
            }
        }

        if let Some(text) = &self.attrs_text {
            parts.push(text.clone());
        }
        parts.join(" ")
    }
}

/// POSIX-like split honoring single/double quotes; falls back to plain
/// whitespace splitting when quoting is unbalanced.
fn tokenize(input: &str) -> Vec<String> {
    shell_words::split(input)
        .unwrap_or_else(|_| input.split_whitespace().map(str::to_owned).collect())
}

/// Strip `-` / `--` prefixes. Returns `None` for tokens that are not flags
/// (including a lone `-`, which is the stdin sentinel elsewhere).
fn strip_dashes(token: &str) -> Option<&str> {
    let stripped = token.strip_prefix("--").or_else(|| token.strip_prefix('-'))?;
    if stripped.is_empty() {
        return None;
    }
    Some(stripped)
}

fn coerce(value: &str, options: &FenceInfoOptions) -> Value {
    if options.coerce_numbers && number_re().is_match(value) {
        if let Ok(n) = value.parse::<i64>() {
            return Value::Number(n.into());
        }
        if let Ok(f) = value.parse::<f64>() {
            if let Some(n) = serde_json::Number::from_f64(f) {
                return Value::Number(n);
            }
        }
    }
    Value::String(value.to_owned())
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
