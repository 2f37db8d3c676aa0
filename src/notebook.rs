//! Runbook loading: markdown text → fenced-code cells.
//!
//! The markdown AST itself comes from `pulldown-cmark`; this module only
//! walks fenced code blocks, keeping the raw info string, the body, and
//! 1-based source lines for diagnostics. YAML frontmatter is split off
//! before markdown parsing and checked against a caller-supplied schema
//! hook; a frontmatter failure skips the whole notebook.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use pulldown_cmark::{CodeBlockKind, Event, Options, Parser, Tag, TagEnd};
use serde_json::Value;

use crate::error::MdrunError;

/// A fenced code block lifted out of a runbook.
#[derive(Debug, Clone, PartialEq)]
pub struct Cell {
    /// First word of the info string, when present.
    pub lang: Option<String>,
    /// Full raw info string as authored.
    pub info: String,
    /// Fence body.
    pub body: String,
    /// 1-based line of the opening fence.
    pub start_line: usize,
    /// 1-based line of the closing fence.
    pub end_line: usize,
}

/// A parsed runbook: origin, optional frontmatter, and its cells.
#[derive(Debug, Clone)]
pub struct Notebook {
    pub origin: PathBuf,
    pub frontmatter: Option<Value>,
    pub cells: Vec<Cell>,
}

/// Validates frontmatter before a notebook is admitted. Returning `Err`
/// rejects the notebook with a `frontmatter-parse` diagnostic.
pub type FrontmatterValidator<'a> = &'a dyn Fn(&Value) -> Result<(), String>;

/// Read a runbook file as UTF-8, distinguishing missing from unreadable.
pub fn read_source(path: &Path) -> Result<String, MdrunError> {
    let bytes = fs::read(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            MdrunError::NotebookNotFound {
                path: path.to_path_buf(),
            }
        } else {
            MdrunError::InvalidNotebook {
                path: path.to_path_buf(),
            }
        }
    })?;
    String::from_utf8(bytes).map_err(|_| MdrunError::InvalidNotebook {
        path: path.to_path_buf(),
    })
}

/// Read a runbook from stdin (the `-` source).
pub fn read_stdin() -> Result<String, MdrunError> {
    let mut buf = String::new();
    std::io::stdin()
        .read_to_string(&mut buf)
        .map_err(|_| MdrunError::InvalidNotebook {
            path: PathBuf::from("-"),
        })?;
    Ok(buf)
}

/// Parse runbook content into a [`Notebook`].
///
/// Returns `Err(message)` only for frontmatter failures (invalid YAML or
/// validator rejection); the caller records the issue and skips this
/// notebook while others proceed.
pub fn parse(
    origin: &Path,
    content: &str,
    validator: Option<FrontmatterValidator>,
) -> Result<Notebook, String> {
    let content = content.replace("\r\n", "\n");
    let (frontmatter, body, line_offset) = split_frontmatter(&content)?;

    if let (Some(fm), Some(validate)) = (&frontmatter, validator) {
        validate(fm).map_err(|msg| format!("frontmatter rejected: {msg}"))?;
    }

    let line_starts = line_start_offsets(body);
    let mut cells = Vec::new();

    let mut current: Option<(String, String, usize)> = None;
    for (event, range) in Parser::new_ext(body, Options::empty()).into_offset_iter() {
        match event {
            Event::Start(Tag::CodeBlock(CodeBlockKind::Fenced(info))) => {
                current = Some((info.to_string(), String::new(), range.start));
            }
            Event::Text(text) => {
                if let Some((_, body_acc, _)) = current.as_mut() {
                    body_acc.push_str(&text);
                }
            }
            Event::End(TagEnd::CodeBlock) => {
                if let Some((info, body_acc, start)) = current.take() {
                    let start_line = line_at(&line_starts, start) + line_offset;
                    let end_line = line_at(&line_starts, range.end.saturating_sub(1)) + line_offset;
                    let lang = info.split_whitespace().next().map(str::to_owned);
                    cells.push(Cell {
                        lang,
                        info,
                        body: body_acc,
                        start_line,
                        end_line,
                    });
                }
            }
            _ => {}
        }
    }

    Ok(Notebook {
        origin: origin.to_path_buf(),
        frontmatter,
        cells,
    })
}

/// Split optional leading `---` frontmatter. Returns the parsed YAML, the
/// remaining markdown, and the number of lines consumed.
fn split_frontmatter(content: &str) -> Result<(Option<Value>, &str, usize), String> {
    let Some(rest) = content.strip_prefix("---\n") else {
        return Ok((None, content, 0));
    };

    let mut consumed = 1;
    let mut yaml_end = None;
    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        consumed += 1;
        let trimmed = line.trim_end();
        if trimmed == "---" || trimmed == "..." {
            yaml_end = Some(offset);
            offset += line.len();
            break;
        }
        offset += line.len();
    }

    let Some(yaml_end) = yaml_end else {
        // An unterminated marker is not frontmatter; treat it as content.
        return Ok((None, content, 0));
    };

    let yaml = &rest[..yaml_end];
    let value: Value =
        serde_yaml::from_str(yaml).map_err(|e| format!("invalid frontmatter YAML: {e}"))?;
    Ok((Some(value), &rest[offset..], consumed))
}

/// Byte offsets of each line start, for offset → line translation.
fn line_start_offsets(text: &str) -> Vec<usize> {
    let mut starts = vec![0];
    for (i, b) in text.bytes().enumerate() {
        if b == b'\n' {
            starts.push(i + 1);
        }
    }
    starts
}

/// 1-based line containing the given byte offset.
fn line_at(starts: &[usize], offset: usize) -> usize {
    match starts.binary_search(&offset) {
        Ok(i) => i + 1,
        Err(i) => i,
    }
}
