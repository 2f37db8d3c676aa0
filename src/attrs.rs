//! Trailing attribute blocks on fence info strings.
//!
//! An info string may end with an object literal, e.g.
//! `bash deploy --dep build { priority: 5, description: "ship it" }`.
//! The block is located by balanced-brace scanning (braces inside string
//! literals do not count) and parsed with a relaxed reader that accepts
//! unquoted identifier keys, single-quoted strings, and trailing commas
//! on top of plain JSON.

use serde_json::{Map, Number, Value};

use crate::error::MdrunError;

/// What to do when a trailing attribute block fails to parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttrsPolicy {
    /// Replace the unparseable block with an empty object.
    #[default]
    Ignore,
    /// Keep the raw source under the `__raw` key.
    Store,
    /// Propagate the failure to the caller.
    Error,
}

impl AttrsPolicy {
    pub fn parse(value: &str) -> Result<Self, MdrunError> {
        match value {
            "ignore" => Ok(Self::Ignore),
            "store" => Ok(Self::Store),
            "error" => Ok(Self::Error),
            _ => Err(MdrunError::InvalidAttrsPolicy {
                value: value.to_owned(),
            }),
        }
    }
}

/// Locate a trailing attribute block in `info`.
///
/// Returns the byte range of the block (including both braces). The block
/// starts at the first `{` that begins a token (start of string or preceded
/// by whitespace) and ends at its balanced closing `}`; braces inside
/// single- or double-quoted string literals are ignored. When the braces
/// never balance the range extends to the end of the string so the caller
/// still strips the fragment from token processing.
pub fn find_attrs_block(info: &str) -> Option<(usize, usize)> {
    let bytes = info.as_bytes();
    let mut start = None;
    for (i, b) in bytes.iter().enumerate() {
        if *b == b'{' && (i == 0 || bytes[i - 1].is_ascii_whitespace()) {
            start = Some(i);
            break;
        }
    }
    let start = start?;

    let mut depth = 0usize;
    let mut in_str: Option<u8> = None;
    let mut escaped = false;
    for (i, b) in bytes.iter().enumerate().skip(start) {
        if let Some(quote) = in_str {
            if escaped {
                escaped = false;
            } else if *b == b'\\' {
                escaped = true;
            } else if *b == quote {
                in_str = None;
            }
            continue;
        }
        match *b {
            b'"' | b'\'' => in_str = Some(*b),
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some((start, i + 1));
                }
            }
            _ => {}
        }
    }

    Some((start, info.len()))
}

/// Parse an attribute block under the given policy.
///
/// `Ignore` yields `{}` on failure, `Store` yields `{"__raw": <source>}`,
/// `Error` propagates.
pub fn parse_with_policy(source: &str, policy: AttrsPolicy) -> Result<Value, MdrunError> {
    match parse_object(source) {
        Ok(v) => Ok(v),
        Err(detail) => match policy {
            AttrsPolicy::Ignore => Ok(Value::Object(Map::new())),
            AttrsPolicy::Store => {
                let mut map = Map::new();
                map.insert("__raw".to_owned(), Value::String(source.to_owned()));
                Ok(Value::Object(map))
            }
            AttrsPolicy::Error => Err(MdrunError::AttrsParseFailed { detail }),
        },
    }
}

/// Parse a relaxed object literal into a `serde_json::Value`.
///
/// Accepted beyond strict JSON: unquoted identifier keys (`[A-Za-z_$][\w$-]*`),
/// single-quoted strings, and trailing commas in objects and arrays.
pub fn parse_object(source: &str) -> Result<Value, String> {
    let mut p = Reader::new(source);
    p.skip_ws();
    let value = p.read_object()?;
    p.skip_ws();
    if !p.at_end() {
        return Err(format!("unexpected trailing input at byte {}", p.pos));
    }
    Ok(value)
}

struct Reader<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(src: &'a str) -> Self {
        Self { src, pos: 0 }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.src.len()
    }

    fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn skip_ws(&mut self) {
        while let Some(c) = self.peek() {
            if c.is_whitespace() {
                self.bump();
            } else {
                break;
            }
        }
    }

    fn expect(&mut self, want: char) -> Result<(), String> {
        match self.bump() {
            Some(c) if c == want => Ok(()),
            Some(c) => Err(format!("expected '{want}', found '{c}' at byte {}", self.pos)),
            None => Err(format!("expected '{want}', found end of input")),
        }
    }

    fn read_value(&mut self) -> Result<Value, String> {
        self.skip_ws();
        match self.peek() {
            Some('{') => self.read_object(),
            Some('[') => self.read_array(),
            Some('"') | Some('\'') => Ok(Value::String(self.read_string()?)),
            Some(c) if c == '-' || c == '+' || c.is_ascii_digit() => self.read_number(),
            Some(_) => self.read_word(),
            None => Err("expected a value, found end of input".to_owned()),
        }
    }

    fn read_object(&mut self) -> Result<Value, String> {
        self.expect('{')?;
        let mut map = Map::new();
        loop {
            self.skip_ws();
            match self.peek() {
                Some('}') => {
                    self.bump();
                    return Ok(Value::Object(map));
                }
                None => return Err("unterminated object".to_owned()),
                _ => {}
            }
            let key = self.read_key()?;
            self.skip_ws();
            self.expect(':')?;
            let value = self.read_value()?;
            map.insert(key, value);
            self.skip_ws();
            match self.peek() {
                Some(',') => {
                    self.bump();
                }
                Some('}') => {}
                Some(c) => return Err(format!("expected ',' or '}}', found '{c}'")),
                None => return Err("unterminated object".to_owned()),
            }
        }
    }

    fn read_array(&mut self) -> Result<Value, String> {
        self.expect('[')?;
        let mut items = Vec::new();
        loop {
            self.skip_ws();
            match self.peek() {
                Some(']') => {
                    self.bump();
                    return Ok(Value::Array(items));
                }
                None => return Err("unterminated array".to_owned()),
                _ => {}
            }
            items.push(self.read_value()?);
            self.skip_ws();
            match self.peek() {
                Some(',') => {
                    self.bump();
                }
                Some(']') => {}
                Some(c) => return Err(format!("expected ',' or ']', found '{c}'")),
                None => return Err("unterminated array".to_owned()),
            }
        }
    }

    fn read_key(&mut self) -> Result<String, String> {
        match self.peek() {
            Some('"') | Some('\'') => self.read_string(),
            Some(c) if c == '_' || c == '$' || c.is_alphabetic() => {
                let start = self.pos;
                while let Some(c) = self.peek() {
                    if c == '_' || c == '$' || c == '-' || c.is_alphanumeric() {
                        self.bump();
                    } else {
                        break;
                    }
                }
                Ok(self.src[start..self.pos].to_owned())
            }
            Some(c) => Err(format!("invalid object key starting with '{c}'")),
            None => Err("expected an object key, found end of input".to_owned()),
        }
    }

    fn read_string(&mut self) -> Result<String, String> {
        let quote = self.bump().ok_or("expected a string")?;
        let mut out = String::new();
        loop {
            match self.bump() {
                None => return Err("unterminated string".to_owned()),
                Some('\\') => match self.bump() {
                    None => return Err("unterminated escape".to_owned()),
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some('r') => out.push('\r'),
                    Some(c) => out.push(c),
                },
                Some(c) if c == quote => return Ok(out),
                Some(c) => out.push(c),
            }
        }
    }

    fn read_number(&mut self) -> Result<Value, String> {
        let start = self.pos;
        if matches!(self.peek(), Some('-') | Some('+')) {
            self.bump();
        }
        let mut saw_dot = false;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                self.bump();
            } else if c == '.' && !saw_dot {
                saw_dot = true;
                self.bump();
            } else {
                break;
            }
        }
        let text = self.src[start..self.pos].trim_start_matches('+');
        if saw_dot {
            let f: f64 = text.parse().map_err(|e| format!("invalid number: {e}"))?;
            Number::from_f64(f)
                .map(Value::Number)
                .ok_or_else(|| format!("non-finite number '{text}'"))
        } else {
            let n: i64 = text.parse().map_err(|e| format!("invalid number: {e}"))?;
            Ok(Value::Number(n.into()))
        }
    }

    fn read_word(&mut self) -> Result<Value, String> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' {
                self.bump();
            } else {
                break;
            }
        }
        match &self.src[start..self.pos] {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            "null" => Ok(Value::Null),
            other => Err(format!("unexpected token '{other}'")),
        }
    }
}
