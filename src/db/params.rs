//! Named parameter binding
//!
//! Callers write `:name` placeholders and pass a [`Params`] map. Each driver
//! wants its own positional syntax, so statements are scanned once and
//! rewritten per backend. Values never end up inside the SQL text.
//!
//! The scanner leaves `:name` alone inside quoted strings, identifiers,
//! comments and PostgreSQL `$tag$` bodies, and does not mistake a `::` cast
//! for a placeholder. A backslash escapes the next character inside
//! PostgreSQL `E'...'` strings, and inside every MySQL string when the
//! query is parsed with [`NamedQuery::parse_backslash_escaped`] (MySQL's
//! default, unless the server runs with `NO_BACKSLASH_ESCAPES`).

use crate::db::query::Value;
use crate::error::{Error, Result};
use std::collections::HashMap;

/// Parameter values keyed by placeholder name (without the leading colon)
pub type Params = HashMap<String, Value>;

/// Build a [`Params`] map: `params! { "name" => "Alice", "age" => 30 }`
#[macro_export]
macro_rules! params {
    () => {
        $crate::db::Params::new()
    };
    ($($name:expr => $value:expr),+ $(,)?) => {{
        let mut params = $crate::db::Params::new();
        $(
            params.insert(::std::string::String::from($name), $crate::db::Value::from($value));
        )+
        params
    }};
}

/// Positional placeholder syntax understood by a driver
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlaceholderStyle {
    /// `?1, ?2` (SQLite)
    Numbered,
    /// `$1, $2` (PostgreSQL)
    Dollar,
    /// `@P1, @P2` (SQL Server)
    AtP,
    /// `?` per occurrence (MySQL)
    Question,
}

#[derive(Clone, Debug, PartialEq)]
enum Segment {
    Sql(String),
    Param(String),
}

/// A statement split into literal SQL and `:name` placeholders
#[derive(Clone, Debug, PartialEq)]
pub struct NamedQuery {
    segments: Vec<Segment>,
}

impl NamedQuery {
    /// Scan a statement where only doubled quotes escape a quote
    pub fn parse(sql: &str) -> Self {
        Self::scan(sql, false)
    }

    /// Scan a statement whose string literals also treat `\` as an escape
    pub fn parse_backslash_escaped(sql: &str) -> Self {
        Self::scan(sql, true)
    }

    fn scan(sql: &str, backslash_escapes: bool) -> Self {
        let bytes = sql.as_bytes();
        let mut segments = Vec::new();
        let mut literal_start = 0;
        let mut i = 0;

        while i < bytes.len() {
            match bytes[i] {
                b'`' => i = skip_quoted(bytes, i, b'`', false),
                quote @ (b'\'' | b'"') => {
                    let escapes = backslash_escapes || (quote == b'\'' && is_escape_prefix(bytes, i));
                    i = skip_quoted(bytes, i, quote, escapes);
                }
                b'$' if !follows_word(bytes, i) => {
                    i = match dollar_tag(bytes, i) {
                        Some(tag_end) => {
                            let tag = &sql[i..tag_end];
                            sql[tag_end..]
                                .find(tag)
                                .map_or(bytes.len(), |p| tag_end + p + tag.len())
                        }
                        None => i + 1,
                    };
                }
                b'-' if bytes.get(i + 1) == Some(&b'-') => {
                    i = bytes[i..]
                        .iter()
                        .position(|&b| b == b'\n')
                        .map_or(bytes.len(), |p| i + p + 1);
                }
                b'/' if bytes.get(i + 1) == Some(&b'*') => {
                    i = sql[i + 2..].find("*/").map_or(bytes.len(), |p| i + 2 + p + 2);
                }
                b':' if bytes.get(i + 1) == Some(&b':') => {
                    // PostgreSQL cast
                    i += 2;
                }
                b':' if bytes.get(i + 1).is_some_and(|&b| is_ident_start(b)) => {
                    let name_start = i + 1;
                    let mut end = name_start;
                    while end < bytes.len() && is_ident_char(bytes[end]) {
                        end += 1;
                    }
                    if literal_start < i {
                        segments.push(Segment::Sql(sql[literal_start..i].to_string()));
                    }
                    segments.push(Segment::Param(sql[name_start..end].to_string()));
                    literal_start = end;
                    i = end;
                }
                _ => i += 1,
            }
        }

        if literal_start < bytes.len() {
            segments.push(Segment::Sql(sql[literal_start..].to_string()));
        }

        Self { segments }
    }

    /// Placeholder names in order of first appearance
    pub fn parameter_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for segment in &self.segments {
            if let Segment::Param(name) = segment {
                if !names.contains(&name.as_str()) {
                    names.push(name);
                }
            }
        }
        names
    }

    /// Render for a driver and collect the values in binding order.
    ///
    /// Fails when a placeholder has no entry in `params`. Unused entries
    /// are ignored.
    pub fn compile(&self, style: PlaceholderStyle, params: &Params) -> Result<(String, Vec<Value>)> {
        let mut sql = String::new();
        let mut values = Vec::new();
        let mut positions: Vec<&str> = Vec::new();

        for segment in &self.segments {
            match segment {
                Segment::Sql(text) => sql.push_str(text),
                Segment::Param(name) => {
                    let value = params
                        .get(name)
                        .ok_or_else(|| Error::Query(format!("missing value for parameter :{}", name)))?;

                    if style == PlaceholderStyle::Question {
                        sql.push('?');
                        values.push(value.clone());
                        continue;
                    }

                    let position = match positions.iter().position(|p| *p == name.as_str()) {
                        Some(idx) => idx + 1,
                        None => {
                            positions.push(name.as_str());
                            values.push(value.clone());
                            positions.len()
                        }
                    };
                    match style {
                        PlaceholderStyle::Numbered => sql.push_str(&format!("?{}", position)),
                        PlaceholderStyle::Dollar => sql.push_str(&format!("${}", position)),
                        PlaceholderStyle::AtP => sql.push_str(&format!("@P{}", position)),
                        PlaceholderStyle::Question => sql.push('?'),
                    }
                }
            }
        }

        Ok((sql, values))
    }
}

fn skip_quoted(bytes: &[u8], start: usize, quote: u8, backslash_escapes: bool) -> usize {
    let mut i = start + 1;
    while i < bytes.len() {
        if backslash_escapes && bytes[i] == b'\\' {
            i += 2;
            continue;
        }
        if bytes[i] == quote {
            // doubled quote is an escaped quote
            if bytes.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    bytes.len()
}

/// `E'...'` / `e'...'` standing on its own, not the tail of a word
fn is_escape_prefix(bytes: &[u8], quote_at: usize) -> bool {
    quote_at > 0
        && matches!(bytes[quote_at - 1], b'E' | b'e')
        && !follows_word(bytes, quote_at - 1)
}

fn follows_word(bytes: &[u8], at: usize) -> bool {
    at > 0 && (is_ident_char(bytes[at - 1]) || bytes[at - 1] == b'$')
}

/// End of a `$tag$` opener starting at `start`; `$1` style parameters are not tags
fn dollar_tag(bytes: &[u8], start: usize) -> Option<usize> {
    let mut end = start + 1;
    if bytes.get(end).is_some_and(|&b| !is_ident_start(b) && b != b'$') {
        return None;
    }
    while end < bytes.len() && is_ident_char(bytes[end]) {
        end += 1;
    }
    (bytes.get(end) == Some(&b'$')).then_some(end + 1)
}

fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

fn is_ident_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}
