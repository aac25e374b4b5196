//! Field paths into semi-structured documents.
//!
//! Paths are dotted segments with optional bracket suffixes:
//! - `spec.workloadRefs` addresses a nested key
//! - `spec.containers[0].name` addresses an array element
//! - `metadata.labels[app.kubernetes.io/name]` addresses a key that contains dots
//!
//! Resolution failures are explicit `PathError`s rather than panics on a
//! mismatched container type.

#![forbid(unsafe_code)]

use std::fmt;

use serde_json::{Map, Value as Json};
use smallvec::SmallVec;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
    Field(String),
    Index(usize),
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Field(k) => write!(f, "{}", k),
            Segment::Index(i) => write!(f, "[{}]", i),
        }
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum PathError {
    #[error("invalid field path {path:?}: {reason}")]
    Invalid { path: String, reason: &'static str },
    #[error("{path}: no such field")]
    NotFound { path: String },
    #[error("{path}: expected {expected}, found {found}")]
    TypeMismatch { path: String, expected: &'static str, found: &'static str },
}

impl PathError {
    pub fn is_not_found(&self) -> bool { matches!(self, PathError::NotFound { .. }) }
}

/// How many null slots `set` may insert to reach an index past the end of an array.
pub const MAX_INDEX_PADDING: usize = 64;

/// A parsed field path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldPath {
    raw: String,
    segments: SmallVec<[Segment; 4]>,
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.raw) }
}

impl std::str::FromStr for FieldPath {
    type Err = PathError;
    fn from_str(s: &str) -> Result<Self, Self::Err> { FieldPath::parse(s) }
}

/// Name of the JSON value kind, as used in `PathError::TypeMismatch`.
pub fn kind_of(v: &Json) -> &'static str {
    match v {
        Json::Null => "null",
        Json::Bool(_) => "bool",
        Json::Number(_) => "number",
        Json::String(_) => "string",
        Json::Array(_) => "array",
        Json::Object(_) => "object",
    }
}

impl FieldPath {
    pub fn parse(raw: &str) -> Result<Self, PathError> {
        let invalid = |reason| PathError::Invalid { path: raw.to_string(), reason };
        if raw.is_empty() {
            return Err(invalid("empty path"));
        }
        let mut segments = SmallVec::new();
        let mut chars = raw.char_indices().peekable();
        let mut cur = String::new();
        // true right after a closing bracket: the next char must be '.', '[' or end
        let mut after_bracket = false;
        while let Some((_, c)) = chars.next() {
            match c {
                '.' => {
                    if !after_bracket {
                        if cur.is_empty() { return Err(invalid("empty segment")); }
                        segments.push(Segment::Field(std::mem::take(&mut cur)));
                    }
                    after_bracket = false;
                    if chars.peek().is_none() { return Err(invalid("trailing dot")); }
                }
                '[' => {
                    if !cur.is_empty() {
                        segments.push(Segment::Field(std::mem::take(&mut cur)));
                    } else if !after_bracket && segments.is_empty() {
                        return Err(invalid("path starts with a bracket"));
                    }
                    let mut inner = String::new();
                    let mut closed = false;
                    for (_, c) in chars.by_ref() {
                        if c == ']' { closed = true; break; }
                        inner.push(c);
                    }
                    if !closed { return Err(invalid("unterminated bracket")); }
                    if inner.is_empty() { return Err(invalid("empty brackets")); }
                    match inner.parse::<usize>() {
                        Ok(i) => segments.push(Segment::Index(i)),
                        Err(_) => segments.push(Segment::Field(inner)),
                    }
                    after_bracket = true;
                }
                ']' => return Err(invalid("unbalanced closing bracket")),
                c => {
                    if after_bracket { return Err(invalid("expected '.' or '[' after ']'")); }
                    cur.push(c);
                }
            }
        }
        if !cur.is_empty() {
            segments.push(Segment::Field(cur));
        }
        Ok(Self { raw: raw.to_string(), segments })
    }

    /// Path made only of plain key segments, e.g. `["spec", "workloadRefs"]`.
    pub fn from_fields<'a>(fields: impl IntoIterator<Item = &'a str>) -> Self {
        let segments: SmallVec<[Segment; 4]> = fields.into_iter().map(|f| Segment::Field(f.to_string())).collect();
        let raw = segments.iter().map(|s| s.to_string()).collect::<Vec<_>>().join(".");
        Self { raw, segments }
    }

    pub fn as_str(&self) -> &str { &self.raw }

    pub fn segments(&self) -> &[Segment] { &self.segments }

    fn prefix(&self, upto: usize) -> String {
        let mut out = String::new();
        for seg in &self.segments[..=upto] {
            match seg {
                Segment::Field(k) => {
                    if !out.is_empty() { out.push('.'); }
                    out.push_str(k);
                }
                Segment::Index(i) => out.push_str(&format!("[{}]", i)),
            }
        }
        out
    }

    /// Resolve the path inside `doc`.
    pub fn get<'a>(&self, doc: &'a Json) -> Result<&'a Json, PathError> {
        let mut cur = doc;
        for (i, seg) in self.segments.iter().enumerate() {
            cur = match (seg, cur) {
                (Segment::Field(k), Json::Object(map)) => {
                    map.get(k).ok_or_else(|| PathError::NotFound { path: self.prefix(i) })?
                }
                (Segment::Index(idx), Json::Array(arr)) => {
                    arr.get(*idx).ok_or_else(|| PathError::NotFound { path: self.prefix(i) })?
                }
                (Segment::Field(_), other) => {
                    return Err(PathError::TypeMismatch { path: self.prefix(i), expected: "object", found: kind_of(other) })
                }
                (Segment::Index(_), other) => {
                    return Err(PathError::TypeMismatch { path: self.prefix(i), expected: "array", found: kind_of(other) })
                }
            };
        }
        Ok(cur)
    }

    /// Like `get`, but an absent field yields `None` instead of an error.
    pub fn get_opt<'a>(&self, doc: &'a Json) -> Result<Option<&'a Json>, PathError> {
        match self.get(doc) {
            Ok(v) => Ok(Some(v)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Write `value` at the path, creating missing intermediate containers.
    pub fn set(&self, doc: &mut Json, value: Json) -> Result<(), PathError> {
        let Some(last) = self.segments.len().checked_sub(1) else {
            return Err(PathError::Invalid { path: self.raw.clone(), reason: "empty path" });
        };
        let mut cur = doc;
        for (i, seg) in self.segments.iter().enumerate() {
            match seg {
                Segment::Field(k) => {
                    if cur.is_null() { *cur = Json::Object(Map::new()); }
                    let found = kind_of(cur);
                    let map = cur.as_object_mut().ok_or_else(|| PathError::TypeMismatch {
                        path: self.prefix(i),
                        expected: "object",
                        found,
                    })?;
                    if i == last {
                        map.insert(k.clone(), value);
                        return Ok(());
                    }
                    cur = map.entry(k.clone()).or_insert(Json::Null);
                }
                Segment::Index(idx) => {
                    if cur.is_null() { *cur = Json::Array(Vec::new()); }
                    let found = kind_of(cur);
                    let arr = cur.as_array_mut().ok_or_else(|| PathError::TypeMismatch {
                        path: self.prefix(i),
                        expected: "array",
                        found,
                    })?;
                    if arr.len() <= *idx {
                        if *idx - arr.len() > MAX_INDEX_PADDING {
                            return Err(PathError::Invalid {
                                path: self.prefix(i),
                                reason: "index too far past the end of the array",
                            });
                        }
                        arr.resize(*idx + 1, Json::Null);
                    }
                    if i == last {
                        arr[*idx] = value;
                        return Ok(());
                    }
                    cur = &mut arr[*idx];
                }
            }
        }
        Ok(())
    }
}
