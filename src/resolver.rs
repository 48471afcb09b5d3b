//! Dot-path resolution over output bundles.
//!
//! A connection's `source_path` addresses a value inside the producing
//! node's output bundle (`"result.customers.0.name"`). Paths are parsed once
//! at graph-build time into a [`PathExpr`] and evaluated against a bundle on
//! every pass; resolution is pure and total — a missing intermediate key
//! yields `None`, never an error, so callers decide whether an unresolved
//! input is fatal or defaulted.

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// One segment of a dot path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    /// Map key lookup.
    Key(String),
    /// Sequence index. Only applied when the current value is an array;
    /// on objects the numeric text is treated as an ordinary key.
    Index(usize),
}

/// A parsed dot-path expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathExpr {
    segments: Vec<PathSegment>,
    raw: String,
}

impl PathExpr {
    /// Parse a dot-separated path. Empty segments are rejected.
    pub fn parse(path: &str) -> Option<Self> {
        if path.is_empty() {
            return None;
        }
        let mut segments = Vec::new();
        for part in path.split('.') {
            if part.is_empty() {
                return None;
            }
            match part.parse::<usize>() {
                Ok(idx) => segments.push(PathSegment::Index(idx)),
                Err(_) => segments.push(PathSegment::Key(part.to_string())),
            }
        }
        Some(PathExpr {
            segments,
            raw: path.to_string(),
        })
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    /// The leading segment as a field name (index paths have none).
    pub fn head(&self) -> Option<&str> {
        match self.segments.first() {
            Some(PathSegment::Key(k)) => Some(k.as_str()),
            _ => None,
        }
    }
}

impl fmt::Display for PathExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// An output bundle: the named, possibly nested, result map produced by one
/// node execution.
pub type OutputBundle = HashMap<String, Value>;

/// Resolve `path` against `bundle`. Returns `None` when any segment is
/// missing or the structure does not match; no side effects.
pub fn resolve<'a>(bundle: &'a OutputBundle, path: &PathExpr) -> Option<&'a Value> {
    let mut segs = path.segments().iter();
    let mut current = match segs.next()? {
        PathSegment::Key(k) => bundle.get(k)?,
        // Top level is a map; numeric text is a key there.
        PathSegment::Index(i) => bundle.get(&i.to_string())?,
    };
    for seg in segs {
        current = step(current, seg)?;
    }
    Some(current)
}

fn step<'a>(value: &'a Value, seg: &PathSegment) -> Option<&'a Value> {
    match (value, seg) {
        (Value::Object(map), PathSegment::Key(k)) => map.get(k),
        // A numeric segment still names a key when the value is a map.
        (Value::Object(map), PathSegment::Index(i)) => map.get(&i.to_string()),
        (Value::Array(arr), PathSegment::Index(i)) => arr.get(*i),
        _ => None,
    }
}

/// Insert `value` at `path` inside an input map, creating intermediate
/// objects as needed. Index segments are treated as keys here: inputs are
/// maps all the way down.
pub fn insert(inputs: &mut HashMap<String, Value>, path: &PathExpr, value: Value) {
    let segments = path.segments();
    let first = segment_key(&segments[0]);
    if segments.len() == 1 {
        inputs.insert(first, value);
        return;
    }

    let mut current = inputs
        .entry(first)
        .or_insert_with(|| Value::Object(serde_json::Map::new()));
    for seg in &segments[1..segments.len() - 1] {
        if !current.is_object() {
            *current = Value::Object(serde_json::Map::new());
        }
        current = current
            .as_object_mut()
            .expect("just ensured object")
            .entry(segment_key(seg))
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
    }

    if !current.is_object() {
        *current = Value::Object(serde_json::Map::new());
    }
    current
        .as_object_mut()
        .expect("just ensured object")
        .insert(segment_key(&segments[segments.len() - 1]), value);
}

fn segment_key(seg: &PathSegment) -> String {
    match seg {
        PathSegment::Key(k) => k.clone(),
        PathSegment::Index(i) => i.to_string(),
    }
}
