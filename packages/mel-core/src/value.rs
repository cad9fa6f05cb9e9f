//! Dot-paths and value-tree traversal.
//!
//! A [`Path`] addresses a location inside a JSON value tree. Paths are the
//! shared currency of the kernel: patches, diffs, computed dependencies,
//! expression reads, and scope globs all speak in paths.
//!
//! # Segment interpretation
//!
//! Segments are plain strings. A segment consisting solely of ASCII digits
//! addresses an array index when the value at that point is an array, and an
//! ordinary object key otherwise. This keeps the path grammar flat while
//! still allowing `items.0.name` style addressing.
//!
//! # Reserved namespaces
//!
//! Two top-level segments of the user data tree are reserved:
//! - `$host`: host-owned scratch space
//! - `$mel`: compiler-owned markers (guard records live under
//!   `$mel.guards.intent`)
//!
//! Reserved paths are excluded from scope accounting and may not be targeted
//! by effect-handler patches.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Host-owned scratch namespace inside `data`.
pub const RESERVED_HOST_SEGMENT: &str = "$host";

/// Compiler-owned marker namespace inside `data`.
pub const RESERVED_PLATFORM_SEGMENT: &str = "$mel";

/// Reserved prefix for platform action names and namespaces.
pub const PLATFORM_PREFIX: &str = "$";

/// A dot-separated path into a value tree.
///
/// Paths are immutable once constructed. An empty path addresses the root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Path {
    segments: Vec<String>,
}

impl Path {
    /// The root path (no segments).
    pub fn root() -> Self {
        Self { segments: Vec::new() }
    }

    /// Parse a dot-separated path string.
    ///
    /// Empty input yields the root path. Empty segments (`a..b`) are
    /// preserved as empty strings; the schema loader rejects them up front.
    pub fn parse(raw: &str) -> Self {
        if raw.is_empty() {
            return Self::root();
        }
        Self {
            segments: raw.split('.').map(str::to_string).collect(),
        }
    }

    /// Build a path from owned segments.
    pub fn from_segments(segments: Vec<String>) -> Self {
        Self { segments }
    }

    /// The path's segments.
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Number of segments.
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// True if this is the root path.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// First segment, if any.
    pub fn head(&self) -> Option<&str> {
        self.segments.first().map(String::as_str)
    }

    /// The path without its first segment.
    pub fn tail(&self) -> Path {
        Path {
            segments: self.segments.iter().skip(1).cloned().collect(),
        }
    }

    /// Append a segment, returning a new path.
    pub fn child(&self, segment: impl Into<String>) -> Path {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Path { segments }
    }

    /// True if `self` starts with all of `prefix`'s segments.
    pub fn starts_with(&self, prefix: &Path) -> bool {
        self.segments.len() >= prefix.segments.len()
            && self.segments[..prefix.segments.len()] == prefix.segments[..]
    }

    /// True if this path enters a reserved namespace (`$host` or `$mel`).
    pub fn is_reserved(&self) -> bool {
        matches!(
            self.head(),
            Some(RESERVED_HOST_SEGMENT) | Some(RESERVED_PLATFORM_SEGMENT)
        )
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("."))
    }
}

impl From<&str> for Path {
    fn from(raw: &str) -> Self {
        Path::parse(raw)
    }
}

/// Outcome of a read-only path lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup<'a> {
    /// The path resolved to a value.
    Found(&'a Value),
    /// The final segment (or an intermediate object key) is absent.
    Missing,
    /// Traversal hit a non-container before the path was exhausted.
    Blocked,
    /// A numeric segment indexed past the end of an array.
    OutOfBounds,
}

/// Resolve `path` against `root` without mutating anything.
pub fn lookup<'a>(root: &'a Value, path: &Path) -> Lookup<'a> {
    let mut current = root;
    for segment in path.segments() {
        match current {
            Value::Object(map) => match map.get(segment) {
                Some(next) => current = next,
                None => return Lookup::Missing,
            },
            Value::Array(items) => match segment.parse::<usize>() {
                Ok(index) if index < items.len() => current = &items[index],
                Ok(_) => return Lookup::OutOfBounds,
                Err(_) => return Lookup::Blocked,
            },
            _ => return Lookup::Blocked,
        }
    }
    Lookup::Found(current)
}

/// Write `value` at `path`, creating intermediate objects as needed.
///
/// Array segments must address an existing index (arrays are never implicitly
/// grown or created). Returns a description of the failure segment on error.
pub fn write(root: &mut Value, path: &Path, value: Value) -> Result<(), WriteFailure> {
    if path.is_empty() {
        *root = value;
        return Ok(());
    }
    let mut current = root;
    let last = path.len() - 1;
    for (position, segment) in path.segments().iter().enumerate() {
        let is_last = position == last;
        match current {
            Value::Object(map) => {
                if is_last {
                    map.insert(segment.clone(), value);
                    return Ok(());
                }
                current = map
                    .entry(segment.clone())
                    .or_insert_with(|| Value::Object(serde_json::Map::new()));
                if !matches!(current, Value::Object(_) | Value::Array(_)) {
                    return Err(WriteFailure::Blocked { position });
                }
            }
            Value::Array(items) => match segment.parse::<usize>() {
                Ok(index) if index < items.len() => {
                    if is_last {
                        items[index] = value;
                        return Ok(());
                    }
                    current = &mut items[index];
                    if !matches!(current, Value::Object(_) | Value::Array(_)) {
                        return Err(WriteFailure::Blocked { position });
                    }
                }
                Ok(_) => return Err(WriteFailure::OutOfBounds { position }),
                Err(_) => return Err(WriteFailure::Blocked { position }),
            },
            _ => return Err(WriteFailure::Blocked { position }),
        }
    }
    // Unreachable: the loop always returns on the last segment.
    Err(WriteFailure::Blocked { position: last })
}

/// Remove the value at `path`. Returns whether anything was removed.
pub fn remove(root: &mut Value, path: &Path) -> Result<bool, WriteFailure> {
    if path.is_empty() {
        return Err(WriteFailure::Blocked { position: 0 });
    }
    let mut current = root;
    let last = path.len() - 1;
    for (position, segment) in path.segments().iter().enumerate() {
        let is_last = position == last;
        match current {
            Value::Object(map) => {
                if is_last {
                    return Ok(map.remove(segment).is_some());
                }
                match map.get_mut(segment) {
                    Some(next) => current = next,
                    None => return Ok(false),
                }
            }
            Value::Array(items) => match segment.parse::<usize>() {
                Ok(index) if index < items.len() => {
                    if is_last {
                        items.remove(index);
                        return Ok(true);
                    }
                    current = &mut items[index];
                }
                Ok(_) => return Err(WriteFailure::OutOfBounds { position }),
                Err(_) => return Err(WriteFailure::Blocked { position }),
            },
            _ => return Err(WriteFailure::Blocked { position }),
        }
    }
    Ok(false)
}

/// Failure detail for a mutating traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteFailure {
    /// Traversal hit a non-container at `position`.
    Blocked {
        /// Index of the failing segment.
        position: usize,
    },
    /// A numeric segment indexed past the end of an array at `position`.
    OutOfBounds {
        /// Index of the failing segment.
        position: usize,
    },
}
