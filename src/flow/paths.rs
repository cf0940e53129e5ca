//! Field-path algebra over step payloads
//!
//! A field path is a dotted identifier whose first segment names the step
//! (`expenses.materials`). Step payloads stay opaque JSON; these helpers only
//! read, write and diff them by path.

use crate::error::{FlowError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Dotted path locating a value inside a flow's step data
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FieldPath(String);

impl FieldPath {
    /// Parse and validate a dotted path
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.split('.').all(valid_segment) {
            Ok(Self(raw.to_string()))
        } else {
            Err(FlowError::validation(format!("malformed field path '{}'", raw)))
        }
    }

    /// Path for a whole step payload
    pub fn step(step_id: &str) -> Result<Self> {
        Self::parse(step_id)
    }

    /// Append one segment
    pub fn child(&self, segment: &str) -> Result<Self> {
        if !valid_segment(segment) {
            return Err(FlowError::validation(format!(
                "malformed field path segment '{}' under '{}'",
                segment, self.0
            )));
        }
        Ok(Self(format!("{}.{}", self.0, segment)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('.')
    }

    /// The step this path belongs to
    pub fn step_id(&self) -> &str {
        self.0.split('.').next().unwrap_or_default()
    }

    /// Segments below the step, empty for a whole-step path
    pub fn relative_segments(&self) -> Vec<&str> {
        self.segments().skip(1).collect()
    }

    /// Segment-wise prefix test (`a.b` is a prefix of `a.b.c`, not of `a.bc`)
    pub fn is_prefix_of(&self, other: &FieldPath) -> bool {
        other.0 == self.0
            || (other.0.len() > self.0.len()
                && other.0.starts_with(&self.0)
                && other.0.as_bytes()[self.0.len()] == b'.')
    }

    /// Two paths contend for the same data when one contains the other
    pub fn overlaps(&self, other: &FieldPath) -> bool {
        self.is_prefix_of(other) || other.is_prefix_of(self)
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for FieldPath {
    type Error = FlowError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<FieldPath> for String {
    fn from(path: FieldPath) -> Self {
        path.0
    }
}

fn valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Step data keyed by step id
pub type StepData = BTreeMap<String, Value>;

/// Leaf paths touched by a step patch, prefixed with the step id
///
/// Nested objects recurse; every other value (null, scalars, arrays, empty
/// objects) is a leaf.
pub fn patch_leaves(step_id: &str, patch: &Map<String, Value>) -> Result<Vec<FieldPath>> {
    let root = FieldPath::step(step_id)?;
    let mut leaves = Vec::new();
    collect_leaves(&root, patch, &mut leaves)?;
    Ok(leaves)
}

fn collect_leaves(prefix: &FieldPath, patch: &Map<String, Value>, out: &mut Vec<FieldPath>) -> Result<()> {
    for (key, value) in patch {
        let path = prefix.child(key)?;
        match value {
            Value::Object(inner) if !inner.is_empty() => collect_leaves(&path, inner, out)?,
            _ => out.push(path),
        }
    }
    Ok(())
}

/// Apply a patch to a JSON value in place (null removes, objects recurse)
pub fn apply_patch(target: &mut Value, patch: &Map<String, Value>) {
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    let Value::Object(fields) = target else {
        return;
    };
    for (key, value) in patch {
        match value {
            Value::Null => {
                fields.remove(key);
            }
            Value::Object(inner) if !inner.is_empty() => {
                let slot = fields
                    .entry(key.clone())
                    .or_insert_with(|| Value::Object(Map::new()));
                apply_patch(slot, inner);
            }
            other => {
                fields.insert(key.clone(), other.clone());
            }
        }
    }
}

/// Apply a step patch to the step data map
pub fn apply_step_patch(step_data: &mut StepData, step_id: &str, patch: &Map<String, Value>) {
    let payload = step_data
        .entry(step_id.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    apply_patch(payload, patch);
}

/// Resolve a path against a JSON value by segments
pub fn lookup<'a>(root: &'a Value, segments: &[&str]) -> Option<&'a Value> {
    segments
        .iter()
        .try_fold(root, |current, segment| current.as_object()?.get(*segment))
}

/// Read a field from step data
pub fn read_field<'a>(step_data: &'a StepData, path: &FieldPath) -> Option<&'a Value> {
    let payload = step_data.get(path.step_id())?;
    lookup(payload, &path.relative_segments())
}

/// Current value at `path`, `null` when absent
pub fn read_field_or_null(step_data: &StepData, path: &FieldPath) -> Value {
    read_field(step_data, path).cloned().unwrap_or(Value::Null)
}

/// Overwrite a field in step data; `null` removes it
pub fn write_field(step_data: &mut StepData, path: &FieldPath, value: Value) {
    let relative = path.relative_segments();
    if relative.is_empty() {
        if value.is_null() {
            step_data.remove(path.step_id());
        } else {
            step_data.insert(path.step_id().to_string(), value);
        }
        return;
    }
    let payload = step_data
        .entry(path.step_id().to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    assign(payload, &relative, value);
}

fn assign(target: &mut Value, segments: &[&str], value: Value) {
    let Some((last, parents)) = segments.split_last() else {
        *target = value;
        return;
    };
    let mut current = target;
    for segment in parents {
        if !current.is_object() {
            if value.is_null() {
                return;
            }
            *current = Value::Object(Map::new());
        }
        let Value::Object(fields) = current else {
            return;
        };
        current = fields
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if !current.is_object() {
        if value.is_null() {
            return;
        }
        *current = Value::Object(Map::new());
    }
    if let Value::Object(fields) = current {
        if value.is_null() {
            fields.remove(*last);
        } else {
            fields.insert(last.to_string(), value);
        }
    }
}

/// Fold a newer patch into an older one; newer values win
pub fn merge_patches(older: &mut Map<String, Value>, newer: &Map<String, Value>) {
    for (key, value) in newer {
        match (older.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(inner)) if !inner.is_empty() => {
                merge_patches(existing, inner);
            }
            _ => {
                older.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Remove the subtree at `segments` from a patch, pruning emptied parents
///
/// Returns true when something was removed.
pub fn remove_from_patch(patch: &mut Map<String, Value>, segments: &[&str]) -> bool {
    let Some((first, rest)) = segments.split_first() else {
        let had_entries = !patch.is_empty();
        patch.clear();
        return had_entries;
    };
    if rest.is_empty() {
        return patch.remove(*first).is_some();
    }
    let (removed, emptied) = match patch.get_mut(*first) {
        Some(Value::Object(inner)) => {
            let removed = remove_from_patch(inner, rest);
            (removed, inner.is_empty())
        }
        _ => (false, false),
    };
    if removed && emptied {
        patch.remove(*first);
    }
    removed
}

/// Move the parts of a step patch that overlap any of `paths` into a new patch
///
/// Paths of other steps are ignored. Nesting and explicit nulls are kept.
pub fn take_from_patch(patch: &mut Map<String, Value>, step_id: &str, paths: &[FieldPath]) -> Map<String, Value> {
    let segments: Vec<Vec<&str>> = paths
        .iter()
        .filter(|path| path.step_id() == step_id)
        .map(|path| path.relative_segments())
        .collect();
    if segments.is_empty() {
        return Map::new();
    }
    let targets: Vec<&[&str]> = segments.iter().map(Vec::as_slice).collect();
    take_matching(patch, &targets)
}

fn take_matching(patch: &mut Map<String, Value>, targets: &[&[&str]]) -> Map<String, Value> {
    if targets.iter().any(|target| target.is_empty()) {
        return std::mem::take(patch);
    }
    let mut taken = Map::new();
    let keys: Vec<String> = patch.keys().cloned().collect();
    for key in keys {
        let below: Vec<&[&str]> = targets
            .iter()
            .copied()
            .filter(|target| target[0] == key)
            .map(|target| &target[1..])
            .collect();
        if below.is_empty() {
            continue;
        }
        let whole = below.iter().any(|target| target.is_empty());
        let nested = match patch.get_mut(&key) {
            Some(Value::Object(inner)) if !whole && !inner.is_empty() => {
                let nested = take_matching(inner, &below);
                Some((nested, inner.is_empty()))
            }
            _ => None,
        };
        match nested {
            Some((nested, emptied)) => {
                if emptied {
                    patch.remove(&key);
                }
                if !nested.is_empty() {
                    taken.insert(key, Value::Object(nested));
                }
            }
            // A leaf at or above a target contends for the whole target
            None => {
                if let Some(value) = patch.remove(&key) {
                    taken.insert(key, value);
                }
            }
        }
    }
    taken
}
