//! Diff results reported by providers.
//!
//! A provider's `Diff` either reports a coarse changed/unchanged verdict
//! with the keys involved, or a detailed per-property-path diff. When only
//! the coarse form is available, [`detailed_diff_from_object_diff`]
//! synthesizes the detailed form from a structural diff of the old and new
//! property maps.

use std::collections::BTreeMap;

use crate::property::diff::{ArrayDiff, ObjectDiff, ValueDiff};
use crate::property::path::PropertyPath;
use crate::property::PropertyKey;

/// Whether a diff found changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiffChanges {
    /// The provider could not determine whether there are changes.
    #[default]
    Unknown,
    /// No changes.
    None,
    /// There are changes.
    Some,
}

/// The kind of change recorded for a single property path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffKind {
    Add,
    AddReplace,
    Delete,
    DeleteReplace,
    Update,
    UpdateReplace,
}

impl DiffKind {
    /// The kind that describes the same change applied in reverse.
    pub fn invert(self) -> DiffKind {
        match self {
            DiffKind::Add => DiffKind::Delete,
            DiffKind::AddReplace => DiffKind::DeleteReplace,
            DiffKind::Delete => DiffKind::Add,
            DiffKind::DeleteReplace => DiffKind::AddReplace,
            DiffKind::Update => DiffKind::Update,
            DiffKind::UpdateReplace => DiffKind::UpdateReplace,
        }
    }

    /// The replacement-flavored version of this kind. Idempotent.
    pub fn as_replace(self) -> DiffKind {
        match self {
            DiffKind::Add | DiffKind::AddReplace => DiffKind::AddReplace,
            DiffKind::Delete | DiffKind::DeleteReplace => DiffKind::DeleteReplace,
            DiffKind::Update | DiffKind::UpdateReplace => DiffKind::UpdateReplace,
        }
    }

    pub fn is_replace(self) -> bool {
        matches!(
            self,
            DiffKind::AddReplace | DiffKind::DeleteReplace | DiffKind::UpdateReplace
        )
    }
}

/// The change recorded for a single property path in a detailed diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertyDiff {
    pub kind: DiffKind,
    /// True if the diff compares old inputs against new inputs rather than
    /// old state against new inputs.
    pub input_diff: bool,
}

/// The result of diffing a resource.
#[derive(Debug, Clone, Default)]
pub struct DiffResult {
    pub changes: DiffChanges,
    /// Keys whose change requires replacing the resource.
    pub replace_keys: Vec<PropertyKey>,
    /// Keys guaranteed not to change.
    pub stable_keys: Vec<PropertyKey>,
    /// Keys that changed.
    pub changed_keys: Vec<PropertyKey>,
    /// The detailed diff, keyed by rendered property path.
    pub detailed_diff: BTreeMap<String, PropertyDiff>,
    /// True if the resource must be deleted before its replacement is
    /// created.
    pub delete_before_replace: bool,
}

impl DiffResult {
    /// True if applying this diff requires replacing the resource.
    pub fn replace(&self) -> bool {
        self.detailed_diff.values().any(|d| d.kind.is_replace()) || !self.replace_keys.is_empty()
    }
}

/// Synthesize a detailed diff from a structural object diff.
pub fn detailed_diff_from_object_diff(
    diff: &ObjectDiff,
    input_diff: bool,
) -> BTreeMap<String, PropertyDiff> {
    let mut out = BTreeMap::new();
    let mut path = PropertyPath::new();
    add_object_diff(&mut path, diff, input_diff, &mut out);
    out
}

fn record(
    path: &PropertyPath,
    kind: DiffKind,
    input_diff: bool,
    out: &mut BTreeMap<String, PropertyDiff>,
) {
    out.insert(path.to_string(), PropertyDiff { kind, input_diff });
}

fn add_object_diff(
    path: &mut PropertyPath,
    diff: &ObjectDiff,
    input_diff: bool,
    out: &mut BTreeMap<String, PropertyDiff>,
) {
    for key in diff.adds.keys() {
        path.push_key(key.as_str());
        record(path, DiffKind::Add, input_diff, out);
        path.pop();
    }
    for key in diff.deletes.keys() {
        path.push_key(key.as_str());
        record(path, DiffKind::Delete, input_diff, out);
        path.pop();
    }
    for (key, vd) in &diff.updates {
        path.push_key(key.as_str());
        add_value_diff(path, vd, input_diff, out);
        path.pop();
    }
}

fn add_array_diff(
    path: &mut PropertyPath,
    diff: &ArrayDiff,
    input_diff: bool,
    out: &mut BTreeMap<String, PropertyDiff>,
) {
    for index in diff.adds.keys() {
        path.push_index(*index);
        record(path, DiffKind::Add, input_diff, out);
        path.pop();
    }
    for index in diff.deletes.keys() {
        path.push_index(*index);
        record(path, DiffKind::Delete, input_diff, out);
        path.pop();
    }
    for (index, vd) in &diff.updates {
        path.push_index(*index);
        add_value_diff(path, vd, input_diff, out);
        path.pop();
    }
}

fn add_value_diff(
    path: &mut PropertyPath,
    vd: &ValueDiff,
    input_diff: bool,
    out: &mut BTreeMap<String, PropertyDiff>,
) {
    if let Some(object) = &vd.object {
        add_object_diff(path, object, input_diff, out);
    } else if let Some(array) = &vd.array {
        add_array_diff(path, array, input_diff, out);
    } else {
        record(path, DiffKind::Update, input_diff, out);
    }
}
