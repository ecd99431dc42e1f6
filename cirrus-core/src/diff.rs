//! Diff - compare prior and planned trees to produce a typed change
//! list
//!
//! Lists diff positionally; sets diff by element hash, so a changed
//! element is a remove-plus-add at that element, never an in-place
//! edit. A diff-suppress function may erase an entry. CustomizeDiff
//! hooks run after the initial diff through `DiffModifier`.

use std::collections::BTreeSet;

use crate::diag::Diagnostic;
use crate::schema::{Attribute, ResourceSchema};
use crate::value::Value;

/// One path-addressed change
#[derive(Debug, Clone, PartialEq)]
pub struct DiffEntry {
    pub path: String,
    pub old: Value,
    pub new: Value,
    pub requires_replace: bool,
}

/// The full change list between prior and planned state
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceDiff {
    pub entries: Vec<DiffEntry>,
}

impl ResourceDiff {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the diff touches this path or anything beneath it
    pub fn contains(&self, path: &str) -> bool {
        self.entries.iter().any(|e| {
            e.path == path
                || e.path
                    .strip_prefix(path)
                    .map(|rest| rest.starts_with('.'))
                    .unwrap_or(false)
        })
    }

    pub fn get(&self, path: &str) -> Option<&DiffEntry> {
        self.entries.iter().find(|e| e.path == path)
    }

    pub fn requires_replace(&self) -> bool {
        self.entries.iter().any(|e| e.requires_replace)
    }

    /// Root attribute paths that force delete-then-create, deduplicated
    pub fn replace_paths(&self) -> Vec<String> {
        let mut paths = BTreeSet::new();
        for entry in &self.entries {
            if entry.requires_replace {
                let root = entry.path.split('.').next().unwrap_or(&entry.path);
                paths.insert(root.to_string());
            }
        }
        paths.into_iter().collect()
    }

    /// Entries that can be applied in place
    pub fn updatable_entries(&self) -> impl Iterator<Item = &DiffEntry> {
        self.entries.iter().filter(|e| !e.requires_replace)
    }
}

/// Compute the diff between two trees conforming to `schema`.
///
/// Computed attributes left null in the planned tree keep their prior
/// value; the cloud owns them.
pub fn compute(schema: &ResourceSchema, prior: &Value, planned: &Value) -> ResourceDiff {
    let mut diff = ResourceDiff::default();
    for (name, attr) in &schema.attributes {
        let old = prior.get_path(name).cloned().unwrap_or(Value::Null);
        let mut new = planned.get_path(name).cloned().unwrap_or(Value::Null);
        if attr.computed && new.is_null() && !old.is_null() {
            new = old.clone();
        }
        diff_value(attr, name, &old, &new, &mut diff);
    }
    diff
}

fn suppressed(attr: &Attribute, old: &Value, new: &Value) -> bool {
    if old.is_unknown() || new.is_unknown() {
        return false;
    }
    attr.diff_suppress.map(|f| f(old, new)).unwrap_or(false)
}

fn diff_value(attr: &Attribute, path: &str, old: &Value, new: &Value, diff: &mut ResourceDiff) {
    if old == new || suppressed(attr, old, new) {
        return;
    }
    match (old, new) {
        (Value::Set(old_items), Value::Set(new_items)) => {
            diff_set(attr, path, old_items, new_items, diff);
        }
        (Value::List(old_items), Value::List(new_items)) => {
            let len = old_items.len().max(new_items.len());
            for i in 0..len {
                let o = old_items.get(i).cloned().unwrap_or(Value::Null);
                let n = new_items.get(i).cloned().unwrap_or(Value::Null);
                diff_value(attr, &format!("{}.{}", path, i), &o, &n, diff);
            }
        }
        (Value::Map(old_entries), Value::Map(new_entries))
        | (Value::Object(old_entries), Value::Object(new_entries)) => {
            let keys: BTreeSet<&String> = old_entries.keys().chain(new_entries.keys()).collect();
            for key in keys {
                let o = old_entries.get(key).cloned().unwrap_or(Value::Null);
                let n = new_entries.get(key).cloned().unwrap_or(Value::Null);
                diff_value(attr, &format!("{}.{}", path, key), &o, &n, diff);
            }
        }
        _ => {
            diff.entries.push(DiffEntry {
                path: path.to_string(),
                old: old.clone(),
                new: new.clone(),
                requires_replace: attr.force_new,
            });
        }
    }
}

/// Hash-based set diff: elements are identified by value hash, so the
/// entries are element removals and additions keyed by hash
fn diff_set(
    attr: &Attribute,
    path: &str,
    old_items: &[Value],
    new_items: &[Value],
    diff: &mut ResourceDiff,
) {
    let old_hashes: Vec<u64> = old_items.iter().map(Value::element_hash).collect();
    let new_hashes: Vec<u64> = new_items.iter().map(Value::element_hash).collect();

    for (item, hash) in old_items.iter().zip(&old_hashes) {
        if !new_hashes.contains(hash) {
            diff.entries.push(DiffEntry {
                path: format!("{}.{}", path, hash),
                old: item.clone(),
                new: Value::Null,
                requires_replace: attr.force_new,
            });
        }
    }
    for (item, hash) in new_items.iter().zip(&new_hashes) {
        if !old_hashes.contains(hash) {
            diff.entries.push(DiffEntry {
                path: format!("{}.{}", path, hash),
                old: Value::Null,
                new: item.clone(),
                requires_replace: attr.force_new,
            });
        }
    }
}

/// Plan-time view handed to a resource's CustomizeDiff hook.
///
/// The hook may rewrite planned values, mark computed attributes as
/// unknown, force replacement, or clear entries. Contradictory edits
/// fail with a diagnostic when `finish` runs.
pub struct DiffModifier<'a> {
    schema: &'a ResourceSchema,
    prior: &'a Value,
    planned: &'a mut Value,
    diff: &'a mut ResourceDiff,
    cleared: BTreeSet<String>,
    rewritten: BTreeSet<String>,
}

impl<'a> DiffModifier<'a> {
    pub fn new(
        schema: &'a ResourceSchema,
        prior: &'a Value,
        planned: &'a mut Value,
        diff: &'a mut ResourceDiff,
    ) -> Self {
        Self {
            schema,
            prior,
            planned,
            diff,
            cleared: BTreeSet::new(),
            rewritten: BTreeSet::new(),
        }
    }

    pub fn get(&self, path: &str) -> Value {
        self.planned
            .get_path(path)
            .or_else(|| self.prior.get_path(path))
            .cloned()
            .unwrap_or(Value::Null)
    }

    pub fn get_change(&self, path: &str) -> (Value, Value) {
        let old = self.prior.get_path(path).cloned().unwrap_or(Value::Null);
        let new = self.planned.get_path(path).cloned().unwrap_or(Value::Null);
        (old, new)
    }

    pub fn has_change(&self, path: &str) -> bool {
        self.diff.contains(path)
    }

    /// Replace the planned value at an attribute path
    pub fn set_new(&mut self, path: &str, value: Value) -> Result<(), Diagnostic> {
        let attr = self.lookup(path)?;
        if self.cleared.contains(path) {
            return Err(Diagnostic::error(
                "customize-diff contradiction: attribute was cleared and then rewritten",
            )
            .with_attribute(path));
        }
        let requires_replace = attr.force_new;
        self.planned
            .set_path(path, value.clone())
            .map_err(|e| Diagnostic::error(e).with_attribute(path))?;
        let old = self.prior.get_path(path).cloned().unwrap_or(Value::Null);
        self.diff.entries.retain(|e| e.path != path);
        if old != value {
            self.diff.entries.push(DiffEntry {
                path: path.to_string(),
                old,
                new: value,
                requires_replace,
            });
        }
        self.rewritten.insert(path.to_string());
        Ok(())
    }

    /// Mark a computed attribute as known-after-apply
    pub fn set_new_computed(&mut self, path: &str) -> Result<(), Diagnostic> {
        let attr = self.lookup(path)?;
        if !attr.computed {
            return Err(Diagnostic::error(
                "customize-diff contradiction: set_new_computed on a non-computed attribute",
            )
            .with_attribute(path));
        }
        self.set_new(path, Value::Unknown)
    }

    /// Escalate every change under this path to requires-replace
    pub fn force_new(&mut self, path: &str) -> Result<(), Diagnostic> {
        self.lookup(path)?;
        if self.cleared.contains(path) {
            return Err(Diagnostic::error(
                "customize-diff contradiction: attribute was cleared and then forced new",
            )
            .with_attribute(path));
        }
        for entry in &mut self.diff.entries {
            if entry.path == path || entry.path.starts_with(&format!("{}.", path)) {
                entry.requires_replace = true;
            }
        }
        Ok(())
    }

    /// Drop all diff entries under this path and restore the prior
    /// value in the planned tree
    pub fn clear(&mut self, path: &str) -> Result<(), Diagnostic> {
        self.lookup(path)?;
        if self.rewritten.contains(path) {
            return Err(Diagnostic::error(
                "customize-diff contradiction: attribute was rewritten and then cleared",
            )
            .with_attribute(path));
        }
        self.diff
            .entries
            .retain(|e| e.path != path && !e.path.starts_with(&format!("{}.", path)));
        let old = self.prior.get_path(path).cloned().unwrap_or(Value::Null);
        self.planned
            .set_path(path, old)
            .map_err(|e| Diagnostic::error(e).with_attribute(path))?;
        self.cleared.insert(path.to_string());
        Ok(())
    }

    fn lookup(&self, path: &str) -> Result<&Attribute, Diagnostic> {
        self.schema.attribute_for_path(path).ok_or_else(|| {
            Diagnostic::error("customize-diff refers to an attribute not in the schema")
                .with_attribute(path)
        })
    }
}
