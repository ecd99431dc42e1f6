//! Value - the tagged-union attribute tree
//!
//! Both trees of a state container (prior and planned/current) are
//! built from this type. `Unknown` marks a value that will only be
//! determined after apply, such as a server-assigned identifier.
//! Coercion between host JSON and this tree happens at the boundary,
//! guided by the registered schema.

use std::collections::BTreeMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Attribute value of a resource
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    /// Ordered sequence; diffed positionally
    List(Vec<Value>),
    /// Unordered collection de-duplicated by element hash
    Set(Vec<Value>),
    /// String-keyed mapping
    Map(BTreeMap<String, Value>),
    /// Nested record with named fields
    Object(BTreeMap<String, Value>),
    /// Known only after apply
    Unknown,
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Set(_) => "set",
            Value::Map(_) => "map",
            Value::Object(_) => "object",
            Value::Unknown => "unknown",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Value::Unknown)
    }

    /// Zero values: empty string, 0, 0.0, false, empty containers.
    /// `GetOk` treats absent and zero the same way.
    pub fn is_zero(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Bool(b) => !b,
            Value::Int(n) => *n == 0,
            Value::Float(f) => *f == 0.0,
            Value::String(s) => s.is_empty(),
            Value::List(items) | Value::Set(items) => items.is_empty(),
            Value::Map(entries) | Value::Object(entries) => entries.is_empty(),
            Value::Unknown => false,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Resolve a dotted path against this tree. Numeric segments index
    /// into lists and sets; other segments address map keys or object
    /// fields. Returns `None` when any step does not resolve.
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        if path.is_empty() {
            return Some(self);
        }
        let mut node = self;
        for step in path.split('.') {
            node = match node {
                Value::Object(fields) => fields.get(step)?,
                Value::Map(entries) => entries.get(step)?,
                Value::List(items) | Value::Set(items) => {
                    items.get(step.parse::<usize>().ok()?)?
                }
                _ => return None,
            };
        }
        Some(node)
    }

    /// Write a value at a dotted path, creating intermediate objects
    /// for missing steps. Appending to a list is allowed when the
    /// index equals the current length.
    pub fn set_path(&mut self, path: &str, value: Value) -> Result<(), String> {
        if path.is_empty() {
            *self = value;
            return Ok(());
        }
        let mut node = self;
        let steps: Vec<&str> = path.split('.').collect();
        for (i, step) in steps.iter().enumerate() {
            let last = i == steps.len() - 1;
            if node.is_null() {
                *node = Value::Object(BTreeMap::new());
            }
            match node {
                Value::Object(fields) | Value::Map(fields) => {
                    if last {
                        fields.insert((*step).to_string(), value);
                        return Ok(());
                    }
                    node = fields
                        .entry((*step).to_string())
                        .or_insert_with(|| Value::Object(BTreeMap::new()));
                }
                Value::List(items) | Value::Set(items) => {
                    let idx: usize = step
                        .parse()
                        .map_err(|_| format!("'{}' is not a valid index in '{}'", step, path))?;
                    if last {
                        if idx == items.len() {
                            items.push(value);
                        } else if idx < items.len() {
                            items[idx] = value;
                        } else {
                            return Err(format!("index {} out of bounds in '{}'", idx, path));
                        }
                        return Ok(());
                    }
                    node = items
                        .get_mut(idx)
                        .ok_or_else(|| format!("index {} out of bounds in '{}'", idx, path))?;
                }
                other => {
                    return Err(format!(
                        "cannot descend into {} at step '{}' of '{}'",
                        other.type_name(),
                        step,
                        path
                    ));
                }
            }
        }
        Ok(())
    }

    /// Hash used to identify set elements. Lexical ordering of a set is
    /// not meaningful; identity is this hash of the element value.
    pub fn element_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.feed_hash(&mut hasher);
        hasher.finish()
    }

    fn feed_hash(&self, hasher: &mut DefaultHasher) {
        std::mem::discriminant(self).hash(hasher);
        match self {
            Value::Null | Value::Unknown => {}
            Value::Bool(b) => b.hash(hasher),
            Value::Int(n) => n.hash(hasher),
            Value::Float(f) => f.to_bits().hash(hasher),
            Value::String(s) => s.hash(hasher),
            Value::List(items) => {
                for item in items {
                    item.feed_hash(hasher);
                }
            }
            Value::Set(items) => {
                // Order-independent combination of element hashes
                let mut combined: u64 = 0;
                for item in items {
                    combined = combined.wrapping_add(item.element_hash());
                }
                combined.hash(hasher);
            }
            Value::Map(entries) | Value::Object(entries) => {
                for (key, value) in entries {
                    key.hash(hasher);
                    value.feed_hash(hasher);
                }
            }
        }
    }

    /// Drop duplicate set elements, keeping first occurrence
    pub fn dedup_set(items: Vec<Value>) -> Vec<Value> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            if seen.insert(item.element_hash()) {
                out.push(item);
            }
        }
        out
    }

    /// Serialize for the host. `Unknown` renders as JSON null; the
    /// planned-change response carries unknown paths separately.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null | Value::Unknown => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(n) => serde_json::Value::Number((*n).into()),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::List(items) | Value::Set(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Map(entries) | Value::Object(entries) => serde_json::Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }

    /// Collect dotted paths of every `Unknown` leaf under this tree
    pub fn unknown_paths(&self) -> Vec<String> {
        let mut paths = Vec::new();
        self.collect_unknown("", &mut paths);
        paths
    }

    fn collect_unknown(&self, prefix: &str, paths: &mut Vec<String>) {
        match self {
            Value::Unknown => paths.push(prefix.to_string()),
            Value::List(items) | Value::Set(items) => {
                for (i, item) in items.iter().enumerate() {
                    item.collect_unknown(&join(prefix, &i.to_string()), paths);
                }
            }
            Value::Map(entries) | Value::Object(entries) => {
                for (key, value) in entries {
                    value.collect_unknown(&join(prefix, key), paths);
                }
            }
            _ => {}
        }
    }

    /// Replace every `Unknown` with `Null`, in place. Resource
    /// functions see unset computed attributes as null during apply.
    pub fn resolve_unknowns(&mut self) {
        match self {
            Value::Unknown => *self = Value::Null,
            Value::List(items) | Value::Set(items) => {
                for item in items {
                    item.resolve_unknowns();
                }
            }
            Value::Map(entries) | Value::Object(entries) => {
                for value in entries.values_mut() {
                    value.resolve_unknowns();
                }
            }
            _ => {}
        }
    }
}

fn join(prefix: &str, step: &str) -> String {
    if prefix.is_empty() {
        step.to_string()
    } else {
        format!("{}.{}", prefix, step)
    }
}

/// Empty object tree, the shape every resource state starts from
pub fn empty_object() -> Value {
    Value::Object(BTreeMap::new())
}
