//! StateContainer - in-memory observed and desired state of one
//! resource instance
//!
//! Two parallel trees conforming to the resource schema: prior (last
//! observed) and current (being constructed by the running operation).
//! Reads resolve against current with fall-through to prior; writes
//! always go to current. A container lives for exactly one operation.

use std::sync::Arc;

use crate::diff::ResourceDiff;
use crate::error::{EngineError, EngineResult};
use crate::schema::ResourceSchema;
use crate::value::Value;

/// Lifecycle phase of the running operation. Carried explicitly so
/// nested reads invoked from Update never masquerade as new-resource
/// reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Plan,
    Create,
    Read,
    Update,
    Delete,
    Import,
}

#[derive(Debug, Clone)]
pub struct StateContainer {
    schema: Arc<ResourceSchema>,
    prior: Value,
    current: Value,
    id: String,
    phase: Phase,
    diff: Option<ResourceDiff>,
}

impl StateContainer {
    pub fn new(
        schema: Arc<ResourceSchema>,
        prior: Value,
        current: Value,
        id: impl Into<String>,
        phase: Phase,
    ) -> Self {
        Self {
            schema,
            prior,
            current,
            id: id.into(),
            phase,
            diff: None,
        }
    }

    /// Attach the computed diff; `has_change` consults it during
    /// Update
    pub fn with_diff(mut self, diff: ResourceDiff) -> Self {
        self.diff = Some(diff);
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// True only inside the dispatcher's Create path, including the
    /// hydration read that follows a create
    pub fn is_new_resource(&self) -> bool {
        self.phase == Phase::Create
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Set the primary identifier. Setting the empty string marks the
    /// resource absent and tells the host to drop it from state.
    pub fn set_id(&mut self, id: impl Into<String>) {
        self.id = id.into();
    }

    pub fn is_absent(&self) -> bool {
        self.id.is_empty()
    }

    /// Read a value: current tree first, prior as fall-through
    pub fn get(&self, path: &str) -> Value {
        self.current
            .get_path(path)
            .filter(|v| !v.is_null())
            .or_else(|| self.prior.get_path(path))
            .cloned()
            .unwrap_or(Value::Null)
    }

    /// Returns the value only when it is present and non-zero. Absent
    /// and present-but-zero are indistinguishable here; callers that
    /// need the difference consult the diff.
    pub fn get_ok(&self, path: &str) -> Option<Value> {
        let value = self.get(path);
        if value.is_zero() { None } else { Some(value) }
    }

    /// Write to the current tree. The root segment must exist in the
    /// schema; anything else is a programmer error.
    pub fn set(&mut self, path: &str, value: Value) -> EngineResult<()> {
        let root = path.split('.').next().unwrap_or(path);
        if self.schema.get(root).is_none() {
            return Err(EngineError::internal(format!(
                "set of '{}' which is not in the schema",
                path
            )));
        }
        self.current
            .set_path(path, value)
            .map_err(EngineError::internal)
    }

    /// Old and new values for a path: prior versus current
    pub fn get_change(&self, path: &str) -> (Value, Value) {
        let old = self.prior.get_path(path).cloned().unwrap_or(Value::Null);
        let new = self
            .current
            .get_path(path)
            .cloned()
            .unwrap_or(Value::Null);
        (old, new)
    }

    /// Whether the running operation is changing this path.
    ///
    /// During Update this is answered by the computed diff. During
    /// Create every user-set field reads as changed and computed-only
    /// fields do not. Elsewhere it falls back to a prior/current
    /// comparison.
    pub fn has_change(&self, path: &str) -> bool {
        match self.phase {
            Phase::Create => {
                let root = path.split('.').next().unwrap_or(path);
                match self.schema.get(root) {
                    Some(attr) if attr.is_computed_only() => false,
                    Some(_) => !self
                        .current
                        .get_path(path)
                        .map(Value::is_null)
                        .unwrap_or(true),
                    None => false,
                }
            }
            _ => match &self.diff {
                Some(diff) => diff.contains(path),
                None => {
                    let (old, new) = self.get_change(path);
                    old != new
                }
            },
        }
    }

    pub fn schema(&self) -> &ResourceSchema {
        &self.schema
    }

    pub fn prior(&self) -> &Value {
        &self.prior
    }

    pub fn current(&self) -> &Value {
        &self.current
    }

    /// Consume the container, yielding the identity and the tree the
    /// operation produced
    pub fn into_parts(self) -> (String, Value) {
        (self.id, self.current)
    }
}
