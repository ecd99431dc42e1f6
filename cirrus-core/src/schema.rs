//! Schema - typed description of resource and data-source attributes
//!
//! Every resource registers a schema describing its attribute tree:
//! cardinality (required / optional / computed), mutability
//! (force-new, sensitive), defaulting, validation predicates, and
//! diff-suppression. Validation collects all failures in order:
//! presence, per-field predicates, item bounds, then cross-field
//! rules.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::diag::{Diagnostic, Diagnostics};
use crate::value::Value;

/// Per-field validation predicate; returns a diagnostic on failure.
/// The second argument is the dotted path of the value being checked.
pub type Validator = fn(&Value, &str) -> Option<Diagnostic>;

/// Suppresses semantically-equivalent textual differences (JSON
/// normalisation, case-insensitive match). Must be pure.
pub type DiffSuppress = fn(old: &Value, new: &Value) -> bool;

/// Function-derived default
pub type DefaultFn = fn() -> Value;

/// Type of one attribute's value tree
#[derive(Debug, Clone)]
pub enum SchemaType {
    String,
    Int,
    Float,
    Bool,
    List(Box<SchemaType>),
    Set(Box<SchemaType>),
    Map(Box<SchemaType>),
    Object(BTreeMap<String, Attribute>),
}

impl SchemaType {
    pub fn type_name(&self) -> String {
        match self {
            SchemaType::String => "string".to_string(),
            SchemaType::Int => "int".to_string(),
            SchemaType::Float => "float".to_string(),
            SchemaType::Bool => "bool".to_string(),
            SchemaType::List(inner) => format!("list<{}>", inner.type_name()),
            SchemaType::Set(inner) => format!("set<{}>", inner.type_name()),
            SchemaType::Map(inner) => format!("map<{}>", inner.type_name()),
            SchemaType::Object(_) => "object".to_string(),
        }
    }

    /// Check that a value conforms to this type. Unknown conforms to
    /// everything; it stands for a value the cloud has not assigned
    /// yet.
    pub fn check(&self, value: &Value, path: &str) -> Option<Diagnostic> {
        if value.is_null() || value.is_unknown() {
            return None;
        }
        match (self, value) {
            (SchemaType::String, Value::String(_)) => None,
            (SchemaType::Int, Value::Int(_)) => None,
            (SchemaType::Float, Value::Float(_) | Value::Int(_)) => None,
            (SchemaType::Bool, Value::Bool(_)) => None,
            (SchemaType::List(inner), Value::List(items))
            | (SchemaType::Set(inner), Value::Set(items)) => items
                .iter()
                .enumerate()
                .find_map(|(i, item)| inner.check(item, &format!("{}.{}", path, i))),
            (SchemaType::Map(inner), Value::Map(entries)) => entries
                .iter()
                .find_map(|(k, v)| inner.check(v, &format!("{}.{}", path, k))),
            (SchemaType::Object(attrs), Value::Object(fields)) => {
                for (name, attr) in attrs {
                    if let Some(field) = fields.get(name)
                        && let Some(diag) = attr.kind.check(field, &format!("{}.{}", path, name))
                    {
                        return Some(diag);
                    }
                }
                None
            }
            _ => Some(
                Diagnostic::error(format!(
                    "type mismatch: expected {}, got {}",
                    self.type_name(),
                    value.type_name()
                ))
                .with_attribute(path),
            ),
        }
    }

    /// Coerce a host JSON payload into the typed tree. Arrays become
    /// lists or hash-deduplicated sets depending on the schema; objects
    /// become maps or records.
    pub fn coerce(&self, json: &serde_json::Value, path: &str) -> Result<Value, Diagnostic> {
        if json.is_null() {
            return Ok(Value::Null);
        }
        match (self, json) {
            (SchemaType::String, serde_json::Value::String(s)) => Ok(Value::String(s.clone())),
            (SchemaType::Int, serde_json::Value::Number(n)) => n
                .as_i64()
                .map(Value::Int)
                .ok_or_else(|| coercion_error("int", json, path)),
            (SchemaType::Float, serde_json::Value::Number(n)) => n
                .as_f64()
                .map(Value::Float)
                .ok_or_else(|| coercion_error("float", json, path)),
            (SchemaType::Bool, serde_json::Value::Bool(b)) => Ok(Value::Bool(*b)),
            (SchemaType::List(inner), serde_json::Value::Array(items)) => {
                let mut out = Vec::with_capacity(items.len());
                for (i, item) in items.iter().enumerate() {
                    out.push(inner.coerce(item, &format!("{}.{}", path, i))?);
                }
                Ok(Value::List(out))
            }
            (SchemaType::Set(inner), serde_json::Value::Array(items)) => {
                let mut out = Vec::with_capacity(items.len());
                for (i, item) in items.iter().enumerate() {
                    out.push(inner.coerce(item, &format!("{}.{}", path, i))?);
                }
                Ok(Value::Set(Value::dedup_set(out)))
            }
            (SchemaType::Map(inner), serde_json::Value::Object(entries)) => {
                let mut out = BTreeMap::new();
                for (key, value) in entries {
                    out.insert(key.clone(), inner.coerce(value, &format!("{}.{}", path, key))?);
                }
                Ok(Value::Map(out))
            }
            (SchemaType::Object(attrs), serde_json::Value::Object(fields)) => {
                let mut out = BTreeMap::new();
                for (name, attr) in attrs {
                    match fields.get(name) {
                        Some(field) => {
                            out.insert(
                                name.clone(),
                                attr.kind.coerce(field, &format!("{}.{}", path, name))?,
                            );
                        }
                        None => {
                            out.insert(name.clone(), Value::Null);
                        }
                    }
                }
                // Unknown fields are dropped; the host validates its
                // own config language before calling us
                Ok(Value::Object(out))
            }
            _ => Err(coercion_error(&self.type_name(), json, path)),
        }
    }
}

fn coercion_error(expected: &str, got: &serde_json::Value, path: &str) -> Diagnostic {
    let got = match got {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    };
    Diagnostic::error(format!("expected {}, got {}", expected, got)).with_attribute(path)
}

/// One attribute of a resource schema
#[derive(Debug, Clone)]
pub struct Attribute {
    pub kind: SchemaType,
    pub required: bool,
    pub optional: bool,
    pub computed: bool,
    /// Change forces delete-then-create instead of in-place update
    pub force_new: bool,
    /// Redacted from diagnostics and plan previews
    pub sensitive: bool,
    pub default: Option<Value>,
    pub default_fn: Option<DefaultFn>,
    pub validators: Vec<Validator>,
    pub diff_suppress: Option<DiffSuppress>,
    pub min_items: Option<usize>,
    pub max_items: Option<usize>,
    pub conflicts_with: Vec<String>,
    pub exactly_one_of: Vec<String>,
    pub required_with: Vec<String>,
    pub description: Option<String>,
}

impl Attribute {
    fn new(kind: SchemaType) -> Self {
        Self {
            kind,
            required: false,
            optional: false,
            computed: false,
            force_new: false,
            sensitive: false,
            default: None,
            default_fn: None,
            validators: Vec::new(),
            diff_suppress: None,
            min_items: None,
            max_items: None,
            conflicts_with: Vec::new(),
            exactly_one_of: Vec::new(),
            required_with: Vec::new(),
            description: None,
        }
    }

    pub fn required(kind: SchemaType) -> Self {
        Self {
            required: true,
            ..Self::new(kind)
        }
    }

    pub fn optional(kind: SchemaType) -> Self {
        Self {
            optional: true,
            ..Self::new(kind)
        }
    }

    pub fn computed(kind: SchemaType) -> Self {
        Self {
            computed: true,
            ..Self::new(kind)
        }
    }

    pub fn optional_computed(kind: SchemaType) -> Self {
        Self {
            optional: true,
            computed: true,
            ..Self::new(kind)
        }
    }

    /// Computed-only: never set by the user, always cloud-assigned
    pub fn is_computed_only(&self) -> bool {
        self.computed && !self.optional && !self.required
    }

    pub fn force_new(mut self) -> Self {
        self.force_new = true;
        self
    }

    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn with_default_fn(mut self, f: DefaultFn) -> Self {
        self.default_fn = Some(f);
        self
    }

    pub fn with_validator(mut self, f: Validator) -> Self {
        self.validators.push(f);
        self
    }

    pub fn with_diff_suppress(mut self, f: DiffSuppress) -> Self {
        self.diff_suppress = Some(f);
        self
    }

    pub fn with_min_items(mut self, n: usize) -> Self {
        self.min_items = Some(n);
        self
    }

    pub fn with_max_items(mut self, n: usize) -> Self {
        self.max_items = Some(n);
        self
    }

    pub fn conflicts_with(mut self, path: impl Into<String>) -> Self {
        self.conflicts_with.push(path.into());
        self
    }

    pub fn exactly_one_of(mut self, paths: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.exactly_one_of = paths.into_iter().map(Into::into).collect();
        self
    }

    pub fn required_with(mut self, path: impl Into<String>) -> Self {
        self.required_with.push(path.into());
        self
    }

    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }

    fn default_value(&self) -> Option<Value> {
        if let Some(v) = &self.default {
            return Some(v.clone());
        }
        self.default_fn.map(|f| f())
    }
}

/// Schema registration errors; these are programmer mistakes and are
/// surfaced as internal errors at registry time
#[derive(Debug, Clone, Error)]
pub enum SchemaError {
    #[error("attribute '{0}' cannot be both required and computed-only")]
    RequiredAndComputed(String),

    #[error("attribute '{0}' must be one of required, optional, or computed")]
    NoCardinality(String),

    #[error("attribute '{0}' is required and cannot carry a default")]
    RequiredWithDefault(String),

    #[error("attribute '{0}' cannot be both required and optional")]
    RequiredAndOptional(String),

    #[error("attribute '{0}': min_items {1} exceeds max_items {2}")]
    ItemBounds(String, usize, usize),
}

/// Schema of one resource or data source: the named attribute map at
/// the root of its value tree
#[derive(Debug, Clone, Default)]
pub struct ResourceSchema {
    pub attributes: BTreeMap<String, Attribute>,
}

impl ResourceSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attribute(mut self, name: impl Into<String>, attr: Attribute) -> Self {
        self.attributes.insert(name.into(), attr);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Attribute> {
        self.attributes.get(name)
    }

    /// Attribute lookup by dotted path root segment
    pub fn attribute_for_path<'a>(&'a self, path: &str) -> Option<&'a Attribute> {
        let root = path.split('.').next()?;
        self.attributes.get(root)
    }

    /// Structural invariants, checked once at registration
    pub fn check(&self) -> Result<(), SchemaError> {
        for (name, attr) in &self.attributes {
            if attr.required && attr.optional {
                return Err(SchemaError::RequiredAndOptional(name.clone()));
            }
            if attr.required && attr.computed && !attr.optional {
                return Err(SchemaError::RequiredAndComputed(name.clone()));
            }
            if !attr.required && !attr.optional && !attr.computed {
                return Err(SchemaError::NoCardinality(name.clone()));
            }
            if attr.required && (attr.default.is_some() || attr.default_fn.is_some()) {
                return Err(SchemaError::RequiredWithDefault(name.clone()));
            }
            if let (Some(min), Some(max)) = (attr.min_items, attr.max_items)
                && min > max
            {
                return Err(SchemaError::ItemBounds(name.clone(), min, max));
            }
        }
        Ok(())
    }

    /// Coerce a host JSON config into the typed tree
    pub fn coerce(&self, json: &serde_json::Value) -> Result<Value, Diagnostic> {
        SchemaType::Object(self.attributes.clone()).coerce(json, "")
    }

    /// Fill literal and function-derived defaults for absent optional
    /// fields
    pub fn apply_defaults(&self, config: &mut Value) {
        let Value::Object(fields) = config else {
            return;
        };
        for (name, attr) in &self.attributes {
            let absent = fields.get(name).map(Value::is_null).unwrap_or(true);
            if absent && let Some(default) = attr.default_value() {
                fields.insert(name.clone(), default);
            }
        }
    }

    /// Validate a coerced config. Rules run in order and every failure
    /// is collected: presence, per-field predicates, item bounds, then
    /// cross-field conflicts / exactly-one-of / required-with.
    pub fn validate(&self, config: &Value) -> Diagnostics {
        let mut diags = Diagnostics::new();
        let fields = match config {
            Value::Object(fields) => fields,
            other => {
                diags.push(Diagnostic::error(format!(
                    "resource config must be an object, got {}",
                    other.type_name()
                )));
                return diags;
            }
        };

        let present = |name: &str| -> bool {
            fields.get(name).map(|v| !v.is_null()).unwrap_or(false)
        };

        // 1. presence: required fields must be set and known
        for (name, attr) in &self.attributes {
            if attr.required {
                match fields.get(name) {
                    None | Some(Value::Null) => diags.push(
                        Diagnostic::error("required attribute is not set").with_attribute(name),
                    ),
                    Some(Value::Unknown) => diags.push(
                        Diagnostic::error("required attribute value is not yet known")
                            .with_attribute(name),
                    ),
                    Some(_) => {}
                }
            }
        }

        // 2. per-field type checks and predicates
        for (name, attr) in &self.attributes {
            let Some(value) = fields.get(name) else {
                continue;
            };
            if value.is_null() || value.is_unknown() {
                continue;
            }
            if let Some(diag) = attr.kind.check(value, name) {
                diags.push(redact(diag, attr));
                continue;
            }
            for validator in &attr.validators {
                if let Some(diag) = validator(value, name) {
                    diags.push(redact(diag, attr));
                }
            }
        }

        // 3. nested-block cardinality
        for (name, attr) in &self.attributes {
            let count = match fields.get(name) {
                Some(Value::List(items)) | Some(Value::Set(items)) => items.len(),
                _ => continue,
            };
            if let Some(min) = attr.min_items
                && count < min
            {
                diags.push(
                    Diagnostic::error(format!("requires at least {} items, got {}", min, count))
                        .with_attribute(name),
                );
            }
            if let Some(max) = attr.max_items
                && count > max
            {
                diags.push(
                    Diagnostic::error(format!("allows at most {} items, got {}", max, count))
                        .with_attribute(name),
                );
            }
        }

        // 4. cross-field rules
        for (name, attr) in &self.attributes {
            if present(name) {
                for other in &attr.conflicts_with {
                    if present(other) {
                        diags.push(
                            Diagnostic::error(format!("conflicts with '{}'", other))
                                .with_attribute(name),
                        );
                    }
                }
            }
            if !attr.exactly_one_of.is_empty() {
                let set_count = attr.exactly_one_of.iter().filter(|p| present(p)).count();
                if set_count != 1 {
                    diags.push(
                        Diagnostic::error(format!(
                            "exactly one of [{}] must be set, found {}",
                            attr.exactly_one_of.join(", "),
                            set_count
                        ))
                        .with_attribute(name),
                    );
                }
            }
            if present(name) {
                for other in &attr.required_with {
                    if !present(other) {
                        diags.push(
                            Diagnostic::error(format!("requires '{}' to also be set", other))
                                .with_attribute(name),
                        );
                    }
                }
            }
        }

        diags
    }

    /// JSON rendering of the schema for the host's GetSchema call
    pub fn to_json(&self) -> serde_json::Value {
        let attributes: serde_json::Map<String, serde_json::Value> = self
            .attributes
            .iter()
            .map(|(name, attr)| {
                (
                    name.clone(),
                    serde_json::json!({
                        "type": attr.kind.type_name(),
                        "required": attr.required,
                        "optional": attr.optional,
                        "computed": attr.computed,
                        "force_new": attr.force_new,
                        "sensitive": attr.sensitive,
                        "description": attr.description,
                    }),
                )
            })
            .collect();
        serde_json::json!({ "attributes": attributes })
    }
}

/// Sensitive values must not leak through validator messages
fn redact(mut diag: Diagnostic, attr: &Attribute) -> Diagnostic {
    if attr.sensitive {
        diag.summary = "invalid value for sensitive attribute".to_string();
        diag.detail = "(sensitive value)".to_string();
    }
    diag
}

#[cfg(test)]
mod tests {
    use super::*;

    fn positive(value: &Value, path: &str) -> Option<Diagnostic> {
        match value {
            Value::Int(n) if *n > 0 => None,
            Value::Int(n) => Some(
                Diagnostic::error(format!("must be positive, got {}", n)).with_attribute(path),
            ),
            _ => None,
        }
    }

    fn schema() -> ResourceSchema {
        ResourceSchema::new()
            .attribute("name", Attribute::required(SchemaType::String))
            .attribute(
                "size",
                Attribute::optional(SchemaType::Int)
                    .with_default(Value::Int(10))
                    .with_validator(positive),
            )
            .attribute("id", Attribute::computed(SchemaType::String))
    }

    #[test]
    fn check_rejects_required_computed_only() {
        let s = ResourceSchema::new().attribute(
            "bad",
            Attribute {
                required: true,
                ..Attribute::computed(SchemaType::String)
            },
        );
        assert!(matches!(
            s.check(),
            Err(SchemaError::RequiredAndComputed(_))
        ));
    }

    #[test]
    fn check_accepts_valid_schema() {
        assert!(schema().check().is_ok());
    }

    #[test]
    fn missing_required_is_collected() {
        let s = schema();
        let config = s.coerce(&serde_json::json!({})).unwrap();
        let diags = s.validate(&config);
        assert!(diags.has_errors());
        assert!(diags.iter().any(|d| d.attribute.as_deref() == Some("name")));
    }

    #[test]
    fn validator_failures_are_collected_not_first_only() {
        let s = ResourceSchema::new()
            .attribute("a", Attribute::optional(SchemaType::Int).with_validator(positive))
            .attribute("b", Attribute::optional(SchemaType::Int).with_validator(positive));
        let config = s.coerce(&serde_json::json!({"a": -1, "b": -2})).unwrap();
        let diags = s.validate(&config);
        assert_eq!(diags.len(), 2);
    }

    #[test]
    fn defaults_fill_absent_fields() {
        let s = schema();
        let mut config = s
            .coerce(&serde_json::json!({"name": "web"}))
            .unwrap();
        s.apply_defaults(&mut config);
        assert_eq!(config.get_path("size"), Some(&Value::Int(10)));
    }

    #[test]
    fn coerce_dedups_sets() {
        let s = ResourceSchema::new().attribute(
            "tags",
            Attribute::optional(SchemaType::Set(Box::new(SchemaType::String))),
        );
        let config = s
            .coerce(&serde_json::json!({"tags": ["a", "b", "a"]}))
            .unwrap();
        match config.get_path("tags") {
            Some(Value::Set(items)) => assert_eq!(items.len(), 2),
            other => panic!("expected set, got {:?}", other),
        }
    }

    #[test]
    fn item_bounds_are_enforced() {
        let s = ResourceSchema::new().attribute(
            "rules",
            Attribute::optional(SchemaType::List(Box::new(SchemaType::String)))
                .with_min_items(1)
                .with_max_items(2),
        );
        let too_many = s
            .coerce(&serde_json::json!({"rules": ["a", "b", "c"]}))
            .unwrap();
        assert!(s.validate(&too_many).has_errors());
        let empty = s.coerce(&serde_json::json!({"rules": []})).unwrap();
        assert!(s.validate(&empty).has_errors());
    }

    #[test]
    fn conflicts_with_both_set() {
        let s = ResourceSchema::new()
            .attribute(
                "inline",
                Attribute::optional(SchemaType::String).conflicts_with("file"),
            )
            .attribute("file", Attribute::optional(SchemaType::String));
        let config = s
            .coerce(&serde_json::json!({"inline": "x", "file": "y"}))
            .unwrap();
        assert!(s.validate(&config).has_errors());
    }

    #[test]
    fn exactly_one_of_zero_and_two() {
        let s = ResourceSchema::new()
            .attribute(
                "a",
                Attribute::optional(SchemaType::String).exactly_one_of(["a", "b"]),
            )
            .attribute("b", Attribute::optional(SchemaType::String));

        let none = s.coerce(&serde_json::json!({})).unwrap();
        assert!(s.validate(&none).has_errors());

        let both = s.coerce(&serde_json::json!({"a": "x", "b": "y"})).unwrap();
        assert!(s.validate(&both).has_errors());

        let one = s.coerce(&serde_json::json!({"a": "x"})).unwrap();
        assert!(!s.validate(&one).has_errors());
    }

    #[test]
    fn sensitive_validator_output_is_redacted() {
        fn leaky(value: &Value, path: &str) -> Option<Diagnostic> {
            Some(
                Diagnostic::error(format!("bad value {:?}", value))
                    .with_detail(format!("{:?}", value))
                    .with_attribute(path),
            )
        }
        let s = ResourceSchema::new().attribute(
            "password",
            Attribute::optional(SchemaType::String)
                .sensitive()
                .with_validator(leaky),
        );
        let config = s
            .coerce(&serde_json::json!({"password": "hunter2"}))
            .unwrap();
        let diags = s.validate(&config);
        assert!(diags.has_errors());
        for d in diags.iter() {
            assert!(!d.summary.contains("hunter2"));
            assert!(!d.detail.contains("hunter2"));
        }
    }

    #[test]
    fn type_mismatch_is_a_diagnostic() {
        let s = schema();
        let err = s.coerce(&serde_json::json!({"name": 42}));
        assert!(err.is_err());
    }
}
