//! Registry - resource and data source definitions by type name
//!
//! Populated once at provider startup, then read concurrently by the
//! dispatcher. Registration validates the schema so a malformed
//! definition fails fast instead of at plan time.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{EngineError, EngineResult};
use crate::resource::{DataSourceDefinition, ResourceDefinition};

pub struct Registry<M> {
    resources: RwLock<HashMap<String, Arc<ResourceDefinition<M>>>>,
    data_sources: RwLock<HashMap<String, Arc<DataSourceDefinition<M>>>>,
}

impl<M> Default for Registry<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> Registry<M> {
    pub fn new() -> Self {
        Self {
            resources: RwLock::new(HashMap::new()),
            data_sources: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, definition: ResourceDefinition<M>) -> EngineResult<()> {
        definition
            .schema()
            .check()
            .map_err(|e| EngineError::internal(format!("{}: {}", definition.type_name(), e)))?;
        let mut resources = self.resources.write().expect("registry lock poisoned");
        if resources.contains_key(definition.type_name()) {
            return Err(EngineError::internal(format!(
                "resource type '{}' registered twice",
                definition.type_name()
            )));
        }
        resources.insert(definition.type_name().to_string(), Arc::new(definition));
        Ok(())
    }

    pub fn register_data_source(&self, definition: DataSourceDefinition<M>) -> EngineResult<()> {
        definition
            .schema()
            .check()
            .map_err(|e| EngineError::internal(format!("{}: {}", definition.type_name(), e)))?;
        let mut data_sources = self.data_sources.write().expect("registry lock poisoned");
        if data_sources.contains_key(definition.type_name()) {
            return Err(EngineError::internal(format!(
                "data source type '{}' registered twice",
                definition.type_name()
            )));
        }
        data_sources.insert(definition.type_name().to_string(), Arc::new(definition));
        Ok(())
    }

    pub fn lookup(&self, type_name: &str) -> EngineResult<Arc<ResourceDefinition<M>>> {
        self.resources
            .read()
            .expect("registry lock poisoned")
            .get(type_name)
            .cloned()
            .ok_or_else(|| {
                EngineError::internal(format!("unknown resource type '{}'", type_name))
            })
    }

    pub fn lookup_data_source(&self, type_name: &str) -> EngineResult<Arc<DataSourceDefinition<M>>> {
        self.data_sources
            .read()
            .expect("registry lock poisoned")
            .get(type_name)
            .cloned()
            .ok_or_else(|| {
                EngineError::internal(format!("unknown data source type '{}'", type_name))
            })
    }

    pub fn resource_types(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .resources
            .read()
            .expect("registry lock poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn data_source_types(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .data_sources
            .read()
            .expect("registry lock poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::OpFn;
    use crate::schema::{Attribute, ResourceSchema, SchemaType};

    fn noop() -> OpFn<()> {
        Arc::new(|_ctx, _state, _meta| Box::pin(async { Ok(()) }))
    }

    fn definition(name: &str) -> ResourceDefinition<()> {
        let schema =
            ResourceSchema::new().attribute("name", Attribute::required(SchemaType::String));
        ResourceDefinition::new(name, schema, noop(), noop(), noop())
    }

    #[test]
    fn register_and_lookup() {
        let registry = Registry::new();
        registry.register(definition("cirrus_vpc")).unwrap();
        let def = registry.lookup("cirrus_vpc").unwrap();
        assert_eq!(def.type_name(), "cirrus_vpc");
        assert!(registry.lookup("cirrus_subnet").is_err());
    }

    #[test]
    fn duplicate_registration_fails() {
        let registry = Registry::new();
        registry.register(definition("cirrus_vpc")).unwrap();
        assert!(registry.register(definition("cirrus_vpc")).is_err());
    }

    #[test]
    fn malformed_schema_rejected_at_registration() {
        let schema = ResourceSchema::new().attribute(
            "broken",
            Attribute::required(SchemaType::String)
                .with_default(crate::value::Value::String("x".into())),
        );
        let def = ResourceDefinition::new("cirrus_bad", schema, noop(), noop(), noop());
        let registry = Registry::new();
        assert!(registry.register(def).is_err());
    }

    #[test]
    fn type_listing_is_sorted() {
        let registry = Registry::new();
        registry.register(definition("cirrus_vpc")).unwrap();
        registry.register(definition("cirrus_bucket")).unwrap();
        assert_eq!(
            registry.resource_types(),
            vec!["cirrus_bucket".to_string(), "cirrus_vpc".to_string()]
        );
    }
}
