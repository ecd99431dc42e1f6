//! Resource definitions - schema plus lifecycle functions
//!
//! A `ResourceDefinition` bundles everything the dispatcher needs to
//! drive one resource type: its schema, the CRUD functions, an
//! optional importer, plan customization, per-operation timeouts, and
//! state migrators. Definitions are built once at provider startup
//! and shared behind `Arc`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::context::OpContext;
use crate::diag::Diagnostic;
use crate::diff::DiffModifier;
use crate::error::{EngineError, EngineResult};
use crate::schema::ResourceSchema;
use crate::state::StateContainer;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub type OpResult = Result<(), EngineError>;

/// A lifecycle function: reads and writes the container, talks to the
/// cloud through the provider meta
pub type OpFn<M> = Arc<
    dyn for<'a> Fn(&'a OpContext, &'a mut StateContainer, &'a M) -> BoxFuture<'a, OpResult>
        + Send
        + Sync,
>;

/// Wrap a boxing closure into an `OpFn`. Callers write
/// `op_fn(|ctx, state, meta| Box::pin(async move { .. }))`.
pub fn op_fn<M, F>(f: F) -> OpFn<M>
where
    F: for<'a> Fn(&'a OpContext, &'a mut StateContainer, &'a M) -> BoxFuture<'a, OpResult>
        + Send
        + Sync
        + 'static,
{
    Arc::new(f)
}

/// The common ID-only importer: accepts the import identifier as-is
/// and lets the trailing hydration read fill in the rest
pub fn passthrough_importer<M>() -> OpFn<M> {
    Arc::new(|_ctx, _state, _meta: &M| Box::pin(async { Ok(()) }))
}

/// Plan-time hook over the computed diff
pub type CustomizeDiffFn =
    Arc<dyn Fn(&mut DiffModifier) -> Result<(), Diagnostic> + Send + Sync>;

/// Per-operation wall clock budgets, overridable per resource
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub create: Duration,
    pub read: Duration,
    pub update: Duration,
    pub delete: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            create: Duration::from_secs(20 * 60),
            read: Duration::from_secs(10 * 60),
            update: Duration::from_secs(10 * 60),
            delete: Duration::from_secs(20 * 60),
        }
    }
}

impl Timeouts {
    /// Set the same budget for all four operations
    pub fn with_default(self, d: Duration) -> Self {
        Self {
            create: d,
            read: d,
            update: d,
            delete: d,
        }
    }

    pub fn with_create(mut self, d: Duration) -> Self {
        self.create = d;
        self
    }

    pub fn with_read(mut self, d: Duration) -> Self {
        self.read = d;
        self
    }

    pub fn with_update(mut self, d: Duration) -> Self {
        self.update = d;
        self
    }

    pub fn with_delete(mut self, d: Duration) -> Self {
        self.delete = d;
        self
    }
}

/// Upgrades stored state written by an older schema version. Runs on
/// the raw stored payload before coercion, so fields the current
/// schema no longer knows are still visible to it. Migrators run in
/// version order until the payload reaches the registered version.
pub struct StateMigrator {
    /// Version the migrator upgrades FROM
    pub version: u64,
    pub migrate: fn(serde_json::Value) -> EngineResult<serde_json::Value>,
}

pub struct ResourceDefinition<M> {
    type_name: String,
    schema: Arc<ResourceSchema>,
    schema_version: u64,
    create: OpFn<M>,
    read: OpFn<M>,
    update: Option<OpFn<M>>,
    delete: OpFn<M>,
    importer: Option<OpFn<M>>,
    customize_diff: Option<CustomizeDiffFn>,
    timeouts: Timeouts,
    migrators: Vec<StateMigrator>,
}

impl<M> ResourceDefinition<M> {
    pub fn new(
        type_name: impl Into<String>,
        schema: ResourceSchema,
        create: OpFn<M>,
        read: OpFn<M>,
        delete: OpFn<M>,
    ) -> Self {
        Self {
            type_name: type_name.into(),
            schema: Arc::new(schema),
            schema_version: 0,
            create,
            read,
            update: None,
            delete,
            importer: None,
            customize_diff: None,
            timeouts: Timeouts::default(),
            migrators: Vec::new(),
        }
    }

    pub fn with_update(mut self, update: OpFn<M>) -> Self {
        self.update = Some(update);
        self
    }

    /// Importer that resolves an import identifier into resource
    /// state. Without one, import hydrates through Read alone.
    pub fn with_importer(mut self, importer: OpFn<M>) -> Self {
        self.importer = Some(importer);
        self
    }

    pub fn with_customize_diff(mut self, f: CustomizeDiffFn) -> Self {
        self.customize_diff = Some(f);
        self
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_schema_version(mut self, version: u64) -> Self {
        self.schema_version = version;
        self
    }

    pub fn with_migrator(mut self, migrator: StateMigrator) -> Self {
        self.migrators.push(migrator);
        self.migrators.sort_by_key(|m| m.version);
        self
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn schema(&self) -> &Arc<ResourceSchema> {
        &self.schema
    }

    pub fn schema_version(&self) -> u64 {
        self.schema_version
    }

    pub fn create(&self) -> &OpFn<M> {
        &self.create
    }

    pub fn read(&self) -> &OpFn<M> {
        &self.read
    }

    pub fn update(&self) -> Option<&OpFn<M>> {
        self.update.as_ref()
    }

    pub fn delete(&self) -> &OpFn<M> {
        &self.delete
    }

    pub fn importer(&self) -> Option<&OpFn<M>> {
        self.importer.as_ref()
    }

    pub fn customize_diff(&self) -> Option<&CustomizeDiffFn> {
        self.customize_diff.as_ref()
    }

    pub fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    /// Upgrade a stored payload from `stored_version` to the
    /// registered schema version
    pub fn migrate_state(
        &self,
        stored_version: u64,
        mut payload: serde_json::Value,
    ) -> EngineResult<serde_json::Value> {
        if stored_version > self.schema_version {
            return Err(EngineError::internal(format!(
                "{}: stored schema version {} is newer than registered version {}",
                self.type_name, stored_version, self.schema_version
            )));
        }
        for migrator in &self.migrators {
            if migrator.version >= stored_version && migrator.version < self.schema_version {
                payload = (migrator.migrate)(payload)?;
            }
        }
        Ok(payload)
    }
}

/// Read-only data source: a schema and a single read function
pub struct DataSourceDefinition<M> {
    type_name: String,
    schema: Arc<ResourceSchema>,
    read: OpFn<M>,
}

impl<M> DataSourceDefinition<M> {
    pub fn new(type_name: impl Into<String>, schema: ResourceSchema, read: OpFn<M>) -> Self {
        Self {
            type_name: type_name.into(),
            schema: Arc::new(schema),
            read,
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn schema(&self) -> &Arc<ResourceSchema> {
        &self.schema
    }

    pub fn read(&self) -> &OpFn<M> {
        &self.read
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Attribute, SchemaType};
    use crate::state::Phase;
    use crate::value;

    fn schema() -> ResourceSchema {
        ResourceSchema::new().attribute("name", Attribute::required(SchemaType::String))
    }

    fn noop<M: Sync + 'static>() -> OpFn<M> {
        Arc::new(|_ctx, _state, _meta| Box::pin(async { Ok(()) }))
    }

    #[tokio::test]
    async fn op_fn_wraps_boxing_closures() {
        let op: OpFn<()> = op_fn(|_ctx, state, _meta| {
            Box::pin(async move {
                state.set_id("r-1");
                Ok(())
            })
        });
        let ctx = OpContext::new(Duration::from_secs(5));
        let mut state = StateContainer::new(
            Arc::new(schema()),
            value::empty_object(),
            value::empty_object(),
            "",
            Phase::Create,
        );
        op(&ctx, &mut state, &()).await.unwrap();
        assert_eq!(state.id(), "r-1");
    }

    #[test]
    fn migrators_run_in_version_order() {
        fn v0(mut payload: serde_json::Value) -> EngineResult<serde_json::Value> {
            payload["name"] = serde_json::json!("v1");
            Ok(payload)
        }
        fn v1(payload: serde_json::Value) -> EngineResult<serde_json::Value> {
            let name = payload["name"].as_str().unwrap_or("");
            Ok(serde_json::json!({ "name": format!("{name}+v2") }))
        }

        let def: ResourceDefinition<()> = ResourceDefinition::new(
            "cirrus_thing",
            schema(),
            noop(),
            noop(),
            noop(),
        )
        .with_schema_version(2)
        .with_migrator(StateMigrator {
            version: 1,
            migrate: v1,
        })
        .with_migrator(StateMigrator {
            version: 0,
            migrate: v0,
        });

        let upgraded = def.migrate_state(0, serde_json::json!({})).unwrap();
        assert_eq!(upgraded["name"], "v1+v2");

        // Starting at version 1 skips the v0 migrator
        let upgraded = def
            .migrate_state(1, serde_json::json!({ "name": "old" }))
            .unwrap();
        assert_eq!(upgraded["name"], "old+v2");
    }

    #[test]
    fn newer_stored_version_is_rejected() {
        let def: ResourceDefinition<()> =
            ResourceDefinition::new("cirrus_thing", schema(), noop(), noop(), noop());
        assert!(def.migrate_state(3, serde_json::json!({})).is_err());
    }

    #[test]
    fn timeouts_default_and_override() {
        let t = Timeouts::default();
        assert_eq!(t.create, Duration::from_secs(1200));
        assert_eq!(t.read, Duration::from_secs(600));
        let t = t.with_delete(Duration::from_secs(90));
        assert_eq!(t.delete, Duration::from_secs(90));
        let t = Timeouts::default().with_default(Duration::from_secs(30));
        assert_eq!(t.create, Duration::from_secs(30));
        assert_eq!(t.read, Duration::from_secs(30));
    }
}
