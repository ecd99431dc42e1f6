//! Provider server - the host-facing operation surface
//!
//! Thin JSON boundary over the dispatcher. The host speaks stored
//! state payloads (schema version, id, attribute tree); the server
//! upgrades stored payloads through registered migrators, routes
//! apply requests to create, update, or delete, and threads the
//! new-resource marker from a create to the refresh that follows it
//! through an opaque private blob.

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::diag::{Diagnostic, Diagnostics};
use crate::lifecycle::{ApplyOutcome, Dispatcher};
use crate::value::Value;

/// Stored state for one resource instance, as the host persists it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatePayload {
    pub schema_version: u64,
    pub id: String,
    pub attributes: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct PlanResponse {
    pub planned_state: serde_json::Value,
    /// Paths whose value is only known after apply
    pub unknown_paths: Vec<String>,
    pub requires_replace: Vec<String>,
    pub is_noop: bool,
}

#[derive(Debug)]
pub struct ApplyResponse {
    pub state: Option<StatePayload>,
    /// Opaque provider data the host hands back on the next read
    pub private: Option<serde_json::Value>,
    pub diagnostics: Diagnostics,
}

#[derive(Debug)]
pub struct ReadResponse {
    pub state: Option<StatePayload>,
    pub diagnostics: Diagnostics,
}

pub struct ProviderServer<M> {
    dispatcher: Dispatcher<M>,
}

impl<M: Send + Sync + 'static> ProviderServer<M> {
    pub fn new(dispatcher: Dispatcher<M>) -> Self {
        Self { dispatcher }
    }

    pub fn dispatcher(&self) -> &Dispatcher<M> {
        &self.dispatcher
    }

    /// Schemas of every registered resource and data source
    pub fn get_schema(&self) -> serde_json::Value {
        let registry = self.dispatcher.registry();
        let resources: serde_json::Map<String, serde_json::Value> = registry
            .resource_types()
            .into_iter()
            .filter_map(|name| {
                let def = registry.lookup(&name).ok()?;
                Some((
                    name,
                    json!({
                        "version": def.schema_version(),
                        "attributes": def.schema().to_json(),
                    }),
                ))
            })
            .collect();
        let data_sources: serde_json::Map<String, serde_json::Value> = registry
            .data_source_types()
            .into_iter()
            .filter_map(|name| {
                let def = registry.lookup_data_source(&name).ok()?;
                Some((name, json!({ "attributes": def.schema().to_json() })))
            })
            .collect();
        json!({
            "resource_schemas": resources,
            "data_source_schemas": data_sources,
        })
    }

    pub fn validate_resource_config(
        &self,
        type_name: &str,
        config: &serde_json::Value,
    ) -> Diagnostics {
        self.dispatcher.validate(type_name, config)
    }

    pub fn plan_resource_change(
        &self,
        type_name: &str,
        prior: Option<&StatePayload>,
        config: &serde_json::Value,
    ) -> Result<PlanResponse, Diagnostics> {
        let prior_tree = match prior {
            Some(payload) => Some(self.upgrade(type_name, payload)?),
            None => None,
        };
        let plan = self
            .dispatcher
            .plan(type_name, prior_tree.as_ref(), config)?;
        Ok(PlanResponse {
            planned_state: plan.planned_state.to_json(),
            unknown_paths: plan.planned_state.unknown_paths(),
            requires_replace: plan.requires_replace.clone(),
            is_noop: plan.is_noop(),
        })
    }

    /// Apply one change. No prior means create, no config means
    /// destroy, both mean in-place update. Replacement is the host's
    /// business: it shows up here as a destroy and a create.
    pub async fn apply_resource_change(
        &self,
        type_name: &str,
        prior: Option<&StatePayload>,
        config: Option<&serde_json::Value>,
        cancel: CancellationToken,
    ) -> ApplyResponse {
        match (prior, config) {
            (None, Some(config)) => {
                let plan = match self.dispatcher.plan(type_name, None, config) {
                    Ok(plan) => plan,
                    Err(diagnostics) => return failed_apply(diagnostics),
                };
                let outcome = self.dispatcher.create(type_name, &plan, cancel).await;
                let private = outcome
                    .state
                    .is_some()
                    .then(|| json!({ "new_resource": true }));
                self.into_apply_response(type_name, outcome, private)
            }
            (Some(payload), None) => {
                let prior_tree = match self.upgrade(type_name, payload) {
                    Ok(tree) => tree,
                    Err(diagnostics) => return failed_apply(diagnostics),
                };
                let outcome = self
                    .dispatcher
                    .delete(type_name, &prior_tree, &payload.id, cancel)
                    .await;
                self.into_apply_response(type_name, outcome, None)
            }
            (Some(payload), Some(config)) => {
                let prior_tree = match self.upgrade(type_name, payload) {
                    Ok(tree) => tree,
                    Err(diagnostics) => return failed_apply(diagnostics),
                };
                let plan = match self.dispatcher.plan(type_name, Some(&prior_tree), config) {
                    Ok(plan) => plan,
                    Err(diagnostics) => return failed_apply(diagnostics),
                };
                let outcome = self
                    .dispatcher
                    .update(type_name, &prior_tree, &payload.id, &plan, cancel)
                    .await;
                self.into_apply_response(type_name, outcome, None)
            }
            (None, None) => failed_apply(Diagnostics::from(Diagnostic::error(
                "apply request carries neither prior state nor config",
            ))),
        }
    }

    /// Refresh stored state from the cloud. The private blob from a
    /// create marks the resource as new, which keeps not-found inside
    /// the propagation window from clearing state.
    pub async fn read_resource(
        &self,
        type_name: &str,
        stored: &StatePayload,
        private: Option<&serde_json::Value>,
        cancel: CancellationToken,
    ) -> ReadResponse {
        let prior_tree = match self.upgrade(type_name, stored) {
            Ok(tree) => tree,
            Err(diagnostics) => {
                return ReadResponse {
                    state: None,
                    diagnostics,
                };
            }
        };
        let new_resource = private
            .and_then(|p| p.get("new_resource"))
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);
        let outcome = self
            .dispatcher
            .read(type_name, &prior_tree, &stored.id, new_resource, cancel)
            .await;
        ReadResponse {
            state: self.payload_of(type_name, &outcome),
            diagnostics: outcome.diagnostics,
        }
    }

    pub async fn import_resource_state(
        &self,
        type_name: &str,
        import_id: &str,
        cancel: CancellationToken,
    ) -> ReadResponse {
        let outcome = self.dispatcher.import(type_name, import_id, cancel).await;
        ReadResponse {
            state: self.payload_of(type_name, &outcome),
            diagnostics: outcome.diagnostics,
        }
    }

    pub async fn read_data_source(
        &self,
        type_name: &str,
        config: &serde_json::Value,
        cancel: CancellationToken,
    ) -> Result<serde_json::Value, Diagnostics> {
        let tree = self
            .dispatcher
            .read_data_source(type_name, config, cancel)
            .await?;
        Ok(tree.to_json())
    }

    /// Coerce a stored payload and run it through any migrators
    /// between its recorded version and the registered one
    fn upgrade(&self, type_name: &str, stored: &StatePayload) -> Result<Value, Diagnostics> {
        let def = self
            .dispatcher
            .registry()
            .lookup(type_name)
            .map_err(|e| Diagnostics::from(e))?;
        if stored.schema_version < def.schema_version() {
            debug!(
                resource = type_name,
                from = stored.schema_version,
                to = def.schema_version(),
                "upgrading stored state"
            );
        }
        let upgraded = def
            .migrate_state(stored.schema_version, stored.attributes.clone())
            .map_err(|e| Diagnostics::from(e))?;
        def.schema().coerce(&upgraded).map_err(Diagnostics::from)
    }

    fn payload_of(&self, type_name: &str, outcome: &ApplyOutcome) -> Option<StatePayload> {
        let state = outcome.state.as_ref()?;
        let version = self
            .dispatcher
            .registry()
            .lookup(type_name)
            .map(|def| def.schema_version())
            .unwrap_or(0);
        Some(StatePayload {
            schema_version: version,
            id: outcome.id.clone(),
            attributes: state.to_json(),
        })
    }

    fn into_apply_response(
        &self,
        type_name: &str,
        outcome: ApplyOutcome,
        private: Option<serde_json::Value>,
    ) -> ApplyResponse {
        let state = self.payload_of(type_name, &outcome);
        ApplyResponse {
            state,
            private,
            diagnostics: outcome.diagnostics,
        }
    }
}

fn failed_apply(diagnostics: Diagnostics) -> ApplyResponse {
    ApplyResponse {
        state: None,
        private: None,
        diagnostics,
    }
}
