//! Lifecycle dispatcher - drives CRUD operations over registered
//! resource types
//!
//! The dispatcher owns the orchestration rules: plan assembly and
//! customize-diff, create-must-set-id, partial failure handling, the
//! post-create propagation window, and delete/update semantics for
//! resources that vanished out of band. Resource functions only talk
//! to the cloud; everything else lives here.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::OpContext;
use crate::diag::{Diagnostic, Diagnostics};
use crate::diff::{self, DiffModifier, ResourceDiff};
use crate::error::EngineError;
use crate::registry::Registry;
use crate::retry::{self, RetryError};
use crate::state::{Phase, StateContainer};
use crate::value::{self, Value};

/// How long a hydration read after create keeps retrying not-found
/// before trusting it
const PROPAGATION_WINDOW: Duration = Duration::from_secs(2 * 60);

/// Output of planning one change
#[derive(Debug, Clone)]
pub struct PlannedChange {
    pub planned_state: Value,
    pub diff: ResourceDiff,
    /// Root attribute paths whose change forces replacement
    pub requires_replace: Vec<String>,
}

impl PlannedChange {
    pub fn is_noop(&self) -> bool {
        self.diff.is_empty()
    }
}

/// Output of an apply-side operation. `state == None` means the
/// resource is gone and the host must drop it.
#[derive(Debug)]
pub struct ApplyOutcome {
    pub id: String,
    pub state: Option<Value>,
    pub diagnostics: Diagnostics,
}

impl ApplyOutcome {
    fn absent() -> Self {
        Self {
            id: String::new(),
            state: None,
            diagnostics: Diagnostics::new(),
        }
    }

    fn failed(diag: Diagnostic) -> Self {
        let mut diagnostics = Diagnostics::new();
        diagnostics.push(diag);
        Self {
            id: String::new(),
            state: None,
            diagnostics,
        }
    }

    pub fn ok(&self) -> bool {
        !self.diagnostics.has_errors()
    }
}

pub struct Dispatcher<M> {
    registry: Arc<Registry<M>>,
    meta: Arc<M>,
    max_retries: Option<u32>,
    propagation_window: Duration,
}

impl<M: Send + Sync + 'static> Dispatcher<M> {
    pub fn new(registry: Arc<Registry<M>>, meta: Arc<M>) -> Self {
        Self {
            registry,
            meta,
            max_retries: None,
            propagation_window: PROPAGATION_WINDOW,
        }
    }

    pub fn with_max_retries(mut self, max_retries: Option<u32>) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Override how long a post-create read keeps retrying not-found
    pub fn with_propagation_window(mut self, window: Duration) -> Self {
        self.propagation_window = window;
        self
    }

    pub fn registry(&self) -> &Arc<Registry<M>> {
        &self.registry
    }

    pub fn meta(&self) -> &Arc<M> {
        &self.meta
    }

    fn ctx(&self, timeout: Duration, cancel: CancellationToken) -> OpContext {
        OpContext::with_cancel(timeout, cancel).with_max_retries(self.max_retries)
    }

    /// Validate a raw config against the schema without planning
    pub fn validate(&self, type_name: &str, config: &serde_json::Value) -> Diagnostics {
        let mut diagnostics = Diagnostics::new();
        let def = match self.registry.lookup(type_name) {
            Ok(def) => def,
            Err(e) => {
                diagnostics.push(Diagnostic::from(e));
                return diagnostics;
            }
        };
        let mut tree = match def.schema().coerce(config) {
            Ok(tree) => tree,
            Err(diag) => {
                diagnostics.push(diag);
                return diagnostics;
            }
        };
        def.schema().apply_defaults(&mut tree);
        def.schema().validate(&tree)
    }

    /// Assemble the planned state and diff for one change. `prior` is
    /// `None` for a resource not yet in state.
    pub fn plan(
        &self,
        type_name: &str,
        prior: Option<&Value>,
        config: &serde_json::Value,
    ) -> Result<PlannedChange, Diagnostics> {
        let def = self
            .registry
            .lookup(type_name)
            .map_err(Diagnostics::from)?;
        let mut planned = def.schema().coerce(config).map_err(Diagnostics::from)?;
        def.schema().apply_defaults(&mut planned);
        self.fail_on_errors(def.schema().validate(&planned))?;

        let is_new = prior.is_none();
        let prior_tree = prior.cloned().unwrap_or_else(value::empty_object);

        // Computed attributes the user left unset: unknown on create,
        // carried forward from prior otherwise
        for (name, attr) in &def.schema().attributes {
            if !attr.computed {
                continue;
            }
            let unset = planned
                .get_path(name)
                .map(Value::is_null)
                .unwrap_or(true);
            if !unset {
                continue;
            }
            let filler = if is_new {
                Value::Unknown
            } else {
                prior_tree
                    .get_path(name)
                    .cloned()
                    .unwrap_or(Value::Unknown)
            };
            planned
                .set_path(name, filler)
                .map_err(|e| Diagnostics::from(EngineError::internal(e)))?;
        }

        let mut diff = diff::compute(def.schema(), &prior_tree, &planned);

        if let Some(hook) = def.customize_diff() {
            let mut modifier =
                DiffModifier::new(def.schema(), &prior_tree, &mut planned, &mut diff);
            hook(&mut modifier).map_err(Diagnostics::from)?;
        }

        let requires_replace = diff.replace_paths();
        debug!(
            resource = type_name,
            changes = diff.len(),
            replace = !requires_replace.is_empty(),
            "planned change"
        );
        Ok(PlannedChange {
            planned_state: planned,
            diff,
            requires_replace,
        })
    }

    /// Create the resource described by a planned state. The create
    /// function must set an id before returning; a failure after the
    /// id is set keeps the partial state so the next refresh can
    /// reconcile.
    pub async fn create(
        &self,
        type_name: &str,
        plan: &PlannedChange,
        cancel: CancellationToken,
    ) -> ApplyOutcome {
        let def = match self.registry.lookup(type_name) {
            Ok(def) => def,
            Err(e) => return ApplyOutcome::failed(Diagnostic::from(e)),
        };
        let ctx = self.ctx(def.timeouts().create, cancel);
        info!(resource = type_name, "creating");

        let mut state = StateContainer::new(
            Arc::clone(def.schema()),
            value::empty_object(),
            plan.planned_state.clone(),
            "",
            Phase::Create,
        )
        .with_diff(plan.diff.clone());

        let result = ctx
            .run(
                "create deadline reached",
                (def.create())(&ctx, &mut state, self.meta.as_ref()),
            )
            .await;

        match result {
            Ok(()) if state.is_absent() => ApplyOutcome::failed(
                op_error(type_name, "create", EngineError::internal(
                    "create returned success without setting an id",
                )),
            ),
            Ok(()) => {
                let id = state.id().to_string();
                let tree = collect(&state);
                info!(resource = type_name, id = %id, "created");
                ApplyOutcome {
                    id,
                    state: Some(tree),
                    diagnostics: Diagnostics::new(),
                }
            }
            Err(e) if state.is_absent() => {
                ApplyOutcome::failed(op_error(type_name, "create", e))
            }
            // Partial create: the id exists in the cloud, keep it
            Err(e) => {
                let id = state.id().to_string();
                warn!(resource = type_name, id = %id, error = %e, "partial create");
                let tree = collect(&state);
                let mut diagnostics = Diagnostics::new();
                diagnostics.push(op_error(type_name, "create", e));
                ApplyOutcome {
                    id,
                    state: Some(tree),
                    diagnostics,
                }
            }
        }
    }

    /// Refresh observed state. With `new_resource` set (the read that
    /// follows a create), not-found is retried for the propagation
    /// window and is an error if it persists; otherwise not-found
    /// means the resource was deleted out of band and clears state.
    pub async fn read(
        &self,
        type_name: &str,
        prior: &Value,
        id: &str,
        new_resource: bool,
        cancel: CancellationToken,
    ) -> ApplyOutcome {
        let def = match self.registry.lookup(type_name) {
            Ok(def) => def,
            Err(e) => return ApplyOutcome::failed(Diagnostic::from(e)),
        };
        let ctx = self.ctx(def.timeouts().read, cancel);
        let window = if new_resource {
            ctx.child(self.propagation_window)
        } else {
            ctx.clone()
        };
        let phase = if new_resource {
            Phase::Create
        } else {
            Phase::Read
        };
        debug!(resource = type_name, id, new_resource, "reading");

        // Every attempt starts from a fresh container so a failed
        // partial read never leaks into the next one
        let attempt = {
            let def = Arc::clone(&def);
            let meta = Arc::clone(&self.meta);
            let window = window.clone();
            let type_name = type_name.to_string();
            let prior = prior.clone();
            let id = id.to_string();
            move || {
                let def = Arc::clone(&def);
                let meta = Arc::clone(&meta);
                let window = window.clone();
                let type_name = type_name.clone();
                let prior = prior.clone();
                let id = id.clone();
                async move {
                    let mut state = StateContainer::new(
                        Arc::clone(def.schema()),
                        prior,
                        value::empty_object(),
                        &id,
                        phase,
                    );
                    match (def.read())(&window, &mut state, meta.as_ref()).await {
                        Ok(()) if state.is_absent() => {
                            Err(RetryError::from(EngineError::not_found(format!(
                                "{} '{}' not found",
                                type_name, id
                            ))))
                        }
                        Ok(()) => Ok(state),
                        Err(e) => Err(RetryError::from(e)),
                    }
                }
            }
        };

        let result = if new_resource {
            // Within the window both transient and not-found retry
            retry::retry(&window, self.propagation_window, move || {
                let fut = attempt();
                async move {
                    fut.await.map_err(|mut e| {
                        if e.error.is_not_found() {
                            e.retryable = true;
                        }
                        e
                    })
                }
            })
            .await
        } else {
            let timeout = ctx.remaining();
            retry::retry(&ctx, timeout, attempt).await
        };

        match result {
            Ok(state) => {
                let id = state.id().to_string();
                let tree = collect(&state);
                ApplyOutcome {
                    id,
                    state: Some(tree),
                    diagnostics: Diagnostics::new(),
                }
            }
            Err(e) if e.is_not_found() && !new_resource => {
                info!(resource = type_name, id, "gone out of band, clearing");
                ApplyOutcome::absent()
            }
            Err(e) => ApplyOutcome::failed(op_error(type_name, "read", e)),
        }
    }

    /// Apply an in-place update. Not-found during update means the
    /// resource was deleted out of band; state clears and the host
    /// replans from scratch.
    pub async fn update(
        &self,
        type_name: &str,
        prior: &Value,
        id: &str,
        plan: &PlannedChange,
        cancel: CancellationToken,
    ) -> ApplyOutcome {
        let def = match self.registry.lookup(type_name) {
            Ok(def) => def,
            Err(e) => return ApplyOutcome::failed(Diagnostic::from(e)),
        };
        if plan.diff.is_empty() {
            return ApplyOutcome {
                id: id.to_string(),
                state: Some(prior.clone()),
                diagnostics: Diagnostics::new(),
            };
        }
        let Some(update) = def.update() else {
            return ApplyOutcome::failed(op_error(
                type_name,
                "update",
                EngineError::internal("resource has changes but no update function"),
            ));
        };
        let ctx = self.ctx(def.timeouts().update, cancel);
        info!(resource = type_name, id, changes = plan.diff.len(), "updating");

        let mut state = StateContainer::new(
            Arc::clone(def.schema()),
            prior.clone(),
            plan.planned_state.clone(),
            id,
            Phase::Update,
        )
        .with_diff(plan.diff.clone());

        let result = ctx
            .run(
                "update deadline reached",
                update(&ctx, &mut state, self.meta.as_ref()),
            )
            .await;

        match result {
            Ok(()) => {
                let id = state.id().to_string();
                let tree = collect(&state);
                ApplyOutcome {
                    id,
                    state: Some(tree),
                    diagnostics: Diagnostics::new(),
                }
            }
            Err(e) if e.is_not_found() => {
                info!(resource = type_name, id, "gone out of band during update");
                ApplyOutcome::absent()
            }
            // Partial update: keep whatever the function recorded so
            // far alongside the prior fall-through
            Err(e) => {
                let id = state.id().to_string();
                let tree = collect(&state);
                let mut diagnostics = Diagnostics::new();
                diagnostics.push(op_error(type_name, "update", e));
                ApplyOutcome {
                    id,
                    state: Some(tree),
                    diagnostics,
                }
            }
        }
    }

    /// Destroy the resource. Not-found counts as success; the desired
    /// end state already holds.
    pub async fn delete(
        &self,
        type_name: &str,
        prior: &Value,
        id: &str,
        cancel: CancellationToken,
    ) -> ApplyOutcome {
        let def = match self.registry.lookup(type_name) {
            Ok(def) => def,
            Err(e) => return ApplyOutcome::failed(Diagnostic::from(e)),
        };
        let ctx = self.ctx(def.timeouts().delete, cancel);
        info!(resource = type_name, id, "deleting");

        let mut state = StateContainer::new(
            Arc::clone(def.schema()),
            prior.clone(),
            value::empty_object(),
            id,
            Phase::Delete,
        );

        let result = ctx
            .run(
                "delete deadline reached",
                (def.delete())(&ctx, &mut state, self.meta.as_ref()),
            )
            .await;

        match result {
            Ok(()) => ApplyOutcome::absent(),
            Err(e) if e.is_not_found() => {
                debug!(resource = type_name, id, "already gone");
                ApplyOutcome::absent()
            }
            // Failed delete keeps the resource in state for another try
            Err(e) => {
                let mut diagnostics = Diagnostics::new();
                diagnostics.push(op_error(type_name, "delete", e));
                ApplyOutcome {
                    id: id.to_string(),
                    state: Some(prior.clone()),
                    diagnostics,
                }
            }
        }
    }

    /// Adopt an existing cloud resource by identifier: run the
    /// importer when one exists, then hydrate through Read. A resource
    /// that does not exist is an error, never an empty success.
    pub async fn import(
        &self,
        type_name: &str,
        import_id: &str,
        cancel: CancellationToken,
    ) -> ApplyOutcome {
        let def = match self.registry.lookup(type_name) {
            Ok(def) => def,
            Err(e) => return ApplyOutcome::failed(Diagnostic::from(e)),
        };
        let ctx = self.ctx(def.timeouts().read, cancel.clone());
        info!(resource = type_name, id = import_id, "importing");

        let mut state = StateContainer::new(
            Arc::clone(def.schema()),
            value::empty_object(),
            value::empty_object(),
            import_id,
            Phase::Import,
        );

        if let Some(importer) = def.importer() {
            if let Err(e) = ctx
                .run(
                    "import deadline reached",
                    importer(&ctx, &mut state, self.meta.as_ref()),
                )
                .await
            {
                return ApplyOutcome::failed(op_error(type_name, "import", e));
            }
            if state.is_absent() {
                return ApplyOutcome::failed(op_error(
                    type_name,
                    "import",
                    EngineError::not_found(format!("cannot import '{}'", import_id)),
                ));
            }
        }

        let hydration_prior = collect(&state);
        let id = state.id().to_string();
        let outcome = self
            .read(type_name, &hydration_prior, &id, false, cancel)
            .await;
        if outcome.ok() && outcome.state.is_none() {
            return ApplyOutcome::failed(op_error(
                type_name,
                "import",
                EngineError::not_found(format!(
                    "{} '{}' does not exist",
                    type_name, import_id
                )),
            ));
        }
        outcome
    }

    /// Evaluate a data source: validate the config, run its read, and
    /// return the resulting tree
    pub async fn read_data_source(
        &self,
        type_name: &str,
        config: &serde_json::Value,
        cancel: CancellationToken,
    ) -> Result<Value, Diagnostics> {
        let def = self
            .registry
            .lookup_data_source(type_name)
            .map_err(Diagnostics::from)?;
        let mut tree = def.schema().coerce(config).map_err(Diagnostics::from)?;
        def.schema().apply_defaults(&mut tree);
        self.fail_on_errors(def.schema().validate(&tree))?;

        let ctx = self.ctx(Duration::from_secs(10 * 60), cancel);
        let mut state = StateContainer::new(
            Arc::clone(def.schema()),
            value::empty_object(),
            tree,
            "",
            Phase::Read,
        );
        ctx.run(
            "data source read deadline reached",
            (def.read())(&ctx, &mut state, self.meta.as_ref()),
        )
        .await
        .map_err(|e| Diagnostics::from(op_error(type_name, "read", e)))?;
        Ok(collect(&state))
    }

    fn fail_on_errors(&self, diagnostics: Diagnostics) -> Result<(), Diagnostics> {
        if diagnostics.has_errors() {
            Err(diagnostics)
        } else {
            Ok(())
        }
    }
}

/// Materialize the operation's resulting tree: every schema attribute
/// through the container's fall-through read, unknowns resolved to
/// null
fn collect(state: &StateContainer) -> Value {
    let mut fields = std::collections::BTreeMap::new();
    for name in state.schema().attributes.keys() {
        fields.insert(name.clone(), state.get(name));
    }
    let mut tree = Value::Object(fields);
    tree.resolve_unknowns();
    tree
}

fn op_error(type_name: &str, op: &str, error: EngineError) -> Diagnostic {
    Diagnostic::error(format!("{}: {} failed", type_name, op)).with_detail(error.to_string())
}
