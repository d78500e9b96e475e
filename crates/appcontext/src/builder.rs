use std::sync::Arc;

use fleet_core::{FleetError, FleetResult};
use fleet_persist::ContextDb;
use metrics::counter;
use serde_json::Value;
use tracing::{error, warn};

use crate::{AppContext, CompositeAppMeta, Handle, InstructionLevel, InstructionType, Level};

/// All-or-nothing construction of a context tree. Any failed step deletes the
/// whole composite app before the error is returned. If that delete fails
/// too, the caller gets `RollbackFailed` with the step's error as source.
pub struct ContextBuilder {
    ac: AppContext,
    root: Handle,
}

impl ContextBuilder {
    /// Mint a context, create its composite app and record `meta`.
    pub fn begin(db: Arc<dyn ContextDb>, meta: Option<&CompositeAppMeta>) -> FleetResult<Self> {
        let mut ac = AppContext::new(db);
        ac.init()?;
        let root = ac.create_composite_app().map_err(|e| rollback(&ac, e))?;
        let me = Self { ac, root };
        if let Some(meta) = meta {
            me.guard(me.ac.add_composite_app_meta(meta))?;
        }
        Ok(me)
    }

    pub fn context_id(&self) -> &str { self.root.context_id() }
    pub fn root(&self) -> &Handle { &self.root }
    pub fn context(&self) -> &AppContext { &self.ac }

    fn guard<T>(&self, r: FleetResult<T>) -> FleetResult<T> { r.map_err(|e| rollback(&self.ac, e)) }

    pub fn add_app(&self, name: &str) -> FleetResult<Handle> { self.guard(self.ac.add_app(&self.root, name)) }

    pub fn add_cluster(&self, app: &Handle, name: &str) -> FleetResult<Handle> { self.guard(self.ac.add_cluster(app, name)) }

    pub fn add_cluster_meta_grp(&self, cluster: &Handle, group: &str) -> FleetResult<Handle> {
        self.guard(self.ac.add_cluster_meta_grp(cluster, group))
    }

    pub fn add_resource(&self, cluster: &Handle, name: &str, value: &Value) -> FleetResult<Handle> {
        self.guard(self.ac.add_resource(cluster, name, value))
    }

    pub fn add_instruction(&self, handle: &Handle, level: InstructionLevel, kind: InstructionType, value: &Value) -> FleetResult<Handle> {
        self.guard(self.ac.add_instruction(handle, level, kind, value))
    }

    /// `{"apporder": [..]}` at the root.
    pub fn add_app_order(&self, apps: &[&str]) -> FleetResult<Handle> {
        let v = serde_json::json!({ "apporder": apps });
        self.add_instruction(&self.root.clone(), InstructionLevel::App, InstructionType::Order, &v)
    }

    /// `{"resorder": [..]}` under a cluster.
    pub fn add_resource_order(&self, cluster: &Handle, resources: &[&str]) -> FleetResult<Handle> {
        let v = serde_json::json!({ "resorder": resources });
        self.add_instruction(cluster, InstructionLevel::Resource, InstructionType::Order, &v)
    }

    pub fn add_level_value(&self, handle: &Handle, level: Level, value: &Value) -> FleetResult<Handle> {
        self.guard(self.ac.add_level_value(handle, level, value))
    }

    /// Run an arbitrary step under the same rollback contract.
    pub fn step<T>(&self, f: impl FnOnce(&AppContext) -> FleetResult<T>) -> FleetResult<T> { self.guard(f(&self.ac)) }

    /// Abandon the build, deleting everything written so far.
    pub fn abort(self, cause: FleetError) -> FleetError { rollback(&self.ac, cause) }

    pub fn finish(self) -> AppContext { self.ac }
}

/// Delete the composite app after `cause`, keeping `cause` as the reported error.
pub(crate) fn rollback(ac: &AppContext, cause: FleetError) -> FleetError {
    counter!("appcontext_rollback_total", 1u64);
    warn!(ctx = ?ac.context_id().ok(), error = %cause, "appcontext: rolling back context build");
    match ac.delete_composite_app() {
        Ok(()) => cause,
        Err(rb) => {
            error!(error = %rb, "appcontext: rollback delete failed");
            FleetError::RollbackFailed { rollback: rb.to_string(), source: Box::new(cause) }
        }
    }
}

impl AppContext {
    /// Delete this context after `cause`; see `ContextBuilder`.
    pub fn rollback(&self, cause: FleetError) -> FleetError { rollback(self, cause) }
}
