//! Fleet application context (Milestone 1): one deployment plan's topology
//! (apps, clusters, resources, instructions) plus its live status, stored as
//! a handle-addressed tree in a `ContextDb`.
//!
//! `AppContext` is a thin synchronous facade: no caching, no locking. Builds
//! that must be all-or-nothing go through `ContextBuilder`.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use fleet_core::{AppContextStatus, ContextStatus, FleetError, FleetResult};
use fleet_persist::ContextDb;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

mod builder;
pub mod handle;

pub use builder::ContextBuilder;
pub use handle::{split_pair, ChildKind, Handle, InstructionLevel, InstructionType, Level};

/// Attributes recorded under a context's `meta/` level. Only some fields are
/// meaningful for a given owner (composite app, logical cloud, ...).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CompositeAppMeta {
    pub project: String,
    pub composite_app: String,
    pub version: String,
    pub release: String,
    pub deployment_intent_group: String,
    pub namespace: String,
    pub level: String,
    #[serde(rename = "ChildContextIDs")]
    pub child_context_ids: Vec<String>,
    pub logical_cloud: String,
    pub logical_cloud_namespace: String,
    pub logical_cloud_level: String,
}

/// Facade over one context tree.
#[derive(Clone)]
pub struct AppContext {
    db: Arc<dyn ContextDb>,
    root: Option<Handle>,
}

impl std::fmt::Debug for AppContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContext").field("root", &self.root).finish()
    }
}

pub fn new_context_id() -> String { uuid::Uuid::new_v4().simple().to_string() }

impl AppContext {
    pub fn new(db: Arc<dyn ContextDb>) -> Self { Self { db, root: None } }

    pub fn db(&self) -> &Arc<dyn ContextDb> { &self.db }

    /// Mint a fresh context id. Nothing is written until `create_composite_app`.
    pub fn init(&mut self) -> FleetResult<String> {
        let id = new_context_id();
        self.init_with_id(&id)?;
        Ok(id)
    }

    pub fn init_with_id(&mut self, id: &str) -> FleetResult<Handle> {
        let root = Handle::root(id)?;
        self.root = Some(root.clone());
        Ok(root)
    }

    /// Attach to an existing tree.
    pub fn load(&mut self, id: &str) -> FleetResult<Handle> {
        let root = Handle::root(id)?;
        if self.db.get(root.as_str())?.is_none() {
            return Err(FleetError::not_found(format!("app context {} not found", id)));
        }
        self.root = Some(root.clone());
        Ok(root)
    }

    /// Open an existing tree by id.
    pub fn open(db: Arc<dyn ContextDb>, id: &str) -> FleetResult<Self> {
        let mut ac = Self::new(db);
        ac.load(id)?;
        Ok(ac)
    }

    pub fn root(&self) -> FleetResult<&Handle> {
        self.root.as_ref().ok_or_else(|| FleetError::bad_request("app context not initialized"))
    }

    pub fn context_id(&self) -> FleetResult<&str> { Ok(self.root()?.context_id()) }

    pub fn create_composite_app(&self) -> FleetResult<Handle> {
        let root = self.root()?.clone();
        self.db.put(root.as_str(), &Value::String(root.context_id().to_string()))?;
        info!(ctx = %root.context_id(), "appcontext: created composite app");
        Ok(root)
    }

    pub fn add_composite_app_meta(&self, meta: &CompositeAppMeta) -> FleetResult<()> {
        let h = self.root()?.level(Level::Meta);
        self.db.put(h.as_str(), &serde_json::to_value(meta)?)?;
        Ok(())
    }

    pub fn composite_app_meta(&self) -> FleetResult<CompositeAppMeta> {
        let h = self.root()?.level(Level::Meta);
        let v = self.get_value(&h).map_err(|_| FleetError::not_found("failed to get composite app meta"))?;
        Ok(serde_json::from_value(v)?)
    }

    pub fn delete_composite_app(&self) -> FleetResult<()> {
        let root = self.root()?;
        self.db.delete_prefix(root.as_str())?;
        info!(ctx = %root.context_id(), "appcontext: deleted composite app");
        Ok(())
    }

    pub fn composite_app_handle(&self) -> FleetResult<Handle> {
        let root = self.root()?.clone();
        self.require(&root, || format!("app context {} not found", root.context_id()))
    }

    /// `handle + level/` if that node exists.
    pub fn level_handle(&self, handle: &Handle, level: &str) -> FleetResult<Handle> {
        let h = handle.named_level(level)?;
        self.require(&h, || format!("no handle was found for level {}", level))
    }

    fn require(&self, h: &Handle, msg: impl FnOnce() -> String) -> FleetResult<Handle> {
        if self.db.get(h.as_str())?.is_some() { Ok(h.clone()) } else { Err(FleetError::NotFound(msg())) }
    }

    fn add_child(&self, parent: &Handle, kind: ChildKind, name: &str, value: &Value) -> FleetResult<Handle> {
        self.ensure_in_tree(parent)?;
        let h = parent.child(kind, name)?;
        self.db.put(h.as_str(), value)?;
        debug!(handle = %h, "appcontext: added {}", kind.as_str());
        Ok(h)
    }

    fn ensure_in_tree(&self, h: &Handle) -> FleetResult<()> {
        let root = self.root()?;
        if h != root && !root.is_ancestor_of(h) {
            return Err(FleetError::bad_request(format!("handle {} is outside app context {}", h, root.context_id())));
        }
        Ok(())
    }

    pub fn add_app(&self, handle: &Handle, name: &str) -> FleetResult<Handle> {
        self.add_child(handle, ChildKind::App, name, &Value::String(name.to_string()))
    }

    pub fn app_handle(&self, app: &str) -> FleetResult<Handle> {
        let h = self.root()?.child(ChildKind::App, app)?;
        self.require(&h, || format!("no handle was found for app {}", app))
    }

    /// Names of all apps in the tree.
    pub fn app_names(&self) -> FleetResult<Vec<String>> { self.direct_children(self.root()?, ChildKind::App) }

    pub fn add_cluster(&self, handle: &Handle, name: &str) -> FleetResult<Handle> {
        self.add_child(handle, ChildKind::Cluster, name, &Value::String(name.to_string()))
    }

    pub fn cluster_handle(&self, app: &str, cluster: &str) -> FleetResult<Handle> {
        let h = self.root()?.child(ChildKind::App, app)?.child(ChildKind::Cluster, cluster)?;
        self.require(&h, || format!("no handle was found for cluster {} of app {}", cluster, app))
    }

    /// Clusters directly under `app`. An app without clusters is an error.
    pub fn cluster_names(&self, app: &str) -> FleetResult<Vec<String>> {
        let app_h = self.root()?.child(ChildKind::App, app)?;
        let names = self.direct_children(&app_h, ChildKind::Cluster)?;
        if names.is_empty() {
            warn!(app = %app, "appcontext: cluster list is empty");
            return Err(FleetError::not_found(format!("cluster list is empty for app {}", app)));
        }
        Ok(names)
    }

    pub fn add_cluster_meta_grp(&self, cluster: &Handle, group: &str) -> FleetResult<Handle> {
        self.add_level_value(cluster, Level::ClusterMetaGroup, &Value::String(group.to_string()))
    }

    pub fn cluster_meta_handle(&self, app: &str, cluster: &str) -> FleetResult<Handle> {
        Ok(self.cluster_handle(app, cluster)?.level(Level::ClusterMetaGroup))
    }

    /// Group number -> clusters of `app` in that group. Clusters without a
    /// group are left out.
    pub fn cluster_group_map(&self, app: &str) -> FleetResult<BTreeMap<String, Vec<String>>> {
        let mut out: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for cluster in self.cluster_names(app)? {
            let h = self.cluster_meta_handle(app, &cluster)?;
            match self.db.get(h.as_str())? {
                Some(Value::String(g)) => out.entry(g).or_default().push(cluster),
                Some(other) => out.entry(other.to_string()).or_default().push(cluster),
                None => debug!(cluster = %cluster, "appcontext: no group number for cluster"),
            }
        }
        Ok(out)
    }

    pub fn add_resource(&self, handle: &Handle, name: &str, value: &Value) -> FleetResult<Handle> {
        self.add_child(handle, ChildKind::Resource, name, value)
    }

    pub fn resource_handle(&self, app: &str, cluster: &str, resource: &str) -> FleetResult<Handle> {
        let h = self.root()?.child(ChildKind::App, app)?.child(ChildKind::Cluster, cluster)?.child(ChildKind::Resource, resource)?;
        self.require(&h, || format!("no handle was found for resource {}", resource))
    }

    pub fn resource_status_handle(&self, app: &str, cluster: &str, resource: &str) -> FleetResult<Handle> {
        let h = self.resource_handle(app, cluster, resource)?.level(Level::Status);
        self.require(&h, || format!("no status handle was found for resource {}", resource))
    }

    /// Resources directly under a cluster; may be empty.
    pub fn resource_names(&self, app: &str, cluster: &str) -> FleetResult<Vec<String>> {
        let ch = self.root()?.child(ChildKind::App, app)?.child(ChildKind::Cluster, cluster)?;
        self.direct_children(&ch, ChildKind::Resource)
    }

    fn direct_children(&self, parent: &Handle, kind: ChildKind) -> FleetResult<Vec<String>> {
        let keys = self.db.keys(parent.as_str())?;
        Ok(keys.iter().filter_map(|k| parent.direct_child(kind, k)).map(str::to_string).collect())
    }

    pub fn add_instruction(&self, handle: &Handle, level: InstructionLevel, kind: InstructionType, value: &Value) -> FleetResult<Handle> {
        self.ensure_in_tree(handle)?;
        let h = handle.instruction(level, kind);
        self.db.put(h.as_str(), value)?;
        debug!(handle = %h, "appcontext: added instruction");
        Ok(h)
    }

    /// App-level instruction stored at the root (`app/instruction/<type>/`).
    pub fn app_instruction(&self, kind: InstructionType) -> FleetResult<Value> {
        let h = self.root()?.instruction(InstructionLevel::App, kind);
        self.get_value(&h)
    }

    /// Per-app dependency instruction (`app/<name>/instruction/dependency/`).
    pub fn app_level_instruction(&self, app: &str, kind: InstructionType) -> FleetResult<Value> {
        if kind != InstructionType::Dependency {
            return Err(FleetError::bad_request("not a valid app context instruction type"));
        }
        let h = self.root()?.child(ChildKind::App, app)?.own_instruction(kind);
        self.get_value(&h)
    }

    pub fn resource_instruction(&self, app: &str, cluster: &str, kind: InstructionType) -> FleetResult<Value> {
        let h = self.root()?.child(ChildKind::App, app)?.child(ChildKind::Cluster, cluster)?.instruction(InstructionLevel::Resource, kind);
        self.get_value(&h)
    }

    pub fn add_level_value(&self, handle: &Handle, level: Level, value: &Value) -> FleetResult<Handle> {
        self.ensure_in_tree(handle)?;
        let h = handle.level(level);
        self.db.put(h.as_str(), value)?;
        Ok(h)
    }

    pub fn cluster_status_handle(&self, app: &str, cluster: &str) -> FleetResult<Handle> {
        let h = self.cluster_handle(app, cluster)?.level(Level::Status);
        self.require(&h, || format!("no status handle was found for cluster {}", cluster))
    }

    /// Overwrite an existing node.
    pub fn update_value(&self, handle: &Handle, value: &Value) -> FleetResult<()> {
        self.ensure_in_tree(handle)?;
        self.require(handle, || format!("handle {} not found", handle))?;
        self.db.put(handle.as_str(), value)?;
        Ok(())
    }

    /// `handle` and every descendant, in key order.
    pub fn all_handles(&self, handle: &Handle) -> FleetResult<Vec<Handle>> {
        let keys = self.db.keys(handle.as_str())?;
        Ok(keys.iter().filter_map(|k| Handle::parse(k).ok()).collect())
    }

    pub fn get_value(&self, handle: &Handle) -> FleetResult<Value> {
        self.db.get(handle.as_str())?.ok_or_else(|| FleetError::not_found(format!("no value at {}", handle)))
    }

    pub fn delete_subtree(&self, handle: &Handle) -> FleetResult<()> {
        self.ensure_in_tree(handle)?;
        self.db.delete_prefix(handle.as_str())?;
        Ok(())
    }

    /// Aggregate status at the root `status/` level.
    pub fn status(&self) -> FleetResult<AppContextStatus> {
        let h = self.root()?.level(Level::Status);
        Ok(serde_json::from_value(self.get_value(&h)?)?)
    }

    pub fn set_status(&self, status: ContextStatus) -> FleetResult<()> {
        let root = self.root()?.clone();
        self.add_level_value(&root, Level::Status, &serde_json::to_value(AppContextStatus { status })?)?;
        info!(ctx = %root.context_id(), status = %status, "appcontext: status updated");
        Ok(())
    }

    pub fn set_stop_flag(&self, stop: bool) -> FleetResult<()> {
        let root = self.root()?.clone();
        self.add_level_value(&root, Level::StopFlag, &Value::Bool(stop))?;
        Ok(())
    }

    /// Point this context's live-status reads at another context.
    pub fn set_status_context_id(&self, id: &str) -> FleetResult<()> {
        let root = self.root()?.clone();
        self.add_level_value(&root, Level::StatusAppCtxId, &Value::String(id.to_string()))?;
        Ok(())
    }
}

/// Decode a stored value that may be a JSON document or a JSON string
/// carrying one.
pub fn decode_value<T: serde::de::DeserializeOwned>(v: Value) -> FleetResult<T> {
    match v {
        Value::String(s) => match serde_json::from_str(&s) {
            Ok(t) => Ok(t),
            Err(_) => Ok(serde_json::from_value(Value::String(s))?),
        },
        other => Ok(serde_json::from_value(other)?),
    }
}
