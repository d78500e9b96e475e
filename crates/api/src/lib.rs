//! Fleet API façade (in-process, Milestone 4).
//!
//! Lifecycle flows shared by every domain controller: build a context for a
//! deployment plan, drive it through the lifecycle log and hand it to the
//! resource synchronizer. The synchronizer and the ready-notify feed are
//! traits so frontends and tests can plug in their own.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use fleet_appcontext::{AppContext, CompositeAppMeta, ContextBuilder, Level};
use fleet_core::{ApplyStatus, Backoff, ClusterReadyStatus, Config, ContextStatus, FleetError, FleetResult, ResourceApplyStatus, Scope};
use fleet_persist::{ContextDb, DocStore};
use fleet_state::{LifecycleEvent, StateClient, StateValue};
use fleet_status::{parse_manifest, Aggregator, StatusQuery, StatusResult};
use futures::StreamExt;
use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub use fleet_notify::{EventStream, ReadyEvent, ReadyNotifyClient};

/// Applies contexts to the remote clusters.
#[async_trait::async_trait]
pub trait ResourceSynchronizer: Send + Sync {
    async fn install_app(&self, context_id: &str) -> FleetResult<()>;
    /// Move the clusters from context `from` to context `to`.
    async fn update_app(&self, from: &str, to: &str) -> FleetResult<()>;
    async fn uninstall_app(&self, context_id: &str) -> FleetResult<()>;
}

/// Resources of one app on one cluster. Manifests are YAML strings or
/// inline objects; each becomes a `name+Kind` resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterPlan {
    /// `provider+cluster`.
    pub name: String,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub manifests: Vec<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppPlan {
    pub name: String,
    #[serde(default)]
    pub clusters: Vec<ClusterPlan>,
}

/// Everything needed to build one context. Apps are installed in order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentPlan {
    #[serde(default)]
    pub meta: CompositeAppMeta,
    pub apps: Vec<AppPlan>,
}

/// Instantiate / update / terminate / status for resources keyed by `Scope`.
pub struct LifecycleClient {
    docs: Arc<dyn DocStore>,
    contexts: Arc<dyn ContextDb>,
    sync: Arc<dyn ResourceSynchronizer>,
    retrieve: Backoff,
    aggregator: Aggregator,
}

impl LifecycleClient {
    pub fn new(docs: Arc<dyn DocStore>, contexts: Arc<dyn ContextDb>, sync: Arc<dyn ResourceSynchronizer>, cfg: &Config) -> Self {
        let aggregator = Aggregator::new(Arc::clone(&contexts));
        Self { docs, contexts, sync, retrieve: cfg.retrieve_backoff, aggregator }
    }

    pub fn state(&self, key: &Scope) -> StateClient { StateClient::new(Arc::clone(&self.docs), Arc::clone(&self.contexts), key.clone()) }

    /// Start the lifecycle log of a newly created resource.
    pub fn create(&self, key: &Scope) -> FleetResult<()> { self.state(key).create("") }

    /// Remove the lifecycle log. Refused while a context is live.
    pub fn delete(&self, key: &Scope) -> FleetResult<()> {
        let state = self.state(key);
        let s = state.get()?;
        if let Some(ctx) = s.last_context_id() {
            let status = fleet_state::app_context_status(&self.contexts, ctx)?.status;
            if !matches!(status, ContextStatus::Terminated | ContextStatus::TerminateFailed) {
                return Err(FleetError::conflict(format!("{}: cannot delete, context {} is {}", key, ctx, status)));
            }
        }
        state.delete()
    }

    /// Write `plan` as a fresh context with every resource owning its own
    /// live status. Any failure deletes the partial tree.
    fn build(&self, plan: &DeploymentPlan) -> FleetResult<AppContext> {
        if plan.apps.is_empty() {
            return Err(FleetError::bad_request("deployment plan has no apps"));
        }
        let b = ContextBuilder::begin(Arc::clone(&self.contexts), Some(&plan.meta))?;
        let own = Value::String(b.context_id().to_string());
        for app in &plan.apps {
            let ah = b.add_app(&app.name)?;
            for cluster in &app.clusters {
                let ch = b.add_cluster(&ah, &cluster.name)?;
                b.add_level_value(&ch, Level::Reference, &own)?;
                for g in &cluster.groups {
                    b.add_cluster_meta_grp(&ch, g)?;
                }
                let mut order = Vec::with_capacity(cluster.manifests.len());
                for m in &cluster.manifests {
                    let obj = b.step(|_| parse_manifest(m))?;
                    let name = format!("{}+{}", obj.name, obj.gvk.kind);
                    let rh = b.add_resource(&ch, &name, m)?;
                    b.add_level_value(&rh, Level::Reference, &own)?;
                    order.push(name);
                }
                let order: Vec<&str> = order.iter().map(String::as_str).collect();
                b.add_resource_order(&ch, &order)?;
            }
        }
        let apps: Vec<&str> = plan.apps.iter().map(|a| a.name.as_str()).collect();
        b.add_app_order(&apps)?;
        b.step(|ac| ac.set_status(ContextStatus::Instantiating))?;
        Ok(b.finish())
    }

    /// Re-open a context just written, retrying while the store has not
    /// caught up yet.
    pub async fn retrieve_app_context(&self, context_id: &str) -> FleetResult<AppContext> {
        let mut attempt = 0;
        loop {
            match AppContext::open(Arc::clone(&self.contexts), context_id) {
                Ok(ac) => return Ok(ac),
                Err(e) if e.is_not_found() && attempt < self.retrieve.max_retries => {
                    let delay = self.retrieve.delay(attempt);
                    debug!(ctx = %context_id, attempt, delay_ms = delay.as_millis() as u64, "api: context not visible yet");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn mark_failed(&self, state: &StateClient, ac: &AppContext, context_id: &str, sv: StateValue, cs: ContextStatus) {
        if let Err(e) = ac.set_status(cs) {
            warn!(ctx = %context_id, error = %e, "api: could not record context failure");
        }
        if let Err(e) = state.update(sv, context_id, false) {
            warn!(key = %state.key(), ctx = %context_id, error = %e, "api: could not record lifecycle failure");
        }
        counter!("api_lifecycle_failed_total", 1u64);
    }

    /// Build a context for `plan`, record it as instantiated and install it.
    /// Returns the new context id.
    pub async fn instantiate(&self, key: &Scope, plan: &DeploymentPlan) -> FleetResult<String> {
        let t0 = Instant::now();
        let state = self.state(key);
        let ac = self.build(plan)?;
        let ctx = ac.context_id()?.to_string();
        match state.transition(LifecycleEvent::Instantiate, StateValue::Instantiated, &ctx) {
            Ok(prev) => debug!(key = %key, ctx = %ctx, prev = ?prev, "api: instantiate accepted"),
            Err(e) => return Err(ac.rollback(e)),
        }
        let ac = self.retrieve_app_context(&ctx).await?;
        if let Err(e) = self.sync.install_app(&ctx).await {
            warn!(key = %key, ctx = %ctx, error = %e, "api: install failed");
            self.mark_failed(&state, &ac, &ctx, StateValue::InstantiateFailed, ContextStatus::InstantiateFailed);
            return Err(e);
        }
        histogram!("api_instantiate_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(key = %key, ctx = %ctx, "api: instantiated");
        Ok(ctx)
    }

    /// Replace the live context with one built from `plan`. Only an
    /// instantiated or updated resource can be updated.
    pub async fn update(&self, key: &Scope, plan: &DeploymentPlan) -> FleetResult<String> {
        let state = self.state(key);
        let s = state.get()?;
        let current = s.current_state()?;
        if !matches!(current, StateValue::Instantiated | StateValue::Updated | StateValue::Applied) {
            return Err(FleetError::conflict(format!("{}: Failed to Update. The resource is in {} state", key, current)));
        }
        let from = s.last_context_id().ok_or_else(|| FleetError::not_found(format!("{}: no context to update", key)))?.to_string();
        let ac = self.build(plan)?;
        let to = ac.context_id()?.to_string();
        if let Err(e) = state.update(StateValue::Updated, &to, false) {
            return Err(ac.rollback(e));
        }
        let ac = self.retrieve_app_context(&to).await?;
        if let Err(e) = self.sync.update_app(&from, &to).await {
            warn!(key = %key, from = %from, to = %to, error = %e, "api: update failed");
            self.mark_failed(&state, &ac, &to, StateValue::UpdateFailed, ContextStatus::UpdateFailed);
            return Err(e);
        }
        info!(key = %key, from = %from, to = %to, "api: updated");
        Ok(to)
    }

    /// Uninstall the current context. A resource that was never instantiated
    /// has nothing to terminate.
    pub async fn terminate(&self, key: &Scope) -> FleetResult<()> {
        let state = self.state(key);
        let Some(ctx) = state.transition_current(LifecycleEvent::Terminate, StateValue::Terminated)? else {
            info!(key = %key, "api: nothing to terminate");
            return Ok(());
        };
        let ac = self.retrieve_app_context(&ctx).await?;
        ac.set_status(ContextStatus::Terminating)?;
        if let Err(e) = self.sync.uninstall_app(&ctx).await {
            warn!(key = %key, ctx = %ctx, error = %e, "api: uninstall failed");
            self.mark_failed(&state, &ac, &ctx, StateValue::TerminateFailed, ContextStatus::TerminateFailed);
            return Err(e);
        }
        info!(key = %key, ctx = %ctx, "api: terminated");
        Ok(())
    }

    pub fn status(&self, key: &Scope, q: &StatusQuery) -> FleetResult<StatusResult> {
        let s = self.state(key).get()?;
        let mut r = self.aggregator.status(&s, q)?;
        r.name = key.name().to_string();
        Ok(r)
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> { m.lock().unwrap_or_else(|e| e.into_inner()) }

// ----------------- Mock implementations -----------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncCall {
    Install(String),
    Update { from: String, to: String },
    Uninstall(String),
}

/// In-memory synchronizer: records calls and writes back what a real one
/// would report (resource apply states, cluster connectivity, context
/// status).
pub struct MockSynchronizer {
    db: Arc<dyn ContextDb>,
    calls: Mutex<Vec<SyncCall>>,
    fail_next: Mutex<Option<String>>,
}

impl MockSynchronizer {
    pub fn new(db: Arc<dyn ContextDb>) -> Self { Self { db, calls: Mutex::new(Vec::new()), fail_next: Mutex::new(None) } }

    pub fn calls(&self) -> Vec<SyncCall> { lock(&self.calls).clone() }

    /// Make the next call fail with `msg`.
    pub fn fail_next(&self, msg: impl Into<String>) { *lock(&self.fail_next) = Some(msg.into()); }

    fn record(&self, call: SyncCall) -> FleetResult<()> {
        lock(&self.calls).push(call);
        match lock(&self.fail_next).take() {
            Some(msg) => Err(FleetError::unknown(msg)),
            None => Ok(()),
        }
    }

    fn settle(&self, context_id: &str, apply: ApplyStatus, status: ContextStatus) -> FleetResult<()> {
        let ac = AppContext::open(Arc::clone(&self.db), context_id)?;
        let apply = serde_json::to_value(ResourceApplyStatus { status: apply })?;
        let available = Value::String(ClusterReadyStatus::Available.as_str().to_string());
        for app in ac.app_names()? {
            for cluster in ac.cluster_names(&app)? {
                let ch = ac.cluster_handle(&app, &cluster)?;
                ac.add_level_value(&ch, Level::ReadyStatus, &available)?;
                for r in ac.resource_names(&app, &cluster)? {
                    let rh = ac.resource_handle(&app, &cluster, &r)?;
                    ac.add_level_value(&rh, Level::Status, &apply)?;
                }
            }
        }
        ac.set_status(status)
    }
}

#[async_trait::async_trait]
impl ResourceSynchronizer for MockSynchronizer {
    async fn install_app(&self, context_id: &str) -> FleetResult<()> {
        self.record(SyncCall::Install(context_id.to_string()))?;
        self.settle(context_id, ApplyStatus::Applied, ContextStatus::Instantiated)
    }

    async fn update_app(&self, from: &str, to: &str) -> FleetResult<()> {
        self.record(SyncCall::Update { from: from.to_string(), to: to.to_string() })?;
        self.settle(to, ApplyStatus::Applied, ContextStatus::Instantiated)
    }

    async fn uninstall_app(&self, context_id: &str) -> FleetResult<()> {
        self.record(SyncCall::Uninstall(context_id.to_string()))?;
        self.settle(context_id, ApplyStatus::Deleted, ContextStatus::Terminated)
    }
}

type FeedKey = (String, String);

/// In-memory ready-notify feed. `publish` fans an event out to every
/// subscriber of its context.
#[derive(Default)]
pub struct MockReadyNotify {
    feeds: Mutex<FxHashMap<FeedKey, mpsc::UnboundedSender<FleetResult<ReadyEvent>>>>,
}

impl MockReadyNotify {
    pub fn new() -> Self { Self::default() }

    /// Number of subscribers reached.
    pub fn publish(&self, app_context: &str, app: &str, cluster: &str) -> usize {
        let ev = ReadyEvent { app_context: app_context.into(), app: app.into(), cluster: cluster.into() };
        lock(&self.feeds).iter().filter(|((_, ctx), _)| ctx == app_context).filter(|(_, tx)| tx.send(Ok(ev.clone())).is_ok()).count()
    }

    pub fn subscribers(&self) -> usize { lock(&self.feeds).len() }
}

#[async_trait::async_trait]
impl ReadyNotifyClient for MockReadyNotify {
    async fn alert(&self, client_name: &str, app_context_id: &str) -> FleetResult<EventStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.feeds).insert((client_name.to_string(), app_context_id.to_string()), tx);
        let s = futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|ev| (ev, rx)) });
        Ok(s.boxed())
    }

    async fn unsubscribe(&self, client_name: &str, app_context_id: &str) -> FleetResult<()> {
        lock(&self.feeds).remove(&(client_name.to_string(), app_context_id.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[test]
    fn plan_from_json() {
        let plan: DeploymentPlan = serde_json::from_value(serde_json::json!({
            "meta": {"Project": "p1", "CompositeApp": "ca"},
            "apps": [{"name": "web", "clusters": [{"name": "p+east", "manifests": ["kind: Pod"]}]}]
        }))
        .unwrap();
        assert_eq!(plan.meta.project, "p1");
        assert_eq!(plan.apps[0].clusters[0].name, "p+east");
        assert!(plan.apps[0].clusters[0].groups.is_empty());
    }

    #[tokio::test]
    async fn mock_feed_routes_by_context() {
        let feed = MockReadyNotify::new();
        let mut a = feed.alert("c1", "ctx-a").await.unwrap();
        let _b = feed.alert("c1", "ctx-b").await.unwrap();
        assert_eq!(feed.publish("ctx-a", "web", "p+east"), 1);
        let ev = a.next().await.unwrap().unwrap();
        assert_eq!((ev.app.as_str(), ev.cluster.as_str()), ("web", "p+east"));
        feed.unsubscribe("c1", "ctx-a").await.unwrap();
        assert_eq!(feed.publish("ctx-a", "web", "p+east"), 0);
        assert_eq!(feed.subscribers(), 1);
        assert!(a.next().await.is_none());
    }
}
