use std::sync::Arc;
use std::time::Instant;

use fleet_appcontext::{decode_value, split_pair, AppContext, ChildKind, Handle, Level};
use fleet_core::{ApplyStatus, ClusterReadyStatus, FleetError, FleetResult, ResourceApplyStatus};
use fleet_persist::ContextDb;
use fleet_state::StateInfo;
use metrics::histogram;
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    parse_manifest, AppStatus, AppsListResult, ClusterEntry, ClusterStatus, ClusterStatusResult, ClustersByAppEntry, ClustersByAppResult, Counts,
    OutputMode, PlanObject, ReadyChecker, ReadyState, ResourceBundleStatus, ResourceEntry, ResourceStatus, ResourcesByAppEntry,
    ResourcesByAppResult, StatusQuery, StatusResult, StatusType,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueryKind {
    /// Whole plan; reports child context ids.
    Plan,
    Cluster,
    LogicalCloud,
}

/// Operational and status context of one query.
struct Resolved {
    ac: AppContext,
    sac: AppContext,
}

fn keep(name: &str, filter: &[String]) -> bool { filter.is_empty() || filter.iter().any(|f| f == name) }

fn bump(counts: &mut Counts, key: &str) { *counts.entry(key.to_string()).or_default() += 1; }

fn drop_not_present(counts: &mut Counts) {
    let key = ReadyState::NotPresent.as_str();
    if let Some(n) = counts.get_mut(key) {
        *n -= 1;
        if *n == 0 {
            counts.remove(key);
        }
    }
}

/// Status queries over context trees.
#[derive(Clone)]
pub struct Aggregator {
    db: Arc<dyn ContextDb>,
    checker: ReadyChecker,
}

impl Aggregator {
    pub fn new(db: Arc<dyn ContextDb>) -> Self { Self { db, checker: ReadyChecker::default() } }

    pub fn with_checker(mut self, checker: ReadyChecker) -> Self {
        self.checker = checker;
        self
    }

    /// Current and status context ids for `instance`, or for the latest
    /// action. `None` while nothing was instantiated.
    fn context_ids(s: &StateInfo, instance: Option<&str>) -> FleetResult<Option<(String, String)>> {
        match instance {
            Some(i) => Ok(Some((i.to_string(), s.status_context_for(i)?.to_string()))),
            None => Ok(s.last_context_id().map(|cur| (cur.to_string(), s.status_context_id().unwrap_or(cur).to_string()))),
        }
    }

    fn open(&self, id: &str) -> FleetResult<AppContext> {
        AppContext::open(self.db.clone(), id).map_err(|e| FleetError::not_found(format!("app context {} for status query not found: {}", id, e)))
    }

    fn resolve(&self, s: &StateInfo, instance: Option<&str>) -> FleetResult<Option<Resolved>> {
        let Some((cur, sid)) = Self::context_ids(s, instance)? else { return Ok(None) };
        Ok(Some(Resolved { ac: self.open(&cur)?, sac: self.open(&sid)? }))
    }

    /// Plan-wide status (deployment intent groups and alike).
    pub fn status(&self, s: &StateInfo, q: &StatusQuery) -> FleetResult<StatusResult> { self.timed(QueryKind::Plan, s, q) }

    /// Plan status restricted to the first matching cluster.
    pub fn cluster_status(&self, s: &StateInfo, q: &StatusQuery) -> FleetResult<ClusterStatusResult> {
        let r = self.timed(QueryKind::Cluster, s, q)?;
        let cluster = r.apps.first().and_then(|a| a.clusters.first()).cloned();
        Ok(if q.status_type.is_legacy() {
            ClusterStatusResult {
                name: r.name,
                state: r.state,
                status: r.status,
                rsync_status: r.rsync_status,
                cluster_status: r.cluster_status,
                cluster,
                ..Default::default()
            }
        } else {
            ClusterStatusResult {
                name: r.name,
                state: r.state,
                deployed_status: r.deployed_status,
                ready_status: r.ready_status,
                deployed_counts: r.deployed_counts,
                ready_counts: r.ready_counts,
                cluster,
                ..Default::default()
            }
        })
    }

    /// Deployed summary of a logical cloud; no filters, no per-app tree.
    pub fn logical_cloud_status(&self, s: &StateInfo) -> FleetResult<StatusResult> {
        let q = StatusQuery::new(StatusType::Deployed, OutputMode::All);
        let mut r = self.timed(QueryKind::LogicalCloud, s, &q)?;
        r.apps.clear();
        Ok(r)
    }

    fn timed(&self, kind: QueryKind, s: &StateInfo, q: &StatusQuery) -> FleetResult<StatusResult> {
        let started = Instant::now();
        let out = self.prepare(kind, s, q);
        histogram!("status_query_ms", started.elapsed().as_secs_f64() * 1000.0);
        out
    }

    fn prepare(&self, kind: QueryKind, s: &StateInfo, q: &StatusQuery) -> FleetResult<StatusResult> {
        let mut out = StatusResult { state: s.clone(), ..Default::default() };
        let Some(Resolved { ac, sac }) = self.resolve(s, q.instance.as_deref())? else { return Ok(out) };

        let current = fleet_state::app_context_status(&self.db, ac.context_id()?)?.status;
        if q.status_type.is_legacy() {
            out.status = Some(current);
        } else {
            out.deployed_status = Some(current);
        }

        let meta = sac.composite_app_meta();
        if kind == QueryKind::Plan {
            out.child_context_ids = meta.as_ref().map_err(|e| FleetError::not_found(format!("composite app meta: {}", e)))?.child_context_ids.clone();
        }

        let mut deployed = Counts::new();
        let mut ready = Counts::new();
        let apps = ac.app_names()?;
        for f in &q.apps {
            if !apps.contains(f) {
                let ca = meta.as_ref().map(|m| m.composite_app.as_str()).unwrap_or_default();
                return Err(FleetError::bad_request(format!("Filter app {} not in list of apps for composite app {}", f, ca)));
            }
        }

        for app in apps.iter().filter(|a| keep(a, &q.apps)) {
            let Ok(clusters) = ac.cluster_names(app) else { continue };
            let mut app_status = AppStatus { name: app.clone(), clusters: Vec::new() };
            let mut app_count = 0;
            for cluster in clusters.iter().filter(|c| keep(c, &q.clusters)) {
                let entry = ClusterEntry::from_pair(cluster);
                let conn = self.connectivity(&sac, app, cluster);
                let mut cs = ClusterStatus { cluster_provider: entry.cluster_provider, cluster: entry.cluster, ..Default::default() };
                if q.status_type.is_legacy() {
                    cs.ready_status = Some(conn);
                } else {
                    cs.connectivity = Some(conn);
                }
                let ch = match ac.cluster_handle(app, cluster) {
                    Ok(h) => h,
                    Err(e) => {
                        warn!(app = %app, cluster = %cluster, error = %e, "status: no handle for cluster");
                        continue;
                    }
                };
                let mut count = match self.plan_resources(&ac, &sac, &ch, app, cluster, q, &mut cs.resources, &mut deployed, &mut ready) {
                    Ok(n) => n,
                    Err(e) => {
                        warn!(app = %app, cluster = %cluster, error = %e, "status: gathering plan resources failed");
                        continue;
                    }
                };
                if q.status_type.reads_live() {
                    if let Some(bundle) = self.live_bundle(&sac, app, cluster) {
                        count += self.merge_live(&bundle, q, &mut cs.resources, &mut ready);
                    }
                }
                debug!(app = %app, cluster = %cluster, count, "status: cluster resources");
                if count > 0 {
                    app_status.clusters.push(cs);
                    app_count += count;
                }
            }
            if app_count > 0 && q.output != OutputMode::Summary {
                out.apps.push(app_status);
            }
        }

        let blocked = ready.get(ReadyState::NotPresent.as_str()).copied().unwrap_or(0) > 0
            || ready.get(ReadyState::NotReady.as_str()).copied().unwrap_or(0) > 0;
        if blocked {
            out.ready_status = Some(ReadyState::NotReady);
        } else if q.status_type.reads_live() {
            out.ready_status = Some(ReadyState::Ready);
        }
        if q.status_type.is_legacy() {
            out.rsync_status = deployed;
            out.cluster_status = ready;
        } else {
            out.deployed_counts = deployed;
            out.ready_counts = ready;
        }
        Ok(out)
    }

    /// Connectivity recorded in the cluster's reference context; `Unknown`
    /// when any link of the chain is missing.
    fn connectivity(&self, sac: &AppContext, app: &str, cluster: &str) -> String {
        let read = || -> FleetResult<String> {
            let ch = sac.cluster_handle(app, cluster)?;
            let ref_id: String = decode_value(sac.get_value(&ch.level(Level::Reference))?)?;
            let rf = self.open(&ref_id)?;
            let rh = rf.cluster_handle(app, cluster)?;
            decode_value(rf.get_value(&rh.level(Level::ReadyStatus))?)
        };
        read().unwrap_or_else(|e| {
            debug!(app = %app, cluster = %cluster, error = %e, "status: cluster connectivity unknown");
            ClusterReadyStatus::Unknown.as_str().to_string()
        })
    }

    /// Resources in the plan under `ch`, with their apply state. Counted
    /// as not present on the readiness axis until a live entry arrives.
    #[allow(clippy::too_many_arguments)]
    fn plan_resources(
        &self,
        ac: &AppContext,
        sac: &AppContext,
        ch: &Handle,
        app: &str,
        cluster: &str,
        q: &StatusQuery,
        out: &mut Vec<ResourceStatus>,
        deployed: &mut Counts,
        ready: &mut Counts,
    ) -> FleetResult<usize> {
        let sid = sac.context_id()?.to_string();
        let mut count = 0;
        for h in ac.all_handles(ch)? {
            let Some(name) = ch.direct_child(ChildKind::Resource, h.as_str()) else { continue };
            if split_pair(name).is_none() {
                continue;
            }
            let sh = h.rebase(&sid)?;
            let apply = self
                .db
                .get(sh.level(Level::Status).as_str())
                .ok()
                .flatten()
                .and_then(|v| decode_value::<ResourceApplyStatus>(v).ok())
                .map(|s| s.status)
                .unwrap_or(ApplyStatus::Pending);
            let obj = match self.from_reference(ac, sac, &sh, app, cluster, name) {
                Ok(Some(o)) => o,
                Ok(None) => continue,
                Err(e) => {
                    debug!(resource = %name, error = %e, "status: resource skipped");
                    continue;
                }
            };
            if !keep(&obj.name, &q.resources) {
                continue;
            }
            let mut r = ResourceStatus { gvk: obj.gvk, name: obj.name, ..Default::default() };
            if q.output == OutputMode::Detail {
                r.detail = Some(obj.raw);
            }
            match q.status_type {
                StatusType::Rsync => {
                    r.rsync_status = Some(apply.as_str().to_string());
                    bump(deployed, apply.as_str());
                }
                StatusType::Deployed => {
                    r.deployed_status = Some(apply.as_str().to_string());
                    bump(deployed, apply.as_str());
                }
                StatusType::Ready => {
                    r.ready_status = Some(ReadyState::NotPresent.as_str().to_string());
                    bump(ready, ReadyState::NotPresent.as_str());
                }
                StatusType::Cluster => {
                    r.cluster_status = Some(ReadyState::NotPresent.as_str().to_string());
                    bump(ready, ReadyState::NotPresent.as_str());
                }
            }
            out.push(r);
            count += 1;
        }
        Ok(count)
    }

    /// Plan object of a resource, read from the context its status
    /// `reference` names. `None` when the status context is the current one
    /// but the resource belongs to an older plan.
    fn from_reference(&self, ac: &AppContext, sac: &AppContext, sh: &Handle, app: &str, cluster: &str, name: &str) -> FleetResult<Option<PlanObject>> {
        let ref_id: String = decode_value(sac.get_value(&sh.level(Level::Reference))?)?;
        let rf = self.open(&ref_id)?;
        let manifest: Value = rf.get_value(&rf.resource_handle(app, cluster, name)?)?;
        let (cur, sid) = (ac.context_id()?, sac.context_id()?);
        if cur == sid && ref_id != cur {
            return Ok(None);
        }
        Ok(Some(parse_manifest(&manifest)?))
    }

    fn live_bundle(&self, sac: &AppContext, app: &str, cluster: &str) -> Option<ResourceBundleStatus> {
        let read = || -> FleetResult<ResourceBundleStatus> { decode_value(sac.get_value(&sac.cluster_status_handle(app, cluster)?)?) };
        match read() {
            Ok(b) => Some(b),
            Err(e) => {
                debug!(app = %app, cluster = %cluster, error = %e, "status: no live status for cluster");
                None
            }
        }
    }

    /// Fold live entries into `out`: a plan resource with the same name and
    /// GVK takes the live verdict, anything else is appended. Returns the
    /// number of appended entries.
    fn merge_live(&self, bundle: &ResourceBundleStatus, q: &StatusQuery, out: &mut Vec<ResourceStatus>, ready: &mut Counts) -> usize {
        let mut added = 0;
        for e in bundle.entries(&self.checker) {
            if !keep(&e.name, &q.resources) {
                continue;
            }
            let state = ReadyState::from_bool(e.ready);
            bump(ready, state.as_str());
            let detail = (q.output == OutputMode::Detail).then_some(e.detail);
            let verdict = Some(state.as_str().to_string());
            match out.iter_mut().find(|r| r.name == e.name && r.gvk == e.gvk) {
                Some(r) => {
                    r.detail = detail;
                    if q.status_type == StatusType::Cluster {
                        r.cluster_status = verdict;
                    } else {
                        r.ready_status = verdict;
                    }
                    drop_not_present(ready);
                }
                None => {
                    let mut r = ResourceStatus { gvk: e.gvk, name: e.name, detail, ..Default::default() };
                    if q.status_type == StatusType::Cluster {
                        r.cluster_status = verdict;
                    } else {
                        r.ready_status = verdict;
                    }
                    out.push(r);
                    added += 1;
                }
            }
        }
        added
    }

    fn current_context(&self, s: &StateInfo, instance: Option<&str>) -> FleetResult<Option<AppContext>> {
        let id = match instance {
            Some(i) => {
                s.status_context_for(i)?;
                Some(i)
            }
            None => s.last_context_id(),
        };
        id.map(|i| self.open(i)).transpose()
    }

    pub fn apps(&self, s: &StateInfo, instance: Option<&str>) -> FleetResult<AppsListResult> {
        let apps = match self.current_context(s, instance)? {
            Some(ac) => ac.app_names()?,
            None => Vec::new(),
        };
        Ok(AppsListResult { apps, ..Default::default() })
    }

    pub fn clusters_by_app(&self, s: &StateInfo, instance: Option<&str>, apps: &[String]) -> FleetResult<ClustersByAppResult> {
        let mut out = ClustersByAppResult::default();
        let Some(ac) = self.current_context(s, instance)? else { return Ok(out) };
        for app in ac.app_names()?.into_iter().filter(|a| keep(a, apps)) {
            let clusters = ac.cluster_names(&app).unwrap_or_default().iter().map(|c| ClusterEntry::from_pair(c)).collect();
            out.clusters_by_app.push(ClustersByAppEntry { app, clusters });
        }
        Ok(out)
    }

    /// Resource identities per app and cluster, plan and live combined.
    pub fn resources_by_app(&self, s: &StateInfo, q: &StatusQuery) -> FleetResult<ResourcesByAppResult> {
        let mut out = ResourcesByAppResult::default();
        let Some(Resolved { ac, sac }) = self.resolve(s, q.instance.as_deref())? else { return Ok(out) };
        let unfiltered = StatusQuery { output: OutputMode::All, resources: Vec::new(), ..q.clone() };
        for app in ac.app_names()?.into_iter().filter(|a| keep(a, &q.apps)) {
            let Ok(clusters) = ac.cluster_names(&app) else { continue };
            for cluster in clusters.iter().filter(|c| keep(c, &q.clusters)) {
                let Ok(ch) = ac.cluster_handle(&app, cluster) else { continue };
                let (mut deployed, mut ready) = (Counts::new(), Counts::new());
                let mut resources = Vec::new();
                if let Err(e) = self.plan_resources(&ac, &sac, &ch, &app, cluster, &unfiltered, &mut resources, &mut deployed, &mut ready) {
                    warn!(app = %app, cluster = %cluster, error = %e, "status: gathering plan resources failed");
                    continue;
                }
                if q.status_type.reads_live() {
                    if let Some(bundle) = self.live_bundle(&sac, &app, cluster) {
                        self.merge_live(&bundle, &unfiltered, &mut resources, &mut ready);
                    }
                }
                let entry = ClusterEntry::from_pair(cluster);
                out.resources_by_app.push(ResourcesByAppEntry {
                    app: app.clone(),
                    cluster_provider: entry.cluster_provider,
                    cluster: entry.cluster,
                    resources: resources.into_iter().map(|r| ResourceEntry { name: r.name, gvk: r.gvk }).collect(),
                });
            }
        }
        Ok(out)
    }
}
