//! Live-status documents reported by cluster monitors, one per app and
//! cluster, stored at `<cluster handle>status/`.

use fleet_appcontext::{AppContext, Level};
use fleet_core::{FleetResult, Gvk};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::certificates::v1::CertificateSigningRequest;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::ReadyChecker;

/// Label the job controller puts on the pods it spawns.
const JOB_NAME_LABEL: &str = "job-name";

/// Object of a kind without a typed status section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenericResourceStatus {
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    /// Raw object, as JSON text.
    #[serde(default)]
    pub res: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceBundleStatus {
    pub ready: bool,
    pub resource_count: i32,
    pub pod_statuses: Vec<Pod>,
    pub service_statuses: Vec<Service>,
    pub config_map_statuses: Vec<ConfigMap>,
    pub deployment_statuses: Vec<Deployment>,
    pub secret_statuses: Vec<Secret>,
    pub daemon_set_statuses: Vec<DaemonSet>,
    pub ingress_statuses: Vec<Ingress>,
    pub job_statuses: Vec<Job>,
    pub stateful_set_statuses: Vec<StatefulSet>,
    pub csr_statuses: Vec<CertificateSigningRequest>,
    pub resource_statuses: Vec<GenericResourceStatus>,
}

/// One live object with its readiness verdict.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveEntry {
    pub name: String,
    pub gvk: Gvk,
    pub ready: bool,
    pub detail: Value,
}

fn gvk_of<K: k8s_openapi::Resource>() -> Gvk { Gvk::new(K::GROUP, K::VERSION, K::KIND) }

fn name_of(meta: &ObjectMeta) -> String { meta.name.clone().unwrap_or_default() }

fn push<K>(out: &mut Vec<LiveEntry>, items: &[K], meta: impl Fn(&K) -> &ObjectMeta, ready: impl Fn(&K) -> bool)
where
    K: k8s_openapi::Resource + Serialize,
{
    for it in items {
        out.push(LiveEntry {
            name: name_of(meta(it)),
            gvk: gvk_of::<K>(),
            ready: ready(it),
            detail: serde_json::to_value(it).unwrap_or(Value::Null),
        });
    }
}

impl ResourceBundleStatus {
    /// Every reported object in report order. Kinds without a readiness
    /// rule count as ready once present.
    pub fn entries(&self, rc: &ReadyChecker) -> Vec<LiveEntry> {
        let mut out = Vec::new();
        push(&mut out, &self.pod_statuses, |p| &p.metadata, |p| {
            let job = p.metadata.labels.as_ref().map_or(false, |l| l.contains_key(JOB_NAME_LABEL));
            if job { rc.pod_success(p) } else { rc.pod_ready(p) }
        });
        push(&mut out, &self.service_statuses, |s| &s.metadata, |s| rc.service_ready(s));
        push(&mut out, &self.deployment_statuses, |d| &d.metadata, |d| rc.deployment_ready(d));
        push(&mut out, &self.config_map_statuses, |c| &c.metadata, |_| true);
        push(&mut out, &self.secret_statuses, |s| &s.metadata, |_| true);
        push(&mut out, &self.ingress_statuses, |i| &i.metadata, |_| true);
        push(&mut out, &self.daemon_set_statuses, |d| &d.metadata, |d| rc.daemon_set_ready(d));
        push(&mut out, &self.job_statuses, |j| &j.metadata, |j| rc.job_ready(j));
        push(&mut out, &self.stateful_set_statuses, |s| &s.metadata, |s| rc.stateful_set_ready(s));
        push(&mut out, &self.csr_statuses, |c| &c.metadata, |_| true);
        for g in &self.resource_statuses {
            out.push(LiveEntry {
                name: g.name.clone(),
                gvk: Gvk::new(g.group.clone(), g.version.clone(), g.kind.clone()),
                ready: true,
                detail: serde_json::from_str(&g.res).unwrap_or_else(|_| Value::String(g.res.clone())),
            });
        }
        out
    }

    /// All workloads on the cluster are ready. A bundle reporting no
    /// workload at all is not.
    pub fn is_app_ready(&self, rc: &ReadyChecker) -> bool {
        let checks: Vec<bool> = self
            .service_statuses
            .iter()
            .map(|s| rc.service_ready(s))
            .chain(self.deployment_statuses.iter().map(|d| rc.deployment_ready(d)))
            .chain(self.daemon_set_statuses.iter().map(|d| rc.daemon_set_ready(d)))
            .chain(self.job_statuses.iter().map(|j| rc.job_ready(j)))
            .chain(self.stateful_set_statuses.iter().map(|s| rc.stateful_set_ready(s)))
            .chain(self.pod_statuses.iter().map(|p| rc.pod_ready(p)))
            .collect();
        !checks.is_empty() && checks.into_iter().all(|b| b)
    }
}

/// Store a cluster's live document and its `resourcesready` flag. Returns
/// true once every cluster of `app` is ready.
pub fn record_cluster_status(ac: &AppContext, app: &str, cluster: &str, bundle: &ResourceBundleStatus, rc: &ReadyChecker) -> FleetResult<bool> {
    let ch = ac.cluster_handle(app, cluster)?;
    ac.add_level_value(&ch, Level::Status, &serde_json::to_value(bundle)?)?;
    let ready = bundle.is_app_ready(rc);
    ac.add_level_value(&ch, Level::ResourcesReady, &Value::Bool(ready))?;
    debug!(app = %app, cluster = %cluster, ready, "status: recorded cluster status");
    if !ready {
        return Ok(false);
    }
    for c in ac.cluster_names(app)? {
        let h = ac.cluster_handle(app, &c)?.level(Level::ResourcesReady);
        if !matches!(ac.db().get(h.as_str())?, Some(Value::Bool(true))) {
            return Ok(false);
        }
    }
    info!(app = %app, "status: app ready on all clusters");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_persist::MemStore;
    use serde_json::json;
    use std::sync::Arc;

    fn bundle(v: Value) -> ResourceBundleStatus { serde_json::from_value(v).unwrap() }

    #[test]
    fn entries_cover_every_kind() {
        let b = bundle(json!({
            "ready": false,
            "resourceCount": 4,
            "podStatuses": [
                {"metadata": {"name": "web-0"}, "status": {"conditions": [{"type": "Ready", "status": "True"}]}},
                {"metadata": {"name": "migrate-x", "labels": {"job-name": "migrate"}}, "status": {"phase": "Running"}}
            ],
            "configMapStatuses": [{"metadata": {"name": "cfg"}}],
            "resourceStatuses": [{"group": "cert-manager.io", "version": "v1", "kind": "Certificate", "name": "c", "res": "{\"spec\":{}}"}]
        }));
        let e = b.entries(&ReadyChecker::default());
        let got: Vec<(&str, &str, bool)> = e.iter().map(|x| (x.name.as_str(), x.gvk.kind.as_str(), x.ready)).collect();
        assert_eq!(got, vec![("web-0", "Pod", true), ("migrate-x", "Pod", false), ("cfg", "ConfigMap", true), ("c", "Certificate", true)]);
        assert_eq!(e[2].gvk, Gvk::new("", "v1", "ConfigMap"));
        assert_eq!(e[3].detail, json!({"spec": {}}));
    }

    #[test]
    fn app_ready_needs_a_workload() {
        let rc = ReadyChecker::default();
        assert!(!bundle(json!({"configMapStatuses": [{"metadata": {"name": "cfg"}}]})).is_app_ready(&rc));
        let ok = bundle(json!({"serviceStatuses": [{"metadata": {"name": "s"}, "spec": {"clusterIP": "10.0.0.1"}}]}));
        assert!(ok.is_app_ready(&rc));
    }

    #[test]
    fn ready_on_all_clusters() {
        let mut ac = AppContext::new(Arc::new(MemStore::new()));
        ac.init().unwrap();
        let root = ac.create_composite_app().unwrap();
        let app = ac.add_app(&root, "a").unwrap();
        ac.add_cluster(&app, "p+c1").unwrap();
        ac.add_cluster(&app, "p+c2").unwrap();
        let rc = ReadyChecker::default();
        let ok = bundle(json!({"serviceStatuses": [{"metadata": {"name": "s"}, "spec": {"clusterIP": "10.0.0.1"}}]}));
        assert!(!record_cluster_status(&ac, "a", "p+c1", &ok, &rc).unwrap());
        assert!(record_cluster_status(&ac, "a", "p+c2", &ok, &rc).unwrap());
        let stored = ac.get_value(&ac.cluster_status_handle("a", "p+c1").unwrap()).unwrap();
        assert_eq!(stored["serviceStatuses"][0]["metadata"]["name"], "s");
    }
}
