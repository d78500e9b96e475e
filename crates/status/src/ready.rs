//! Readiness predicates for live objects reported by cluster monitors.

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Pod, Service};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

/// Per-kind readiness rules.
#[derive(Debug, Clone, Copy)]
pub struct ReadyChecker {
    /// A paused deployment counts as ready.
    pub paused_as_ready: bool,
    /// Jobs must complete to count as ready.
    pub check_jobs: bool,
}

impl Default for ReadyChecker {
    fn default() -> Self { Self { paused_as_ready: true, check_jobs: true } }
}

/// Resolve an int-or-percent against `total`; percentages round up or down.
fn scaled(v: Option<&IntOrString>, total: i32, round_up: bool, default: i32) -> i32 {
    match v {
        None => default,
        Some(IntOrString::Int(i)) => *i,
        Some(IntOrString::String(s)) => match s.strip_suffix('%').and_then(|p| p.parse::<i64>().ok()) {
            Some(pct) => {
                let num = pct * total as i64;
                (if round_up { (num + 99) / 100 } else { num / 100 }) as i32
            }
            None => default,
        },
    }
}

impl ReadyChecker {
    pub fn pod_ready(&self, p: &Pod) -> bool {
        p.status
            .as_ref()
            .and_then(|s| s.conditions.as_ref())
            .map(|cs| cs.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
            .unwrap_or(false)
    }

    /// Pods spawned by a job are done once they succeed.
    pub fn pod_success(&self, p: &Pod) -> bool {
        p.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Succeeded")
    }

    pub fn service_ready(&self, s: &Service) -> bool {
        let Some(spec) = s.spec.as_ref() else { return false };
        let kind = spec.type_.as_deref().unwrap_or("ClusterIP");
        if kind == "ExternalName" {
            return true;
        }
        if spec.cluster_ip.as_deref().unwrap_or_default().is_empty() {
            return false;
        }
        if kind == "LoadBalancer" {
            if spec.external_ips.as_ref().map_or(false, |ips| !ips.is_empty()) {
                return true;
            }
            let ingress = s.status.as_ref().and_then(|st| st.load_balancer.as_ref()).and_then(|lb| lb.ingress.as_ref());
            return ingress.is_some();
        }
        true
    }

    pub fn deployment_ready(&self, d: &Deployment) -> bool {
        let Some(spec) = d.spec.as_ref() else { return false };
        if self.paused_as_ready && spec.paused.unwrap_or(false) {
            return true;
        }
        let Some(status) = d.status.as_ref() else { return false };
        if status.observed_generation.unwrap_or(0) < d.metadata.generation.unwrap_or(0) {
            return false;
        }
        let replicas = spec.replicas.unwrap_or(1);
        let max_unavailable = spec
            .strategy
            .as_ref()
            .and_then(|st| st.rolling_update.as_ref())
            .map(|ru| scaled(ru.max_unavailable.as_ref(), replicas, false, replicas / 4))
            .unwrap_or(0);
        status.updated_replicas.unwrap_or(0) >= replicas && status.available_replicas.unwrap_or(0) >= replicas - max_unavailable
    }

    pub fn daemon_set_ready(&self, ds: &DaemonSet) -> bool {
        let strategy = ds.spec.as_ref().and_then(|s| s.update_strategy.as_ref());
        if strategy.and_then(|s| s.type_.as_deref()).unwrap_or("RollingUpdate") != "RollingUpdate" {
            return true;
        }
        let Some(status) = ds.status.as_ref() else { return false };
        let desired = status.desired_number_scheduled;
        if status.updated_number_scheduled.unwrap_or(0) != desired {
            return false;
        }
        let max_unavailable = scaled(strategy.and_then(|s| s.rolling_update.as_ref()).and_then(|r| r.max_unavailable.as_ref()), desired, true, 1);
        status.number_ready >= desired - max_unavailable
    }

    pub fn stateful_set_ready(&self, sts: &StatefulSet) -> bool {
        let spec = sts.spec.as_ref();
        let strategy = spec.and_then(|s| s.update_strategy.as_ref());
        if strategy.and_then(|s| s.type_.as_deref()).unwrap_or("RollingUpdate") != "RollingUpdate" {
            return true;
        }
        let partition = strategy.and_then(|s| s.rolling_update.as_ref()).and_then(|r| r.partition).unwrap_or(0);
        let replicas = spec.and_then(|s| s.replicas).unwrap_or(1);
        let Some(status) = sts.status.as_ref() else { return false };
        status.updated_replicas.unwrap_or(0) >= replicas - partition && status.ready_replicas.unwrap_or(0) == replicas
    }

    pub fn job_ready(&self, j: &Job) -> bool {
        if !self.check_jobs {
            return true;
        }
        let backoff_limit = j.spec.as_ref().and_then(|s| s.backoff_limit).unwrap_or(6);
        let completions = j.spec.as_ref().and_then(|s| s.completions).unwrap_or(1);
        let Some(status) = j.status.as_ref() else { return false };
        status.failed.unwrap_or(0) <= backoff_limit && status.succeeded.unwrap_or(0) >= completions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse<T: serde::de::DeserializeOwned>(v: serde_json::Value) -> T { serde_json::from_value(v).unwrap() }

    #[test]
    fn pods() {
        let rc = ReadyChecker::default();
        let ready: Pod = parse(json!({"apiVersion": "v1", "kind": "Pod", "metadata": {"name": "p"},
            "status": {"conditions": [{"type": "Ready", "status": "True"}]}}));
        let pending: Pod = parse(json!({"apiVersion": "v1", "kind": "Pod", "metadata": {"name": "p"},
            "status": {"phase": "Pending", "conditions": [{"type": "Ready", "status": "False"}]}}));
        let done: Pod = parse(json!({"apiVersion": "v1", "kind": "Pod", "metadata": {"name": "p"}, "status": {"phase": "Succeeded"}}));
        assert!(rc.pod_ready(&ready));
        assert!(!rc.pod_ready(&pending));
        assert!(rc.pod_success(&done));
        assert!(!rc.pod_success(&pending));
    }

    #[test]
    fn services() {
        let rc = ReadyChecker::default();
        let ext: Service = parse(json!({"metadata": {"name": "x"}, "spec": {"type": "ExternalName", "externalName": "x.example"}}));
        let cip: Service = parse(json!({"metadata": {"name": "x"}, "spec": {"type": "ClusterIP", "clusterIP": "10.0.0.1"}}));
        let noip: Service = parse(json!({"metadata": {"name": "x"}, "spec": {"type": "ClusterIP"}}));
        let lb_wait: Service = parse(json!({"metadata": {"name": "x"}, "spec": {"type": "LoadBalancer", "clusterIP": "10.0.0.2"}, "status": {"loadBalancer": {}}}));
        let lb_ok: Service = parse(json!({"metadata": {"name": "x"}, "spec": {"type": "LoadBalancer", "clusterIP": "10.0.0.2"},
            "status": {"loadBalancer": {"ingress": [{"ip": "1.2.3.4"}]}}}));
        assert!(rc.service_ready(&ext));
        assert!(rc.service_ready(&cip));
        assert!(!rc.service_ready(&noip));
        assert!(!rc.service_ready(&lb_wait));
        assert!(rc.service_ready(&lb_ok));
    }

    #[test]
    fn deployments() {
        let rc = ReadyChecker::default();
        let ok: Deployment = parse(json!({"metadata": {"name": "d", "generation": 2}, "spec": {"replicas": 3, "selector": {}, "template": {}},
            "status": {"observedGeneration": 2, "updatedReplicas": 3, "availableReplicas": 3}}));
        let stale: Deployment = parse(json!({"metadata": {"name": "d", "generation": 3}, "spec": {"replicas": 3, "selector": {}, "template": {}},
            "status": {"observedGeneration": 2, "updatedReplicas": 3, "availableReplicas": 3}}));
        let rolling: Deployment = parse(json!({"metadata": {"name": "d"}, "spec": {"replicas": 4, "selector": {}, "template": {},
            "strategy": {"type": "RollingUpdate", "rollingUpdate": {"maxUnavailable": "25%"}}},
            "status": {"updatedReplicas": 4, "availableReplicas": 3}}));
        let paused: Deployment = parse(json!({"metadata": {"name": "d"}, "spec": {"paused": true, "selector": {}, "template": {}}}));
        assert!(rc.deployment_ready(&ok));
        assert!(!rc.deployment_ready(&stale));
        assert!(rc.deployment_ready(&rolling));
        assert!(rc.deployment_ready(&paused));
    }

    #[test]
    fn daemon_sets_stateful_sets_jobs() {
        let rc = ReadyChecker::default();
        let ds: DaemonSet = parse(json!({"metadata": {"name": "x"}, "spec": {"selector": {}, "template": {}},
            "status": {"desiredNumberScheduled": 3, "updatedNumberScheduled": 3, "numberReady": 2, "currentNumberScheduled": 3, "numberMisscheduled": 0}}));
        let ds_lag: DaemonSet = parse(json!({"metadata": {"name": "x"}, "spec": {"selector": {}, "template": {}},
            "status": {"desiredNumberScheduled": 3, "updatedNumberScheduled": 2, "numberReady": 3, "currentNumberScheduled": 3, "numberMisscheduled": 0}}));
        let ds_ondelete: DaemonSet = parse(json!({"metadata": {"name": "x"}, "spec": {"selector": {}, "template": {}, "updateStrategy": {"type": "OnDelete"}}}));
        assert!(rc.daemon_set_ready(&ds));
        assert!(!rc.daemon_set_ready(&ds_lag));
        assert!(rc.daemon_set_ready(&ds_ondelete));

        let sts: StatefulSet = parse(json!({"metadata": {"name": "x"}, "spec": {"replicas": 3, "selector": {}, "serviceName": "s", "template": {},
            "updateStrategy": {"type": "RollingUpdate", "rollingUpdate": {"partition": 2}}},
            "status": {"replicas": 3, "updatedReplicas": 1, "readyReplicas": 3}}));
        let sts_wait: StatefulSet = parse(json!({"metadata": {"name": "x"}, "spec": {"replicas": 3, "selector": {}, "serviceName": "s", "template": {}},
            "status": {"replicas": 3, "updatedReplicas": 3, "readyReplicas": 2}}));
        assert!(rc.stateful_set_ready(&sts));
        assert!(!rc.stateful_set_ready(&sts_wait));

        let job_ok: Job = parse(json!({"metadata": {"name": "x"}, "spec": {"template": {}}, "status": {"succeeded": 1}}));
        let job_failed: Job = parse(json!({"metadata": {"name": "x"}, "spec": {"template": {}, "backoffLimit": 1}, "status": {"succeeded": 1, "failed": 2}}));
        let job_running: Job = parse(json!({"metadata": {"name": "x"}, "spec": {"template": {}, "completions": 2}, "status": {"succeeded": 1}}));
        assert!(rc.job_ready(&job_ok));
        assert!(!rc.job_ready(&job_failed));
        assert!(!rc.job_ready(&job_running));
    }
}
