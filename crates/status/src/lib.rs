//! Fleet status (Milestone 2): joins a context's plan topology with the
//! live-status documents reported per cluster, and rolls readiness and
//! deployment counts up to cluster, app and whole-plan level.
//!
//! Results serialize with the field names operators already script
//! against; empty fields are left out.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::str::FromStr;

use fleet_core::{ContextStatus, FleetError, Gvk};
use fleet_state::StateInfo;
use serde::{Deserialize, Serialize};
use serde_json::Value;

mod aggregate;
pub mod bundle;
pub mod manifest;
pub mod ready;

pub use aggregate::Aggregator;
pub use bundle::{record_cluster_status, GenericResourceStatus, LiveEntry, ResourceBundleStatus};
pub use manifest::{parse_manifest, PlanObject};
pub use ready::ReadyChecker;

/// Which axis a query reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusType {
    #[default]
    Ready,
    Deployed,
    /// Deprecated alias of `Deployed` that fills the legacy fields.
    Rsync,
    /// Deprecated alias of `Ready` that fills the legacy fields.
    Cluster,
}

impl StatusType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Deployed => "deployed",
            Self::Rsync => "rsync",
            Self::Cluster => "cluster",
        }
    }

    pub fn is_legacy(&self) -> bool { matches!(self, Self::Rsync | Self::Cluster) }

    /// Queries that read live cluster documents.
    pub fn reads_live(&self) -> bool { matches!(self, Self::Ready | Self::Cluster) }
}

impl FromStr for StatusType {
    type Err = FleetError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ready" => Ok(Self::Ready),
            "deployed" => Ok(Self::Deployed),
            "rsync" => Ok(Self::Rsync),
            "cluster" => Ok(Self::Cluster),
            _ => Err(FleetError::bad_request(format!("invalid status type: {}", s))),
        }
    }
}

impl std::fmt::Display for StatusType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    Summary,
    #[default]
    All,
    /// `All` plus the raw object of each resource.
    Detail,
}

impl OutputMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Summary => "summary",
            Self::All => "all",
            Self::Detail => "detail",
        }
    }
}

impl FromStr for OutputMode {
    type Err = FleetError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "summary" => Ok(Self::Summary),
            "all" => Ok(Self::All),
            "detail" => Ok(Self::Detail),
            _ => Err(FleetError::bad_request(format!("invalid output mode: {}", s))),
        }
    }
}

/// Parameters of one status query. Empty filter lists keep everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusQuery {
    /// Historical context to report on; latest when `None`.
    pub instance: Option<String>,
    pub status_type: StatusType,
    pub output: OutputMode,
    pub apps: Vec<String>,
    pub clusters: Vec<String>,
    pub resources: Vec<String>,
}

impl StatusQuery {
    pub fn new(status_type: StatusType, output: OutputMode) -> Self { Self { status_type, output, ..Default::default() } }
}

/// Readiness of one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReadyState {
    Ready,
    NotReady,
    /// In the plan but not (yet) reported by the cluster.
    NotPresent,
}

impl ReadyState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "Ready",
            Self::NotReady => "NotReady",
            Self::NotPresent => "NotPresent",
        }
    }

    pub fn from_bool(ready: bool) -> Self { if ready { Self::Ready } else { Self::NotReady } }
}

impl std::fmt::Display for ReadyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(self.as_str()) }
}

/// Count per status value (`Applied`, `Ready`, `NotPresent`, ...).
pub type Counts = BTreeMap<String, u32>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatus {
    #[serde(rename = "GVK", default)]
    pub gvk: Gvk,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rsync_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployed_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_status: Option<String>,
}

impl ResourceStatus {
    /// Readiness on either the current or the legacy field.
    pub fn readiness(&self) -> Option<&str> { self.ready_status.as_deref().or(self.cluster_status.as_deref()) }

    pub fn deployment(&self) -> Option<&str> { self.deployed_status.as_deref().or(self.rsync_status.as_deref()) }

    pub fn is_ready(&self) -> bool { self.readiness() == Some(ReadyState::Ready.as_str()) }

    pub fn is_deployed(&self) -> bool { self.deployment() == Some(fleet_core::ApplyStatus::Applied.as_str()) }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cluster_provider: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cluster: String,
    /// Deprecated spelling of `connectivity`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connectivity: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ResourceStatus>,
}

impl ClusterStatus {
    pub fn is_ready(&self) -> bool { self.resources.iter().all(ResourceStatus::is_ready) }
    pub fn is_deployed(&self) -> bool { self.resources.iter().all(ResourceStatus::is_deployed) }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppStatus {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub clusters: Vec<ClusterStatus>,
}

impl AppStatus {
    pub fn is_ready(&self) -> bool { self.clusters.iter().all(ClusterStatus::is_ready) }
    pub fn is_deployed(&self) -> bool { self.clusters.iter().all(ClusterStatus::is_deployed) }
}

/// Status of a whole plan (deployment intent group, logical cloud, cert
/// distribution, ...).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResult {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(rename = "states", default)]
    pub state: StateInfo,
    /// Deprecated spelling of `deployedStatus`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ContextStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployed_status: Option<ContextStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_status: Option<ReadyState>,
    #[serde(default, skip_serializing_if = "Counts::is_empty")]
    pub rsync_status: Counts,
    #[serde(default, skip_serializing_if = "Counts::is_empty")]
    pub cluster_status: Counts,
    #[serde(default, skip_serializing_if = "Counts::is_empty")]
    pub deployed_counts: Counts,
    #[serde(default, skip_serializing_if = "Counts::is_empty")]
    pub ready_counts: Counts,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub apps: Vec<AppStatus>,
    #[serde(rename = "ChildContextIDs", default, skip_serializing_if = "Vec::is_empty")]
    pub child_context_ids: Vec<String>,
}

impl StatusResult {
    /// Context status on whichever field the query filled.
    pub fn context_status(&self) -> Option<ContextStatus> { self.deployed_status.or(self.status) }

    /// Readiness counts on whichever field the query filled.
    pub fn readiness_counts(&self) -> &Counts { if self.ready_counts.is_empty() { &self.cluster_status } else { &self.ready_counts } }

    pub fn deployment_counts(&self) -> &Counts { if self.deployed_counts.is_empty() { &self.rsync_status } else { &self.deployed_counts } }
}

/// Single-cluster view, used by cluster-scoped controllers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatusResult {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(rename = "states", default)]
    pub state: StateInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ContextStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployed_status: Option<ContextStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_status: Option<ReadyState>,
    #[serde(default, skip_serializing_if = "Counts::is_empty")]
    pub rsync_status: Counts,
    #[serde(default, skip_serializing_if = "Counts::is_empty")]
    pub cluster_status: Counts,
    #[serde(default, skip_serializing_if = "Counts::is_empty")]
    pub deployed_counts: Counts,
    #[serde(default, skip_serializing_if = "Counts::is_empty")]
    pub ready_counts: Counts,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<ClusterStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppsListResult {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    pub apps: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterEntry {
    pub cluster_provider: String,
    pub cluster: String,
}

impl ClusterEntry {
    /// From a `provider+cluster` name; a name without separator is all cluster.
    pub fn from_pair(name: &str) -> Self {
        match fleet_appcontext::split_pair(name) {
            Some((p, c)) => Self { cluster_provider: p.to_string(), cluster: c.to_string() },
            None => Self { cluster_provider: String::new(), cluster: name.to_string() },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClustersByAppEntry {
    pub app: String,
    pub clusters: Vec<ClusterEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClustersByAppResult {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    pub clusters_by_app: Vec<ClustersByAppEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceEntry {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(rename = "GVK", default)]
    pub gvk: Gvk,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourcesByAppEntry {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub app: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cluster_provider: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cluster: String,
    pub resources: Vec<ResourceEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourcesByAppResult {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    pub resources_by_app: Vec<ResourcesByAppEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_query_params() {
        assert_eq!("deployed".parse::<StatusType>().unwrap(), StatusType::Deployed);
        assert!("bogus".parse::<StatusType>().is_err());
        assert_eq!("summary".parse::<OutputMode>().unwrap(), OutputMode::Summary);
        assert!(StatusType::Cluster.reads_live() && StatusType::Cluster.is_legacy());
        assert!(!StatusType::Deployed.reads_live());
    }

    #[test]
    fn empty_fields_are_omitted() {
        let r = StatusResult { deployed_status: Some(ContextStatus::Instantiated), ready_status: Some(ReadyState::Ready), ..Default::default() };
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["deployedStatus"], "Instantiated");
        assert_eq!(v["readyStatus"], "Ready");
        assert!(v.get("apps").is_none());
        assert!(v.get("status").is_none());
        assert!(v.get("readyCounts").is_none());
        assert!(v.get("states").is_some());
    }

    #[test]
    fn rollups() {
        let rs = |ready: &str| ResourceStatus { ready_status: Some(ready.into()), ..Default::default() };
        let ok = ClusterStatus { resources: vec![rs("Ready"), rs("Ready")], ..Default::default() };
        let bad = ClusterStatus { resources: vec![rs("Ready"), rs("NotPresent")], ..Default::default() };
        assert!(ok.is_ready());
        assert!(!bad.is_ready());
        let app = AppStatus { name: "a".into(), clusters: vec![ok.clone(), bad] };
        assert!(!app.is_ready());
        assert!(AppStatus { name: "a".into(), clusters: vec![ok] }.is_ready());
        assert_eq!(ClusterEntry::from_pair("p+c"), ClusterEntry { cluster_provider: "p".into(), cluster: "c".into() });
    }
}
