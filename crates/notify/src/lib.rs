//! Fleet notify (Milestone 3): status notifications for long-lived
//! subscribers. Each watched context gets exactly one upstream change feed;
//! its events are debounced, one status query per status type answers every
//! subscriber of the context, and each subscriber only hears about changes to
//! what its own filters select.

#![forbid(unsafe_code)]

use fleet_core::{ContextStatus, FleetResult, Gvk, Scope};
use fleet_status::{AppStatus, ClusterStatus, ResourceStatus, StatusQuery, StatusResult};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

pub mod adapter;
mod filter;
mod server;

pub use adapter::StateHelpers;
pub use filter::{AggregateFilter, Filters};
pub use server::{StatusNotifyServer, StatusStream};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusValue {
    #[default]
    Unknown,
    Ready,
    NotReady,
    Deployed,
    NotDeployed,
}

impl StatusValue {
    /// Positive or negative value on the axis of `t`.
    pub fn of(t: NotifyType, ok: bool) -> Self {
        match (t, ok) {
            (NotifyType::Ready, true) => Self::Ready,
            (NotifyType::Ready, false) => Self::NotReady,
            (NotifyType::Deployed, true) => Self::Deployed,
            (NotifyType::Deployed, false) => Self::NotDeployed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::Ready => "READY",
            Self::NotReady => "NOT_READY",
            Self::Deployed => "DEPLOYED",
            Self::NotDeployed => "NOT_DEPLOYED",
        }
    }
}

impl std::fmt::Display for StatusValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotifyType {
    #[default]
    Ready,
    Deployed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotifyOutput {
    #[default]
    Summary,
    All,
}

/// One subscriber's request. Empty filter lists select everything; clusters
/// are given as `provider+cluster`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusRegistration {
    pub client_id: String,
    pub key: Scope,
    pub status_type: NotifyType,
    pub output: NotifyOutput,
    #[serde(default)]
    pub apps: Vec<String>,
    #[serde(default)]
    pub clusters: Vec<String>,
    #[serde(default)]
    pub resources: Vec<String>,
}

impl StatusRegistration {
    pub fn new(client_id: impl Into<String>, key: Scope, status_type: NotifyType, output: NotifyOutput) -> Self {
        Self { client_id: client_id.into(), key, status_type, output, apps: Vec::new(), clusters: Vec::new(), resources: Vec::new() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDetail {
    pub name: String,
    pub gvk: Gvk,
    pub status_value: StatusValue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterDetail {
    pub cluster_provider: String,
    pub cluster: String,
    pub status_value: StatusValue,
    pub resources: Vec<ResourceDetail>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppDetail {
    pub app: String,
    pub status_value: StatusValue,
    pub clusters: Vec<ClusterDetail>,
}

/// What a subscriber receives. `details` is filled for `ALL` output only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusNotification {
    pub status_value: StatusValue,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<AppDetail>,
}

/// Upstream change event: something changed for `app` on `cluster`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadyEvent {
    pub app_context: String,
    pub app: String,
    pub cluster: String,
}

pub type EventStream = BoxStream<'static, FleetResult<ReadyEvent>>;

/// Upstream change feed, one subscription per (client name, context).
#[async_trait::async_trait]
pub trait ReadyNotifyClient: Send + Sync {
    async fn alert(&self, client_name: &str, app_context_id: &str) -> FleetResult<EventStream>;
    async fn unsubscribe(&self, client_name: &str, app_context_id: &str) -> FleetResult<()>;
}

/// Domain glue: how a registration key maps to a context, how to query it,
/// and how to turn the shared result into one subscriber's notification.
#[async_trait::async_trait]
pub trait StatusNotifyHelpers: Send + Sync {
    async fn app_context_id(&self, reg: &StatusRegistration) -> FleetResult<String>;
    async fn query(&self, reg: &StatusRegistration, q: &StatusQuery) -> FleetResult<StatusResult>;
    fn prepare(&self, reg: &StatusRegistration, result: &StatusResult) -> StatusNotification { shape(reg, result) }
}

/// Cut a shared result down to `reg`'s own filters and compute its value.
///
/// Deployed means the context is instantiated. Ready additionally needs every
/// selected resource ready; without a resource tree the counts decide (some
/// resources counted, none `NotReady` or `NotPresent`).
pub fn shape(reg: &StatusRegistration, result: &StatusResult) -> StatusNotification {
    let own = AggregateFilter::of(reg);
    let t = reg.status_type;
    let details: Vec<AppDetail> = result.apps.iter().filter_map(|a| app_detail(t, &own, a)).collect();
    let instantiated = result.context_status() == Some(ContextStatus::Instantiated);
    let ok = match t {
        NotifyType::Deployed => instantiated,
        NotifyType::Ready if !instantiated => false,
        NotifyType::Ready if result.apps.is_empty() => {
            let counts = result.readiness_counts();
            !counts.is_empty() && !counts.contains_key("NotReady") && !counts.contains_key("NotPresent")
        }
        NotifyType::Ready => !details.is_empty() && details.iter().all(|a| a.status_value == StatusValue::Ready),
    };
    let details = if reg.output == NotifyOutput::All { details } else { Vec::new() };
    StatusNotification { status_value: StatusValue::of(t, ok), details }
}

fn resource_ok(t: NotifyType, r: &ResourceStatus) -> bool {
    match t {
        NotifyType::Ready => r.is_ready(),
        NotifyType::Deployed => r.is_deployed(),
    }
}

fn cluster_detail(t: NotifyType, own: &AggregateFilter, c: &ClusterStatus) -> Option<ClusterDetail> {
    let resources: Vec<ResourceDetail> = c
        .resources
        .iter()
        .filter(|r| own.keeps_resource(&r.name))
        .map(|r| ResourceDetail { name: r.name.clone(), gvk: r.gvk.clone(), status_value: StatusValue::of(t, resource_ok(t, r)) })
        .collect();
    if resources.is_empty() && own.resources.is_some() {
        return None;
    }
    let ok = resources.iter().all(|r| r.status_value == StatusValue::of(t, true));
    Some(ClusterDetail { cluster_provider: c.cluster_provider.clone(), cluster: c.cluster.clone(), status_value: StatusValue::of(t, ok), resources })
}

fn app_detail(t: NotifyType, own: &AggregateFilter, a: &AppStatus) -> Option<AppDetail> {
    if !own.keeps_app(&a.name) {
        return None;
    }
    let clusters: Vec<ClusterDetail> = a
        .clusters
        .iter()
        .filter(|c| own.keeps_cluster(&pair(&c.cluster_provider, &c.cluster)))
        .filter_map(|c| cluster_detail(t, own, c))
        .collect();
    if clusters.is_empty() {
        return None;
    }
    let ok = clusters.iter().all(|c| c.status_value == StatusValue::of(t, true));
    Some(AppDetail { app: a.name.clone(), status_value: StatusValue::of(t, ok), clusters })
}

fn pair(provider: &str, cluster: &str) -> String {
    if provider.is_empty() { cluster.to_string() } else { format!("{}+{}", provider, cluster) }
}
