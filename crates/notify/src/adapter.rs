//! Helpers backed by the lifecycle log and the context store, usable for
//! every registration key.

use std::sync::Arc;

use fleet_core::{ContextStatus, FleetError, FleetResult, Scope};
use fleet_persist::{ContextDb, DocStore};
use fleet_state::{StateClient, StateInfo};
use fleet_status::{AppStatus, Aggregator, ClusterStatusResult, StatusQuery, StatusResult};

use crate::{NotifyType, StatusNotification, StatusNotifyHelpers, StatusRegistration, StatusValue};

pub struct StateHelpers {
    docs: Arc<dyn DocStore>,
    contexts: Arc<dyn ContextDb>,
    aggregator: Aggregator,
}

impl StateHelpers {
    pub fn new(docs: Arc<dyn DocStore>, contexts: Arc<dyn ContextDb>) -> Self {
        let aggregator = Aggregator::new(Arc::clone(&contexts));
        Self { docs, contexts, aggregator }
    }

    fn state(&self, key: &Scope) -> FleetResult<StateInfo> {
        StateClient::new(Arc::clone(&self.docs), Arc::clone(&self.contexts), key.clone())
            .get()
            .map_err(|e| match e {
                FleetError::NotFound(_) => FleetError::not_found(format!("{} state not found: {}", key.kind(), key.name())),
                other => other,
            })
    }
}

/// Single-cluster view recast as a one-app tree.
fn from_cluster(r: ClusterStatusResult) -> StatusResult {
    StatusResult {
        name: r.name,
        state: r.state,
        status: r.status,
        deployed_status: r.deployed_status,
        ready_status: r.ready_status,
        rsync_status: r.rsync_status,
        cluster_status: r.cluster_status,
        deployed_counts: r.deployed_counts,
        ready_counts: r.ready_counts,
        apps: r.cluster.map(|c| vec![AppStatus { name: String::new(), clusters: vec![c] }]).unwrap_or_default(),
        child_context_ids: Vec::new(),
    }
}

#[async_trait::async_trait]
impl StatusNotifyHelpers for StateHelpers {
    async fn app_context_id(&self, reg: &StatusRegistration) -> FleetResult<String> {
        let s = self.state(&reg.key)?;
        s.status_context_id()
            .map(str::to_string)
            .ok_or_else(|| FleetError::not_found(format!("{} {} has no status context", reg.key.kind(), reg.key.name())))
    }

    async fn query(&self, reg: &StatusRegistration, q: &StatusQuery) -> FleetResult<StatusResult> {
        let s = self.state(&reg.key)?;
        let mut r = match reg.key {
            Scope::Cluster { .. } => from_cluster(self.aggregator.cluster_status(&s, q)?),
            _ => self.aggregator.status(&s, q)?,
        };
        if r.name.is_empty() {
            r.name = reg.key.name().to_string();
        }
        Ok(r)
    }

    /// Logical clouds report on the context status alone.
    fn prepare(&self, reg: &StatusRegistration, result: &StatusResult) -> StatusNotification {
        match reg.key {
            Scope::LogicalCloud { .. } => {
                let ok = result.context_status() == Some(ContextStatus::Instantiated);
                StatusNotification { status_value: StatusValue::of(reg.status_type, ok), details: Vec::new() }
            }
            _ => crate::shape(reg, result),
        }
    }
}
