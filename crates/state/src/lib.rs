//! Fleet lifecycle state (Milestone 1): the append-only action log kept per
//! managed resource, and the guard deciding which lifecycle events are legal.

#![forbid(unsafe_code)]

use std::sync::Arc;

use chrono::{DateTime, Utc};
use fleet_appcontext::AppContext;
use fleet_core::{AppContextStatus, FleetError, FleetResult};
use fleet_persist::ContextDb;
use serde::{Deserialize, Serialize};

mod client;

pub use client::{LifecycleEvent, StateClient, STATE_STORE, STATE_TAG};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StateValue {
    Created,
    Instantiating,
    Instantiated,
    InstantiateFailed,
    Updating,
    Updated,
    UpdateFailed,
    Terminating,
    Terminated,
    TerminateFailed,
    /// Written by older controllers in place of `Instantiated`.
    Applied,
}

impl StateValue {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "Created",
            Self::Instantiating => "Instantiating",
            Self::Instantiated => "Instantiated",
            Self::InstantiateFailed => "InstantiateFailed",
            Self::Updating => "Updating",
            Self::Updated => "Updated",
            Self::UpdateFailed => "UpdateFailed",
            Self::Terminating => "Terminating",
            Self::Terminated => "Terminated",
            Self::TerminateFailed => "TerminateFailed",
            Self::Applied => "Applied",
        }
    }

    /// Entries whose context owns live status.
    pub fn is_instantiated(&self) -> bool { matches!(self, Self::Instantiated | Self::Applied) }
}

impl std::fmt::Display for StateValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionEntry {
    pub state: StateValue,
    #[serde(rename = "instance", default)]
    pub context_id: String,
    #[serde(rename = "time")]
    pub time_stamp: DateTime<Utc>,
    #[serde(default)]
    pub revision: i64,
}

impl ActionEntry {
    pub fn new(state: StateValue, context_id: impl Into<String>, revision: i64) -> Self {
        Self { state, context_id: context_id.into(), time_stamp: Utc::now(), revision }
    }
}

/// Lifecycle log of one managed resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateInfo {
    #[serde(rename = "statusctxid", default)]
    pub status_context_id: String,
    #[serde(default)]
    pub actions: Vec<ActionEntry>,
}

impl StateInfo {
    pub fn current_state(&self) -> FleetResult<StateValue> {
        self.actions.last().map(|a| a.state).ok_or_else(|| FleetError::not_found("no state information"))
    }

    /// Context of the last action; `None` for an empty log or a context-less entry.
    pub fn last_context_id(&self) -> Option<&str> {
        self.actions.last().map(|a| a.context_id.as_str()).filter(|c| !c.is_empty())
    }

    pub fn status_context_id(&self) -> Option<&str> { Some(self.status_context_id.as_str()).filter(|c| !c.is_empty()) }

    pub fn latest_revision(&self) -> FleetResult<i64> {
        self.actions.last().map(|a| a.revision).ok_or_else(|| FleetError::not_found("no state information"))
    }

    pub fn context_id_for_revision(&self, revision: i64) -> FleetResult<&str> {
        self.actions
            .iter()
            .find(|a| a.revision == revision && !a.context_id.is_empty())
            .map(|a| a.context_id.as_str())
            .ok_or_else(|| FleetError::not_found(format!("no context id for revision {}", revision)))
    }

    /// Distinct non-empty context ids in log order.
    pub fn context_ids(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for a in &self.actions {
            if !a.context_id.is_empty() && !out.contains(&a.context_id) {
                out.push(a.context_id.clone());
            }
        }
        out
    }

    fn position(&self, context_id: &str) -> FleetResult<usize> {
        self.actions
            .iter()
            .position(|a| a.context_id == context_id)
            .ok_or_else(|| FleetError::not_found(format!("no state information for {}", context_id)))
    }

    /// Context holding live status for `context_id`: the nearest entry at or
    /// before its first occurrence that reached Instantiated (or Applied).
    pub fn status_context_for(&self, context_id: &str) -> FleetResult<&str> {
        let pos = self.position(context_id)?;
        self.actions[..=pos]
            .iter()
            .rev()
            .find(|a| a.state.is_instantiated())
            .map(|a| a.context_id.as_str())
            .ok_or_else(|| FleetError::not_found(format!("status context id not found for {}", context_id)))
    }

    /// Inverse of `status_context_for`: the context that terminated the
    /// status context, or the status context itself if it is still live.
    pub fn context_for_status_context(&self, status_context_id: &str) -> FleetResult<&str> {
        let pos = self.position(status_context_id)?;
        let hit = self.actions[pos + 1..].iter().find(|a| a.state == StateValue::Terminated).unwrap_or(&self.actions[pos]);
        Ok(hit.context_id.as_str())
    }
}

/// Aggregate status recorded in context `context_id`.
pub fn app_context_status(db: &Arc<dyn ContextDb>, context_id: &str) -> FleetResult<AppContextStatus> {
    let ac = AppContext::open(db.clone(), context_id)?;
    let h = ac.composite_app_handle()?;
    let sh = ac.level_handle(&h, "status")?;
    fleet_appcontext::decode_value(ac.get_value(&sh)?)
}
