use std::sync::Arc;

use fleet_appcontext::AppContext;
use fleet_core::{ContextStatus, FleetError, FleetResult, Scope};
use fleet_persist::{ContextDb, DocStore};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{app_context_status, ActionEntry, StateInfo, StateValue};

pub const STATE_STORE: &str = "resources";
pub const STATE_TAG: &str = "stateInfo";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleEvent {
    Instantiate,
    Terminate,
}

impl std::fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Instantiate => "Instantiate",
            Self::Terminate => "Terminate",
        })
    }
}

/// Lifecycle log of one managed resource, persisted in the document store
/// under its `Scope`. Writes are compare-and-swap on the row version.
#[derive(Clone)]
pub struct StateClient {
    docs: Arc<dyn DocStore>,
    contexts: Arc<dyn ContextDb>,
    key: Scope,
}

impl StateClient {
    pub fn new(docs: Arc<dyn DocStore>, contexts: Arc<dyn ContextDb>, key: Scope) -> Self { Self { docs, contexts, key } }

    pub fn key(&self) -> &Scope { &self.key }

    /// Start a fresh log with a single `Created` entry.
    pub fn create(&self, context_id: &str) -> FleetResult<()> {
        let s = StateInfo { status_context_id: String::new(), actions: vec![ActionEntry::new(StateValue::Created, context_id, 0)] };
        self.docs.insert(STATE_STORE, &self.key.db_key(), STATE_TAG, serde_json::to_value(&s)?)?;
        info!(key = %self.key, "state: created");
        Ok(())
    }

    pub fn get(&self) -> FleetResult<StateInfo> { self.read()?.map(|(_, s)| s).ok_or_else(|| FleetError::not_found("StateInfo not found")) }

    fn read(&self) -> FleetResult<Option<(u64, StateInfo)>> {
        match self.docs.find_versioned(STATE_STORE, &self.key.db_key(), STATE_TAG)? {
            Some(v) => Ok(Some((v.version, serde_json::from_value(v.doc)?))),
            None => Ok(None),
        }
    }

    /// Append `new_state` for `context_id` with the next revision and make
    /// `context_id` the status context.
    pub fn update(&self, new_state: StateValue, context_id: &str, create_if_not_exists: bool) -> FleetResult<()> {
        match self.read()? {
            Some((version, s)) => self.append(version, s, new_state, context_id),
            None if create_if_not_exists => self.create(context_id),
            None => Err(FleetError::not_found("StateInfo not found")),
        }
    }

    fn append(&self, version: u64, mut s: StateInfo, new_state: StateValue, context_id: &str) -> FleetResult<()> {
        let revision = s.latest_revision()? + 1;
        s.actions.push(ActionEntry::new(new_state, context_id, revision));
        s.status_context_id = context_id.to_string();
        let ok = self.docs.insert_if_version(STATE_STORE, &self.key.db_key(), STATE_TAG, serde_json::to_value(&s)?, Some(version))?;
        if !ok {
            counter!("state_conflict_total", 1u64);
            return Err(FleetError::conflict(format!("{}: state changed concurrently, retry the request", self.key)));
        }
        debug!(key = %self.key, state = %new_state, ctx = %context_id, revision, "state: appended");
        Ok(())
    }

    pub fn delete(&self) -> FleetResult<()> {
        self.docs.remove(STATE_STORE, &self.key.db_key())?;
        info!(key = %self.key, "state: deleted");
        Ok(())
    }

    /// Decide whether `event` may run. Returns the current context id (`None`
    /// when nothing was instantiated yet). A missing log counts as no prior
    /// action. Instantiating over a terminated context deletes that context.
    pub fn verify_state(&self, event: LifecycleEvent) -> FleetResult<Option<String>> {
        let s = self.read()?.map(|(_, s)| s).unwrap_or_default();
        self.verify(&s, event)
    }

    fn verify(&self, s: &StateInfo, event: LifecycleEvent) -> FleetResult<Option<String>> {
        let Some(context_id) = s.last_context_id() else { return Ok(None) };
        let status = app_context_status(&self.contexts, context_id)?.status;
        use ContextStatus as C;
        use LifecycleEvent as E;
        let reason = match (status, event) {
            (C::Terminating, _) => "The resource is being terminated",
            (C::Instantiating, _) => "The resource is in instantiating status",
            (C::TerminateFailed, _) => "The resource has failed terminating, please delete the resource",
            (C::Terminated, E::Instantiate) => {
                AppContext::open(self.contexts.clone(), context_id)?.delete_composite_app()?;
                info!(key = %self.key, ctx = %context_id, "state: deleted terminated context before instantiate");
                return Ok(Some(context_id.to_string()));
            }
            (C::Terminated, E::Terminate) => "The resource is already terminated",
            (C::Instantiated, E::Instantiate) => "The resource is already instantiated",
            (C::Instantiated, E::Terminate) => return Ok(Some(context_id.to_string())),
            (C::InstantiateFailed, E::Instantiate) => "The resource has failed instantiating before, please terminate and try again",
            (C::InstantiateFailed, E::Terminate) => return Ok(Some(context_id.to_string())),
            _ => "The resource isn't in an expected status so not taking any action",
        };
        counter!("state_conflict_total", 1u64);
        warn!(key = %self.key, ctx = %context_id, status = %status, event = %event, "state: transition refused");
        Err(FleetError::conflict(format!("{}: Failed to {}. {}", self.key, event, reason)))
    }

    /// Verify `event` and append `new_state` against the same observed log
    /// version, so a concurrent writer between the two steps yields Conflict.
    pub fn transition(&self, event: LifecycleEvent, new_state: StateValue, context_id: &str) -> FleetResult<Option<String>> {
        let current = self.read()?;
        let (version, s) = match current {
            Some((v, s)) => (Some(v), s),
            None => (None, StateInfo::default()),
        };
        let prev = self.verify(&s, event)?;
        match version {
            Some(v) => self.append(v, s, new_state, context_id)?,
            None => {
                let fresh = StateInfo { status_context_id: context_id.to_string(), actions: vec![ActionEntry::new(new_state, context_id, 0)] };
                let ok = self.docs.insert_if_version(STATE_STORE, &self.key.db_key(), STATE_TAG, serde_json::to_value(&fresh)?, None)?;
                if !ok {
                    counter!("state_conflict_total", 1u64);
                    return Err(FleetError::conflict(format!("{}: state created concurrently, retry the request", self.key)));
                }
            }
        }
        Ok(prev)
    }

    /// `transition` for flows acting on the current context: the entry is
    /// recorded against the context the verification resolved. Nothing is
    /// appended when there is no such context.
    pub fn transition_current(&self, event: LifecycleEvent, new_state: StateValue) -> FleetResult<Option<String>> {
        let Some((version, s)) = self.read()? else { return Ok(None) };
        let prev = self.verify(&s, event)?;
        if let Some(context_id) = &prev {
            self.append(version, s, new_state, context_id)?;
        }
        Ok(prev)
    }
}
