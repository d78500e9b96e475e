//! Fleet core types and errors (Milestone 0)
//!
//! Shared by every other crate: the error taxonomy, status vocabularies
//! persisted in context trees, the GVK triple, document-store key scopes and
//! the runtime configuration read from `FLEET_*` env vars.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

pub mod config;
pub mod keys;

pub use config::{Backoff, Config};
pub use keys::Scope;

/// Errors surfaced by every fleet component. Each kind maps to a stable code
/// for the (out of tree) REST layer.
#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("bad_request: {0}")]
    BadRequest(String),
    #[error("unprocessable: {0}")]
    Unprocessable(String),
    #[error("unknown: {0}")]
    Unknown(String),
    /// Compensating delete failed after `source` aborted a context build.
    #[error("rollback failed: {rollback}")]
    RollbackFailed {
        rollback: String,
        #[source]
        source: Box<FleetError>,
    },
}

pub type FleetResult<T> = Result<T, FleetError>;

impl FleetError {
    pub fn not_found(msg: impl Into<String>) -> Self { Self::NotFound(msg.into()) }
    pub fn conflict(msg: impl Into<String>) -> Self { Self::Conflict(msg.into()) }
    pub fn bad_request(msg: impl Into<String>) -> Self { Self::BadRequest(msg.into()) }
    pub fn unknown(msg: impl Into<String>) -> Self { Self::Unknown(msg.into()) }

    /// HTTP-style status code for the error kind.
    pub fn code(&self) -> u16 {
        match self {
            Self::NotFound(_) => 404,
            Self::Conflict(_) => 409,
            Self::BadRequest(_) => 400,
            Self::Unprocessable(_) => 422,
            Self::Unknown(_) | Self::RollbackFailed { .. } => 500,
        }
    }

    pub fn is_not_found(&self) -> bool { matches!(self, Self::NotFound(_)) }
    pub fn is_conflict(&self) -> bool { matches!(self, Self::Conflict(_)) }

    /// The error that started a failed build, looking through rollback wrappers.
    pub fn root(&self) -> &FleetError {
        match self {
            Self::RollbackFailed { source, .. } => source.root(),
            other => other,
        }
    }
}

impl From<anyhow::Error> for FleetError {
    fn from(e: anyhow::Error) -> Self { Self::Unknown(format!("{:#}", e)) }
}

impl From<serde_json::Error> for FleetError {
    fn from(e: serde_json::Error) -> Self { Self::Unknown(format!("json: {}", e)) }
}

/// Group/Version/Kind of a Kubernetes object, serialized the way live-status
/// documents and plan references carry it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Gvk {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl Gvk {
    pub fn new(group: impl Into<String>, version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { group: group.into(), version: version.into(), kind: kind.into() }
    }

    /// Split an `apiVersion` string ("apps/v1" or "v1") plus kind.
    pub fn from_api_version(api_version: &str, kind: &str) -> Self {
        match api_version.split_once('/') {
            Some((g, v)) => Self::new(g, v, kind),
            None => Self::new("", api_version, kind),
        }
    }
}

impl std::fmt::Display for Gvk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.group.is_empty() { write!(f, "{}/{}", self.version, self.kind) } else { write!(f, "{}/{}/{}", self.group, self.version, self.kind) }
    }
}

/// Aggregate status of one context tree, stored at `/context/<id>/status/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContextStatus {
    Created,
    Instantiating,
    Instantiated,
    InstantiateFailed,
    Terminating,
    Terminated,
    TerminateFailed,
    Updating,
    Updated,
    UpdateFailed,
}

impl ContextStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "Created",
            Self::Instantiating => "Instantiating",
            Self::Instantiated => "Instantiated",
            Self::InstantiateFailed => "InstantiateFailed",
            Self::Terminating => "Terminating",
            Self::Terminated => "Terminated",
            Self::TerminateFailed => "TerminateFailed",
            Self::Updating => "Updating",
            Self::Updated => "Updated",
            Self::UpdateFailed => "UpdateFailed",
        }
    }
}

impl std::fmt::Display for ContextStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(self.as_str()) }
}

/// JSON document at a context's `status/` level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppContextStatus {
    pub status: ContextStatus,
}

/// Connectivity of a remote cluster as last reported by the synchronizer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClusterReadyStatus {
    #[default]
    Unknown,
    Available,
    Retrying,
}

impl ClusterReadyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "Unknown",
            Self::Available => "Available",
            Self::Retrying => "Retrying",
        }
    }
}

/// Apply state of one resource on one cluster (the "deployed" axis).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ApplyStatus {
    #[default]
    Pending,
    Applied,
    Failed,
    Retrying,
    Deleted,
}

impl ApplyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Applied => "Applied",
            Self::Failed => "Failed",
            Self::Retrying => "Retrying",
            Self::Deleted => "Deleted",
        }
    }
}

/// JSON document at a resource's `status/` level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceApplyStatus {
    pub status: ApplyStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_follow_kind() {
        assert_eq!(FleetError::not_found("x").code(), 404);
        assert_eq!(FleetError::conflict("x").code(), 409);
        assert_eq!(FleetError::bad_request("x").code(), 400);
        assert_eq!(FleetError::Unprocessable("x".into()).code(), 422);
        let wrapped = FleetError::RollbackFailed { rollback: "db down".into(), source: Box::new(FleetError::bad_request("bad name")) };
        assert_eq!(wrapped.code(), 500);
        assert!(matches!(wrapped.root(), FleetError::BadRequest(m) if m == "bad name"));
        assert!(std::error::Error::source(&wrapped).is_some());
    }

    #[test]
    fn gvk_from_api_version() {
        assert_eq!(Gvk::from_api_version("apps/v1", "Deployment"), Gvk::new("apps", "v1", "Deployment"));
        assert_eq!(Gvk::from_api_version("v1", "Pod"), Gvk::new("", "v1", "Pod"));
        assert_eq!(Gvk::new("", "v1", "Pod").to_string(), "v1/Pod");
        let v = serde_json::to_value(Gvk::new("apps", "v1", "Deployment")).unwrap();
        assert_eq!(v, serde_json::json!({"Group": "apps", "Version": "v1", "Kind": "Deployment"}));
    }

    #[test]
    fn status_docs_use_plain_names() {
        let s = AppContextStatus { status: ContextStatus::InstantiateFailed };
        assert_eq!(serde_json::to_value(s).unwrap(), serde_json::json!({"status": "InstantiateFailed"}));
        let r: ResourceApplyStatus = serde_json::from_value(serde_json::json!({"status": "Applied"})).unwrap();
        assert_eq!(r.status, ApplyStatus::Applied);
    }
}
