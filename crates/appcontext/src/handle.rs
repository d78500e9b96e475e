//! Typed handles into a context tree.
//!
//! A handle is a `/`-separated path ending in `/`. Every level below the root
//! is a `kind/name/` pair (`app/a/`, `cluster/p+c/`, `resource/r+Pod/`) or a
//! one-level value (`status/`, `reference/`, ...). Names are single segments.

use std::str::FromStr;

use fleet_core::{FleetError, FleetResult};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub const CONTEXT_PREFIX: &str = "/context/";
/// Level name holding a cluster's group number.
pub const CLUSTER_META_GROUP: &str = "!@#metaGrp";
/// Joins composite names (`provider+cluster`, `name+Kind`).
pub const SEPARATOR: char = '+';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChildKind {
    App,
    Cluster,
    Resource,
}

impl ChildKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::App => "app",
            Self::Cluster => "cluster",
            Self::Resource => "resource",
        }
    }
}

/// One-level values hanging off a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Level {
    Meta,
    Status,
    Reference,
    ReadyStatus,
    ResourcesReady,
    StopFlag,
    StatusAppCtxId,
    ClusterMetaGroup,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Meta => "meta",
            Self::Status => "status",
            Self::Reference => "reference",
            Self::ReadyStatus => "readystatus",
            Self::ResourcesReady => "resourcesready",
            Self::StopFlag => "stopflag",
            Self::StatusAppCtxId => "statusappctxid",
            Self::ClusterMetaGroup => CLUSTER_META_GROUP,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstructionType {
    Order,
    Dependency,
}

impl InstructionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Order => "order",
            Self::Dependency => "dependency",
        }
    }
}

impl FromStr for InstructionType {
    type Err = FleetError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "order" => Ok(Self::Order),
            "dependency" => Ok(Self::Dependency),
            _ => Err(FleetError::bad_request(format!("not a valid app context instruction type: {}", s))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstructionLevel {
    App,
    Resource,
    Subresource,
}

impl InstructionLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::App => "app",
            Self::Resource => "resource",
            Self::Subresource => "subresource",
        }
    }
}

impl FromStr for InstructionLevel {
    type Err = FleetError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "app" => Ok(Self::App),
            "resource" => Ok(Self::Resource),
            "subresource" => Ok(Self::Subresource),
            _ => Err(FleetError::bad_request(format!("not a valid app context instruction level: {}", s))),
        }
    }
}

/// Address of one node in a context tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Handle(String);

fn check_segment(what: &str, name: &str) -> FleetResult<()> {
    if name.is_empty() || name.contains('/') {
        return Err(FleetError::bad_request(format!("not a valid run time context {} name: {:?}", what, name)));
    }
    Ok(())
}

impl Handle {
    pub fn root(context_id: &str) -> FleetResult<Self> {
        check_segment("context id", context_id)?;
        Ok(Self(format!("{}{}/", CONTEXT_PREFIX, context_id)))
    }

    /// Accept a stored key as a handle. It must sit under a context root, end
    /// with `/` and contain no empty segments.
    pub fn parse(s: &str) -> FleetResult<Self> {
        let rest = s
            .strip_prefix(CONTEXT_PREFIX)
            .and_then(|r| r.strip_suffix('/'))
            .ok_or_else(|| FleetError::bad_request(format!("not a context handle: {}", s)))?;
        if rest.split('/').any(str::is_empty) {
            return Err(FleetError::bad_request(format!("not a context handle: {}", s)));
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str { &self.0 }

    /// `kind/name/` below this handle.
    pub fn child(&self, kind: ChildKind, name: &str) -> FleetResult<Handle> {
        check_segment(kind.as_str(), name)?;
        Ok(Self(format!("{}{}/{}/", self.0, kind.as_str(), name)))
    }

    pub fn level(&self, level: Level) -> Handle { Self(format!("{}{}/", self.0, level.as_str())) }

    /// Level addressed by a free-form name, as accepted by `GetLevelHandle`.
    pub fn named_level(&self, level: &str) -> FleetResult<Handle> {
        check_segment("level", level)?;
        Ok(Self(format!("{}{}/", self.0, level)))
    }

    /// `<level>/instruction/<type>/` below this handle. App instructions hang
    /// off the root, resource instructions off a cluster handle.
    pub fn instruction(&self, level: InstructionLevel, kind: InstructionType) -> Handle {
        Self(format!("{}{}/instruction/{}/", self.0, level.as_str(), kind.as_str()))
    }

    /// Instructions stored directly under an app handle (`instruction/<type>/`).
    pub fn own_instruction(&self, kind: InstructionType) -> Handle { Self(format!("{}instruction/{}/", self.0, kind.as_str())) }

    pub fn segments(&self) -> SmallVec<[&str; 8]> { self.0.trim_matches('/').split('/').collect() }

    pub fn context_id(&self) -> &str { self.segments().get(1).copied().unwrap_or_default() }

    pub fn context_root(&self) -> Handle { Self(format!("{}{}/", CONTEXT_PREFIX, self.context_id())) }

    pub fn is_root(&self) -> bool { self.segments().len() == 2 }

    /// Last path segment (the name of an `app`/`cluster`/`resource` node).
    pub fn name(&self) -> &str { self.segments().last().copied().unwrap_or_default() }

    /// Same path inside another context tree.
    pub fn rebase(&self, context_id: &str) -> FleetResult<Handle> {
        let root = Handle::root(context_id)?;
        let rel = &self.0[self.context_root().0.len()..];
        Ok(Self(format!("{}{}", root.0, rel)))
    }

    /// Path below the context root, without leading separator.
    pub fn relative(&self) -> &str {
        let n = CONTEXT_PREFIX.len() + self.context_id().len() + 1;
        self.0.get(n..).unwrap_or_default()
    }

    pub fn is_ancestor_of(&self, other: &Handle) -> bool { other.0.len() > self.0.len() && other.0.starts_with(&self.0) }

    /// Name of the `kind` node `key` addresses when it is a direct child of
    /// this handle: `self + kind/ + name/` with a single non-empty `name`.
    /// Deeper descendants and sibling levels yield `None`.
    pub fn direct_child<'k>(&self, kind: ChildKind, key: &'k str) -> Option<&'k str> {
        let rest = key.strip_prefix(self.0.as_str())?.strip_prefix(kind.as_str())?.strip_prefix('/')?;
        let name = rest.strip_suffix('/')?;
        if name.is_empty() || name.contains('/') {
            return None;
        }
        Some(name)
    }
}

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(&self.0) }
}

impl TryFrom<String> for Handle {
    type Error = FleetError;
    fn try_from(s: String) -> Result<Self, Self::Error> { Handle::parse(&s) }
}

impl From<Handle> for String {
    fn from(h: Handle) -> Self { h.0 }
}

/// Split a composite name (`provider+cluster`, `name+Kind`) into its two parts.
pub fn split_pair(s: &str) -> Option<(&str, &str)> {
    let mut it = s.split(SEPARATOR);
    match (it.next(), it.next(), it.next()) {
        (Some(a), Some(b), None) => Some((a, b)),
        _ => None,
    }
}
