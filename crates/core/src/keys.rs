//! Document-store key scopes.
//!
//! Every managed resource owns exactly one lifecycle record; the scope names
//! which one. The store sees the canonical JSON rendering of the scope.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Scope {
    /// CA certificate distributed to the clusters of one provider.
    CaCertClusterProvider { cluster_provider: String, cert: String },
    /// CA certificate distributed to the clusters of a project's logical clouds.
    CaCertLogicalCloud { project: String, cert: String },
    DeploymentIntentGroup { project: String, composite_app: String, version: String, deployment_intent_group: String },
    LogicalCloud { project: String, logical_cloud: String },
    Cluster { cluster_provider: String, cluster: String },
}

impl Scope {
    /// Stable key handed to the document store.
    pub fn db_key(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| self.to_string())
    }

    /// Short kind label, used in logs and notifications.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CaCertClusterProvider { .. } => "caCertClusterProvider",
            Self::CaCertLogicalCloud { .. } => "caCertLogicalCloud",
            Self::DeploymentIntentGroup { .. } => "deploymentIntentGroup",
            Self::LogicalCloud { .. } => "logicalCloud",
            Self::Cluster { .. } => "cluster",
        }
    }

    /// The scope's own name (the last path element).
    pub fn name(&self) -> &str {
        match self {
            Self::CaCertClusterProvider { cert, .. } | Self::CaCertLogicalCloud { cert, .. } => cert,
            Self::DeploymentIntentGroup { deployment_intent_group, .. } => deployment_intent_group,
            Self::LogicalCloud { logical_cloud, .. } => logical_cloud,
            Self::Cluster { cluster, .. } => cluster,
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CaCertClusterProvider { cluster_provider, cert } => write!(f, "clusterProvider/{}/caCert/{}", cluster_provider, cert),
            Self::CaCertLogicalCloud { project, cert } => write!(f, "project/{}/caCert/{}", project, cert),
            Self::DeploymentIntentGroup { project, composite_app, version, deployment_intent_group } => {
                write!(f, "project/{}/compositeApp/{}/{}/deploymentIntentGroup/{}", project, composite_app, version, deployment_intent_group)
            }
            Self::LogicalCloud { project, logical_cloud } => write!(f, "project/{}/logicalCloud/{}", project, logical_cloud),
            Self::Cluster { cluster_provider, cluster } => write!(f, "clusterProvider/{}/cluster/{}", cluster_provider, cluster),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_key_is_tagged_json() {
        let k = Scope::CaCertClusterProvider { cluster_provider: "cp1".into(), cert: "root".into() };
        assert_eq!(k.db_key(), r#"{"caCertClusterProvider":{"clusterProvider":"cp1","cert":"root"}}"#);
        let back: Scope = serde_json::from_str(&k.db_key()).unwrap();
        assert_eq!(back, k);
    }

    #[test]
    fn display_and_name() {
        let k = Scope::LogicalCloud { project: "p".into(), logical_cloud: "lc".into() };
        assert_eq!(k.to_string(), "project/p/logicalCloud/lc");
        assert_eq!(k.name(), "lc");
        assert_eq!(k.kind(), "logicalCloud");
    }
}
