//! Persisted deploy state records
//!
//! `DeployedPackage` is written to a cluster secret after every fully
//! successful deploy; `ClusterTarget` is the init-seeded record describing
//! the bundle-managed registry and git server.

use serde::{Deserialize, Serialize};

use super::bundle::Bundle;

/// A chart (or synthetic manifest chart) installed by a component
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstalledChart {
    pub namespace: String,
    pub chart_name: String,
    pub release_name: String,
    pub revision: u32,
}

/// Per-component record of what made it into the cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployedComponent {
    pub name: String,
    #[serde(default)]
    pub installed_charts: Vec<InstalledChart>,
}

/// The record persisted after a successful deploy, keyed by bundle name
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployedPackage {
    pub cli_version: String,
    /// Snapshot of the bundle descriptor as deployed
    pub data: Bundle,
    pub deployed_components: Vec<DeployedComponent>,
}

impl DeployedPackage {
    pub fn new(data: Bundle, deployed_components: Vec<DeployedComponent>) -> Self {
        Self {
            cli_version: env!("CARGO_PKG_VERSION").to_string(),
            data,
            deployed_components,
        }
    }
}

/// Init-seeded target endpoints for the bundle-managed registry and git
/// server, read from the reserved-namespace state secret.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterTarget {
    pub registry: RegistryTarget,
    pub git: GitTarget,
    pub distro: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegistryTarget {
    /// Registry address reachable from the deploying host, e.g. `127.0.0.1:31999`
    pub address: String,
    pub push_username: String,
    pub push_password: String,
    /// Address as seen from inside the cluster, used for reference rewrites
    pub internal_address: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GitTarget {
    /// Git server base url, e.g. `http://127.0.0.1:31998`
    pub address: String,
    pub push_username: String,
    pub push_password: String,
}
