//! Cluster state store
//!
//! Two kinds of records live as secrets in the reserved namespace: the
//! init-seeded `airlift-state` secret describing the bundle-managed
//! registry and git server, and one `airlift-package-<name>` secret per
//! deployed bundle. The cluster is the authoritative store; records are
//! read back on redeploy to reason about history.

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::{Namespace, Secret};
use k8s_openapi::ByteString;
use kube::api::{Api, ObjectMeta, PostParams};
use kube::Client;
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::domain::state::{ClusterTarget, DeployedPackage};
use crate::domain::{PACKAGE_SECRET_PREFIX, RESERVED_NAMESPACE, STATE_SECRET};
use crate::error::StateError;

const DATA_KEY: &str = "data";

/// Store for airlift-managed cluster state
pub struct StateStore {
    client: Client,
}

impl StateStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn secrets(&self) -> Api<Secret> {
        Api::namespaced(self.client.clone(), RESERVED_NAMESPACE)
    }

    /// Read the init-seeded registry/git targets.
    pub async fn load_cluster_target(&self) -> Result<ClusterTarget> {
        let secret = self
            .secrets()
            .get_opt(STATE_SECRET)
            .await
            .context("Failed to query cluster state secret")?
            .ok_or_else(|| StateError::NotFound {
                name: STATE_SECRET.to_string(),
                namespace: RESERVED_NAMESPACE.to_string(),
            })?;
        decode(&secret, STATE_SECRET)
    }

    /// Read the deployed-package record for a bundle name, if any.
    pub async fn read_package(&self, bundle_name: &str) -> Result<Option<DeployedPackage>> {
        let name = package_secret_name(bundle_name);
        let Some(secret) = self
            .secrets()
            .get_opt(&name)
            .await
            .context("Failed to query deployed package secret")?
        else {
            return Ok(None);
        };
        Ok(Some(decode(&secret, &name)?))
    }

    /// Persist the deployed-package record, creating or replacing the
    /// secret. Only called after every component has succeeded.
    pub async fn write_package(&self, package: &DeployedPackage) -> Result<()> {
        self.ensure_namespace().await?;
        let name = package_secret_name(&package.data.metadata.name);
        let payload = serde_json::to_vec(package)?;
        let mut data = BTreeMap::new();
        data.insert(DATA_KEY.to_string(), ByteString(payload));

        let secrets = self.secrets();
        let desired = Secret {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(RESERVED_NAMESPACE.to_string()),
                labels: Some(BTreeMap::from([(
                    "app.kubernetes.io/managed-by".to_string(),
                    "airlift".to_string(),
                )])),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        };

        match secrets.get_opt(&name).await? {
            Some(existing) => {
                let mut replacement = desired;
                replacement.metadata.resource_version = existing.metadata.resource_version;
                secrets
                    .replace(&name, &PostParams::default(), &replacement)
                    .await
                    .context("Failed to replace deployed package secret")?;
            }
            None => {
                secrets
                    .create(&PostParams::default(), &desired)
                    .await
                    .context("Failed to create deployed package secret")?;
            }
        }
        info!(secret = %name, "deploy state persisted");
        Ok(())
    }

    async fn ensure_namespace(&self) -> Result<()> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        if namespaces.get_opt(RESERVED_NAMESPACE).await?.is_some() {
            return Ok(());
        }
        debug!(namespace = RESERVED_NAMESPACE, "creating reserved namespace");
        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some(RESERVED_NAMESPACE.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        match namespaces.create(&PostParams::default(), &ns).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(()),
            Err(e) => Err(e).context("Failed to create reserved namespace"),
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(secret: &Secret, name: &str) -> Result<T> {
    let bytes = secret
        .data
        .as_ref()
        .and_then(|d| d.get(DATA_KEY))
        .map(|b| b.0.clone())
        .ok_or_else(|| StateError::Corrupt {
            name: name.to_string(),
            message: format!("missing '{DATA_KEY}' key"),
        })?;
    serde_json::from_slice(&bytes).map_err(|e| {
        StateError::Corrupt {
            name: name.to_string(),
            message: e.to_string(),
        }
        .into()
    })
}

/// Secret name for a bundle's deployed-package record.
pub fn package_secret_name(bundle_name: &str) -> String {
    format!("{PACKAGE_SECRET_PREFIX}{bundle_name}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::bundle::Bundle;

    #[test]
    fn test_package_secret_name() {
        assert_eq!(package_secret_name("sample"), "airlift-package-sample");
    }

    #[test]
    fn test_decode_round_trip() {
        let bundle = Bundle::parse(
            "kind: ZarfPackageConfig\nmetadata:\n  name: sample\ncomponents:\n  - name: app\n",
        )
        .unwrap();
        let package = DeployedPackage::new(bundle, Vec::new());
        let mut data = BTreeMap::new();
        data.insert(
            DATA_KEY.to_string(),
            ByteString(serde_json::to_vec(&package).unwrap()),
        );
        let secret = Secret {
            data: Some(data),
            ..Default::default()
        };
        let decoded: DeployedPackage = decode(&secret, "airlift-package-sample").unwrap();
        assert_eq!(decoded.data.metadata.name, "sample");
    }

    #[test]
    fn test_decode_missing_key_is_corrupt() {
        let secret = Secret::default();
        let err = decode::<DeployedPackage>(&secret, "airlift-package-x").unwrap_err();
        assert!(err.to_string().contains("missing"));
    }
}
