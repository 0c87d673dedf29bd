//! Release manager
//!
//! Drives every chart and manifest set through the release state machine:
//! resolve the live release, install or upgrade (with retries), run the
//! two-stage wait, and roll back to the last healthy revision on failure.
//! Raw manifests are materialized into synthetic charts so one engine
//! handles both.

use anyhow::{Context, Result};
use kube::Client;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::domain::bundle::{Chart, Manifest};
use crate::domain::state::InstalledChart;
use crate::error::ReleaseError;
use crate::infrastructure::helm::HelmClient;
use crate::k8s;
use crate::services::variables::VariableStore;

const DEFAULT_NAMESPACE: &str = "default";

/// One release to reconcile
#[derive(Debug, Clone)]
struct ReleaseRequest {
    namespace: String,
    release: String,
    chart_name: String,
    chart_path: PathBuf,
    values: Vec<PathBuf>,
    no_wait: bool,
    timeout: Duration,
    retries: u32,
}

pub struct ReleaseManager {
    client: Client,
    timeout: Duration,
    retries: u32,
    no_wait: bool,
}

impl ReleaseManager {
    pub fn new(client: Client, timeout: Duration, retries: u32, no_wait: bool) -> Self {
        Self {
            client,
            timeout,
            retries: retries.max(1),
            no_wait,
        }
    }

    /// Install or upgrade a bundled chart.
    pub async fn deploy_chart(
        &self,
        chart: &Chart,
        component_dir: &Path,
        variables: &VariableStore,
    ) -> Result<InstalledChart> {
        let chart_path = resolve_chart_path(chart, component_dir);
        if !chart_path.exists() {
            anyhow::bail!(
                "chart {} not found at {}",
                chart.name,
                chart_path.display()
            );
        }
        let mut values = Vec::new();
        for file in &chart.values_files {
            let path = component_dir.join(file);
            variables.render_file(&path)?;
            values.push(path);
        }
        let request = ReleaseRequest {
            namespace: default_namespace(&chart.namespace),
            release: chart.release_name().to_string(),
            chart_name: chart.name.clone(),
            chart_path,
            values,
            no_wait: self.no_wait || chart.no_wait,
            timeout: chart
                .timeout_seconds
                .map(Duration::from_secs)
                .unwrap_or(self.timeout),
            retries: chart.max_retries.unwrap_or(self.retries).max(1),
        };
        self.reconcile(request).await
    }

    /// Materialize a manifest set into a synthetic chart and reconcile it.
    pub async fn deploy_manifests(
        &self,
        manifest: &Manifest,
        component_dir: &Path,
        staging: &Path,
        variables: &VariableStore,
    ) -> Result<InstalledChart> {
        let chart_path = materialize_synthetic_chart(manifest, component_dir, staging, variables)?;
        let request = ReleaseRequest {
            namespace: default_namespace(&manifest.namespace),
            release: manifest.name.clone(),
            chart_name: manifest.name.clone(),
            chart_path,
            values: Vec::new(),
            no_wait: self.no_wait || manifest.no_wait,
            timeout: manifest
                .timeout_seconds
                .map(Duration::from_secs)
                .unwrap_or(self.timeout),
            retries: manifest.max_retries.unwrap_or(self.retries).max(1),
        };
        self.reconcile(request).await
    }

    /// The state machine: resolve → install/upgrade → wait → (rollback).
    async fn reconcile(&self, request: ReleaseRequest) -> Result<InstalledChart> {
        let helm = HelmClient::new(request.timeout);
        let existing = helm.status(&request.namespace, &request.release).await?;
        match &existing {
            Some(status) => info!(
                release = %request.release,
                namespace = %request.namespace,
                revision = status.revision,
                status = %status.info.status,
                "release exists, upgrading"
            ),
            None => info!(
                release = %request.release,
                namespace = %request.namespace,
                "no release found, installing"
            ),
        }

        let mut attempts = 0;
        let engine_wait = !request.no_wait;
        loop {
            attempts += 1;
            let result = match &existing {
                None => {
                    helm.install(
                        &request.namespace,
                        &request.release,
                        &request.chart_path,
                        &request.values,
                        engine_wait,
                    )
                    .await
                }
                Some(_) => {
                    helm.upgrade(
                        &request.namespace,
                        &request.release,
                        &request.chart_path,
                        &request.values,
                        engine_wait,
                    )
                    .await
                }
            };
            let result = match result {
                Ok(()) if !request.no_wait => self.secondary_wait(&helm, &request).await,
                other => other,
            };

            match result {
                Ok(()) => break,
                Err(e) if attempts < request.retries => {
                    warn!(
                        release = %request.release,
                        attempt = attempts,
                        error = %format!("{e:#}"),
                        "release attempt failed, retrying..."
                    );
                    if existing.is_none() {
                        // A failed install leaves the name claimed; clear it
                        // before the next attempt.
                        let _ = helm.uninstall(&request.namespace, &request.release).await;
                    }
                }
                Err(e) => {
                    self.attempt_rollback(&helm, &request, existing.as_ref().map(|s| s.revision))
                        .await;
                    return Err(match existing {
                        Some(_) => ReleaseError::UpgradeFailed {
                            release: request.release.clone(),
                            attempts,
                            message: format!("{e:#}"),
                        },
                        None => ReleaseError::InstallFailed {
                            release: request.release.clone(),
                            attempts,
                            message: format!("{e:#}"),
                        },
                    }
                    .into());
                }
            }
        }

        let revision = helm
            .status(&request.namespace, &request.release)
            .await?
            .map(|s| s.revision)
            .unwrap_or(1);
        info!(
            release = %request.release,
            revision,
            "release reconciled"
        );
        Ok(InstalledChart {
            namespace: request.namespace,
            chart_name: request.chart_name,
            release_name: request.release,
            revision,
        })
    }

    /// Secondary reconciliation: poll `.status` on every applied object.
    async fn secondary_wait(&self, helm: &HelmClient, request: &ReleaseRequest) -> Result<()> {
        let manifest = helm
            .get_manifest(&request.namespace, &request.release)
            .await?;
        let objects = k8s::parse_manifest_objects(&manifest, &request.namespace)?;
        if objects.is_empty() {
            return Ok(());
        }
        info!(
            release = %request.release,
            objects = objects.len(),
            "waiting for applied objects to reconcile"
        );
        k8s::wait_for_ready(&self.client, &objects, request.timeout).await
    }

    /// Best-effort rollback: back to the last healthy revision when one
    /// exists, otherwise uninstall the failed first install. Never retried.
    async fn attempt_rollback(
        &self,
        helm: &HelmClient,
        request: &ReleaseRequest,
        last_good: Option<u32>,
    ) {
        match last_good {
            Some(revision) => {
                warn!(
                    release = %request.release,
                    revision,
                    "rolling back to last healthy revision"
                );
                if let Err(e) = helm
                    .rollback(&request.namespace, &request.release, revision)
                    .await
                {
                    let rollback_err = ReleaseError::RollbackFailed {
                        release: request.release.clone(),
                        revision,
                        message: format!("{e:#}"),
                    };
                    warn!("{rollback_err}");
                }
            }
            None => {
                warn!(release = %request.release, "removing failed first install");
                if let Err(e) = helm.uninstall(&request.namespace, &request.release).await {
                    warn!(
                        release = %request.release,
                        error = %format!("{e:#}"),
                        "uninstall failed"
                    );
                }
            }
        }
    }
}

fn default_namespace(namespace: &str) -> String {
    if namespace.is_empty() {
        DEFAULT_NAMESPACE.to_string()
    } else {
        namespace.to_string()
    }
}

/// Bundled charts live under `charts/` in the component payload.
fn resolve_chart_path(chart: &Chart, component_dir: &Path) -> PathBuf {
    let charts = component_dir.join("charts");
    match &chart.local_path {
        Some(local) => charts.join(local),
        None => match &chart.version {
            Some(version) => charts.join(format!("{}-{version}.tgz", chart.name)),
            None => charts.join(&chart.name),
        },
    }
}

/// Write a synthetic chart wrapping a manifest set: a minimal `Chart.yaml`
/// plus each manifest file, variable-rendered, under `templates/`.
fn materialize_synthetic_chart(
    manifest: &Manifest,
    component_dir: &Path,
    staging: &Path,
    variables: &VariableStore,
) -> Result<PathBuf> {
    let chart_dir = staging.join(format!("manifest-chart-{}", manifest.name));
    let templates = chart_dir.join("templates");
    std::fs::create_dir_all(&templates)?;

    let chart_yaml = format!(
        "apiVersion: v2\nname: {}\nversion: 0.1.0\ndescription: Raw manifests for {}\n",
        manifest.name, manifest.name
    );
    std::fs::write(chart_dir.join("Chart.yaml"), chart_yaml)?;

    for (index, file) in manifest.files.iter().enumerate() {
        let source = component_dir.join("manifests").join(file);
        let content = std::fs::read_to_string(&source)
            .with_context(|| format!("Failed to read manifest {}", source.display()))?;
        let rendered = variables.render(&content, &source.display().to_string())?;
        let file_name = Path::new(file)
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| format!("{index:02}-{n}"))
            .unwrap_or_else(|| format!("{index:02}.yaml"));
        std::fs::write(templates.join(file_name), rendered)?;
    }
    Ok(chart_dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::bundle::Bundle;

    fn variables() -> VariableStore {
        let bundle = Bundle::parse(
            r#"
kind: ZarfPackageConfig
metadata:
  name: t
variables:
  - name: VERSION
    default: 1.2.3
components:
  - name: a
"#,
        )
        .unwrap();
        VariableStore::new(&bundle, &[]).unwrap()
    }

    #[test]
    fn test_synthetic_chart_materialization() {
        let staging = tempfile::tempdir().unwrap();
        let component_dir = staging.path().join("component");
        std::fs::create_dir_all(component_dir.join("manifests")).unwrap();
        std::fs::write(
            component_dir.join("manifests/deployment.yaml"),
            "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: web\n  labels:\n    version: \"###ZARF_VAR_VERSION###\"\n",
        )
        .unwrap();

        let manifest = Manifest {
            name: "nginx-manifests".to_string(),
            namespace: "web".to_string(),
            files: vec!["deployment.yaml".to_string()],
            ..Default::default()
        };
        let chart_dir = materialize_synthetic_chart(
            &manifest,
            &component_dir,
            staging.path(),
            &variables(),
        )
        .unwrap();

        let chart_yaml =
            std::fs::read_to_string(chart_dir.join("Chart.yaml")).unwrap();
        assert!(chart_yaml.contains("name: nginx-manifests"));
        assert!(chart_yaml.contains("apiVersion: v2"));

        let rendered =
            std::fs::read_to_string(chart_dir.join("templates/00-deployment.yaml")).unwrap();
        assert!(rendered.contains("version: \"1.2.3\""));
        assert!(!rendered.contains("###ZARF_VAR_"));
    }

    #[test]
    fn test_unresolved_manifest_variable_is_fatal() {
        let staging = tempfile::tempdir().unwrap();
        let component_dir = staging.path().join("component");
        std::fs::create_dir_all(component_dir.join("manifests")).unwrap();
        std::fs::write(
            component_dir.join("manifests/cm.yaml"),
            "data: ###ZARF_VAR_NOPE###\n",
        )
        .unwrap();
        let manifest = Manifest {
            name: "cm".to_string(),
            files: vec!["cm.yaml".to_string()],
            ..Default::default()
        };
        let err = materialize_synthetic_chart(
            &manifest,
            &component_dir,
            staging.path(),
            &variables(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("NOPE"));
    }

    #[test]
    fn test_resolve_chart_path_variants() {
        let dir = Path::new("/stage/components/app");
        let by_local = Chart {
            name: "api".to_string(),
            local_path: Some("api".to_string()),
            ..Default::default()
        };
        assert_eq!(
            resolve_chart_path(&by_local, dir),
            dir.join("charts/api")
        );
        let by_version = Chart {
            name: "api".to_string(),
            version: Some("2.1.0".to_string()),
            ..Default::default()
        };
        assert_eq!(
            resolve_chart_path(&by_version, dir),
            dir.join("charts/api-2.1.0.tgz")
        );
    }

    #[test]
    fn test_default_namespace() {
        assert_eq!(default_namespace(""), "default");
        assert_eq!(default_namespace("web"), "web");
    }
}
