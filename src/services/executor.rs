//! Component executor
//!
//! Runs each selected component through its fixed step order:
//! before-hooks, files, cluster state, image push, repo push, data
//! injections, charts, manifests, after-hooks, success-hooks. The order is
//! never shuffled even when steps look independent, because actions feed
//! later steps through `setVariable`. Any failure runs the component's
//! failure hooks best-effort and aborts the whole deploy.

use anyhow::{bail, Context, Result};
use kube::Client;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::{DeployOptions, HostFacts};
use crate::domain::bundle::Component;
use crate::domain::state::{ClusterTarget, DeployedComponent};
use crate::domain::IMAGES_DIR;
use crate::infrastructure::archive::{sha256_file, LoadedBundle};
use crate::infrastructure::git::RepoMirror;
use crate::infrastructure::injection::Injector;
use crate::infrastructure::oci::{self, LayerCache, OciLayout, PullConfig};
use crate::infrastructure::registry::RegistryPusher;
use crate::infrastructure::state::StateStore;
use crate::services::actions::ActionRunner;
use crate::services::release::ReleaseManager;
use crate::services::variables::VariableStore;
use crate::ui;

pub struct ComponentExecutor {
    client: Option<Client>,
    opts: DeployOptions,
    host: HostFacts,
    staging: PathBuf,
    variables: Arc<VariableStore>,
    actions: ActionRunner,
    yolo: bool,
    cluster_target: Option<ClusterTarget>,
}

impl ComponentExecutor {
    pub fn new(
        client: Option<Client>,
        opts: DeployOptions,
        host: HostFacts,
        staging: PathBuf,
        variables: Arc<VariableStore>,
        yolo: bool,
    ) -> Self {
        let actions = ActionRunner::new(variables.clone());
        Self {
            client,
            opts,
            host,
            staging,
            variables,
            actions,
            yolo,
            cluster_target: None,
        }
    }

    /// Cluster-bound steps fail here when the cluster never came up.
    fn client(&self) -> Result<Client> {
        self.client
            .clone()
            .context("cluster is unreachable but this component needs it")
    }

    /// Execute every component in declared order. The first failure aborts
    /// the deploy; components already completed stay deployed.
    pub async fn execute_all(
        &mut self,
        components: &[Component],
        loaded: &LoadedBundle,
    ) -> Result<Vec<DeployedComponent>> {
        let mut deployed = Vec::new();
        for component in components {
            ui::print_header(&format!("Component: {}", component.name));
            match self.execute_component(component, loaded).await {
                Ok(record) => deployed.push(record),
                Err(e) => {
                    warn!(component = %component.name, "component failed, running failure hooks");
                    if let Err(hook_err) =
                        self.actions.run_set(&component.actions.on_failure).await
                    {
                        warn!(error = %format!("{hook_err:#}"), "failure hooks also failed");
                    }
                    return Err(e).with_context(|| {
                        format!("component {} failed to deploy", component.name)
                    });
                }
            }
        }
        Ok(deployed)
    }

    async fn execute_component(
        &mut self,
        component: &Component,
        loaded: &LoadedBundle,
    ) -> Result<DeployedComponent> {
        let component_dir = loaded.component_dir(&component.name);

        self.actions.run_set(&component.actions.before).await?;

        place_component_files(component, &component_dir, &self.variables)?;

        let needs_cluster_targets = !component.images.is_empty() || !component.repos.is_empty();
        if needs_cluster_targets && !self.yolo {
            self.ensure_cluster_target().await?;
        }

        if !component.images.is_empty() {
            self.push_images(component, &component_dir).await?;
        }
        if !component.repos.is_empty() {
            self.push_repos(component, &component_dir).await?;
        }
        for injection in &component.data_injections {
            let injector = Injector::new(self.client()?, self.opts.timeout);
            injector.inject(injection, &component_dir).await?;
        }

        let mut installed = Vec::new();
        if !component.charts.is_empty() || !component.manifests.is_empty() {
            let releases = ReleaseManager::new(
                self.client()?,
                self.opts.timeout,
                self.opts.retries,
                self.opts.no_wait,
            );
            for chart in &component.charts {
                installed.push(
                    releases
                        .deploy_chart(chart, &component_dir, &self.variables)
                        .await?,
                );
            }
            for manifest in &component.manifests {
                installed.push(
                    releases
                        .deploy_manifests(manifest, &component_dir, &self.staging, &self.variables)
                        .await?,
                );
            }
        }

        self.actions.run_set(&component.actions.after).await?;
        self.actions.run_set(&component.actions.on_success).await?;

        info!(component = %component.name, charts = installed.len(), "component deployed");
        Ok(DeployedComponent {
            name: component.name.clone(),
            installed_charts: installed,
        })
    }

    /// Load the init-seeded registry/git endpoints once per deploy.
    async fn ensure_cluster_target(&mut self) -> Result<()> {
        if self.cluster_target.is_some() {
            return Ok(());
        }
        let store = StateStore::new(self.client()?);
        let target = store.load_cluster_target().await.context(
            "cluster has no airlift state; run init against it first or mark the bundle yolo",
        )?;
        self.cluster_target = Some(target);
        Ok(())
    }

    /// Stage the component's images in an OCI layout (bundled layout when
    /// present, live pull otherwise) and push them to the cluster registry.
    async fn push_images(&self, component: &Component, component_dir: &Path) -> Result<()> {
        if self.yolo {
            info!("yolo bundle: cluster pulls images from their original sources");
            return Ok(());
        }
        let bundled = component_dir.join(IMAGES_DIR);
        let layout = if bundled.join("index.json").exists() {
            info!(component = %component.name, "using bundled image layout");
            OciLayout::open(&bundled)?
        } else {
            info!(
                component = %component.name,
                images = component.images.len(),
                "no bundled layout, pulling images"
            );
            let dest = self.staging.join(format!("images-{}", component.name));
            let scratch = self.staging.join("image-scratch");
            std::fs::create_dir_all(&scratch)?;
            let cache = match &self.opts.cache_dir {
                Some(dir) => Some(LayerCache::new(dir)?),
                None => None,
            };
            let config = PullConfig {
                dest: dest.clone(),
                staging: scratch,
                cache,
                registry_overrides: Default::default(),
                arch: self.host.arch.clone(),
                workers: self.opts.image_workers,
                plain_http: self.opts.plain_http,
                insecure_skip_tls_verify: self.opts.insecure_skip_tls_verify,
            };
            let report = oci::pull_images(&component.images, &config).await?;
            info!(
                images = report.descriptors.len(),
                total_mb = report.total_bytes / (1024 * 1024),
                "images staged"
            );
            OciLayout::open(&dest)?
        };

        let target = self
            .cluster_target
            .as_ref()
            .map(|t| t.registry.clone())
            .unwrap_or_default();
        // The bundle-managed registry sits behind a plain-HTTP NodePort.
        let pusher = RegistryPusher::new(target, true, self.opts.insecure_skip_tls_verify)?
            .with_retries(self.opts.retries)
            .with_workers(self.opts.image_workers);
        pusher.push_layout(Arc::new(layout)).await?;
        Ok(())
    }

    async fn push_repos(&self, component: &Component, component_dir: &Path) -> Result<()> {
        if self.yolo {
            info!("yolo bundle: skipping repo mirroring");
            return Ok(());
        }
        let target = self
            .cluster_target
            .as_ref()
            .map(|t| t.git.clone())
            .unwrap_or_default();
        let staging = self.staging.join("repos");
        let mirror = RepoMirror::new(target, &staging, self.opts.retries)?;
        let bundled = component_dir.join("repos");
        let bundled = bundled.exists().then_some(bundled);
        let mirrored = mirror
            .mirror_all(&component.repos, bundled.as_deref())
            .await?;
        info!(repos = mirrored.len(), "repos mirrored");
        Ok(())
    }
}

/// Place each declared file: resolve inside the component payload, verify
/// its shasum, render template markers, copy to the (rendered) target and
/// apply the executable bit.
pub fn place_component_files(
    component: &Component,
    component_dir: &Path,
    variables: &VariableStore,
) -> Result<()> {
    for file in &component.files {
        let source = component_dir.join("files").join(&file.source);
        if !source.exists() {
            bail!(
                "file {} missing from component {} payload",
                file.source,
                component.name
            );
        }
        if let Some(expected) = &file.shasum {
            let actual = sha256_file(&source)?;
            if &actual != expected {
                bail!(
                    "file {} checksum mismatch: expected {expected}, got {actual}",
                    file.source
                );
            }
        }
        let target = PathBuf::from(variables.render(&file.target, &file.target)?);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::copy(&source, &target)
            .with_context(|| format!("Failed to place {}", target.display()))?;
        variables.render_file(&target)?;
        if file.executable {
            set_executable(&target)?;
        }
        info!(target = %target.display(), "file placed");
    }
    Ok(())
}

#[cfg(unix)]
fn set_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::bundle::{Bundle, FileDrop};

    fn variables_with(pairs: &[(&str, &str)]) -> VariableStore {
        let bundle = Bundle::parse(
            "kind: ZarfPackageConfig\nmetadata:\n  name: t\ncomponents:\n  - name: a\n",
        )
        .unwrap();
        let overrides: Vec<(String, String)> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        VariableStore::new(&bundle, &overrides).unwrap()
    }

    fn component_with_file(file: FileDrop) -> Component {
        Component {
            name: "files".to_string(),
            files: vec![file],
            ..Default::default()
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_place_file_renders_and_marks_executable() {
        let dir = tempfile::tempdir().unwrap();
        let component_dir = dir.path().join("component");
        std::fs::create_dir_all(component_dir.join("files")).unwrap();
        std::fs::write(
            component_dir.join("files/run.sh"),
            "#!/bin/sh\necho ###ZARF_VAR_MODE###\n",
        )
        .unwrap();

        let target = dir.path().join("out/run.sh");
        let component = component_with_file(FileDrop {
            source: "run.sh".to_string(),
            target: target.display().to_string(),
            executable: true,
            ..Default::default()
        });
        let variables = variables_with(&[("MODE", "fast")]);
        place_component_files(&component, &component_dir, &variables).unwrap();

        let placed = std::fs::read_to_string(&target).unwrap();
        assert!(placed.contains("echo fast"));

        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&target).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111);
    }

    #[test]
    fn test_place_file_shasum_mismatch_fails() {
        let dir = tempfile::tempdir().unwrap();
        let component_dir = dir.path().join("component");
        std::fs::create_dir_all(component_dir.join("files")).unwrap();
        std::fs::write(component_dir.join("files/data.bin"), b"payload").unwrap();

        let component = component_with_file(FileDrop {
            source: "data.bin".to_string(),
            target: dir.path().join("out/data.bin").display().to_string(),
            shasum: Some("0".repeat(64)),
            ..Default::default()
        });
        let variables = variables_with(&[]);
        let err =
            place_component_files(&component, &component_dir, &variables).unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[test]
    fn test_place_file_missing_source_fails() {
        let dir = tempfile::tempdir().unwrap();
        let component_dir = dir.path().join("component");
        std::fs::create_dir_all(component_dir.join("files")).unwrap();
        let component = component_with_file(FileDrop {
            source: "nope.txt".to_string(),
            target: dir.path().join("out/nope.txt").display().to_string(),
            ..Default::default()
        });
        let variables = variables_with(&[]);
        let err =
            place_component_files(&component, &component_dir, &variables).unwrap_err();
        assert!(err.to_string().contains("missing from component"));
    }

    #[test]
    fn test_target_path_is_templated() {
        let dir = tempfile::tempdir().unwrap();
        let component_dir = dir.path().join("component");
        std::fs::create_dir_all(component_dir.join("files")).unwrap();
        std::fs::write(component_dir.join("files/cfg"), b"x").unwrap();

        let component = component_with_file(FileDrop {
            source: "cfg".to_string(),
            target: format!("{}/###ZARF_VAR_ENV###/cfg", dir.path().display()),
            ..Default::default()
        });
        let variables = variables_with(&[("ENV", "prod")]);
        place_component_files(&component, &component_dir, &variables).unwrap();
        assert!(dir.path().join("prod/cfg").exists());
    }
}
