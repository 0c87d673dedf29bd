//! Data injection
//!
//! Delivers a local file or directory into a named container of a running
//! pod: wait for the pod to be ready, stream a tar (optionally gzipped)
//! through an exec session, then confirm completion by polling a sentinel
//! file written as the archive's final entry.

use anyhow::{bail, Context, Result};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams, ListParams};
use kube::Client;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::domain::bundle::DataInjection;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct Injector {
    client: Client,
    timeout: Duration,
}

impl Injector {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    /// Run one injection end to end.
    pub async fn inject(&self, injection: &DataInjection, source_root: &Path) -> Result<()> {
        let source = source_root.join(&injection.source);
        if !source.exists() {
            bail!(
                "injection source {} not found in component payload",
                source.display()
            );
        }
        let pod = self.wait_for_pod(injection).await?;
        info!(
            pod = %pod,
            target = %injection.target.path,
            "injecting data payload"
        );

        let marker = format!(".airlift-sync-{}", uuid::Uuid::new_v4().simple());
        let archive = build_payload_tar(&source, injection.compress, &marker)?;
        self.stream_archive(injection, &pod, &archive).await?;
        let _ = std::fs::remove_file(&archive);

        self.confirm_sentinel(injection, &pod, &marker).await?;
        Ok(())
    }

    /// Poll for a ready pod matching the target selector.
    async fn wait_for_pod(&self, injection: &DataInjection) -> Result<String> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &injection.target.namespace);
        let params = ListParams::default().labels(&injection.target.selector);
        let deadline = Instant::now() + self.timeout;
        loop {
            let list = pods.list(&params).await.context("Failed to list pods")?;
            let ready = list.items.iter().find(|pod| {
                let running = pod
                    .status
                    .as_ref()
                    .and_then(|s| s.phase.as_deref())
                    .map(|p| p == "Running")
                    .unwrap_or(false);
                let containers_ready = pod
                    .status
                    .as_ref()
                    .and_then(|s| s.container_statuses.as_ref())
                    .map(|cs| cs.iter().all(|c| c.ready))
                    .unwrap_or(false);
                running && containers_ready
            });
            if let Some(pod) = ready {
                return Ok(pod.metadata.name.clone().unwrap_or_default());
            }
            if Instant::now() >= deadline {
                bail!(
                    "no ready pod matching '{}' in namespace {} after {}s",
                    injection.target.selector,
                    injection.target.namespace,
                    self.timeout.as_secs()
                );
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Stream the tar through `tar -xf -` in the target container.
    async fn stream_archive(
        &self,
        injection: &DataInjection,
        pod: &str,
        archive: &Path,
    ) -> Result<()> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &injection.target.namespace);
        let mut command = vec!["tar", "-x"];
        if injection.compress {
            command.push("-z");
        }
        command.extend(["-f", "-", "-C", &injection.target.path]);

        let params = AttachParams::default()
            .container(&injection.target.container)
            .stdin(true)
            .stderr(true);
        let mut attached = pods
            .exec(pod, command, &params)
            .await
            .context("Failed to exec into target container")?;
        let mut stdin = attached
            .stdin()
            .context("exec session exposed no stdin")?;
        let mut file = tokio::fs::File::open(archive).await?;
        tokio::io::copy(&mut file, &mut stdin).await?;
        stdin.shutdown().await?;
        drop(stdin);
        attached.join().await.context("tar extraction failed")?;
        Ok(())
    }

    /// Poll for the sentinel file, then delete it.
    async fn confirm_sentinel(
        &self,
        injection: &DataInjection,
        pod: &str,
        marker: &str,
    ) -> Result<()> {
        let sentinel = format!("{}/{marker}", injection.target.path.trim_end_matches('/'));
        let deadline = Instant::now() + self.timeout;
        loop {
            if self
                .exec_succeeds(injection, pod, vec!["test", "-f", &sentinel])
                .await
            {
                debug!(pod, sentinel = %sentinel, "injection confirmed");
                let _ = self
                    .exec_succeeds(injection, pod, vec!["rm", "-f", &sentinel])
                    .await;
                return Ok(());
            }
            if Instant::now() >= deadline {
                bail!(
                    "injection into {pod} did not confirm within {}s (sentinel {sentinel})",
                    self.timeout.as_secs()
                );
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn exec_succeeds(
        &self,
        injection: &DataInjection,
        pod: &str,
        command: Vec<&str>,
    ) -> bool {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &injection.target.namespace);
        let params = AttachParams::default()
            .container(&injection.target.container)
            .stderr(false);
        let Ok(mut attached) = pods.exec(pod, command, &params).await else {
            return false;
        };
        let status = attached.take_status();
        let _ = attached.join().await;
        match status {
            Some(rx) => matches!(
                rx.await.and_then(|s| s.status),
                Some(ref s) if s == "Success"
            ),
            None => false,
        }
    }
}

/// Build the payload tar on disk: the source tree first, the sentinel
/// marker as the final entry so its presence proves extraction finished.
pub fn build_payload_tar(source: &Path, compress: bool, marker: &str) -> Result<PathBuf> {
    let out = std::env::temp_dir().join(format!("airlift-inject-{marker}.tar"));
    let file = std::fs::File::create(&out)?;

    fn append<W: std::io::Write>(builder: &mut tar::Builder<W>, source: &Path, marker: &str) -> Result<()> {
        if source.is_dir() {
            builder.append_dir_all(".", source)?;
        } else {
            let name = source
                .file_name()
                .context("injection source has no file name")?;
            builder.append_path_with_name(source, name)?;
        }
        let mut header = tar::Header::new_gnu();
        header.set_size(0);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, marker, std::io::empty())?;
        builder.finish()?;
        Ok(())
    }

    if compress {
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        append(&mut builder, source, marker)?;
        builder.into_inner()?.finish()?;
    } else {
        let mut builder = tar::Builder::new(file);
        append(&mut builder, source, marker)?;
    }
    Ok(out)
}
