//! Cluster registry push
//!
//! Pushes every image in a staging OCI layout into the bundle-managed
//! registry, rewriting references into the registry's namespace. Layers
//! already present (by digest) are skipped, pushes run bounded-parallel,
//! and each image retries with backoff. Re-running a push is harmless.

use anyhow::Result;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::domain::state::RegistryTarget;
use crate::error::RegistryError;
use crate::infrastructure::oci::layout::{annotation, digest_hex, OciLayout, REF_ANNOTATION};
use crate::infrastructure::oci::{ImageRef, RegistryHttpClient};

/// Client for pushing a layout into the cluster registry
#[derive(Debug)]
pub struct RegistryPusher {
    client: Arc<RegistryHttpClient>,
    target: RegistryTarget,
    default_retries: u32,
    workers: usize,
}

impl RegistryPusher {
    pub fn new(target: RegistryTarget, plain_http: bool, insecure: bool) -> Result<Self> {
        if target.address.is_empty() {
            return Err(RegistryError::NoTarget.into());
        }
        let mut client = RegistryHttpClient::new(plain_http, insecure)?;
        if !target.push_username.is_empty() {
            client = client.with_credentials(&target.push_username, &target.push_password);
        }
        Ok(Self {
            client: Arc::new(client),
            target,
            default_retries: 3,
            workers: 10,
        })
    }

    /// Set retry count for each image push
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.default_retries = retries.max(1);
        self
    }

    /// Set bounded parallelism for image pushes
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Rewrite an original reference into the cluster registry namespace.
    ///
    /// `docker.io/library/nginx:1.25` becomes
    /// `<registry>/library/nginx:1.25`; digest-pinned references are
    /// addressed by tag `sha256-<hex>` so they stay pullable by name.
    pub fn rewrite(&self, original: &ImageRef) -> Result<ImageRef> {
        let tag = match (&original.tag, &original.digest) {
            (_, Some(digest)) => format!("sha256-{}", digest_hex(digest)),
            (Some(tag), None) => tag.clone(),
            (None, None) => "latest".to_string(),
        };
        ImageRef::parse(&format!(
            "{}/{}:{tag}",
            self.target.address, original.repository
        ))
    }

    /// Push every image in the layout. Returns the pushed target references.
    pub async fn push_layout(&self, layout: Arc<OciLayout>) -> Result<Vec<String>> {
        let index = layout.index()?;
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();

        for descriptor in index.manifests().iter().cloned() {
            let Some(reference) = annotation(&descriptor, REF_ANNOTATION) else {
                warn!(digest = %descriptor.digest(), "skipping unannotated manifest");
                continue;
            };
            let original = ImageRef::parse(&reference)?;
            let target = self.rewrite(&original)?;
            let client = self.client.clone();
            let layout = layout.clone();
            let semaphore = semaphore.clone();
            let retries = self.default_retries;
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let result =
                    push_image_with_retries(&client, &layout, &descriptor, &target, retries)
                        .await;
                result.map(|_| target.original)
            });
        }

        let mut pushed = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            pushed.push(joined??);
        }
        pushed.sort();
        info!(images = pushed.len(), registry = %self.target.address, "image push complete");
        Ok(pushed)
    }
}

async fn push_image_with_retries(
    client: &RegistryHttpClient,
    layout: &OciLayout,
    descriptor: &oci_spec::image::Descriptor,
    target: &ImageRef,
    retries: u32,
) -> Result<()> {
    let mut attempts = 0;
    loop {
        attempts += 1;
        match push_image(client, layout, descriptor, target).await {
            Ok(()) => {
                debug!(target = %target.original, attempts, "image pushed");
                return Ok(());
            }
            Err(e) if attempts < retries => {
                warn!(
                    target = %target.original,
                    attempt = attempts,
                    error = %format!("{e:#}"),
                    "push attempt failed, retrying..."
                );
                tokio::time::sleep(std::time::Duration::from_secs(2)).await;
            }
            Err(e) => {
                return Err(RegistryError::PushFailed {
                    attempts,
                    message: format!("{}: {e:#}", target.original),
                }
                .into())
            }
        }
    }
}

/// Push one image: blobs first (skipping any the registry already holds),
/// then the manifest at its tag.
async fn push_image(
    client: &RegistryHttpClient,
    layout: &OciLayout,
    descriptor: &oci_spec::image::Descriptor,
    target: &ImageRef,
) -> Result<()> {
    let manifest = layout.manifest(descriptor)?;
    for blob in manifest
        .layers()
        .iter()
        .chain(std::iter::once(manifest.config()))
    {
        if client.blob_exists(target, blob.digest()).await? {
            debug!(digest = %blob.digest(), "blob already present");
            continue;
        }
        let path = layout.blob_path(digest_hex(blob.digest()));
        client.upload_blob(target, blob.digest(), &path).await?;
    }

    let manifest_bytes = layout.blob_bytes(descriptor.digest())?;
    let content_type = descriptor.media_type().to_string();
    client
        .put_manifest(
            target,
            &target.manifest_reference(),
            &content_type,
            manifest_bytes,
        )
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pusher() -> RegistryPusher {
        RegistryPusher::new(
            RegistryTarget {
                address: "127.0.0.1:31999".to_string(),
                push_username: "push".to_string(),
                push_password: "secret".to_string(),
                internal_address: None,
            },
            true,
            false,
        )
        .unwrap()
    }

    #[test]
    fn test_rewrite_keeps_repository_and_tag() {
        let original = ImageRef::parse("nginx:1.25").unwrap();
        let target = pusher().rewrite(&original).unwrap();
        assert_eq!(target.registry, "127.0.0.1:31999");
        assert_eq!(target.repository, "library/nginx");
        assert_eq!(target.tag.as_deref(), Some("1.25"));
    }

    #[test]
    fn test_rewrite_digest_pin_becomes_tag() {
        let original = ImageRef::parse("alpine@sha256:abc123").unwrap();
        let target = pusher().rewrite(&original).unwrap();
        assert_eq!(target.tag.as_deref(), Some("sha256-abc123"));
        assert!(target.digest.is_none());
    }

    #[test]
    fn test_rewrite_is_deterministic() {
        let original = ImageRef::parse("ghcr.io/org/app:2.0").unwrap();
        let a = pusher().rewrite(&original).unwrap();
        let b = pusher().rewrite(&original).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_missing_target_rejected() {
        let err = RegistryPusher::new(RegistryTarget::default(), true, false).unwrap_err();
        assert!(err.to_string().contains("No registry target"));
    }
}
