//! Image subsystem: pull side
//!
//! Pulls component images from mixed sources (remote registry, OCI
//! tarball, local daemon) into the staging OCI layout. Two bounded phases:
//! info-fetch resolves every reference in parallel, then the save phase
//! writes blobs concurrently with a sequential fallback. Completed images
//! drop out of the retry set, so partial progress is durable.

pub mod cache;
pub mod client;
pub mod layout;
pub mod tarball;

pub use cache::LayerCache;
pub use client::RegistryHttpClient;
pub use layout::OciLayout;

use anyhow::Result;
use oci_spec::image::{Descriptor, ImageIndex, ImageManifest, MediaType};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::ImageError;
use self::layout::{digest_hex, is_image_layer, REF_ANNOTATION};

/// A parsed image reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    /// The reference as written in the bundle
    pub original: String,
    pub registry: String,
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl ImageRef {
    pub fn parse(reference: &str) -> Result<Self> {
        let original = reference.to_string();
        let (rest, digest) = match reference.split_once('@') {
            Some((r, d)) => (r, Some(d.to_string())),
            None => (reference, None),
        };
        // A tag colon must come after the final path separator.
        let (name, tag) = match rest.rfind(':') {
            Some(idx) if !rest[idx..].contains('/') => {
                (&rest[..idx], Some(rest[idx + 1..].to_string()))
            }
            _ => (rest, None),
        };
        if name.is_empty() {
            return Err(ImageError::InvalidReference {
                reference: original,
            }
            .into());
        }
        let (registry, repository) = match name.split_once('/') {
            Some((host, path))
                if host.contains('.') || host.contains(':') || host == "localhost" =>
            {
                (host.to_string(), path.to_string())
            }
            Some(_) => ("docker.io".to_string(), name.to_string()),
            None => ("docker.io".to_string(), format!("library/{name}")),
        };
        if repository.is_empty() {
            return Err(ImageError::InvalidReference {
                reference: original,
            }
            .into());
        }
        Ok(Self {
            original,
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// What to ask the registry for: digest wins, then tag, then `latest`.
    pub fn manifest_reference(&self) -> String {
        self.digest
            .clone()
            .or_else(|| self.tag.clone())
            .unwrap_or_else(|| "latest".to_string())
    }

    /// Filesystem-safe rendition of the reference.
    pub fn safe_name(&self) -> String {
        self.original
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
            .collect()
    }

    /// Apply registry-prefix overrides (`old-prefix -> new-prefix`) and
    /// reparse when one matches.
    pub fn with_overrides(self, overrides: &HashMap<String, String>) -> Result<Self> {
        for (prefix, replacement) in overrides {
            if let Some(rest) = self.original.strip_prefix(prefix.as_str()) {
                let rewritten = format!("{replacement}{rest}");
                debug!(from = %self.original, to = %rewritten, "registry override applied");
                return Self::parse(&rewritten);
            }
        }
        Ok(self)
    }
}

/// Configuration for one pull invocation
pub struct PullConfig {
    /// Destination layout directory
    pub dest: PathBuf,
    /// Scratch space for daemon exports and partial downloads
    pub staging: PathBuf,
    pub cache: Option<LayerCache>,
    pub registry_overrides: HashMap<String, String>,
    /// Platform architecture used to disambiguate indexes
    pub arch: String,
    pub workers: usize,
    pub plain_http: bool,
    pub insecure_skip_tls_verify: bool,
}

/// Outcome of a pull: appended descriptors plus size accounting
#[derive(Debug)]
pub struct PullReport {
    pub descriptors: Vec<Descriptor>,
    pub total_bytes: i64,
}

#[derive(Debug, Clone)]
enum ResolvedSource {
    Remote(client::FetchedManifest),
    Tarball(PathBuf),
    Daemon,
}

#[derive(Debug, Clone)]
struct ResolvedImage {
    image: ImageRef,
    source: ResolvedSource,
    size: i64,
}

/// Pull `refs` into the layout at `config.dest`.
pub async fn pull_images(refs: &[String], config: &PullConfig) -> Result<PullReport> {
    let layout = Arc::new(OciLayout::create(&config.dest)?);
    let client = Arc::new(RegistryHttpClient::new(
        config.plain_http,
        config.insecure_skip_tls_verify,
    )?);

    // Phase 1: info-fetch. Resolve every descriptor before any blob lands
    // on disk so index rejection aborts a clean tree.
    let semaphore = Arc::new(Semaphore::new(config.workers));
    let mut tasks = JoinSet::new();
    for (position, reference) in refs.iter().enumerate() {
        let image = ImageRef::parse(reference)?.with_overrides(&config.registry_overrides)?;
        let client = client.clone();
        let semaphore = semaphore.clone();
        let arch = config.arch.clone();
        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            let resolved = resolve(&client, image, &arch).await;
            (position, resolved)
        });
    }
    let mut resolved: Vec<Option<ResolvedImage>> = vec![None; refs.len()];
    while let Some(joined) = tasks.join_next().await {
        let (position, result) = joined?;
        resolved[position] = Some(result?);
    }
    let resolved: Vec<ResolvedImage> = resolved.into_iter().flatten().collect();
    let total_bytes: i64 = resolved.iter().map(|r| r.size).sum();
    info!(
        images = resolved.len(),
        total_mb = total_bytes / (1024 * 1024),
        "image descriptors resolved"
    );

    // Phase 2: save, concurrent first with a sequential fallback; both
    // strategies retry twice and completed images leave the retry set.
    let mut remaining = resolved;
    let mut descriptors = Vec::new();
    for attempt in 1..=2u32 {
        if remaining.is_empty() {
            break;
        }
        let (done, failed) =
            save_concurrent(&client, &layout, config, &remaining).await;
        descriptors.extend(done);
        if failed.is_empty() {
            remaining = Vec::new();
            break;
        }
        warn!(
            attempt,
            failed = failed.len(),
            "concurrent save attempt incomplete"
        );
        prune_cache(config.cache.as_ref(), &failed)?;
        remaining = failed;
    }
    if !remaining.is_empty() {
        warn!(images = remaining.len(), "falling back to sequential save");
        for item in remaining {
            let mut last_error = None;
            let mut saved = None;
            for _ in 1..=2u32 {
                match save_image(&client, &layout, config, &item).await {
                    Ok(descriptor) => {
                        saved = Some(descriptor);
                        break;
                    }
                    Err(e) => {
                        prune_cache(config.cache.as_ref(), std::slice::from_ref(&item))?;
                        last_error = Some(e);
                    }
                }
            }
            match saved {
                Some(descriptor) => descriptors.push(descriptor),
                None => {
                    return Err(ImageError::PullFailed {
                        reference: item.image.original.clone(),
                        attempts: 4,
                        message: last_error
                            .map(|e| format!("{e:#}"))
                            .unwrap_or_default(),
                    }
                    .into())
                }
            }
        }
    }

    let repaired = layout.repair_blobs()?;
    if !repaired.is_empty() {
        info!(repaired = repaired.len(), "renamed mis-hashed blobs");
    }
    Ok(PullReport {
        descriptors,
        total_bytes,
    })
}

/// Resolve one reference to a single-platform source.
async fn resolve(
    client: &RegistryHttpClient,
    image: ImageRef,
    arch: &str,
) -> Result<ResolvedImage> {
    if tarball::is_tarball_ref(&image.original) {
        let path = PathBuf::from(&image.original);
        let size = path.metadata().map(|m| m.len() as i64).unwrap_or(0);
        return Ok(ResolvedImage {
            image,
            source: ResolvedSource::Tarball(path),
            size,
        });
    }

    let fetched = match client.get_manifest(&image, &image.manifest_reference()).await {
        Ok(fetched) => fetched,
        Err(e) => {
            warn!(image = %image.original, error = %e, "remote resolve failed");
            return Ok(ResolvedImage {
                image,
                source: ResolvedSource::Daemon,
                size: 0,
            });
        }
    };

    let fetched = if fetched.is_index() {
        let index: ImageIndex = serde_json::from_slice(&fetched.bytes)?;
        if image.digest.is_some() {
            // A digest pin leaves no platform to select; enumerate what the
            // index offers so the caller can re-pin.
            let available = index
                .manifests()
                .iter()
                .map(|d| {
                    let platform = d
                        .platform()
                        .as_ref()
                        .map(|p| format!("{}/{}", p.os(), p.architecture()))
                        .unwrap_or_else(|| "unknown".to_string());
                    format!("{}@{} ({platform})", image.repository, d.digest())
                })
                .collect();
            return Err(ImageError::IndexRejected {
                reference: image.original.clone(),
                available,
            }
            .into());
        }
        let platform_digest = index
            .manifests()
            .iter()
            .find(|d| {
                d.platform()
                    .as_ref()
                    .map(|p| {
                        p.architecture().to_string() == arch && p.os().to_string() == "linux"
                    })
                    .unwrap_or(false)
            })
            .map(|d| d.digest().clone())
            .ok_or_else(|| ImageError::PlatformNotFound {
                reference: image.original.clone(),
                platform: format!("linux/{arch}"),
            })?;
        client.get_manifest(&image, &platform_digest).await?
    } else {
        fetched
    };

    let manifest: ImageManifest = serde_json::from_slice(&fetched.bytes)?;
    let size = OciLayout::image_size(&manifest, fetched.bytes.len() as i64);
    Ok(ResolvedImage {
        image,
        source: ResolvedSource::Remote(fetched),
        size,
    })
}

/// One bounded concurrent save pass; returns (saved, failed).
async fn save_concurrent(
    client: &Arc<RegistryHttpClient>,
    layout: &Arc<OciLayout>,
    config: &PullConfig,
    items: &[ResolvedImage],
) -> (Vec<Descriptor>, Vec<ResolvedImage>) {
    let semaphore = Arc::new(Semaphore::new(config.workers));
    let mut tasks = JoinSet::new();
    for item in items.iter().cloned() {
        let client = client.clone();
        let layout = layout.clone();
        let semaphore = semaphore.clone();
        let cache = config.cache.clone();
        let staging = config.staging.clone();
        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            let result = save_image_inner(&client, &layout, cache.as_ref(), &staging, &item).await;
            (item, result)
        });
    }
    let mut saved = Vec::new();
    let mut failed = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((_, Ok(descriptor))) => saved.push(descriptor),
            Ok((item, Err(e))) => {
                warn!(image = %item.image.original, error = %format!("{e:#}"), "image save failed");
                failed.push(item);
            }
            Err(e) => warn!(error = %e, "save worker panicked"),
        }
    }
    (saved, failed)
}

async fn save_image(
    client: &Arc<RegistryHttpClient>,
    layout: &Arc<OciLayout>,
    config: &PullConfig,
    item: &ResolvedImage,
) -> Result<Descriptor> {
    save_image_inner(client, layout, config.cache.as_ref(), &config.staging, item).await
}

/// Write one resolved image into the layout.
async fn save_image_inner(
    client: &RegistryHttpClient,
    layout: &OciLayout,
    cache: Option<&LayerCache>,
    staging: &Path,
    item: &ResolvedImage,
) -> Result<Descriptor> {
    match &item.source {
        ResolvedSource::Tarball(path) => tarball::load_into_layout(path, layout, &item.image),
        ResolvedSource::Daemon => tarball::load_from_daemon(&item.image, layout, staging).await,
        ResolvedSource::Remote(fetched) => {
            let manifest: ImageManifest = serde_json::from_slice(&fetched.bytes)?;
            // Non-image layers bypass the cache so it only ever holds
            // reusable image content.
            let cacheable = manifest.layers().iter().all(|l| is_image_layer(l.media_type()));
            let cache = if cacheable { cache } else { None };

            for blob in manifest
                .layers()
                .iter()
                .chain(std::iter::once(manifest.config()))
            {
                let hex = digest_hex(blob.digest()).to_string();
                if layout.has_blob(&hex, blob.size()) {
                    continue;
                }
                // Unique scratch path: two images can share a layer and
                // save concurrently.
                let scratch =
                    staging.join(format!("blob-{hex}-{}", uuid::Uuid::new_v4().simple()));
                let is_layer = is_image_layer(blob.media_type());
                let from_cache = match cache {
                    Some(cache) if is_layer => cache.fetch_into(&hex, blob.size(), &scratch)?,
                    _ => false,
                };
                if !from_cache {
                    client
                        .download_blob(&item.image, blob.digest(), &scratch)
                        .await?;
                    if let (Some(cache), true) = (cache, is_layer) {
                        cache.store(&hex, &scratch)?;
                    }
                }
                layout.import_blob_file(&scratch, Some(&hex))?;
            }

            let manifest_blob = layout.write_blob(&fetched.bytes)?;
            if digest_hex(&fetched.digest) != manifest_blob.sha256 {
                return Err(ImageError::DigestMismatch {
                    digest: fetched.digest.clone(),
                    actual: manifest_blob.digest_id(),
                }
                .into());
            }
            let descriptor = manifest_blob
                .descriptor()
                .media_type(media_type_from(&fetched.content_type))
                .annotations(HashMap::from([(
                    REF_ANNOTATION.to_string(),
                    item.image.original.clone(),
                )]))
                .build()?;
            layout.append_manifest_descriptor(descriptor.clone())?;
            debug!(image = %item.image.original, "image saved to layout");
            Ok(descriptor)
        }
    }
}

fn prune_cache(cache: Option<&LayerCache>, failed: &[ResolvedImage]) -> Result<()> {
    let Some(cache) = cache else {
        return Ok(());
    };
    let mut declared = HashMap::new();
    for item in failed {
        if let ResolvedSource::Remote(fetched) = &item.source {
            let manifest: ImageManifest = serde_json::from_slice(&fetched.bytes)?;
            declared.extend(OciLayout::declared_layer_sizes(&manifest));
        }
    }
    cache.prune_mismatched(&declared)?;
    Ok(())
}

/// Map an HTTP content type onto the typed media-type enum.
pub fn media_type_from(content_type: &str) -> MediaType {
    match content_type {
        "application/vnd.oci.image.manifest.v1+json" => MediaType::ImageManifest,
        "application/vnd.oci.image.index.v1+json" => MediaType::ImageIndex,
        other => MediaType::Other(other.to_string()),
    }
}
