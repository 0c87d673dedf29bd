//! On-disk OCI image layout
//!
//! The staging format between image pull and registry push: an `oci-layout`
//! marker, an `index.json` of manifest descriptors, and content-addressed
//! blobs under `blobs/sha256/`. Concurrent savers append descriptors under
//! a mutex; the repair pass renames any blob whose filename no longer
//! matches the sha256 of its contents.

use anyhow::{anyhow, Context, Result};
use oci_spec::image::{
    Descriptor, DescriptorBuilder, ImageIndex, ImageIndexBuilder, ImageManifest, MediaType,
};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Path inside an OCI directory to the blobs
pub const BLOBDIR: &str = "blobs/sha256";

/// Annotation carrying the image's original reference
pub const REF_ANNOTATION: &str = "org.opencontainers.image.ref.name";

const OCI_LAYOUT_FILE: &str = "oci-layout";
const INDEX_JSON: &str = "index.json";

/// Completed blob metadata
#[derive(Debug, Clone)]
pub struct Blob {
    pub sha256: String,
    pub size: i64,
}

impl Blob {
    pub fn digest_id(&self) -> String {
        format!("sha256:{}", self.sha256)
    }

    pub fn descriptor(&self) -> DescriptorBuilder {
        DescriptorBuilder::default()
            .digest(self.digest_id())
            .size(self.size)
    }
}

/// An OCI image layout rooted at a directory
#[derive(Debug)]
pub struct OciLayout {
    root: PathBuf,
    index_lock: Mutex<()>,
}

impl OciLayout {
    /// Create (or reopen) a layout at `root`.
    pub fn create(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root.join(BLOBDIR))?;
        let marker = root.join(OCI_LAYOUT_FILE);
        if !marker.exists() {
            std::fs::write(&marker, b"{\"imageLayoutVersion\":\"1.0.0\"}\n")?;
        }
        let index_path = root.join(INDEX_JSON);
        if !index_path.exists() {
            let index = ImageIndexBuilder::default()
                .schema_version(2u32)
                .media_type(MediaType::ImageIndex)
                .manifests(Vec::<Descriptor>::new())
                .build()?;
            std::fs::write(&index_path, serde_json::to_vec_pretty(&index)?)?;
        }
        Ok(Self {
            root: root.to_path_buf(),
            index_lock: Mutex::new(()),
        })
    }

    /// Open an existing layout, failing when the marker file is absent.
    pub fn open(root: &Path) -> Result<Self> {
        if !root.join(OCI_LAYOUT_FILE).exists() {
            return Err(anyhow!("no OCI layout at {}", root.display()));
        }
        Ok(Self {
            root: root.to_path_buf(),
            index_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn blob_path(&self, sha256_hex: &str) -> PathBuf {
        self.root.join(BLOBDIR).join(sha256_hex)
    }

    /// A blob is present when the file exists with the declared size.
    pub fn has_blob(&self, sha256_hex: &str, size: i64) -> bool {
        self.blob_path(sha256_hex)
            .metadata()
            .map(|m| m.len() as i64 == size)
            .unwrap_or(false)
    }

    /// Write bytes as a content-addressed blob.
    pub fn write_blob(&self, bytes: &[u8]) -> Result<Blob> {
        let sha256 = hex::encode(Sha256::digest(bytes));
        let path = self.blob_path(&sha256);
        if !path.exists() {
            let tmp = path.with_extension("tmp");
            std::fs::write(&tmp, bytes)?;
            std::fs::rename(&tmp, &path)?;
        }
        Ok(Blob {
            sha256,
            size: bytes.len() as i64,
        })
    }

    /// Move an already-downloaded file into the blob store, verifying its
    /// digest when one is expected.
    pub fn import_blob_file(&self, src: &Path, expected_sha256: Option<&str>) -> Result<Blob> {
        let sha256 = crate::infrastructure::archive::sha256_file(src)?;
        if let Some(expected) = expected_sha256 {
            if sha256 != expected {
                return Err(crate::error::ImageError::DigestMismatch {
                    digest: format!("sha256:{expected}"),
                    actual: format!("sha256:{sha256}"),
                }
                .into());
            }
        }
        let size = src.metadata()?.len() as i64;
        let path = self.blob_path(&sha256);
        if path.exists() {
            std::fs::remove_file(src)?;
        } else if std::fs::rename(src, &path).is_err() {
            std::fs::copy(src, &path)?;
            std::fs::remove_file(src)?;
        }
        Ok(Blob { sha256, size })
    }

    /// Read the layout index.
    pub fn index(&self) -> Result<ImageIndex> {
        let path = self.root.join(INDEX_JSON);
        let bytes = std::fs::read(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Append a manifest descriptor to the index, replacing any earlier
    /// entry for the same original reference. Serialized by a mutex since
    /// concurrent savers all funnel through here.
    pub fn append_manifest_descriptor(&self, descriptor: Descriptor) -> Result<()> {
        let _guard = self.index_lock.lock().unwrap_or_else(|e| e.into_inner());
        let index = self.index()?;
        let reference = annotation(&descriptor, REF_ANNOTATION);
        let mut manifests: Vec<Descriptor> = index
            .manifests()
            .iter()
            .filter(|existing| {
                reference.is_none() || annotation(existing, REF_ANNOTATION) != reference
            })
            .cloned()
            .collect();
        manifests.push(descriptor);
        let index = ImageIndexBuilder::default()
            .schema_version(2u32)
            .media_type(MediaType::ImageIndex)
            .manifests(manifests)
            .build()?;
        std::fs::write(
            self.root.join(INDEX_JSON),
            serde_json::to_vec_pretty(&index)?,
        )?;
        Ok(())
    }

    /// Load the image manifest a descriptor points at.
    pub fn manifest(&self, descriptor: &Descriptor) -> Result<ImageManifest> {
        let hex = digest_hex(descriptor.digest());
        let bytes = std::fs::read(self.blob_path(hex))
            .with_context(|| format!("Missing manifest blob {}", descriptor.digest()))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn blob_bytes(&self, digest: &str) -> Result<Vec<u8>> {
        let path = self.blob_path(digest_hex(digest));
        std::fs::read(&path).with_context(|| format!("Missing blob {digest}"))
    }

    /// Walk `blobs/sha256/` and rename every file whose name is not the
    /// sha256 of its contents. Returns `(old, new)` pairs.
    pub fn repair_blobs(&self) -> Result<Vec<(String, String)>> {
        let mut renamed = Vec::new();
        let blobdir = self.root.join(BLOBDIR);
        for entry in std::fs::read_dir(&blobdir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            let actual = crate::infrastructure::archive::sha256_file(&entry.path())?;
            if name == actual {
                continue;
            }
            let target = blobdir.join(&actual);
            warn!(blob = %name, actual = %actual, "repairing mis-hashed blob");
            if target.exists() {
                std::fs::remove_file(entry.path())?;
            } else {
                std::fs::rename(entry.path(), &target)?;
            }
            renamed.push((name, actual));
        }
        debug!(repaired = renamed.len(), "blob repair pass complete");
        Ok(renamed)
    }

    /// Sum of manifest + config + layer sizes for one image, for progress
    /// accounting.
    pub fn image_size(manifest: &ImageManifest, manifest_len: i64) -> i64 {
        manifest_len
            + manifest.config().size()
            + manifest.layers().iter().map(|l| l.size()).sum::<i64>()
    }

    /// Declared layer sizes by digest hex, used for cache pruning.
    pub fn declared_layer_sizes(manifest: &ImageManifest) -> HashMap<String, i64> {
        manifest
            .layers()
            .iter()
            .map(|l| (digest_hex(l.digest()).to_string(), l.size()))
            .collect()
    }
}

/// Strip the `sha256:` algorithm prefix from a digest.
pub fn digest_hex(digest: &str) -> &str {
    digest.strip_prefix("sha256:").unwrap_or(digest)
}

/// Read one annotation off a descriptor.
pub fn annotation(descriptor: &Descriptor, key: &str) -> Option<String> {
    descriptor
        .annotations()
        .as_ref()
        .and_then(|a| a.get(key))
        .cloned()
}

/// True for media types that represent image layers (cacheable payload).
pub fn is_image_layer(media_type: &MediaType) -> bool {
    matches!(
        media_type,
        MediaType::ImageLayer
            | MediaType::ImageLayerGzip
            | MediaType::ImageLayerZstd
            | MediaType::ImageLayerNonDistributable
            | MediaType::ImageLayerNonDistributableGzip
            | MediaType::ImageLayerNonDistributableZstd
    ) || matches!(
        media_type,
        MediaType::Other(other) if other == "application/vnd.docker.image.rootfs.diff.tar.gzip"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    #[test]
    fn test_create_writes_marker_and_empty_index() {
        let dir = tempfile::tempdir().unwrap();
        let layout = OciLayout::create(dir.path()).unwrap();
        assert!(dir.path().join("oci-layout").exists());
        assert!(layout.index().unwrap().manifests().is_empty());
    }

    #[test]
    fn test_blob_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let layout = OciLayout::create(dir.path()).unwrap();
        let blob = layout.write_blob(b"layer-bytes").unwrap();
        assert!(layout.has_blob(&blob.sha256, blob.size));
        assert!(!layout.has_blob(&blob.sha256, blob.size + 1));
        assert_eq!(layout.blob_bytes(&blob.digest_id()).unwrap(), b"layer-bytes");
    }

    #[test]
    fn test_append_replaces_same_reference() {
        let dir = tempfile::tempdir().unwrap();
        let layout = OciLayout::create(dir.path()).unwrap();
        for content in [b"v1".as_slice(), b"v2".as_slice()] {
            let blob = layout.write_blob(content).unwrap();
            let descriptor = DescriptorBuilder::default()
                .media_type(MediaType::ImageManifest)
                .digest(blob.digest_id())
                .size(blob.size)
                .annotations(Map::from([(
                    REF_ANNOTATION.to_string(),
                    "docker.io/library/nginx:1.25".to_string(),
                )]))
                .build()
                .unwrap();
            layout.append_manifest_descriptor(descriptor).unwrap();
        }
        let index = layout.index().unwrap();
        assert_eq!(index.manifests().len(), 1);
        assert_eq!(
            digest_hex(index.manifests()[0].digest()),
            hex::encode(Sha256::digest(b"v2"))
        );
    }

    #[test]
    fn test_repair_renames_mismatched_blob() {
        let dir = tempfile::tempdir().unwrap();
        let layout = OciLayout::create(dir.path()).unwrap();
        let bogus = layout.blob_path(&"0".repeat(64));
        std::fs::write(&bogus, b"actual contents").unwrap();
        let renamed = layout.repair_blobs().unwrap();
        assert_eq!(renamed.len(), 1);
        let expected = hex::encode(Sha256::digest(b"actual contents"));
        assert_eq!(renamed[0].1, expected);
        assert!(layout.blob_path(&expected).exists());
        assert!(!bogus.exists());
    }

    #[test]
    fn test_repair_leaves_valid_blobs() {
        let dir = tempfile::tempdir().unwrap();
        let layout = OciLayout::create(dir.path()).unwrap();
        layout.write_blob(b"good").unwrap();
        assert!(layout.repair_blobs().unwrap().is_empty());
    }

    #[test]
    fn test_digest_hex() {
        assert_eq!(digest_hex("sha256:abc"), "abc");
        assert_eq!(digest_hex("abc"), "abc");
    }

    #[test]
    fn test_docker_layer_media_type_is_cacheable() {
        assert!(is_image_layer(&MediaType::ImageLayerGzip));
        assert!(is_image_layer(&MediaType::Other(
            "application/vnd.docker.image.rootfs.diff.tar.gzip".to_string()
        )));
        assert!(!is_image_layer(&MediaType::ImageConfig));
    }
}
