//! OCI tarball sources
//!
//! Loads images from OCI-layout tarballs (`.tar`, `.tar.gz`, `.tgz`) and
//! from the local container daemon via `docker save` into a scoped temp
//! file. Both paths converge on the same layout-merge code; archives
//! without an `index.json` are rejected.

use anyhow::{Context, Result};
use oci_spec::image::{Descriptor, DescriptorBuilder, ImageIndex};
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use tokio::process::Command;
use tracing::{debug, info};

use super::layout::{OciLayout, BLOBDIR, REF_ANNOTATION};
use super::ImageRef;
use crate::error::ImageError;
use crate::tools::{get_tool_path, tools};

/// Merge an OCI-layout tarball into `layout` and return the manifest
/// descriptor annotated with the image's original reference.
pub fn load_into_layout(
    tar_path: &Path,
    layout: &OciLayout,
    image: &ImageRef,
) -> Result<Descriptor> {
    let staging = tempfile::tempdir_in(layout.root())?;
    extract_archive(tar_path, staging.path())?;

    let index_path = staging.path().join("index.json");
    if !index_path.exists() {
        return Err(ImageError::NotOciArchive {
            path: tar_path.display().to_string(),
        }
        .into());
    }
    let index: ImageIndex = serde_json::from_slice(&std::fs::read(&index_path)?)?;
    let source = index
        .manifests()
        .iter()
        .find(|d| {
            super::layout::annotation(d, REF_ANNOTATION)
                .map(|r| r == image.original || r.ends_with(&image.manifest_reference()))
                .unwrap_or(false)
        })
        .or_else(|| index.manifests().first())
        .ok_or_else(|| ImageError::NotOciArchive {
            path: tar_path.display().to_string(),
        })?
        .clone();

    // Copy blobs across; filenames are re-verified by the repair pass.
    let blob_src = staging.path().join(BLOBDIR);
    if blob_src.exists() {
        for entry in std::fs::read_dir(&blob_src)? {
            let entry = entry?;
            let target = layout.root().join(BLOBDIR).join(entry.file_name());
            if !target.exists() {
                std::fs::copy(entry.path(), &target)?;
            }
        }
    }
    debug!(image = %image.original, archive = %tar_path.display(), "loaded OCI tarball");

    let descriptor = DescriptorBuilder::default()
        .media_type(source.media_type().clone())
        .digest(source.digest().clone())
        .size(source.size())
        .annotations(HashMap::from([(
            REF_ANNOTATION.to_string(),
            image.original.clone(),
        )]))
        .build()?;
    layout.append_manifest_descriptor(descriptor.clone())?;
    Ok(descriptor)
}

/// Export an image from the local daemon into a scoped temp file and load
/// it. `docker save` writes straight to disk, so large images never pass
/// through memory.
pub async fn load_from_daemon(
    image: &ImageRef,
    layout: &OciLayout,
    staging: &Path,
) -> Result<Descriptor> {
    info!(image = %image.original, "falling back to the local container daemon");
    let tar_path = staging.join(format!("daemon-{}.tar", image.safe_name()));
    let docker = get_tool_path(tools::DOCKER);
    let output = Command::new(&docker)
        .args([
            "save",
            "-o",
            &tar_path.display().to_string(),
            &image.original,
        ])
        .output()
        .await
        .with_context(|| format!("Failed to run {docker} save"))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ImageError::PullFailed {
            reference: image.original.clone(),
            attempts: 1,
            message: format!("docker save: {}", stderr.trim()),
        }
        .into());
    }
    let descriptor = load_into_layout(&tar_path, layout, image)?;
    let _ = std::fs::remove_file(&tar_path);
    Ok(descriptor)
}

fn extract_archive(path: &Path, dest: &Path) -> Result<()> {
    let name = path.to_string_lossy();
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let reader: Box<dyn Read> = if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        Box::new(flate2::read::GzDecoder::new(file))
    } else {
        Box::new(file)
    };
    tar::Archive::new(reader)
        .unpack(dest)
        .with_context(|| format!("Failed to extract {}", path.display()))?;
    Ok(())
}

/// True when a reference points at an image archive on disk.
pub fn is_tarball_ref(reference: &str) -> bool {
    reference.ends_with(".tar") || reference.ends_with(".tar.gz") || reference.ends_with(".tgz")
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::Digest as _;

    fn make_oci_tarball(dir: &Path, reference: &str) -> std::path::PathBuf {
        let tree = dir.join("tree");
        std::fs::create_dir_all(tree.join(BLOBDIR)).unwrap();
        std::fs::write(tree.join("oci-layout"), b"{\"imageLayoutVersion\":\"1.0.0\"}").unwrap();

        let manifest = b"{\"schemaVersion\":2,\"config\":{\"mediaType\":\"application/vnd.oci.image.config.v1+json\",\"digest\":\"sha256:00\",\"size\":2},\"layers\":[]}";
        let digest = hex::encode(sha2::Sha256::digest(manifest));
        std::fs::write(tree.join(BLOBDIR).join(&digest), manifest).unwrap();

        let index = serde_json::json!({
            "schemaVersion": 2,
            "manifests": [{
                "mediaType": "application/vnd.oci.image.manifest.v1+json",
                "digest": format!("sha256:{digest}"),
                "size": manifest.len(),
                "annotations": { REF_ANNOTATION: reference }
            }]
        });
        std::fs::write(tree.join("index.json"), serde_json::to_vec(&index).unwrap()).unwrap();

        let tar_path = dir.join("image.tar");
        let file = std::fs::File::create(&tar_path).unwrap();
        let mut builder = tar::Builder::new(file);
        builder.append_dir_all(".", &tree).unwrap();
        builder.finish().unwrap();
        tar_path
    }

    #[test]
    fn test_load_oci_tarball() {
        let dir = tempfile::tempdir().unwrap();
        let tarball = make_oci_tarball(dir.path(), "docker.io/library/busybox:1.36");
        let layout_dir = dir.path().join("layout");
        let layout = OciLayout::create(&layout_dir).unwrap();
        let image = ImageRef::parse("busybox:1.36").unwrap();
        let descriptor = load_into_layout(&tarball, &layout, &image).unwrap();
        assert_eq!(
            super::super::layout::annotation(&descriptor, REF_ANNOTATION).unwrap(),
            "busybox:1.36"
        );
        assert_eq!(layout.index().unwrap().manifests().len(), 1);
        assert!(layout
            .blob_path(super::super::layout::digest_hex(descriptor.digest()))
            .exists());
    }

    #[test]
    fn test_non_oci_archive_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let tree = dir.path().join("tree");
        std::fs::create_dir_all(&tree).unwrap();
        std::fs::write(tree.join("manifest.json"), b"[]").unwrap();
        let tar_path = dir.path().join("legacy.tar");
        let file = std::fs::File::create(&tar_path).unwrap();
        let mut builder = tar::Builder::new(file);
        builder.append_dir_all(".", &tree).unwrap();
        builder.finish().unwrap();

        let layout_dir = dir.path().join("layout");
        let layout = OciLayout::create(&layout_dir).unwrap();
        let image = ImageRef::parse("legacy:1").unwrap();
        let err = load_into_layout(&tar_path, &layout, &image).unwrap_err();
        assert!(err.to_string().contains("no OCI index"));
    }

    #[test]
    fn test_is_tarball_ref() {
        assert!(is_tarball_ref("images/app.tar"));
        assert!(is_tarball_ref("images/app.tar.gz"));
        assert!(is_tarball_ref("images/app.tgz"));
        assert!(!is_tarball_ref("nginx:1.25"));
    }
}
