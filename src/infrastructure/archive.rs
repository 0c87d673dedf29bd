//! Bundle archive loading
//!
//! Locates the archive (filesystem path or OCI reference), reassembles
//! multipart archives, extracts into the scoped staging directory, verifies
//! the checksum manifest and optional cosign signature, and parses the
//! bundle descriptor. Every failure carries the offending path or name.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::DeployOptions;
use crate::domain::bundle::Bundle;
use crate::domain::{BUNDLE_YAML, CHECKSUMS_TXT, COMPONENTS_DIR, SIGNATURE_FILE};
use crate::error::ArchiveError;
use crate::infrastructure::oci::client::RegistryHttpClient;
use crate::tools::{get_tool_path, tools};

/// Header part of a multipart archive (`*.part000`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartHeader {
    /// Number of data parts (part001..partNNN)
    pub count: usize,
    /// Total reassembled size in bytes
    pub bytes: u64,
    /// sha256 of the reassembled file
    pub sha256_sum: String,
}

/// An extracted, verified bundle
#[derive(Debug)]
pub struct LoadedBundle {
    pub bundle: Bundle,
    /// Extraction root inside the scoped staging directory
    pub dir: PathBuf,
}

impl LoadedBundle {
    /// Directory holding one component's extracted payload
    pub fn component_dir(&self, name: &str) -> PathBuf {
        self.dir.join(COMPONENTS_DIR).join(name)
    }
}

/// Load, verify and parse a bundle archive into `staging`.
pub async fn load(opts: &DeployOptions, staging: &Path) -> Result<LoadedBundle> {
    let archive = locate(opts, staging).await?;

    if let Some(expected) = &opts.shasum {
        let actual = sha256_file(&archive)?;
        if &actual != expected {
            return Err(ArchiveError::ChecksumMismatch {
                path: archive.display().to_string(),
                expected: expected.clone(),
                actual,
            }
            .into());
        }
    }

    let archive = if is_multipart(&archive) {
        reassemble(&archive, staging)?
    } else {
        archive
    };

    let dir = staging.join("extracted");
    std::fs::create_dir_all(&dir)?;
    extract(&archive, &dir)?;

    verify_checksums(&dir)?;
    verify_signature(&dir, opts).await?;

    let descriptor = dir.join(BUNDLE_YAML);
    let yaml = std::fs::read_to_string(&descriptor)
        .with_context(|| format!("Failed to read {}", descriptor.display()))?;
    let bundle = Bundle::parse(&yaml)?;

    extract_component_tars(&dir)?;

    info!(
        bundle = %bundle.metadata.name,
        components = bundle.components.len(),
        "loaded bundle archive"
    );
    Ok(LoadedBundle { bundle, dir })
}

/// Resolve the source locator to a local archive file.
async fn locate(opts: &DeployOptions, staging: &Path) -> Result<PathBuf> {
    if let Some(reference) = opts.source.strip_prefix("oci://") {
        let dest = staging.join("remote");
        std::fs::create_dir_all(&dest)?;
        info!(reference, "pulling bundle artifact");
        let client = RegistryHttpClient::new(opts.plain_http, opts.insecure_skip_tls_verify)?;
        let files = client.pull_artifact(reference, &dest).await?;
        // The artifact carries exactly one archive layer (plus optional
        // signature/sbom layers); pick it by extension.
        files
            .into_iter()
            .find(|f| {
                let name = f.file_name().and_then(|n| n.to_str()).unwrap_or_default();
                name.ends_with(".tar.zst") || name.ends_with(".tar") || is_multipart(f)
            })
            .ok_or_else(|| {
                ArchiveError::Malformed {
                    path: format!("oci://{reference}"),
                    message: "artifact contains no bundle archive layer".to_string(),
                }
                .into()
            })
    } else {
        let path = PathBuf::from(&opts.source);
        if !path.exists() {
            return Err(ArchiveError::NotFound {
                path: path.display().to_string(),
            }
            .into());
        }
        Ok(path)
    }
}

fn is_multipart(path: &Path) -> bool {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    if let Some(idx) = name.rfind(".part") {
        let suffix = &name[idx + 5..];
        return suffix.len() == 3 && suffix.chars().all(|c| c.is_ascii_digit());
    }
    false
}

/// Concatenate `foo.part001..partNNN` as declared by the `part000` header.
fn reassemble(part: &Path, staging: &Path) -> Result<PathBuf> {
    let name = part
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    let stem = &name[..name.rfind(".part").unwrap_or(name.len())];
    let parent = part.parent().unwrap_or_else(|| Path::new("."));

    let header_path = parent.join(format!("{stem}.part000"));
    let header: PartHeader = serde_json::from_slice(
        &std::fs::read(&header_path).map_err(|_| ArchiveError::MissingPart {
            name: stem.to_string(),
            index: 0,
        })?,
    )
    .map_err(|e| ArchiveError::Malformed {
        path: header_path.display().to_string(),
        message: e.to_string(),
    })?;

    let found = (1..=header.count)
        .filter(|i| parent.join(format!("{stem}.part{i:03}")).exists())
        .count();
    if found != header.count {
        return Err(ArchiveError::PartCountMismatch {
            name: stem.to_string(),
            declared: header.count,
            found,
        }
        .into());
    }

    info!(name = stem, parts = header.count, "reassembling multipart archive");
    let out_path = staging.join(stem);
    let mut out = std::fs::File::create(&out_path)?;
    let mut hasher = Sha256::new();
    for index in 1..=header.count {
        let part_path = parent.join(format!("{stem}.part{index:03}"));
        let mut part_file =
            std::fs::File::open(&part_path).map_err(|_| ArchiveError::MissingPart {
                name: stem.to_string(),
                index,
            })?;
        let mut buf = Vec::new();
        part_file.read_to_end(&mut buf)?;
        hasher.update(&buf);
        std::io::Write::write_all(&mut out, &buf)?;
    }
    let actual = hex::encode(hasher.finalize());
    if actual != header.sha256_sum {
        return Err(ArchiveError::ChecksumMismatch {
            path: out_path.display().to_string(),
            expected: header.sha256_sum,
            actual,
        }
        .into());
    }
    Ok(out_path)
}

/// Untar the archive, sniffing zstd/gzip compression from magic bytes.
fn extract(archive: &Path, dest: &Path) -> Result<()> {
    let mut magic = [0u8; 4];
    {
        let mut f = std::fs::File::open(archive)
            .with_context(|| format!("Failed to open {}", archive.display()))?;
        let n = f.read(&mut magic)?;
        if n < 4 {
            return Err(ArchiveError::Malformed {
                path: archive.display().to_string(),
                message: "archive shorter than 4 bytes".to_string(),
            }
            .into());
        }
    }
    let file = std::fs::File::open(archive)?;
    let reader: Box<dyn Read> = if magic == [0x28, 0xb5, 0x2f, 0xfd] {
        Box::new(zstd::Decoder::new(file)?)
    } else if magic[0] == 0x1f && magic[1] == 0x8b {
        Box::new(flate2::read::GzDecoder::new(file))
    } else {
        Box::new(file)
    };
    debug!(archive = %archive.display(), dest = %dest.display(), "extracting");
    tar::Archive::new(reader)
        .unpack(dest)
        .map_err(|e| ArchiveError::Malformed {
            path: archive.display().to_string(),
            message: e.to_string(),
        })?;
    Ok(())
}

/// Verify every file listed in `checksums.txt` (`<hex>  <relative-path>`).
fn verify_checksums(dir: &Path) -> Result<()> {
    let manifest = dir.join(CHECKSUMS_TXT);
    let content = std::fs::read_to_string(&manifest)
        .with_context(|| format!("Failed to read {}", manifest.display()))?;
    let mut verified = 0usize;
    for line in content.lines().filter(|l| !l.trim().is_empty()) {
        let Some((expected, rel)) = line.split_once("  ") else {
            return Err(ArchiveError::Malformed {
                path: manifest.display().to_string(),
                message: format!("bad checksum line: {line}"),
            }
            .into());
        };
        let path = dir.join(rel);
        if !path.exists() {
            return Err(ArchiveError::MissingFile {
                path: rel.to_string(),
            }
            .into());
        }
        let actual = sha256_file(&path)?;
        if actual != expected {
            return Err(ArchiveError::ChecksumMismatch {
                path: rel.to_string(),
                expected: expected.to_string(),
                actual,
            }
            .into());
        }
        verified += 1;
    }
    debug!(verified, "checksum manifest verified");
    Ok(())
}

/// Verify the cosign signature over `checksums.txt` when present.
async fn verify_signature(dir: &Path, opts: &DeployOptions) -> Result<()> {
    let signature = dir.join(SIGNATURE_FILE);
    if !signature.exists() {
        if opts.key.is_some() {
            warn!("--key provided but the bundle is unsigned; nothing to verify");
        }
        return Ok(());
    }
    let Some(key) = &opts.key else {
        bail!(
            "bundle is signed ({}) but no verification key was provided; pass --key",
            signature.display()
        );
    };

    let cosign = get_tool_path(tools::COSIGN);
    let output = Command::new(&cosign)
        .args([
            "verify-blob",
            "--key",
            &key.display().to_string(),
            "--signature",
            &signature.display().to_string(),
            "--insecure-ignore-tlog=true",
            &dir.join(CHECKSUMS_TXT).display().to_string(),
        ])
        .output()
        .await
        .with_context(|| format!("Failed to run {cosign}"))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ArchiveError::SignatureInvalid {
            path: signature.display().to_string(),
            message: stderr.trim().to_string(),
        }
        .into());
    }
    info!("bundle signature verified");
    Ok(())
}

/// Extract each `components/<name>.tar` next to itself as `components/<name>/`.
fn extract_component_tars(dir: &Path) -> Result<()> {
    let components = dir.join(COMPONENTS_DIR);
    if !components.exists() {
        return Ok(());
    }
    for entry in std::fs::read_dir(&components)? {
        let entry = entry?;
        let path = entry.path();
        let Some(name) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_suffix(".tar"))
        else {
            continue;
        };
        let dest = components.join(name);
        std::fs::create_dir_all(&dest)?;
        extract(&path, &dest)?;
        std::fs::remove_file(&path)?;
    }
    Ok(())
}

/// sha256 of a file's contents, hex-encoded.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Regenerate the checksum manifest for an extracted tree (tests and
/// fixtures); descriptor, manifest and signature files are excluded.
pub fn write_checksums(dir: &Path) -> Result<()> {
    let mut lines = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(dir)?
            .to_string_lossy()
            .replace('\\', "/");
        if rel == BUNDLE_YAML || rel == CHECKSUMS_TXT || rel == SIGNATURE_FILE {
            continue;
        }
        lines.push(format!("{}  {}", sha256_file(entry.path())?, rel));
    }
    std::fs::write(dir.join(CHECKSUMS_TXT), lines.join("\n") + "\n")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn make_archive(dir: &Path, files: &[(&str, &[u8])]) -> PathBuf {
        let tree = dir.join("tree");
        std::fs::create_dir_all(&tree).unwrap();
        for (rel, content) in files {
            let path = tree.join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, content).unwrap();
        }
        write_checksums(&tree).unwrap();
        let archive = dir.join("bundle.tar");
        let file = std::fs::File::create(&archive).unwrap();
        let mut builder = tar::Builder::new(file);
        builder.append_dir_all(".", &tree).unwrap();
        builder.finish().unwrap();
        archive
    }

    const DESCRIPTOR: &[u8] =
        b"kind: ZarfPackageConfig\nmetadata:\n  name: sample\ncomponents:\n  - name: app\n";

    #[tokio::test]
    async fn test_load_plain_tar() {
        let staging = tempfile::tempdir().unwrap();
        let archive = make_archive(
            staging.path(),
            &[(BUNDLE_YAML, DESCRIPTOR), ("sboms.txt", b"none")],
        );
        let opts = DeployOptions::new(archive.display().to_string());
        let loaded = load(&opts, staging.path()).await.unwrap();
        assert_eq!(loaded.bundle.metadata.name, "sample");
        assert!(loaded.dir.join("sboms.txt").exists());
    }

    #[tokio::test]
    async fn test_tampered_file_fails_checksum() {
        let staging = tempfile::tempdir().unwrap();
        let tree = staging.path().join("tree");
        std::fs::create_dir_all(&tree).unwrap();
        std::fs::write(tree.join(BUNDLE_YAML), DESCRIPTOR).unwrap();
        std::fs::write(tree.join("data.txt"), b"original").unwrap();
        write_checksums(&tree).unwrap();
        std::fs::write(tree.join("data.txt"), b"tampered").unwrap();

        let archive = staging.path().join("bundle.tar");
        let file = std::fs::File::create(&archive).unwrap();
        let mut builder = tar::Builder::new(file);
        builder.append_dir_all(".", &tree).unwrap();
        builder.finish().unwrap();

        let opts = DeployOptions::new(archive.display().to_string());
        let err = load(&opts, staging.path()).await.unwrap_err();
        assert!(err.to_string().contains("data.txt"), "got: {err:#}");
    }

    #[tokio::test]
    async fn test_archive_shasum_checked() {
        let staging = tempfile::tempdir().unwrap();
        let archive = make_archive(staging.path(), &[(BUNDLE_YAML, DESCRIPTOR)]);
        let mut opts = DeployOptions::new(archive.display().to_string());
        opts.shasum = Some("0".repeat(64));
        let err = load(&opts, staging.path()).await.unwrap_err();
        assert!(err.to_string().contains("Checksum mismatch"));
    }

    #[test]
    fn test_multipart_reassembly() {
        let dir = tempfile::tempdir().unwrap();
        let payload = b"0123456789abcdef0123456789abcdef".to_vec();
        let sum = hex::encode(Sha256::digest(&payload));
        let header = PartHeader {
            count: 2,
            bytes: payload.len() as u64,
            sha256_sum: sum,
        };
        std::fs::write(
            dir.path().join("bundle.tar.part000"),
            serde_json::to_vec(&header).unwrap(),
        )
        .unwrap();
        std::fs::write(dir.path().join("bundle.tar.part001"), &payload[..16]).unwrap();
        std::fs::write(dir.path().join("bundle.tar.part002"), &payload[16..]).unwrap();

        let out = reassemble(&dir.path().join("bundle.tar.part001"), dir.path()).unwrap();
        assert_eq!(std::fs::read(out).unwrap(), payload);
    }

    #[test]
    fn test_multipart_missing_part() {
        let dir = tempfile::tempdir().unwrap();
        let header = PartHeader {
            count: 3,
            bytes: 48,
            sha256_sum: "0".repeat(64),
        };
        std::fs::write(
            dir.path().join("bundle.tar.part000"),
            serde_json::to_vec(&header).unwrap(),
        )
        .unwrap();
        std::fs::write(dir.path().join("bundle.tar.part001"), b"x").unwrap();

        let err = reassemble(&dir.path().join("bundle.tar.part001"), dir.path()).unwrap_err();
        assert!(err.to_string().contains("declares 3 parts"));
    }

    #[test]
    fn test_is_multipart() {
        assert!(is_multipart(Path::new("/x/bundle.tar.zst.part007")));
        assert!(!is_multipart(Path::new("/x/bundle.tar.zst")));
        assert!(!is_multipart(Path::new("/x/bundle.tar.partly")));
    }

    #[tokio::test]
    async fn test_signed_bundle_without_key_is_fatal() {
        let staging = tempfile::tempdir().unwrap();
        let archive = make_archive(
            staging.path(),
            &[(BUNDLE_YAML, DESCRIPTOR), (SIGNATURE_FILE, b"MEUCIQ...")],
        );
        let opts = DeployOptions::new(archive.display().to_string());
        let err = load(&opts, staging.path()).await.unwrap_err();
        assert!(err.to_string().contains("no verification key"));
    }

    #[test]
    fn test_zstd_archive_extracts() {
        let dir = tempfile::tempdir().unwrap();
        let tree = dir.path().join("tree");
        std::fs::create_dir_all(&tree).unwrap();
        std::fs::write(tree.join("hello.txt"), b"hi").unwrap();

        let plain = dir.path().join("a.tar");
        let file = std::fs::File::create(&plain).unwrap();
        let mut builder = tar::Builder::new(file);
        builder.append_dir_all(".", &tree).unwrap();
        builder.finish().unwrap();

        let compressed = dir.path().join("a.tar.zst");
        let mut enc =
            zstd::Encoder::new(std::fs::File::create(&compressed).unwrap(), 3).unwrap();
        std::io::copy(&mut std::fs::File::open(&plain).unwrap(), &mut enc).unwrap();
        enc.finish().unwrap().flush().unwrap();

        let out = dir.path().join("out");
        extract(&compressed, &out).unwrap();
        assert_eq!(std::fs::read(out.join("hello.txt")).unwrap(), b"hi");
    }
}
