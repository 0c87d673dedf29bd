//! Centralized error types for airlift
//!
//! Uses thiserror for typed errors that can be matched on,
//! while still being compatible with anyhow for propagation.

use thiserror::Error;

/// Top-level error type for deploy operations
#[derive(Error, Debug)]
pub enum DeployError {
    #[error("Archive error: {0}")]
    Archive(#[from] ArchiveError),

    #[error("Bundle error: {0}")]
    Bundle(#[from] BundleError),

    #[error("Image error: {0}")]
    Image(#[from] ImageError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Git error: {0}")]
    Git(#[from] GitError),

    #[error("Release error: {0}")]
    Release(#[from] ReleaseError),

    #[error("Action error: {0}")]
    Action(#[from] ActionError),

    #[error("State error: {0}")]
    State(#[from] StateError),
}

/// Archive loading and integrity errors
#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Archive not found at path: {path}")]
    NotFound { path: String },

    #[error("Missing part {index} of multipart archive {name}")]
    MissingPart { name: String, index: usize },

    #[error("Part manifest declares {declared} parts but {found} were found for {name}")]
    PartCountMismatch {
        name: String,
        declared: usize,
        found: usize,
    },

    #[error("Checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("File {path} is listed in the checksum manifest but missing from the archive")]
    MissingFile { path: String },

    #[error("Signature verification failed for {path}: {message}")]
    SignatureInvalid { path: String, message: String },

    #[error("Malformed archive {path}: {message}")]
    Malformed { path: String, message: String },
}

/// Bundle descriptor errors
#[derive(Error, Debug)]
pub enum BundleError {
    #[error("Failed to parse bundle descriptor: {message}")]
    ParseError { message: String },

    #[error("Bundle was built for {bundle_arch} but the target is {host_arch}")]
    ArchitectureMismatch {
        bundle_arch: String,
        host_arch: String,
    },

    #[error("No components to deploy after filtering")]
    NothingToDeploy,

    #[error("Component group {group} resolved to no members")]
    EmptyGroup { group: String },

    #[error("Unknown component or group in selection: {name}")]
    UnknownSelection { name: String },

    #[error("Unresolved template variable {name} in {path}")]
    UnresolvedVariable { name: String, path: String },
}

/// Image pull and layout errors
#[derive(Error, Debug)]
pub enum ImageError {
    #[error("Invalid image reference: {reference}")]
    InvalidReference { reference: String },

    #[error(
        "{reference} resolved to a multi-platform index; retry with one of:\n  {}",
        .available.join("\n  ")
    )]
    IndexRejected {
        reference: String,
        available: Vec<String>,
    },

    #[error("No manifest for platform {platform} in index for {reference}")]
    PlatformNotFound {
        reference: String,
        platform: String,
    },

    #[error("Digest mismatch for blob {digest}: content hashed to {actual}")]
    DigestMismatch { digest: String, actual: String },

    #[error("Failed to pull {reference} after {attempts} attempts: {message}")]
    PullFailed {
        reference: String,
        attempts: u32,
        message: String,
    },

    #[error("Image archive {path} has no OCI index; only OCI-layout tarballs are supported")]
    NotOciArchive { path: String },
}

/// Cluster registry push errors
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Push failed after {attempts} attempts: {message}")]
    PushFailed { attempts: u32, message: String },

    #[error("Registry returned {status} for {url}")]
    UnexpectedStatus { status: u16, url: String },

    #[error("No registry target configured; run init first or mark the bundle yolo")]
    NoTarget,
}

/// Git mirroring errors
#[derive(Error, Debug)]
pub enum GitError {
    #[error("Invalid repository url: {url}")]
    InvalidUrl { url: String },

    #[error("Git command failed: {command}: {message}")]
    CommandFailed { command: String, message: String },

    #[error("Push failed for {repo} after {attempts} attempts")]
    PushFailed { repo: String, attempts: u32 },

    #[error("No git server target configured; run init first or mark the bundle yolo")]
    NoTarget,
}

/// Release engine errors
#[derive(Error, Debug)]
pub enum ReleaseError {
    #[error("Install of release {release} failed after {attempts} attempts: {message}")]
    InstallFailed {
        release: String,
        attempts: u32,
        message: String,
    },

    #[error("Upgrade of release {release} failed after {attempts} attempts: {message}")]
    UpgradeFailed {
        release: String,
        attempts: u32,
        message: String,
    },

    #[error("Rollback of release {release} to revision {revision} failed: {message}")]
    RollbackFailed {
        release: String,
        revision: u32,
        message: String,
    },

    #[error("Timed out after {timeout_secs}s waiting for {resource} to become ready")]
    ReadinessTimeout {
        resource: String,
        timeout_secs: u64,
    },

    #[error("helm command failed: {message}")]
    EngineFailed { message: String },
}

/// Action command errors
#[derive(Error, Debug)]
pub enum ActionError {
    #[error("Command failed after {attempts} attempts (exit {code:?}): {cmd}")]
    CommandFailed {
        cmd: String,
        attempts: u32,
        code: Option<i32>,
    },

    #[error("Command timed out after {timeout_secs}s: {cmd}")]
    Timeout { cmd: String, timeout_secs: u64 },

    #[error("Failed to spawn shell {shell}: {message}")]
    SpawnFailed { shell: String, message: String },
}

/// Persisted cluster state errors
#[derive(Error, Debug)]
pub enum StateError {
    #[error("Cluster state secret {name} not found in namespace {namespace}")]
    NotFound { name: String, namespace: String },

    #[error("Failed to decode state secret {name}: {message}")]
    Corrupt { name: String, message: String },
}
