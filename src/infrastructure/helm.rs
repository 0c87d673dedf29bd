//! Helm release engine driver
//!
//! All chart installs, upgrades and rollbacks go through the `helm` binary.
//! Argument assembly is kept in pure functions so the exact invocations are
//! testable; execution is a thin tokio wrapper around them.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use crate::error::ReleaseError;
use crate::tools::{get_tool_path, tools};

/// Status of an existing release
#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseStatus {
    #[serde(rename = "version")]
    pub revision: u32,
    #[serde(rename = "info")]
    pub info: ReleaseInfo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseInfo {
    pub status: String,
}

/// Thin client over the helm binary
#[derive(Debug, Clone)]
pub struct HelmClient {
    timeout: Duration,
}

impl HelmClient {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Query a release; `None` when it does not exist.
    pub async fn status(&self, namespace: &str, release: &str) -> Result<Option<ReleaseStatus>> {
        let output = helm(&status_args(namespace, release)).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("not found") {
                return Ok(None);
            }
            return Err(ReleaseError::EngineFailed {
                message: stderr.trim().to_string(),
            }
            .into());
        }
        let status: ReleaseStatus = serde_json::from_slice(&output.stdout)
            .context("Failed to parse helm status output")?;
        Ok(Some(status))
    }

    pub async fn install(
        &self,
        namespace: &str,
        release: &str,
        chart: &Path,
        values: &[std::path::PathBuf],
        wait: bool,
    ) -> Result<()> {
        self.run_or_engine_error(install_args(
            namespace,
            release,
            chart,
            values,
            wait,
            self.timeout,
        ))
        .await
    }

    pub async fn upgrade(
        &self,
        namespace: &str,
        release: &str,
        chart: &Path,
        values: &[std::path::PathBuf],
        wait: bool,
    ) -> Result<()> {
        self.run_or_engine_error(upgrade_args(
            namespace,
            release,
            chart,
            values,
            wait,
            self.timeout,
        ))
        .await
    }

    pub async fn rollback(&self, namespace: &str, release: &str, revision: u32) -> Result<()> {
        self.run_or_engine_error(rollback_args(namespace, release, revision, self.timeout))
            .await
    }

    pub async fn uninstall(&self, namespace: &str, release: &str) -> Result<()> {
        self.run_or_engine_error(vec![
            "uninstall".to_string(),
            release.to_string(),
            "-n".to_string(),
            namespace.to_string(),
        ])
        .await
    }

    /// Rendered manifest of the live release, as applied.
    pub async fn get_manifest(&self, namespace: &str, release: &str) -> Result<String> {
        let output = helm(&[
            "get".to_string(),
            "manifest".to_string(),
            release.to_string(),
            "-n".to_string(),
            namespace.to_string(),
        ])
        .await?;
        if !output.status.success() {
            return Err(ReleaseError::EngineFailed {
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }
            .into());
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn run_or_engine_error(&self, args: Vec<String>) -> Result<()> {
        let output = helm(&args).await?;
        if !output.status.success() {
            return Err(ReleaseError::EngineFailed {
                message: format!(
                    "helm {}: {}",
                    args.first().map(String::as_str).unwrap_or_default(),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            }
            .into());
        }
        Ok(())
    }
}

fn status_args(namespace: &str, release: &str) -> Vec<String> {
    vec![
        "status".to_string(),
        release.to_string(),
        "-n".to_string(),
        namespace.to_string(),
        "-o".to_string(),
        "json".to_string(),
    ]
}

fn timeout_arg(timeout: Duration) -> String {
    format!("{}s", timeout.as_secs())
}

/// Install includes CRDs and creates the namespace; `wait` adds the
/// engine's own readiness wait (post-install hooks are awaited regardless).
fn install_args(
    namespace: &str,
    release: &str,
    chart: &Path,
    values: &[std::path::PathBuf],
    wait: bool,
    timeout: Duration,
) -> Vec<String> {
    let mut args = vec![
        "install".to_string(),
        release.to_string(),
        chart.display().to_string(),
        "-n".to_string(),
        namespace.to_string(),
        "--create-namespace".to_string(),
        "--timeout".to_string(),
        timeout_arg(timeout),
    ];
    if wait {
        args.push("--wait".to_string());
        args.push("--wait-for-jobs".to_string());
    }
    for file in values {
        args.push("-f".to_string());
        args.push(file.display().to_string());
    }
    args
}

/// Upgrades never touch CRDs; the engine cannot upgrade them safely.
fn upgrade_args(
    namespace: &str,
    release: &str,
    chart: &Path,
    values: &[std::path::PathBuf],
    wait: bool,
    timeout: Duration,
) -> Vec<String> {
    let mut args = vec![
        "upgrade".to_string(),
        release.to_string(),
        chart.display().to_string(),
        "-n".to_string(),
        namespace.to_string(),
        "--skip-crds".to_string(),
        "--timeout".to_string(),
        timeout_arg(timeout),
    ];
    if wait {
        args.push("--wait".to_string());
        args.push("--wait-for-jobs".to_string());
    }
    for file in values {
        args.push("-f".to_string());
        args.push(file.display().to_string());
    }
    args
}

/// Rollback deletes resources the failed attempt created and force-recreates
/// where an in-place update cannot apply.
fn rollback_args(
    namespace: &str,
    release: &str,
    revision: u32,
    timeout: Duration,
) -> Vec<String> {
    vec![
        "rollback".to_string(),
        release.to_string(),
        revision.to_string(),
        "-n".to_string(),
        namespace.to_string(),
        "--cleanup-on-fail".to_string(),
        "--force".to_string(),
        "--wait".to_string(),
        "--timeout".to_string(),
        timeout_arg(timeout),
    ]
}

async fn helm(args: &[String]) -> Result<std::process::Output> {
    let bin = get_tool_path(tools::HELM);
    debug!(cmd = %format!("{bin} {}", args.join(" ")), "running helm");
    Command::new(&bin)
        .args(args)
        .output()
        .await
        .with_context(|| format!("Failed to run {bin}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_install_args_include_crds_and_namespace_creation() {
        let args = install_args(
            "web",
            "nginx",
            Path::new("/tmp/chart"),
            &[],
            true,
            Duration::from_secs(900),
        );
        assert!(args.contains(&"--create-namespace".to_string()));
        assert!(args.contains(&"--wait".to_string()));
        assert!(args.contains(&"900s".to_string()));
        assert!(!args.contains(&"--skip-crds".to_string()));
    }

    #[test]
    fn test_upgrade_args_skip_crds() {
        let args = upgrade_args(
            "web",
            "nginx",
            Path::new("/tmp/chart"),
            &[PathBuf::from("values.yaml")],
            false,
            Duration::from_secs(60),
        );
        assert!(args.contains(&"--skip-crds".to_string()));
        assert!(!args.contains(&"--wait".to_string()));
        let f = args.iter().position(|a| a == "-f").unwrap();
        assert_eq!(args[f + 1], "values.yaml");
    }

    #[test]
    fn test_rollback_args_force_and_cleanup() {
        let args = rollback_args("web", "api", 3, Duration::from_secs(900));
        assert_eq!(args[1], "api");
        assert_eq!(args[2], "3");
        assert!(args.contains(&"--cleanup-on-fail".to_string()));
        assert!(args.contains(&"--force".to_string()));
    }

    #[test]
    fn test_status_parse() {
        let json = r#"{"name":"api","version":4,"info":{"status":"deployed"}}"#;
        let status: ReleaseStatus = serde_json::from_str(json).unwrap();
        assert_eq!(status.revision, 4);
        assert_eq!(status.info.status, "deployed");
    }
}
