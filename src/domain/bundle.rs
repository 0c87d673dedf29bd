//! Bundle descriptor model
//!
//! Serde model for `zarf.yaml` plus validation and the deprecated-field
//! migrations applied right after parse. The deploy pipeline never mutates
//! a bundle after it has been loaded and migrated.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::BundleError;

/// Bundle kind discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BundleKind {
    /// Cluster bootstrap bundle (registry, git server, PKI seed)
    #[serde(rename = "ZarfInitConfig", alias = "InitConfig")]
    InitConfig,
    /// Application bundle
    #[serde(rename = "ZarfPackageConfig", alias = "AppConfig")]
    AppConfig,
}

/// Bundle-level metadata
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Metadata {
    pub name: String,
    pub description: Option<String>,
    pub version: Option<String>,
    pub architecture: Option<String>,
    /// Archive is a plain tar, not zstd-compressed
    pub uncompressed: bool,
    /// Deploy without the bundle-managed registry/git server prerequisites
    pub yolo: bool,
}

/// Build provenance stamped at creation time
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BuildStamp {
    pub terminal: Option<String>,
    pub user: Option<String>,
    pub architecture: Option<String>,
    pub timestamp: Option<String>,
    pub version: Option<String>,
}

/// A named constant templated as `###ZARF_CONST_NAME###`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Constant {
    pub name: String,
    pub value: String,
    pub description: Option<String>,
}

/// A deploy-time variable templated as `###ZARF_VAR_NAME###`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VariableDef {
    pub name: String,
    pub description: Option<String>,
    pub default: Option<String>,
    /// Ask the user for a value when none was supplied
    pub prompt: bool,
    /// Never echo the value to logs or prompts
    pub sensitive: bool,
}

/// Host/cluster constraints limiting where a component applies
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OnlyFilter {
    /// Restrict to a host operating system ("linux", "darwin", "windows")
    pub local_os: Option<String>,
    pub cluster: OnlyCluster,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OnlyCluster {
    /// Restrict to a cluster architecture ("amd64", "arm64")
    pub architecture: Option<String>,
    /// Restrict to cluster distributions ("k3s", "eks", ...)
    pub distros: Vec<String>,
}

/// A chart to install or upgrade
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Chart {
    pub name: String,
    pub version: Option<String>,
    /// Remote chart location; bundled charts live under `charts/` instead
    pub url: Option<String>,
    /// Path inside the component's `charts/` directory
    pub local_path: Option<String>,
    pub namespace: String,
    /// Release name; defaults to the chart name
    pub release_name: Option<String>,
    pub values_files: Vec<String>,
    /// Skip the secondary readiness wait (engine hook wait still applies)
    pub no_wait: bool,
    pub timeout_seconds: Option<u64>,
    pub max_retries: Option<u32>,
}

impl Chart {
    pub fn release_name(&self) -> &str {
        self.release_name.as_deref().unwrap_or(&self.name)
    }
}

/// A set of raw manifests, installed as a synthetic chart
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Manifest {
    pub name: String,
    pub namespace: String,
    pub files: Vec<String>,
    pub no_wait: bool,
    pub timeout_seconds: Option<u64>,
    pub max_retries: Option<u32>,
}

/// A file to place on the host
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FileDrop {
    pub source: String,
    pub target: String,
    pub shasum: Option<String>,
    pub executable: bool,
}

/// A payload delivered into a running container
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DataInjection {
    pub source: String,
    pub target: InjectionTarget,
    pub compress: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InjectionTarget {
    pub namespace: String,
    /// Label selector for the receiving pod
    pub selector: String,
    pub container: String,
    pub path: String,
}

/// Lifecycle hooks around a component's execution
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ActionSet {
    pub before: Vec<Action>,
    pub after: Vec<Action>,
    pub on_success: Vec<Action>,
    pub on_failure: Vec<Action>,
}

impl ActionSet {
    pub fn is_empty(&self) -> bool {
        self.before.is_empty()
            && self.after.is_empty()
            && self.on_success.is_empty()
            && self.on_failure.is_empty()
    }
}

/// A single user-defined command
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Action {
    pub cmd: String,
    pub description: Option<String>,
    /// Working directory for the command
    pub dir: Option<String>,
    /// Extra environment entries, `KEY=VALUE`
    pub env: Vec<String>,
    /// Per-attempt timeout
    pub max_total_seconds: Option<u64>,
    pub max_retries: u32,
    /// Suppress command output from the user
    pub mute: bool,
    /// Capture trimmed stdout into this variable on success
    pub set_variable: Option<String>,
    /// Pin a shell instead of the platform default
    pub shell: Option<String>,
}

/// Deprecated pre-actions hook shape, migrated on load
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeprecatedScripts {
    pub before: Vec<String>,
    pub after: Vec<String>,
    pub retry: bool,
    pub timeout_seconds: Option<u64>,
    pub show_output: bool,
}

impl DeprecatedScripts {
    fn is_empty(&self) -> bool {
        self.before.is_empty() && self.after.is_empty()
    }
}

/// Build-time component composition marker. Resolved and flattened during
/// creation; the deploy pipeline must never follow it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Import {
    pub name: Option<String>,
    pub path: String,
}

/// A named unit of deployment inside a bundle
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Component {
    pub name: String,
    pub description: Option<String>,
    /// Always included; cannot be deselected
    pub required: bool,
    /// Included when the user makes no selection
    pub default: bool,
    /// Mutually-exclusive selection group
    pub group: Option<String>,
    pub only: OnlyFilter,
    pub images: Vec<String>,
    pub repos: Vec<String>,
    pub charts: Vec<Chart>,
    pub manifests: Vec<Manifest>,
    pub files: Vec<FileDrop>,
    pub data_injections: Vec<DataInjection>,
    pub actions: ActionSet,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scripts: Option<DeprecatedScripts>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub import: Option<Import>,
}

/// The parsed bundle descriptor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bundle {
    pub kind: BundleKind,
    pub metadata: Metadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<BuildStamp>,
    #[serde(default)]
    pub constants: Vec<Constant>,
    #[serde(default)]
    pub variables: Vec<VariableDef>,
    #[serde(default)]
    pub components: Vec<Component>,
}

impl Bundle {
    /// Parse a descriptor and apply migrations
    pub fn parse(yaml: &str) -> Result<Self> {
        let mut bundle: Bundle =
            serde_yaml::from_str(yaml).map_err(|e| BundleError::ParseError {
                message: e.to_string(),
            })?;
        bundle.migrate_deprecated();
        Ok(bundle)
    }

    /// Rewrite deprecated fields to their current form.
    ///
    /// `scripts.before`/`scripts.after` become `actions.before`/`actions.after`
    /// entries carrying the script-level retry and timeout settings.
    pub fn migrate_deprecated(&mut self) {
        for component in &mut self.components {
            let Some(scripts) = component.scripts.take() else {
                continue;
            };
            if scripts.is_empty() {
                continue;
            }
            tracing::warn!(
                component = %component.name,
                "migrating deprecated 'scripts' to 'actions'"
            );
            let retries = if scripts.retry { 1 } else { 0 };
            let to_action = |cmd: &String| Action {
                cmd: cmd.clone(),
                max_total_seconds: scripts.timeout_seconds,
                max_retries: retries,
                mute: !scripts.show_output,
                ..Default::default()
            };
            let mut before: Vec<Action> = scripts.before.iter().map(to_action).collect();
            let mut after: Vec<Action> = scripts.after.iter().map(to_action).collect();
            before.append(&mut component.actions.before);
            component.actions.before = before;
            component.actions.after.append(&mut after);
        }
    }

    /// Structural validation run once after load
    pub fn validate(&self, host_arch: &str) -> Result<()> {
        if self.metadata.name.is_empty() {
            bail!("bundle metadata.name must not be empty");
        }
        let mut seen = HashSet::new();
        for component in &self.components {
            if component.name.is_empty() {
                bail!("component name must not be empty");
            }
            if !seen.insert(component.name.as_str()) {
                bail!("duplicate component name: {}", component.name);
            }
        }
        if let Some(arch) = self.metadata.architecture.as_deref() {
            if arch != host_arch {
                return Err(BundleError::ArchitectureMismatch {
                    bundle_arch: arch.to_string(),
                    host_arch: host_arch.to_string(),
                }
                .into());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
kind: ZarfPackageConfig
metadata:
  name: sample
  version: 0.1.0
components:
  - name: app
    required: true
    images:
      - nginx:1.25
    manifests:
      - name: web
        namespace: sample
        files:
          - deployment.yaml
"#;

    #[test]
    fn test_parse_minimal() {
        let bundle = Bundle::parse(MINIMAL).unwrap();
        assert_eq!(bundle.kind, BundleKind::AppConfig);
        assert_eq!(bundle.metadata.name, "sample");
        assert_eq!(bundle.components.len(), 1);
        assert!(bundle.components[0].required);
        assert_eq!(bundle.components[0].manifests[0].files.len(), 1);
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let err = Bundle::parse("kind: Nonsense\nmetadata:\n  name: x\n").unwrap_err();
        assert!(err.to_string().contains("parse"));
    }

    #[test]
    fn test_scripts_migrate_to_actions() {
        let yaml = r#"
kind: ZarfPackageConfig
metadata:
  name: legacy
components:
  - name: old
    scripts:
      retry: true
      timeoutSeconds: 30
      before:
        - ./prepare.sh
      after:
        - ./finish.sh
"#;
        let bundle = Bundle::parse(yaml).unwrap();
        let component = &bundle.components[0];
        assert!(component.scripts.is_none());
        assert_eq!(component.actions.before.len(), 1);
        assert_eq!(component.actions.before[0].cmd, "./prepare.sh");
        assert_eq!(component.actions.before[0].max_retries, 1);
        assert_eq!(component.actions.before[0].max_total_seconds, Some(30));
        assert_eq!(component.actions.after[0].cmd, "./finish.sh");
    }

    #[test]
    fn test_migrated_scripts_run_before_declared_actions() {
        let yaml = r#"
kind: ZarfPackageConfig
metadata:
  name: legacy
components:
  - name: old
    actions:
      before:
        - cmd: echo declared
    scripts:
      before:
        - echo legacy
"#;
        let bundle = Bundle::parse(yaml).unwrap();
        let before = &bundle.components[0].actions.before;
        assert_eq!(before[0].cmd, "echo legacy");
        assert_eq!(before[1].cmd, "echo declared");
    }

    #[test]
    fn test_validate_duplicate_names() {
        let yaml = r#"
kind: ZarfPackageConfig
metadata:
  name: dup
components:
  - name: a
  - name: a
"#;
        let bundle = Bundle::parse(yaml).unwrap();
        assert!(bundle.validate("amd64").is_err());
    }

    #[test]
    fn test_validate_architecture_mismatch() {
        let yaml = r#"
kind: ZarfPackageConfig
metadata:
  name: cross
  architecture: arm64
components:
  - name: a
"#;
        let bundle = Bundle::parse(yaml).unwrap();
        let err = bundle.validate("amd64").unwrap_err();
        assert!(err.to_string().contains("arm64"));
    }

    #[test]
    fn test_release_name_defaults_to_chart_name() {
        let chart = Chart {
            name: "api".to_string(),
            ..Default::default()
        };
        assert_eq!(chart.release_name(), "api");
    }
}
