//! Deploy-time variable engine
//!
//! Resolves `###ZARF_CONST_NAME###` and `###ZARF_VAR_NAME###` markers in
//! manifest, chart and file content. Values come from bundle constants,
//! variable defaults, `--set` overrides, interactive prompts, and
//! `setVariable` captures from actions. Writers race with later readers,
//! so the mutable map sits behind a mutex.

use anyhow::{bail, Context, Result};
use regex::Regex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use crate::domain::bundle::{Bundle, VariableDef};
use crate::error::BundleError;

#[derive(Debug, Clone)]
struct Variable {
    value: String,
    sensitive: bool,
}

/// Shared variable state for one deploy invocation
pub struct VariableStore {
    constants: HashMap<String, String>,
    variables: Mutex<HashMap<String, Variable>>,
    marker: Regex,
}

impl VariableStore {
    /// Seed the store from the bundle's constants and variables plus the
    /// user's `--set` overrides. Overrides win over declared defaults.
    pub fn new(bundle: &Bundle, overrides: &[(String, String)]) -> Result<Self> {
        let constants = bundle
            .constants
            .iter()
            .map(|c| (c.name.clone(), c.value.clone()))
            .collect();

        let mut variables = HashMap::new();
        for (name, value) in overrides {
            variables.insert(
                name.clone(),
                Variable {
                    value: value.clone(),
                    sensitive: false,
                },
            );
        }
        for def in &bundle.variables {
            if let Some(existing) = variables.get_mut(&def.name) {
                existing.sensitive = def.sensitive;
                continue;
            }
            if let Some(default) = &def.default {
                variables.insert(
                    def.name.clone(),
                    Variable {
                        value: default.clone(),
                        sensitive: def.sensitive,
                    },
                );
            }
        }

        Ok(Self {
            constants,
            variables: Mutex::new(variables),
            marker: Regex::new(r"###ZARF_(VAR|CONST)_([A-Z0-9_]+)###")
                .context("Failed to compile template marker regex")?,
        })
    }

    /// Ask the user for every `prompt: true` variable that still has no
    /// value. In non-interactive mode an unset prompted variable is fatal.
    pub fn prompt_missing(&self, defs: &[VariableDef], non_interactive: bool) -> Result<()> {
        for def in defs {
            if !def.prompt || self.get(&def.name).is_some() {
                continue;
            }
            if non_interactive {
                bail!(
                    "variable {} requires a value; pass --set {}=... in non-interactive mode",
                    def.name,
                    def.name
                );
            }
            let label = def
                .description
                .clone()
                .unwrap_or_else(|| format!("Value for {}", def.name));
            let value = if def.sensitive {
                dialoguer::Password::new()
                    .with_prompt(label)
                    .interact()
                    .context("Failed to read prompted value")?
            } else {
                dialoguer::Input::<String>::new()
                    .with_prompt(label)
                    .allow_empty(true)
                    .interact_text()
                    .context("Failed to read prompted value")?
            };
            self.set(&def.name, &value, def.sensitive);
        }
        Ok(())
    }

    /// Record a variable; later reads observe this value.
    pub fn set(&self, name: &str, value: &str, sensitive: bool) {
        let mut variables = self.variables.lock().unwrap_or_else(|e| e.into_inner());
        variables.insert(
            name.to_string(),
            Variable {
                value: value.to_string(),
                sensitive,
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<String> {
        let variables = self.variables.lock().unwrap_or_else(|e| e.into_inner());
        variables.get(name).map(|v| v.value.clone())
    }

    /// Environment entries (`ZARF_VAR_NAME=value`) exposed to action commands.
    pub fn env_pairs(&self) -> Vec<(String, String)> {
        let variables = self.variables.lock().unwrap_or_else(|e| e.into_inner());
        let mut pairs: Vec<(String, String)> = variables
            .iter()
            .map(|(name, var)| (format!("ZARF_VAR_{name}"), var.value.clone()))
            .collect();
        pairs.sort();
        pairs
    }

    /// Expand every marker in `content`. An unresolved `ZARF_VAR` marker is
    /// fatal and names the offending variable and source.
    pub fn render(&self, content: &str, source: &str) -> Result<String> {
        let variables = self.variables.lock().unwrap_or_else(|e| e.into_inner());
        let mut unresolved = None;
        let rendered = self
            .marker
            .replace_all(content, |caps: &regex::Captures<'_>| {
                let name = &caps[2];
                let value = match &caps[1] {
                    "CONST" => self.constants.get(name).cloned(),
                    _ => variables.get(name).map(|v| v.value.clone()),
                };
                match value {
                    Some(v) => v,
                    None => {
                        if unresolved.is_none() {
                            unresolved = Some(name.to_string());
                        }
                        caps[0].to_string()
                    }
                }
            })
            .into_owned();
        if let Some(name) = unresolved {
            return Err(BundleError::UnresolvedVariable {
                name,
                path: source.to_string(),
            }
            .into());
        }
        Ok(rendered)
    }

    /// Render a file in place. Binary files (non-UTF-8) are left untouched.
    pub fn render_file(&self, path: &Path) -> Result<()> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let Ok(content) = String::from_utf8(bytes) else {
            return Ok(());
        };
        if !content.contains("###ZARF_") {
            return Ok(());
        }
        let rendered = self.render(&content, &path.display().to_string())?;
        std::fs::write(path, rendered)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    /// Redact a value for logging when the variable is sensitive.
    pub fn display_value(&self, name: &str) -> String {
        let variables = self.variables.lock().unwrap_or_else(|e| e.into_inner());
        match variables.get(name) {
            Some(var) if var.sensitive => "(sensitive)".to_string(),
            Some(var) => var.value.clone(),
            None => "(unset)".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::bundle::Bundle;

    fn bundle() -> Bundle {
        Bundle::parse(
            r#"
kind: ZarfPackageConfig
metadata:
  name: vars
constants:
  - name: DOMAIN
    value: example.com
variables:
  - name: VERSION
    default: 1.0.0
  - name: TOKEN
    sensitive: true
    prompt: true
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_render_constants_and_variables() {
        let store = VariableStore::new(&bundle(), &[]).unwrap();
        let out = store
            .render(
                "host: ###ZARF_CONST_DOMAIN###\nimage: app:###ZARF_VAR_VERSION###",
                "values.yaml",
            )
            .unwrap();
        assert_eq!(out, "host: example.com\nimage: app:1.0.0");
    }

    #[test]
    fn test_set_override_wins_over_default() {
        let store = VariableStore::new(
            &bundle(),
            &[("VERSION".to_string(), "2.0.0".to_string())],
        )
        .unwrap();
        assert_eq!(store.get("VERSION").unwrap(), "2.0.0");
    }

    #[test]
    fn test_unresolved_variable_is_fatal() {
        let store = VariableStore::new(&bundle(), &[]).unwrap();
        let err = store
            .render("###ZARF_VAR_MISSING###", "deployment.yaml")
            .unwrap_err();
        assert!(err.to_string().contains("MISSING"));
        assert!(err.to_string().contains("deployment.yaml"));
    }

    #[test]
    fn test_action_capture_visible_to_later_renders() {
        let store = VariableStore::new(&bundle(), &[]).unwrap();
        store.set("BUILD_SHA", "abc1234", false);
        let out = store.render("sha: ###ZARF_VAR_BUILD_SHA###", "cm.yaml").unwrap();
        assert_eq!(out, "sha: abc1234");
    }

    #[test]
    fn test_sensitive_values_redacted_for_display() {
        let store = VariableStore::new(&bundle(), &[("TOKEN".to_string(), "hunter2".to_string())])
            .unwrap();
        assert_eq!(store.display_value("TOKEN"), "(sensitive)");
        assert_eq!(store.get("TOKEN").unwrap(), "hunter2");
    }

    #[test]
    fn test_env_pairs_are_prefixed_and_sorted() {
        let store = VariableStore::new(&bundle(), &[]).unwrap();
        store.set("ALPHA", "1", false);
        let pairs = store.env_pairs();
        assert!(pairs.iter().any(|(k, _)| k == "ZARF_VAR_ALPHA"));
        let keys: Vec<_> = pairs.iter().map(|(k, _)| k.clone()).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn test_render_file_skips_binary(){
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob.bin");
        std::fs::write(&path, [0xff, 0xfe, 0x00, 0x23]).unwrap();
        let store = VariableStore::new(&bundle(), &[]).unwrap();
        store.render_file(&path).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), vec![0xff, 0xfe, 0x00, 0x23]);
    }
}
