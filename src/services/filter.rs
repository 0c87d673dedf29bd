//! Component selection
//!
//! Narrows a bundle's component list to what actually runs on this host and
//! cluster, honoring required/default flags, selection groups and the
//! user's `--components` picks. Output preserves declaration order.

use anyhow::Result;
use std::collections::{HashMap, HashSet};
use tracing::debug;

use crate::config::HostFacts;
use crate::domain::bundle::{Bundle, Component};
use crate::error::BundleError;

/// Facts about the target cluster relevant to selection
#[derive(Debug, Clone, Default)]
pub struct ClusterFacts {
    pub arch: Option<String>,
    pub distro: Option<String>,
}

/// Apply the selection policy and return the components to execute.
pub fn select_components(
    bundle: &Bundle,
    host: &HostFacts,
    cluster: Option<&ClusterFacts>,
    requested: Option<&str>,
) -> Result<Vec<Component>> {
    let picks = parse_requested(requested);
    validate_picks(bundle, &picks)?;

    let eligible: Vec<&Component> = bundle
        .components
        .iter()
        .filter(|c| is_eligible(c, host, cluster))
        .collect();

    // Resolve each group to its single winner up front.
    let mut group_winner: HashMap<&str, &str> = HashMap::new();
    for component in &eligible {
        let Some(group) = component.group.as_deref() else {
            continue;
        };
        if group_winner.contains_key(group) {
            continue;
        }
        let members: Vec<&&Component> = eligible
            .iter()
            .filter(|c| c.group.as_deref() == Some(group))
            .collect();
        let winner = members
            .iter()
            .find(|c| picks.contains(c.name.as_str()) || picks.contains(group))
            .or_else(|| members.iter().find(|c| c.default))
            .or_else(|| members.first())
            .ok_or_else(|| BundleError::EmptyGroup {
                group: group.to_string(),
            })?;
        debug!(group, winner = %winner.name, "resolved component group");
        group_winner.insert(group, winner.name.as_str());
    }

    let mut selected = Vec::new();
    for component in eligible {
        let include = match component.group.as_deref() {
            Some(group) => group_winner.get(group) == Some(&component.name.as_str()),
            None => {
                component.required
                    || picks.contains(component.name.as_str())
                    || (picks.is_empty() && requested.is_none() && component.default)
            }
        };
        if include {
            selected.push(component.clone());
        }
    }

    if selected.is_empty() {
        return Err(BundleError::NothingToDeploy.into());
    }
    Ok(selected)
}

fn parse_requested(requested: Option<&str>) -> HashSet<&str> {
    requested
        .map(|csv| {
            csv.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn validate_picks(bundle: &Bundle, picks: &HashSet<&str>) -> Result<()> {
    for pick in picks {
        let known = bundle
            .components
            .iter()
            .any(|c| c.name == *pick || c.group.as_deref() == Some(*pick));
        if !known {
            return Err(BundleError::UnknownSelection {
                name: pick.to_string(),
            }
            .into());
        }
    }
    Ok(())
}

fn is_eligible(component: &Component, host: &HostFacts, cluster: Option<&ClusterFacts>) -> bool {
    if let Some(os) = component.only.local_os.as_deref() {
        if os != host.os {
            debug!(component = %component.name, os, "excluded by local OS");
            return false;
        }
    }
    let Some(cluster) = cluster else {
        // Cluster facts unknown; nothing cluster-side can exclude.
        return true;
    };
    if let (Some(want), Some(have)) = (
        component.only.cluster.architecture.as_deref(),
        cluster.arch.as_deref(),
    ) {
        if want != have {
            debug!(component = %component.name, want, have, "excluded by cluster arch");
            return false;
        }
    }
    if !component.only.cluster.distros.is_empty() {
        if let Some(distro) = cluster.distro.as_deref() {
            if !component
                .only
                .cluster
                .distros
                .iter()
                .any(|d| d == distro)
            {
                debug!(component = %component.name, distro, "excluded by cluster distro");
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::bundle::Bundle;

    fn host() -> HostFacts {
        HostFacts {
            arch: "amd64".to_string(),
            os: "linux".to_string(),
        }
    }

    fn grouped_bundle() -> Bundle {
        Bundle::parse(
            r#"
kind: ZarfPackageConfig
metadata:
  name: filtering
components:
  - name: core
    required: true
  - name: postgres
    group: db
    default: true
  - name: mysql
    group: db
  - name: dashboards
    default: true
  - name: windows-agent
    only:
      localOS: windows
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_defaults_selected_without_user_input() {
        let selected = select_components(&grouped_bundle(), &host(), None, None).unwrap();
        let names: Vec<&str> = selected.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["core", "postgres", "dashboards"]);
    }

    #[test]
    fn test_explicit_pick_overrides_group_default() {
        let selected =
            select_components(&grouped_bundle(), &host(), None, Some("mysql")).unwrap();
        let names: Vec<&str> = selected.iter().map(|c| c.name.as_str()).collect();
        // required stays, explicit pick replaces the group default, plain
        // defaults drop once the user has expressed a selection
        assert_eq!(names, vec!["core", "mysql"]);
    }

    #[test]
    fn test_group_without_default_falls_back_to_first_declared() {
        let bundle = Bundle::parse(
            r#"
kind: ZarfPackageConfig
metadata:
  name: g
components:
  - name: a
    group: pick
  - name: b
    group: pick
"#,
        )
        .unwrap();
        let selected = select_components(&bundle, &host(), None, None).unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].name, "a");
    }

    #[test]
    fn test_exactly_one_group_member_even_when_both_requested_path() {
        let selected =
            select_components(&grouped_bundle(), &host(), None, Some("db")).unwrap();
        let db: Vec<&str> = selected
            .iter()
            .filter(|c| c.group.as_deref() == Some("db"))
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(db, vec!["postgres"]);
    }

    #[test]
    fn test_local_os_exclusion() {
        let selected = select_components(&grouped_bundle(), &host(), None, None).unwrap();
        assert!(selected.iter().all(|c| c.name != "windows-agent"));
    }

    #[test]
    fn test_cluster_distro_exclusion() {
        let bundle = Bundle::parse(
            r#"
kind: ZarfPackageConfig
metadata:
  name: d
components:
  - name: k3s-tuning
    required: true
    only:
      cluster:
        distros: [k3s]
  - name: everything-else
    required: true
"#,
        )
        .unwrap();
        let facts = ClusterFacts {
            arch: Some("amd64".to_string()),
            distro: Some("eks".to_string()),
        };
        let selected = select_components(&bundle, &host(), Some(&facts), None).unwrap();
        let names: Vec<&str> = selected.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["everything-else"]);
    }

    #[test]
    fn test_unknown_selection_rejected() {
        let err =
            select_components(&grouped_bundle(), &host(), None, Some("nope")).unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn test_required_cannot_be_deselected() {
        let selected =
            select_components(&grouped_bundle(), &host(), None, Some("mysql")).unwrap();
        assert!(selected.iter().any(|c| c.name == "core"));
    }

    #[test]
    fn test_nothing_to_deploy_is_fatal() {
        let bundle = Bundle::parse(
            r#"
kind: ZarfPackageConfig
metadata:
  name: empty
components:
  - name: only-on-windows
    only:
      localOS: windows
"#,
        )
        .unwrap();
        let err = select_components(&bundle, &host(), None, None).unwrap_err();
        assert!(err.to_string().contains("No components"));
    }

    #[test]
    fn test_declaration_order_preserved() {
        let selected = select_components(
            &grouped_bundle(),
            &host(),
            None,
            Some("dashboards,core,mysql"),
        )
        .unwrap();
        let names: Vec<&str> = selected.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["core", "mysql", "dashboards"]);
    }
}
