//! Kubernetes helpers
//!
//! Client construction, cluster fact detection, the object-status readiness
//! oracle used by the release manager's secondary wait, and the service
//! listing behind the post-deploy connection table.

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::{Node, Service};
use kube::{
    api::{Api, DynamicObject, GroupVersionKind, ListParams},
    discovery::{oneshot, ApiResource, Scope},
    Client, Config,
};
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::ReleaseError;
use crate::services::filter::ClusterFacts;

/// Create Kubernetes client
pub async fn create_client() -> Result<Client> {
    let config = Config::infer()
        .await
        .context("Failed to infer kubeconfig")?;

    Client::try_from(config).context("Failed to create Kubernetes client")
}

/// Detect cluster architecture and distribution from the node pool.
pub async fn cluster_facts(client: &Client) -> Result<ClusterFacts> {
    let nodes: Api<Node> = Api::all(client.clone());
    let list = nodes
        .list(&ListParams::default())
        .await
        .context("Failed to list nodes")?;
    let Some(node) = list.items.first() else {
        return Ok(ClusterFacts::default());
    };
    let info = node.status.as_ref().and_then(|s| s.node_info.as_ref());
    let arch = info.map(|i| i.architecture.clone());
    let distro = detect_distro(
        info.map(|i| i.kubelet_version.as_str()).unwrap_or_default(),
        node.spec
            .as_ref()
            .and_then(|s| s.provider_id.as_deref())
            .unwrap_or_default(),
        info.map(|i| i.os_image.as_str()).unwrap_or_default(),
    );
    Ok(ClusterFacts { arch, distro })
}

fn detect_distro(kubelet_version: &str, provider_id: &str, os_image: &str) -> Option<String> {
    let distro = if kubelet_version.contains("+k3s") {
        "k3s"
    } else if kubelet_version.contains("+rke2") {
        "rke2"
    } else if kubelet_version.contains("-eks-") || provider_id.starts_with("aws") {
        "eks"
    } else if provider_id.starts_with("azure") {
        "aks"
    } else if kubelet_version.contains("-gke") {
        "gke"
    } else if provider_id.starts_with("kind") {
        "kind"
    } else if os_image.contains("Talos") {
        "talos"
    } else {
        return None;
    };
    Some(distro.to_string())
}

/// One object applied by a release, addressed for readiness polling
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedObject {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub namespace: Option<String>,
}

impl AppliedObject {
    pub fn describe(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{}/{} {}", ns, self.kind, self.name),
            None => format!("{} {}", self.kind, self.name),
        }
    }

    fn gvk(&self) -> GroupVersionKind {
        let (group, version) = match self.api_version.split_once('/') {
            Some((g, v)) => (g.to_string(), v.to_string()),
            None => (String::new(), self.api_version.clone()),
        };
        GroupVersionKind {
            group,
            version,
            kind: self.kind.clone(),
        }
    }
}

/// Parse a multi-document manifest stream into addressable objects.
pub fn parse_manifest_objects(yaml: &str, default_namespace: &str) -> Result<Vec<AppliedObject>> {
    let mut objects = Vec::new();
    for document in serde_yaml::Deserializer::from_str(yaml) {
        let value: Value = match serde::Deserialize::deserialize(document) {
            Ok(Value::Null) => continue,
            Ok(value) => value,
            Err(e) => anyhow::bail!("failed to parse applied manifest: {e}"),
        };
        let (Some(api_version), Some(kind), Some(name)) = (
            value.get("apiVersion").and_then(Value::as_str),
            value.get("kind").and_then(Value::as_str),
            value
                .pointer("/metadata/name")
                .and_then(Value::as_str),
        ) else {
            continue;
        };
        let namespace = value
            .pointer("/metadata/namespace")
            .and_then(Value::as_str)
            .unwrap_or(default_namespace);
        objects.push(AppliedObject {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
            namespace: Some(namespace.to_string()),
        });
    }
    Ok(objects)
}

/// Poll each object's `.status` until ready or the deadline passes.
///
/// An object with no `.status` field is treated as ready on first sighting.
pub async fn wait_for_ready(
    client: &Client,
    objects: &[AppliedObject],
    timeout: Duration,
) -> Result<()> {
    let deadline = Instant::now() + timeout;
    let mut pending: Vec<AppliedObject> = objects.to_vec();
    let mut resources: HashMap<String, (ApiResource, Scope)> = HashMap::new();

    while !pending.is_empty() {
        let mut still_pending = Vec::new();
        for object in pending {
            let gvk = object.gvk();
            let key = format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind);
            if !resources.contains_key(&key) {
                let (resource, capabilities) = oneshot::pinned_kind(client, &gvk)
                    .await
                    .with_context(|| format!("Failed to discover {}", object.kind))?;
                resources.insert(key.clone(), (resource, capabilities.scope));
            }
            let (resource, scope) = &resources[&key];
            let api: Api<DynamicObject> = match (scope, &object.namespace) {
                (Scope::Namespaced, Some(ns)) => {
                    Api::namespaced_with(client.clone(), ns, resource)
                }
                _ => Api::all_with(client.clone(), resource),
            };
            let ready = match api.get_opt(&object.name).await? {
                Some(live) => {
                    let generation = live.metadata.generation;
                    is_ready(&object.kind, generation, &live.data)
                }
                // Not visible yet; keep polling.
                None => false,
            };
            if ready {
                debug!(object = %object.describe(), "ready");
            } else {
                still_pending.push(object);
            }
        }
        pending = still_pending;
        if pending.is_empty() {
            break;
        }
        if Instant::now() >= deadline {
            return Err(ReleaseError::ReadinessTimeout {
                resource: pending[0].describe(),
                timeout_secs: timeout.as_secs(),
            }
            .into());
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    Ok(())
}

/// The readiness heuristic over an object's raw data.
pub fn is_ready(kind: &str, generation: Option<i64>, data: &Value) -> bool {
    let Some(status) = data.get("status") else {
        // No status block: ready on first sighting.
        return true;
    };
    if status.is_null() || status.as_object().map(|o| o.is_empty()).unwrap_or(false) {
        return true;
    }

    match kind {
        "Deployment" | "StatefulSet" => {
            let desired = data
                .pointer("/spec/replicas")
                .and_then(Value::as_i64)
                .unwrap_or(1);
            let ready = status
                .get("readyReplicas")
                .and_then(Value::as_i64)
                .unwrap_or(0);
            generation_observed(generation, status) && ready >= desired
        }
        "DaemonSet" => {
            let desired = status
                .get("desiredNumberScheduled")
                .and_then(Value::as_i64)
                .unwrap_or(0);
            let ready = status
                .get("numberReady")
                .and_then(Value::as_i64)
                .unwrap_or(0);
            ready >= desired
        }
        "Job" => {
            has_condition(status, &["Complete"])
                || status.get("succeeded").and_then(Value::as_i64).unwrap_or(0) >= 1
        }
        "Pod" => {
            let phase = status.get("phase").and_then(Value::as_str).unwrap_or("");
            phase == "Succeeded" || (phase == "Running" && has_condition(status, &["Ready"]))
        }
        _ => {
            if status.get("conditions").is_some() {
                has_condition(status, &["Ready", "Available", "Complete"])
            } else {
                // Status present but nothing recognizable to wait on.
                generation_observed(generation, status)
            }
        }
    }
}

fn generation_observed(generation: Option<i64>, status: &Value) -> bool {
    match (
        generation,
        status.get("observedGeneration").and_then(Value::as_i64),
    ) {
        (Some(want), Some(observed)) => observed >= want,
        _ => true,
    }
}

fn has_condition(status: &Value, types: &[&str]) -> bool {
    status
        .get("conditions")
        .and_then(Value::as_array)
        .map(|conditions| {
            conditions.iter().any(|c| {
                let matches_type = c
                    .get("type")
                    .and_then(Value::as_str)
                    .map(|t| types.contains(&t))
                    .unwrap_or(false);
                matches_type
                    && c.get("status").and_then(Value::as_str) == Some("True")
            })
        })
        .unwrap_or(false)
}

/// service → URL rows for the post-deploy connection table.
pub async fn connection_rows(
    client: &Client,
    namespaces: &[String],
) -> Result<Vec<(String, String)>> {
    let nodes: Api<Node> = Api::all(client.clone());
    let node_ip = nodes
        .list(&ListParams::default())
        .await
        .ok()
        .and_then(|list| {
            list.items.into_iter().next().and_then(|node| {
                node.status.and_then(|s| s.addresses).and_then(|addrs| {
                    addrs
                        .into_iter()
                        .find(|a| a.type_ == "InternalIP")
                        .map(|a| a.address)
                })
            })
        });

    let mut rows = Vec::new();
    for namespace in namespaces {
        let services: Api<Service> = Api::namespaced(client.clone(), namespace);
        let Ok(list) = services.list(&ListParams::default()).await else {
            continue;
        };
        for service in list {
            let name = service.metadata.name.clone().unwrap_or_default();
            let Some(spec) = service.spec else { continue };
            match spec.type_.as_deref() {
                Some("NodePort") => {
                    if let (Some(ip), Some(ports)) = (&node_ip, &spec.ports) {
                        for port in ports {
                            if let Some(node_port) = port.node_port {
                                rows.push((
                                    format!("{namespace}/{name}"),
                                    format!("http://{ip}:{node_port}"),
                                ));
                            }
                        }
                    }
                }
                Some("LoadBalancer") => {
                    let ingress = service
                        .status
                        .and_then(|s| s.load_balancer)
                        .and_then(|lb| lb.ingress)
                        .and_then(|mut i| i.pop());
                    if let Some(ingress) = ingress {
                        let host = ingress.hostname.or(ingress.ip).unwrap_or_default();
                        if !host.is_empty() {
                            rows.push((format!("{namespace}/{name}"), format!("http://{host}")));
                        }
                    }
                }
                _ => {}
            }
        }
    }
    rows.sort();
    rows.dedup();
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_statusless_object_is_ready() {
        assert!(is_ready("ConfigMap", None, &json!({"data": {"k": "v"}})));
    }

    #[test]
    fn test_empty_status_is_ready() {
        assert!(is_ready("Widget", Some(1), &json!({"status": {}})));
    }

    #[test]
    fn test_deployment_waits_for_replicas() {
        let not_ready = json!({
            "spec": {"replicas": 3},
            "status": {"readyReplicas": 1, "observedGeneration": 2}
        });
        assert!(!is_ready("Deployment", Some(2), &not_ready));

        let ready = json!({
            "spec": {"replicas": 3},
            "status": {"readyReplicas": 3, "observedGeneration": 2}
        });
        assert!(is_ready("Deployment", Some(2), &ready));
    }

    #[test]
    fn test_deployment_waits_for_observed_generation() {
        let stale = json!({
            "spec": {"replicas": 1},
            "status": {"readyReplicas": 1, "observedGeneration": 1}
        });
        assert!(!is_ready("Deployment", Some(2), &stale));
    }

    #[test]
    fn test_job_completion() {
        let running = json!({"status": {"active": 1}});
        assert!(!is_ready("Job", None, &running));
        let complete = json!({"status": {"succeeded": 1}});
        assert!(is_ready("Job", None, &complete));
        let conditioned = json!({
            "status": {"conditions": [{"type": "Complete", "status": "True"}]}
        });
        assert!(is_ready("Job", None, &conditioned));
    }

    #[test]
    fn test_custom_resource_with_ready_condition() {
        let ready = json!({
            "status": {"conditions": [{"type": "Ready", "status": "True"}]}
        });
        assert!(is_ready("Certificate", None, &ready));
        let pending = json!({
            "status": {"conditions": [{"type": "Ready", "status": "False"}]}
        });
        assert!(!is_ready("Certificate", None, &pending));
    }

    #[test]
    fn test_parse_manifest_objects() {
        let yaml = r#"
apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
---
apiVersion: v1
kind: Service
metadata:
  name: web
  namespace: override
"#;
        let objects = parse_manifest_objects(yaml, "fallback").unwrap();
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[0].namespace.as_deref(), Some("fallback"));
        assert_eq!(objects[1].namespace.as_deref(), Some("override"));
        assert_eq!(objects[0].describe(), "fallback/Deployment web");
    }

    #[test]
    fn test_parse_skips_empty_documents() {
        let objects = parse_manifest_objects("---\n# nothing\n---\n", "ns").unwrap();
        assert!(objects.is_empty());
    }

    #[test]
    fn test_detect_distro() {
        assert_eq!(
            detect_distro("v1.30.2+k3s1", "", "").as_deref(),
            Some("k3s")
        );
        assert_eq!(
            detect_distro("v1.29.0-eks-a1b2c3", "aws:///us-east-1a/i-abc", "").as_deref(),
            Some("eks")
        );
        assert_eq!(detect_distro("v1.30.0", "", ""), None);
    }
}
