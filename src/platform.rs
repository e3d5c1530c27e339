use async_trait::async_trait;
use futures::stream::BoxStream;
use k8s_openapi::api::core::v1::{Node, Pod, Taint};
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::Client;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

use crate::crd::{AlertTemplate, NodeGuardianRule, NodeGuardianRuleStatus};
use crate::error::{EngineError, EngineResult};

const FIELD_MANAGER: &str = "nodeguardian";
const MAX_PATCH_RETRIES: u32 = 3;
const PATCH_RETRY_BACKOFF_MS: u64 = 100;

/// A watch-stream event for a custom resource, collapsing the platform's
/// Added/Modified distinction the way a merge-patch upsert naturally does —
/// the Rule Store treats both identically.
#[derive(Debug, Clone)]
pub enum ObjectEvent<T> {
    Applied(T),
    Deleted(T),
    Synchronization(Vec<T>),
}

/// Minimal view of a node needed by the metrics resolver and evaluator.
#[derive(Debug, Clone, Default)]
pub struct NodeInfo {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub taints: Vec<(String, String, String)>,
    pub disk_pressure: bool,
}

#[derive(Debug, Clone)]
pub struct PodRef {
    pub namespace: String,
    pub name: String,
    pub phase: String,
}

/// Everything the control loop needs from the orchestration platform.
///
/// All mutations are optimistic-update-with-retry: read current object,
/// merge, patch; on conflict retry up to `MAX_PATCH_RETRIES` with linear
/// backoff. Failures split into `PlatformTransient` (caller may retry) and
/// `PlatformFatal` (surface, skip this evaluation).
#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    async fn list_nodes(&self, label_selector: Option<&str>) -> EngineResult<Vec<NodeInfo>>;
    async fn read_node(&self, name: &str) -> EngineResult<NodeInfo>;
    async fn set_taint(
        &self,
        node: &str,
        key: &str,
        value: &str,
        effect: &str,
    ) -> EngineResult<()>;
    async fn remove_taint(&self, node: &str, key: &str) -> EngineResult<()>;
    async fn set_labels(&self, node: &str, labels: &BTreeMap<String, String>) -> EngineResult<()>;
    async fn remove_labels(&self, node: &str, keys: &[String]) -> EngineResult<()>;
    async fn set_annotations(
        &self,
        node: &str,
        annotations: &BTreeMap<String, String>,
    ) -> EngineResult<()>;
    async fn remove_annotations(&self, node: &str, keys: &[String]) -> EngineResult<()>;
    async fn list_pods_on_node(
        &self,
        node: &str,
        exclude_namespaces: &[String],
    ) -> EngineResult<Vec<PodRef>>;
    async fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
        grace_period_seconds: i64,
    ) -> EngineResult<()>;
    async fn patch_rule_status(
        &self,
        name: &str,
        status: &NodeGuardianRuleStatus,
    ) -> EngineResult<()>;
    fn watch_rules(&self) -> BoxStream<'static, EngineResult<ObjectEvent<NodeGuardianRule>>>;
    fn watch_templates(&self) -> BoxStream<'static, EngineResult<ObjectEvent<AlertTemplate>>>;
}

pub struct KubePlatformAdapter {
    client: Client,
}

impl KubePlatformAdapter {
    pub fn new(client: Client) -> Self {
        KubePlatformAdapter { client }
    }

    fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }

    fn pods(&self) -> Api<Pod> {
        Api::all(self.client.clone())
    }

    fn rules(&self) -> Api<NodeGuardianRule> {
        Api::all(self.client.clone())
    }

    fn templates(&self) -> Api<AlertTemplate> {
        Api::all(self.client.clone())
    }

    async fn patch_node_with_retry(
        &self,
        name: &str,
        patch: serde_json::Value,
    ) -> EngineResult<()> {
        let api = self.nodes();
        let mut last_err = None;
        for attempt in 0..MAX_PATCH_RETRIES {
            let result = api
                .patch(
                    name,
                    &PatchParams::apply(FIELD_MANAGER).force(),
                    &Patch::Apply(&patch),
                )
                .await;
            match result {
                Ok(_) => return Ok(()),
                Err(kube::Error::Api(e)) if e.code == 409 => {
                    warn!(node = %name, attempt, "optimistic lock conflict, retrying");
                    last_err = Some(EngineError::PlatformTransient(e.message));
                    tokio::time::sleep(Duration::from_millis(
                        PATCH_RETRY_BACKOFF_MS * (attempt as u64 + 1),
                    ))
                    .await;
                }
                Err(kube::Error::Api(e)) if (400..500).contains(&e.code) => {
                    return Err(EngineError::PlatformFatal(e.message));
                }
                Err(e) => {
                    last_err = Some(EngineError::PlatformTransient(e.to_string()));
                    tokio::time::sleep(Duration::from_millis(
                        PATCH_RETRY_BACKOFF_MS * (attempt as u64 + 1),
                    ))
                    .await;
                }
            }
        }
        Err(last_err.unwrap_or_else(|| EngineError::PlatformTransient(format!(
            "exhausted {MAX_PATCH_RETRIES} retries patching node {name}"
        ))))
    }
}

fn node_info_from(node: &Node) -> NodeInfo {
    let labels = node
        .metadata
        .labels
        .clone()
        .unwrap_or_default()
        .into_iter()
        .collect();
    let taints = node
        .spec
        .as_ref()
        .and_then(|s| s.taints.clone())
        .unwrap_or_default()
        .into_iter()
        .map(|t: Taint| (t.key, t.value.unwrap_or_default(), t.effect))
        .collect();
    let disk_pressure = node
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == "DiskPressure" && c.status == "True")
        })
        .unwrap_or(false);
    NodeInfo {
        name: node.metadata.name.clone().unwrap_or_default(),
        labels,
        taints,
        disk_pressure,
    }
}

#[async_trait]
impl PlatformAdapter for KubePlatformAdapter {
    async fn list_nodes(&self, label_selector: Option<&str>) -> EngineResult<Vec<NodeInfo>> {
        let mut params = ListParams::default();
        if let Some(selector) = label_selector {
            params = params.labels(selector);
        }
        let list = self
            .nodes()
            .list(&params)
            .await
            .map_err(|e| EngineError::PlatformTransient(e.to_string()))?;
        Ok(list.items.iter().map(node_info_from).collect())
    }

    async fn read_node(&self, name: &str) -> EngineResult<NodeInfo> {
        let node = self.nodes().get(name).await.map_err(|e| match e {
            kube::Error::Api(e) if (400..500).contains(&e.code) => {
                EngineError::PlatformFatal(e.message)
            }
            e => EngineError::PlatformTransient(e.to_string()),
        })?;
        Ok(node_info_from(&node))
    }

    async fn set_taint(
        &self,
        node: &str,
        key: &str,
        value: &str,
        effect: &str,
    ) -> EngineResult<()> {
        let current = self.read_node(node).await?;
        let mut taints: Vec<_> = current
            .taints
            .into_iter()
            .filter(|(k, _, _)| k != key)
            .collect();
        taints.push((key.to_string(), value.to_string(), effect.to_string()));
        let patch = serde_json::json!({
            "apiVersion": "v1",
            "kind": "Node",
            "spec": {
                "taints": taints.iter().map(|(k, v, e)| serde_json::json!({
                    "key": k, "value": v, "effect": e
                })).collect::<Vec<_>>()
            }
        });
        self.patch_node_with_retry(node, patch).await
    }

    async fn remove_taint(&self, node: &str, key: &str) -> EngineResult<()> {
        let current = self.read_node(node).await?;
        let taints: Vec<_> = current
            .taints
            .into_iter()
            .filter(|(k, _, _)| k != key)
            .collect();
        let patch = serde_json::json!({
            "apiVersion": "v1",
            "kind": "Node",
            "spec": {
                "taints": taints.iter().map(|(k, v, e)| serde_json::json!({
                    "key": k, "value": v, "effect": e
                })).collect::<Vec<_>>()
            }
        });
        self.patch_node_with_retry(node, patch).await
    }

    async fn set_labels(&self, node: &str, labels: &BTreeMap<String, String>) -> EngineResult<()> {
        let patch = serde_json::json!({
            "apiVersion": "v1",
            "kind": "Node",
            "metadata": { "labels": labels }
        });
        self.patch_node_with_retry(node, patch).await
    }

    async fn remove_labels(&self, node: &str, keys: &[String]) -> EngineResult<()> {
        // Server-side apply can't null out fields it doesn't own; a plain
        // merge patch is what actually deletes keys.
        let nulls: BTreeMap<&String, Option<()>> = keys.iter().map(|k| (k, None)).collect();
        self.nodes()
            .patch(
                node,
                &PatchParams::default(),
                &Patch::Merge(&serde_json::json!({
                    "metadata": { "labels": nulls }
                })),
            )
            .await
            .map(|_| ())
            .map_err(|e| EngineError::PlatformTransient(e.to_string()))
    }

    async fn set_annotations(
        &self,
        node: &str,
        annotations: &BTreeMap<String, String>,
    ) -> EngineResult<()> {
        let patch = serde_json::json!({
            "apiVersion": "v1",
            "kind": "Node",
            "metadata": { "annotations": annotations }
        });
        self.patch_node_with_retry(node, patch).await
    }

    async fn remove_annotations(&self, node: &str, keys: &[String]) -> EngineResult<()> {
        let nulls: BTreeMap<&String, Option<()>> = keys.iter().map(|k| (k, None)).collect();
        self.nodes()
            .patch(
                node,
                &PatchParams::default(),
                &Patch::Merge(&serde_json::json!({
                    "metadata": { "annotations": nulls }
                })),
            )
            .await
            .map(|_| ())
            .map_err(|e| EngineError::PlatformTransient(e.to_string()))
    }

    async fn list_pods_on_node(
        &self,
        node: &str,
        exclude_namespaces: &[String],
    ) -> EngineResult<Vec<PodRef>> {
        let params = ListParams::default().fields(&format!("spec.nodeName={node}"));
        let list = self
            .pods()
            .list(&params)
            .await
            .map_err(|e| EngineError::PlatformTransient(e.to_string()))?;
        let mut pods: Vec<PodRef> = list
            .items
            .into_iter()
            .filter_map(|pod| {
                let namespace = pod.metadata.namespace?;
                if exclude_namespaces.iter().any(|ns| ns == &namespace) {
                    return None;
                }
                Some(PodRef {
                    namespace,
                    name: pod.metadata.name?,
                    phase: pod
                        .status
                        .and_then(|s| s.phase)
                        .unwrap_or_else(|| "Unknown".to_string()),
                })
            })
            .collect();
        pods.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));
        Ok(pods)
    }

    async fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
        grace_period_seconds: i64,
    ) -> EngineResult<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = kube::api::DeleteParams {
            grace_period_seconds: Some(grace_period_seconds as u32),
            ..Default::default()
        };
        match api.delete(name, &params).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => {
                debug!(namespace, name, "pod already gone");
                Ok(())
            }
            Err(kube::Error::Api(e)) if (400..500).contains(&e.code) => {
                Err(EngineError::PlatformFatal(e.message))
            }
            Err(e) => Err(EngineError::PlatformTransient(e.to_string())),
        }
    }

    async fn patch_rule_status(
        &self,
        name: &str,
        status: &NodeGuardianRuleStatus,
    ) -> EngineResult<()> {
        let patch = Patch::Merge(serde_json::json!({ "status": status }));
        self.rules()
            .patch_status(name, &PatchParams::default(), &patch)
            .await
            .map(|_| ())
            .map_err(|e| EngineError::PlatformTransient(e.to_string()))
    }

    fn watch_rules(&self) -> BoxStream<'static, EngineResult<ObjectEvent<NodeGuardianRule>>> {
        use futures::StreamExt;
        use kube_runtime::watcher::{watcher, Config, Event};
        let stream = watcher(self.rules(), Config::default()).map(|result| {
            result
                .map(|event| match event {
                    Event::Applied(obj) => ObjectEvent::Applied(obj),
                    Event::Deleted(obj) => ObjectEvent::Deleted(obj),
                    Event::Restarted(objs) => ObjectEvent::Synchronization(objs),
                })
                .map_err(|e| EngineError::PlatformTransient(e.to_string()))
        });
        Box::pin(stream)
    }

    fn watch_templates(&self) -> BoxStream<'static, EngineResult<ObjectEvent<AlertTemplate>>> {
        use futures::StreamExt;
        use kube_runtime::watcher::{watcher, Config, Event};
        let stream = watcher(self.templates(), Config::default()).map(|result| {
            result
                .map(|event| match event {
                    Event::Applied(obj) => ObjectEvent::Applied(obj),
                    Event::Deleted(obj) => ObjectEvent::Deleted(obj),
                    Event::Restarted(objs) => ObjectEvent::Synchronization(objs),
                })
                .map_err(|e| EngineError::PlatformTransient(e.to_string()))
        });
        Box::pin(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_info_default_has_no_disk_pressure() {
        let info = NodeInfo::default();
        assert!(!info.disk_pressure);
        assert!(info.taints.is_empty());
    }
}
