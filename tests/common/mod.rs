use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::sync::Mutex;

use nodeguardian::crd::{AlertActionSpec, AlertTemplate, Metric, NodeGuardianRule, NodeGuardianRuleStatus};
use nodeguardian::error::EngineResult;
use nodeguardian::executor::{AlertContext, AlertSink};
use nodeguardian::metrics::MetricsResolver;
use nodeguardian::platform::{NodeInfo, ObjectEvent, PlatformAdapter, PodRef};

/// An in-memory stand-in for the orchestration platform. Taint/label/
/// annotation mutations are applied to the held node so a later evaluation
/// tick in the same test observes the post-remediation state.
#[derive(Default)]
pub struct FakePlatformAdapter {
    pub nodes: Mutex<BTreeMap<String, NodeInfo>>,
    pub pods: Mutex<BTreeMap<String, Vec<PodRef>>>,
    pub deleted_pods: Mutex<Vec<(String, String)>>,
    pub statuses: Mutex<BTreeMap<String, NodeGuardianRuleStatus>>,
}

impl FakePlatformAdapter {
    pub fn with_node(self, node: NodeInfo) -> Self {
        self.nodes.try_lock().unwrap().insert(node.name.clone(), node);
        self
    }

    pub async fn status_of(&self, rule: &str) -> Option<NodeGuardianRuleStatus> {
        self.statuses.lock().await.get(rule).cloned()
    }

    pub async fn has_taint(&self, node: &str, key: &str) -> bool {
        self.nodes
            .lock()
            .await
            .get(node)
            .is_some_and(|n| n.taints.iter().any(|(k, _, _)| k == key))
    }
}

fn selector_matches(labels: &BTreeMap<String, String>, selector: &str) -> bool {
    selector.split(',').all(|pair| {
        let Some((k, v)) = pair.split_once('=') else {
            return false;
        };
        labels.get(k).map(|existing| existing == v).unwrap_or(false)
    })
}

#[async_trait]
impl PlatformAdapter for FakePlatformAdapter {
    async fn list_nodes(&self, label_selector: Option<&str>) -> EngineResult<Vec<NodeInfo>> {
        let nodes = self.nodes.lock().await;
        Ok(match label_selector {
            Some(sel) => nodes.values().filter(|n| selector_matches(&n.labels, sel)).cloned().collect(),
            None => nodes.values().cloned().collect(),
        })
    }

    async fn read_node(&self, name: &str) -> EngineResult<NodeInfo> {
        self.nodes
            .lock()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| nodeguardian::error::EngineError::PlatformFatal(format!("no such node {name}")))
    }

    async fn set_taint(&self, node: &str, key: &str, value: &str, effect: &str) -> EngineResult<()> {
        if let Some(n) = self.nodes.lock().await.get_mut(node) {
            n.taints.retain(|(k, _, _)| k != key);
            n.taints.push((key.to_string(), value.to_string(), effect.to_string()));
        }
        Ok(())
    }

    async fn remove_taint(&self, node: &str, key: &str) -> EngineResult<()> {
        if let Some(n) = self.nodes.lock().await.get_mut(node) {
            n.taints.retain(|(k, _, _)| k != key);
        }
        Ok(())
    }

    async fn set_labels(&self, node: &str, labels: &BTreeMap<String, String>) -> EngineResult<()> {
        if let Some(n) = self.nodes.lock().await.get_mut(node) {
            n.labels.extend(labels.clone());
        }
        Ok(())
    }

    async fn remove_labels(&self, node: &str, keys: &[String]) -> EngineResult<()> {
        if let Some(n) = self.nodes.lock().await.get_mut(node) {
            for key in keys {
                n.labels.remove(key);
            }
        }
        Ok(())
    }

    async fn set_annotations(&self, _node: &str, _annotations: &BTreeMap<String, String>) -> EngineResult<()> {
        Ok(())
    }

    async fn remove_annotations(&self, _node: &str, _keys: &[String]) -> EngineResult<()> {
        Ok(())
    }

    async fn list_pods_on_node(&self, node: &str, exclude_namespaces: &[String]) -> EngineResult<Vec<PodRef>> {
        Ok(self
            .pods
            .lock()
            .await
            .get(node)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|p| !exclude_namespaces.contains(&p.namespace))
            .collect())
    }

    async fn delete_pod(&self, namespace: &str, name: &str, _grace_period_seconds: i64) -> EngineResult<()> {
        self.deleted_pods.lock().await.push((namespace.to_string(), name.to_string()));
        Ok(())
    }

    async fn patch_rule_status(&self, name: &str, status: &NodeGuardianRuleStatus) -> EngineResult<()> {
        self.statuses.lock().await.insert(name.to_string(), status.clone());
        Ok(())
    }

    fn watch_rules(&self) -> BoxStream<'static, EngineResult<ObjectEvent<NodeGuardianRule>>> {
        Box::pin(futures::stream::empty())
    }

    fn watch_templates(&self) -> BoxStream<'static, EngineResult<ObjectEvent<AlertTemplate>>> {
        Box::pin(futures::stream::empty())
    }
}

/// A metrics resolver backed by a fixed lookup table, for scenarios that
/// need specific per-node metric readings without a live time-series store.
#[derive(Default)]
pub struct FakeMetricsResolver {
    pub values: std::collections::HashMap<(String, MetricKey), f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricKey {
    Cpu,
    Memory,
    Disk,
    Load,
}

impl FakeMetricsResolver {
    pub fn with(mut self, node: &str, metric: MetricKey, value: f64) -> Self {
        self.values.insert((node.to_string(), metric), value);
        self
    }
}

#[async_trait]
impl MetricsResolver for FakeMetricsResolver {
    async fn resolve(&self, node: &NodeInfo, metric: Metric) -> Option<f64> {
        let key = match metric {
            Metric::CpuUtilizationPercent => MetricKey::Cpu,
            Metric::MemoryUtilizationPercent => MetricKey::Memory,
            Metric::DiskUtilizationPercent => MetricKey::Disk,
            Metric::CpuLoadRatio => MetricKey::Load,
        };
        self.values.get(&(node.name.clone(), key)).copied()
    }
}

/// Records every dispatch without sending anything, so scenario tests can
/// assert fan-out happened without standing up real channels.
#[derive(Default)]
pub struct RecordingSink {
    pub dispatches: Mutex<Vec<(String, bool)>>,
}

#[async_trait]
impl AlertSink for RecordingSink {
    async fn dispatch(&self, spec: &AlertActionSpec, context: &AlertContext, is_recovery: bool) {
        self.dispatches
            .lock()
            .await
            .push((format!("{}:{}", spec.template, context.rule_name), is_recovery));
    }
}

pub fn arc_sink(sink: RecordingSink) -> Arc<dyn AlertSink> {
    Arc::new(sink)
}
