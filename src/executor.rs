use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::crd::{Action, AlertActionSpec, EvictSpec, LabelSpec, RemoveAnnotationSpec, RemoveLabelSpec};
use crate::cooldown::{CooldownLedger, Phase};
use crate::platform::PlatformAdapter;

const EVICT_GRACE_PERIOD_SECS: i64 = 30;

/// Per-node metrics snapshot carried into an alert context.
#[derive(Debug, Clone, Default)]
pub struct NodeMetricsSnapshot {
    pub cpu_utilization_percent: Option<f64>,
    pub memory_utilization_percent: Option<f64>,
    pub disk_utilization_percent: Option<f64>,
    pub cpu_load_ratio: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct ProblemPod {
    pub namespace: String,
    pub name: String,
    pub phase: String,
}

#[derive(Debug, Clone)]
pub struct TriggeredNodeContext {
    pub name: String,
    pub metrics: NodeMetricsSnapshot,
    pub problem_pods: Vec<ProblemPod>,
}

/// The context assembled per fire and handed to the Alert Dispatcher.
#[derive(Debug, Clone)]
pub struct AlertContext {
    pub rule_name: String,
    pub rule_description: String,
    pub severity: String,
    pub timestamp_utc: DateTime<Utc>,
    pub triggered_nodes: Vec<TriggeredNodeContext>,
}

/// The narrow capability the executor needs from the dispatcher. Breaks the
/// executor/dispatcher dependency cycle: the executor depends only on this
/// trait, the dispatcher implements it, and the control loop wires a
/// concrete instance in at startup.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn dispatch(&self, action: &AlertActionSpec, context: &AlertContext, is_recovery: bool);
}

/// Applies an ordered action list to a set of triggered nodes. One action
/// failing does not abort the batch; one node failing does not abort other
/// nodes.
pub struct ActionExecutor<'a> {
    platform: &'a dyn PlatformAdapter,
    sink: &'a dyn AlertSink,
}

#[derive(Debug, Default)]
pub struct ExecutionReport {
    pub errors: Vec<String>,
}

impl<'a> ActionExecutor<'a> {
    pub fn new(platform: &'a dyn PlatformAdapter, sink: &'a dyn AlertSink) -> Self {
        ActionExecutor { platform, sink }
    }

    /// Runs `actions` in declared order against every node in `nodes`, for
    /// one rule fire. `context_for` builds the per-node alert context lazily
    /// (only if an `alert` action is present).
    pub async fn execute(
        &self,
        rule_name: &str,
        actions: &[Action],
        nodes: &[String],
        is_recovery: bool,
        context: Option<&AlertContext>,
        ledger: &CooldownLedger,
    ) -> ExecutionReport {
        let mut report = ExecutionReport::default();
        for action in actions {
            for node in nodes {
                if let Err(e) = self.apply_one(rule_name, action, node, is_recovery, context).await
                {
                    warn!(rule = rule_name, node, error = %e, "action failed");
                    report.errors.push(format!("{node}: {e}"));
                }
            }
        }

        if !is_recovery {
            for node in nodes {
                ledger.mark(rule_name, node, Phase::Trigger).await;
            }
        }

        report
    }

    async fn apply_one(
        &self,
        rule_name: &str,
        action: &Action,
        node: &str,
        is_recovery: bool,
        context: Option<&AlertContext>,
    ) -> Result<(), String> {
        match action {
            Action::Taint(spec) => self
                .platform
                .set_taint(node, &spec.key, &spec.value, taint_effect_str(spec.effect))
                .await
                .map_err(|e| e.to_string()),
            Action::Untaint(spec) => self
                .platform
                .remove_taint(node, &spec.key)
                .await
                .map_err(|e| e.to_string()),
            Action::Label(LabelSpec { labels }) => {
                let labels: BTreeMap<String, String> = labels.clone();
                self.platform
                    .set_labels(node, &labels)
                    .await
                    .map_err(|e| e.to_string())
            }
            Action::RemoveLabel(RemoveLabelSpec { keys }) => self
                .platform
                .remove_labels(node, keys)
                .await
                .map_err(|e| e.to_string()),
            Action::Annotation(spec) => self
                .platform
                .set_annotations(node, &spec.annotations)
                .await
                .map_err(|e| e.to_string()),
            Action::RemoveAnnotation(RemoveAnnotationSpec { keys }) => self
                .platform
                .remove_annotations(node, keys)
                .await
                .map_err(|e| e.to_string()),
            Action::Evict(spec) => self.apply_evict(node, spec).await,
            Action::Alert(spec) => {
                self.apply_alert(rule_name, node, spec, is_recovery, context).await;
                Ok(())
            }
        }
    }

    async fn apply_evict(&self, node: &str, spec: &EvictSpec) -> Result<(), String> {
        let pods = self
            .platform
            .list_pods_on_node(node, &spec.exclude_namespaces)
            .await
            .map_err(|e| e.to_string())?;
        let mut evicted = 0u32;
        for pod in pods {
            if evicted >= spec.max_pods {
                break;
            }
            self.platform
                .delete_pod(&pod.namespace, &pod.name, EVICT_GRACE_PERIOD_SECS)
                .await
                .map_err(|e| e.to_string())?;
            info!(node, namespace = %pod.namespace, pod = %pod.name, "pod evicted");
            evicted += 1;
        }
        Ok(())
    }

    async fn apply_alert(
        &self,
        rule_name: &str,
        node: &str,
        spec: &AlertActionSpec,
        is_recovery: bool,
        context: Option<&AlertContext>,
    ) {
        if !spec.enabled {
            return;
        }
        let Some(context) = context else {
            warn!(rule = rule_name, node, "alert action fired with no context assembled");
            return;
        };
        self.sink.dispatch(spec, context, is_recovery).await;
    }
}

fn taint_effect_str(effect: crate::crd::TaintEffect) -> &'static str {
    match effect {
        crate::crd::TaintEffect::NoSchedule => "NoSchedule",
        crate::crd::TaintEffect::PreferNoSchedule => "PreferNoSchedule",
        crate::crd::TaintEffect::NoExecute => "NoExecute",
    }
}
