use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::warn;

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::cooldown::{CooldownLedger, Phase};
use crate::crd::{parse_duration, Action, Metric, NodeGuardianRule, NodeSelector, RulePhase};
use crate::evaluator::ConditionEvaluator;
use crate::executor::{
    ActionExecutor, AlertContext, AlertSink, NodeMetricsSnapshot, ProblemPod, TriggeredNodeContext,
};
use crate::metrics::MetricsResolver;
use crate::platform::{NodeInfo, PlatformAdapter};
use crate::store::SharedRuleStore;

const RECOVERY_TICK: Duration = Duration::from_secs(30);
const MIN_TRIGGER_TICK: Duration = Duration::from_secs(5);
const DEFAULT_TRIGGER_TICK: Duration = Duration::from_secs(30);

/// Everything one engine instance needs, wired once at startup. No
/// module-level mutable state: every collaborator is passed in explicitly.
pub struct EngineContext {
    pub config: EngineConfig,
    pub platform: Arc<dyn PlatformAdapter>,
    pub metrics: Arc<dyn MetricsResolver>,
    pub store: SharedRuleStore,
    pub cooldown: Arc<CooldownLedger>,
    pub sink: Arc<dyn AlertSink>,
    pub clock: Arc<dyn Clock>,
}

/// Readiness flag surfaced by the HTTP server's `/readyz`. Becomes true after
/// the first trigger tick completes.
#[derive(Default)]
pub struct EngineStatus {
    ready: AtomicBool,
}

impl EngineStatus {
    pub fn new() -> Self {
        EngineStatus {
            ready: AtomicBool::new(false),
        }
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

/// Runs the trigger driver, recovery driver, and the two watch consumers
/// until `shutdown` fires, then waits for all four to unwind.
pub async fn run(ctx: Arc<EngineContext>, status: Arc<EngineStatus>, mut shutdown: broadcast::Receiver<()>) {
    let trigger_handle = tokio::spawn(trigger_loop(ctx.clone(), status.clone(), shutdown.resubscribe()));
    let recovery_handle = tokio::spawn(recovery_loop(ctx.clone(), shutdown.resubscribe()));
    let rules_handle = tokio::spawn(watch_rules_loop(ctx.clone(), shutdown.resubscribe()));
    let templates_handle = tokio::spawn(watch_templates_loop(ctx.clone(), shutdown.resubscribe()));

    let _ = shutdown.recv().await;
    let _ = tokio::join!(trigger_handle, recovery_handle, rules_handle, templates_handle);
}

async fn watch_rules_loop(ctx: Arc<EngineContext>, mut shutdown: broadcast::Receiver<()>) {
    let mut stream = ctx.platform.watch_rules();
    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            event = stream.next() => match event {
                Some(Ok(ev)) => ctx.store.apply_rule_event(ev).await,
                Some(Err(e)) => warn!(error = %e, "rule watch stream error"),
                None => return,
            },
        }
    }
}

async fn watch_templates_loop(ctx: Arc<EngineContext>, mut shutdown: broadcast::Receiver<()>) {
    let mut stream = ctx.platform.watch_templates();
    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            event = stream.next() => match event {
                Some(Ok(ev)) => ctx.store.apply_template_event(ev).await,
                Some(Err(e)) => warn!(error = %e, "alert template watch stream error"),
                None => return,
            },
        }
    }
}

/// `min(rule.checkInterval for rule in enabled)`, floored at 5s. With no
/// enabled rules, falls back to a conservative default rather than busy-
/// looping at the floor.
fn compute_trigger_tick(rules: &[NodeGuardianRule]) -> Duration {
    let min_interval = rules
        .iter()
        .filter(|r| r.spec.metadata.enabled)
        .filter_map(|r| parse_duration(&r.spec.monitoring.check_interval).ok())
        .min();
    match min_interval {
        Some(interval) => interval.max(MIN_TRIGGER_TICK),
        None => DEFAULT_TRIGGER_TICK,
    }
}

async fn trigger_loop(ctx: Arc<EngineContext>, status: Arc<EngineStatus>, mut shutdown: broadcast::Receiver<()>) {
    loop {
        let tick = compute_trigger_tick(&ctx.store.snapshot().await);
        tokio::select! {
            _ = shutdown.recv() => return,
            _ = tokio::time::sleep(tick) => {
                let rules = ctx.store.snapshot().await;
                for rule in &rules {
                    run_trigger_for_rule(&ctx, rule).await;
                }
                status.mark_ready();
            }
        }
    }
}

async fn recovery_loop(ctx: Arc<EngineContext>, mut shutdown: broadcast::Receiver<()>) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            _ = tokio::time::sleep(RECOVERY_TICK) => {
                let rules = ctx.store.snapshot().await;
                for rule in &rules {
                    run_recovery_for_rule(&ctx, rule).await;
                }
            }
        }
    }
}

async fn select_nodes(ctx: &EngineContext, selector: &NodeSelector) -> Vec<NodeInfo> {
    if let Some(names) = &selector.node_names {
        let mut nodes = Vec::new();
        for name in names {
            match ctx.platform.read_node(name).await {
                Ok(node) => nodes.push(node),
                Err(e) => warn!(node = name, error = %e, "could not read selected node"),
            }
        }
        nodes
    } else {
        ctx.platform
            .list_nodes(selector.label_selector_expr().as_deref())
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "node listing failed, skipping this tick");
                Vec::new()
            })
    }
}

/// Runs one trigger-evaluation tick for a single rule. Exposed so scenario
/// tests can drive the engine one tick at a time against fake collaborators
/// instead of waiting on the scheduling loop's real timers.
pub async fn run_trigger_for_rule(ctx: &EngineContext, rule: &NodeGuardianRule) {
    let Some(name) = rule.metadata.name.clone() else {
        return;
    };
    if !rule.spec.metadata.enabled {
        return;
    }
    let Ok(period) = parse_duration(&rule.spec.monitoring.cooldown_period) else {
        warn!(rule = %name, "invalid cooldownPeriod, skipping tick");
        return;
    };
    let period_secs = period.as_secs() as i64;

    let nodes = select_nodes(ctx, &rule.spec.node_selector).await;
    let evaluator = ConditionEvaluator::new(ctx.metrics.as_ref());
    let max_concurrent = ctx.config.monitoring.max_concurrent_checks.max(1);

    let mut candidates: Vec<NodeInfo> = Vec::new();
    for chunk in nodes.chunks(max_concurrent) {
        let chunk_futures = chunk.iter().cloned().map(|node| {
            let evaluator = &evaluator;
            let name = &name;
            async move {
                if !ctx.cooldown.may_fire(name, &node.name, Phase::Trigger, period_secs).await {
                    return None;
                }
                if evaluator
                    .evaluate(&rule.spec.conditions, rule.spec.condition_logic, &node)
                    .await
                {
                    Some(node)
                } else {
                    None
                }
            }
        });
        candidates.extend(futures::future::join_all(chunk_futures).await.into_iter().flatten());
    }

    if candidates.is_empty() {
        return;
    }

    let node_names: Vec<String> = candidates.iter().map(|n| n.name.clone()).collect();
    let context = build_alert_context(ctx, &name, rule, &candidates, false).await;
    let executor = ActionExecutor::new(ctx.platform.as_ref(), ctx.sink.as_ref());
    let report = executor
        .execute(&name, &rule.spec.actions, &node_names, false, context.as_ref(), &ctx.cooldown)
        .await;

    let mut status = rule.status.clone().unwrap_or_default();
    status.phase = RulePhase::Active;
    for node_name in &node_names {
        if !status.triggered_nodes.contains(node_name) {
            status.triggered_nodes.push(node_name.clone());
        }
    }
    status.last_triggered = Some(ctx.clock.now().to_rfc3339());
    status.last_error = if report.errors.is_empty() {
        None
    } else {
        Some(report.errors.join("; "))
    };
    if let Err(e) = ctx.platform.patch_rule_status(&name, &status).await {
        warn!(rule = %name, error = %e, "failed to patch rule status after trigger");
    }
}

/// Runs one recovery-evaluation tick for a single rule. See
/// [`run_trigger_for_rule`].
pub async fn run_recovery_for_rule(ctx: &EngineContext, rule: &NodeGuardianRule) {
    if rule.spec.recovery_conditions.is_empty() {
        return;
    }
    let Some(name) = rule.metadata.name.clone() else {
        return;
    };
    let triggered_nodes: Vec<String> = rule
        .status
        .as_ref()
        .map(|s| s.triggered_nodes.clone())
        .unwrap_or_default();
    if triggered_nodes.is_empty() {
        return;
    }
    let Ok(period) = parse_duration(&rule.spec.monitoring.recovery_cooldown_period) else {
        warn!(rule = %name, "invalid recoveryCooldownPeriod, skipping recovery tick");
        return;
    };
    let period_secs = period.as_secs() as i64;

    let evaluator = ConditionEvaluator::new(ctx.metrics.as_ref());
    let mut recovered_nodes: Vec<NodeInfo> = Vec::new();
    for node_name in &triggered_nodes {
        if !ctx.cooldown.may_fire(&name, node_name, Phase::Recovery, period_secs).await {
            continue;
        }
        let Ok(node) = ctx.platform.read_node(node_name).await else {
            continue;
        };
        if evaluator
            .evaluate(&rule.spec.recovery_conditions, rule.spec.condition_logic, &node)
            .await
        {
            recovered_nodes.push(node);
        }
    }

    if recovered_nodes.is_empty() {
        return;
    }

    let recovered_names: Vec<String> = recovered_nodes.iter().map(|n| n.name.clone()).collect();
    let context = build_alert_context(ctx, &name, rule, &recovered_nodes, true).await;
    let executor = ActionExecutor::new(ctx.platform.as_ref(), ctx.sink.as_ref());
    let report = executor
        .execute(&name, &rule.spec.recovery_actions, &recovered_names, true, context.as_ref(), &ctx.cooldown)
        .await;
    for node_name in &recovered_names {
        ctx.cooldown.mark(&name, node_name, Phase::Recovery).await;
    }

    let mut status = rule.status.clone().unwrap_or_default();
    status.triggered_nodes.retain(|n| !recovered_names.contains(n));
    status.last_recovery = Some(ctx.clock.now().to_rfc3339());
    status.last_error = if report.errors.is_empty() {
        None
    } else {
        Some(report.errors.join("; "))
    };
    if let Err(e) = ctx.platform.patch_rule_status(&name, &status).await {
        warn!(rule = %name, error = %e, "failed to patch rule status after recovery");
    }
}

/// Builds the alert-fan-out context only when the fired action list actually
/// carries an `alert` action — metric resolution and pod listing for the
/// context are real work, not worth doing otherwise.
async fn build_alert_context(
    ctx: &EngineContext,
    rule_name: &str,
    rule: &NodeGuardianRule,
    nodes: &[NodeInfo],
    is_recovery: bool,
) -> Option<AlertContext> {
    let actions = if is_recovery {
        &rule.spec.recovery_actions
    } else {
        &rule.spec.actions
    };
    if !actions.iter().any(|a| matches!(a, Action::Alert(_))) {
        return None;
    }

    let mut triggered_nodes = Vec::new();
    for node in nodes {
        let metrics = NodeMetricsSnapshot {
            cpu_utilization_percent: ctx.metrics.resolve(node, Metric::CpuUtilizationPercent).await,
            memory_utilization_percent: ctx.metrics.resolve(node, Metric::MemoryUtilizationPercent).await,
            disk_utilization_percent: ctx.metrics.resolve(node, Metric::DiskUtilizationPercent).await,
            cpu_load_ratio: ctx.metrics.resolve(node, Metric::CpuLoadRatio).await,
        };
        let problem_pods = ctx
            .platform
            .list_pods_on_node(&node.name, &[])
            .await
            .unwrap_or_default()
            .into_iter()
            .filter(|p| p.phase != "Running")
            .take(5)
            .map(|p| ProblemPod {
                namespace: p.namespace,
                name: p.name,
                phase: p.phase,
            })
            .collect();
        triggered_nodes.push(TriggeredNodeContext {
            name: node.name.clone(),
            metrics,
            problem_pods,
        });
    }

    Some(AlertContext {
        rule_name: rule_name.to_string(),
        rule_description: rule.spec.metadata.description.clone().unwrap_or_default(),
        severity: format!("{:?}", rule.spec.metadata.severity),
        timestamp_utc: ctx.clock.now(),
        triggered_nodes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{MonitoringSpec, NodeGuardianRuleSpec, RuleMetadata};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn rule_with_interval(interval: &str, enabled: bool) -> NodeGuardianRule {
        NodeGuardianRule {
            metadata: ObjectMeta::default(),
            spec: NodeGuardianRuleSpec {
                monitoring: MonitoringSpec {
                    check_interval: interval.to_string(),
                    ..Default::default()
                },
                metadata: RuleMetadata {
                    enabled,
                    ..Default::default()
                },
                ..Default::default()
            },
            status: None,
        }
    }

    #[test]
    fn test_compute_trigger_tick_floors_at_five_seconds() {
        let rules = vec![rule_with_interval("1s", true)];
        assert_eq!(compute_trigger_tick(&rules), Duration::from_secs(5));
    }

    #[test]
    fn test_compute_trigger_tick_uses_min_of_enabled_rules() {
        let rules = vec![rule_with_interval("60s", true), rule_with_interval("15s", true)];
        assert_eq!(compute_trigger_tick(&rules), Duration::from_secs(15));
    }

    #[test]
    fn test_compute_trigger_tick_ignores_disabled_rules() {
        let rules = vec![rule_with_interval("10s", false), rule_with_interval("20s", true)];
        assert_eq!(compute_trigger_tick(&rules), Duration::from_secs(20));
    }

    #[test]
    fn test_compute_trigger_tick_defaults_with_no_enabled_rules() {
        let rules: Vec<NodeGuardianRule> = vec![];
        assert_eq!(compute_trigger_tick(&rules), DEFAULT_TRIGGER_TICK);
    }

    #[test]
    fn test_engine_status_starts_not_ready() {
        let status = EngineStatus::new();
        assert!(!status.is_ready());
        status.mark_ready();
        assert!(status.is_ready());
    }
}
