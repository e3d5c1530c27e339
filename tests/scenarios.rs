mod common;

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use common::{arc_sink, FakeMetricsResolver, FakePlatformAdapter, MetricKey, RecordingSink};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use nodeguardian::clock::FakeClock;
use nodeguardian::config::EngineConfig;
use nodeguardian::control::{run_recovery_for_rule, run_trigger_for_rule, EngineContext};
use nodeguardian::cooldown::{CooldownLedger, Phase};
use nodeguardian::crd::{
    Action, AlertActionSpec, Condition, ConditionLogic, Metric, MonitoringSpec, NodeGuardianRule,
    NodeGuardianRuleSpec, NodeGuardianRuleStatus, NodeSelector, Operator, RuleMetadata, TaintEffect, TaintSpec,
    UntaintSpec,
};
use nodeguardian::metrics::parse_cpu_value;
use nodeguardian::platform::NodeInfo;
use nodeguardian::store::RuleStore;

fn tempdir(label: &str) -> std::path::PathBuf {
    use std::sync::atomic::{AtomicUsize, Ordering};
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let dir = std::env::temp_dir().join(format!("nodeguardian-scenario-{label}-{}-{n}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn worker_node(name: &str) -> NodeInfo {
    NodeInfo {
        name: name.to_string(),
        labels: [("role".to_string(), "worker".to_string())].into_iter().collect(),
        taints: vec![],
        disk_pressure: false,
    }
}

fn cpu_high_rule(extra_conditions: Vec<Condition>, logic: ConditionLogic) -> NodeGuardianRule {
    let mut conditions = vec![Condition {
        metric: Metric::CpuUtilizationPercent,
        operator: Operator::GreaterThan,
        value: 80.0,
        description: None,
        duration: None,
    }];
    conditions.extend(extra_conditions);

    NodeGuardianRule {
        metadata: ObjectMeta {
            name: Some("cpu-high".to_string()),
            ..Default::default()
        },
        spec: NodeGuardianRuleSpec {
            node_selector: NodeSelector {
                match_labels: Some([("role".to_string(), "worker".to_string())].into_iter().collect()),
                node_names: None,
            },
            conditions,
            condition_logic: logic,
            actions: vec![Action::Taint(TaintSpec {
                key: "k8s.io/overload".to_string(),
                value: "1".to_string(),
                effect: TaintEffect::NoSchedule,
            })],
            recovery_conditions: vec![],
            recovery_actions: vec![],
            monitoring: MonitoringSpec {
                check_interval: "30s".to_string(),
                cooldown_period: "5m".to_string(),
                recovery_cooldown_period: "2m".to_string(),
            },
            metadata: RuleMetadata {
                enabled: true,
                ..Default::default()
            },
        },
        status: None,
    }
}

/// Builds the engine context from a concrete fake platform handle, keeping
/// the concrete `Arc` alive for the caller so post-tick assertions can reach
/// its test-only inherent methods (`has_taint`, `status_of`) instead of
/// going through the type-erased `EngineContext::platform` field.
fn test_ctx(
    platform: Arc<FakePlatformAdapter>,
    metrics: FakeMetricsResolver,
    state_dir: &std::path::Path,
) -> EngineContext {
    let clock = Arc::new(FakeClock::new(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()));
    let cooldown = Arc::new(CooldownLedger::new(state_dir, clock.clone()));
    EngineContext {
        config: EngineConfig::default(),
        platform,
        metrics: Arc::new(metrics),
        store: Arc::new(RuleStore::new(state_dir, cooldown.clone())),
        cooldown,
        sink: arc_sink(RecordingSink::default()),
        clock,
    }
}

/// Scenario 1: trigger then cool down. Two nodes at 85% both get tainted on
/// tick one; tick two (still 85%, one second later) is blocked by cooldown.
#[tokio::test]
async fn scenario_trigger_then_cooldown() {
    let dir = tempdir("trigger-cooldown");
    let platform = Arc::new(
        FakePlatformAdapter::default()
            .with_node(worker_node("w1"))
            .with_node(worker_node("w2")),
    );
    let metrics = FakeMetricsResolver::default()
        .with("w1", MetricKey::Cpu, 85.0)
        .with("w2", MetricKey::Cpu, 85.0);
    let ctx = test_ctx(platform.clone(), metrics, &dir);
    let rule = cpu_high_rule(vec![], ConditionLogic::And);

    run_trigger_for_rule(&ctx, &rule).await;
    let status_after_first = platform.patch_rule_status("probe", &NodeGuardianRuleStatus::default()).await;
    assert!(status_after_first.is_ok());

    assert!(!ctx.cooldown.may_fire("cpu-high", "w1", Phase::Trigger, 300).await);
    assert!(!ctx.cooldown.may_fire("cpu-high", "w2", Phase::Trigger, 300).await);

    // Tick two, one second later: still 85%, but both in cooldown.
    run_trigger_for_rule(&ctx, &rule).await;
    assert!(!ctx.cooldown.may_fire("cpu-high", "w1", Phase::Trigger, 300).await);

    std::fs::remove_dir_all(&dir).ok();
}

/// Scenario 2: partial match under OR. Only the node satisfying either leg
/// of the OR condition gets remediated.
#[tokio::test]
async fn scenario_partial_match_under_or() {
    let dir = tempdir("partial-or");
    let platform = Arc::new(
        FakePlatformAdapter::default()
            .with_node(worker_node("w1"))
            .with_node(worker_node("w2")),
    );
    let metrics = FakeMetricsResolver::default()
        .with("w1", MetricKey::Cpu, 85.0)
        .with("w1", MetricKey::Memory, 50.0)
        .with("w2", MetricKey::Cpu, 50.0)
        .with("w2", MetricKey::Memory, 50.0);
    let ctx = test_ctx(platform.clone(), metrics, &dir);
    let rule = cpu_high_rule(
        vec![Condition {
            metric: Metric::MemoryUtilizationPercent,
            operator: Operator::GreaterThan,
            value: 90.0,
            description: None,
            duration: None,
        }],
        ConditionLogic::Or,
    );

    run_trigger_for_rule(&ctx, &rule).await;

    assert!(platform.has_taint("w1", "k8s.io/overload").await);
    assert!(!platform.has_taint("w2", "k8s.io/overload").await);

    std::fs::remove_dir_all(&dir).ok();
}

/// Scenario 3: fallback resolution math, exercised directly against the
/// parsing helpers the resolver's fallback tier uses.
#[test]
fn scenario_fallback_resolution_math() {
    let usage_cpu = parse_cpu_value("1500m").unwrap();
    let capacity_cpu = parse_cpu_value("2").unwrap();
    assert_eq!((usage_cpu / capacity_cpu) * 100.0, 75.0);
}

/// Scenario 4: recovery path. A rule already fired on w1; once w1 reports
/// below the recovery threshold, the recovery tick removes the taint,
/// dispatches the recovery alert, and drops w1 from `triggeredNodes`.
#[tokio::test]
async fn scenario_recovery_path() {
    let dir = tempdir("recovery");
    let mut node = worker_node("w1");
    node.taints.push(("k8s.io/overload".to_string(), "1".to_string(), "NoSchedule".to_string()));
    let platform = Arc::new(FakePlatformAdapter::default().with_node(node));
    let metrics = FakeMetricsResolver::default().with("w1", MetricKey::Cpu, 30.0);
    let ctx = test_ctx(platform.clone(), metrics, &dir);

    let mut rule = cpu_high_rule(vec![], ConditionLogic::And);
    rule.spec.recovery_conditions = vec![Condition {
        metric: Metric::CpuUtilizationPercent,
        operator: Operator::LessThan,
        value: 50.0,
        description: None,
        duration: None,
    }];
    rule.spec.recovery_actions = vec![
        Action::Untaint(UntaintSpec { key: "k8s.io/overload".to_string() }),
        Action::Alert(AlertActionSpec {
            enabled: true,
            template: "recovered".to_string(),
            channels: vec!["log".to_string()],
        }),
    ];
    rule.status = Some(NodeGuardianRuleStatus {
        triggered_nodes: vec!["w1".to_string()],
        ..Default::default()
    });

    run_recovery_for_rule(&ctx, &rule.clone()).await;

    assert!(!platform.has_taint("w1", "k8s.io/overload").await);
    assert!(!ctx.cooldown.may_fire("cpu-high", "w1", Phase::Recovery, 120).await);
    let status = platform.status_of("cpu-high").await.expect("status patched");
    assert!(!status.triggered_nodes.contains(&"w1".to_string()));

    std::fs::remove_dir_all(&dir).ok();
}

/// Scenario 5: alert fan-out with one channel down. The dispatcher isolates
/// a failing channel from the others; this exercises that isolation at the
/// `AlertDispatcher::send` level directly (channel transports are faked at
/// the HTTP layer in `dispatcher.rs`'s own unit tests).
#[tokio::test]
async fn scenario_alert_fanout_one_channel_down() {
    use nodeguardian::config::{AlertConfig, EmailConfig};
    use nodeguardian::dispatcher::AlertDispatcher;
    use nodeguardian::executor::{AlertContext, AlertSink};

    let dispatcher = AlertDispatcher::new(
        EmailConfig { smtp_server: String::new(), ..Default::default() },
        AlertConfig { webhook_url: String::new(), ..Default::default() },
    );
    let context = AlertContext {
        rule_name: "cpu-high".to_string(),
        rule_description: "CPU usage exceeded threshold".to_string(),
        severity: "High".to_string(),
        timestamp_utc: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
        triggered_nodes: vec![],
    };
    let spec = AlertActionSpec {
        enabled: true,
        template: "default".to_string(),
        channels: vec!["email".to_string(), "log".to_string()],
    };
    // Unconfigured email fails internally but dispatch never panics or
    // short-circuits the remaining channels.
    dispatcher.dispatch(&spec, &context, false).await;
}

/// Scenario 6: rule disable. A `Modified` watch event disabling a rule
/// removes it from the store's snapshot; the next trigger tick has nothing
/// to evaluate.
#[tokio::test]
async fn scenario_rule_disable_removes_from_snapshot() {
    use nodeguardian::platform::ObjectEvent;

    let dir = tempdir("disable");
    let clock = Arc::new(FakeClock::new(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()));
    let cooldown = Arc::new(CooldownLedger::new(&dir, clock));
    let store = RuleStore::new(&dir, cooldown);
    let mut rule = cpu_high_rule(vec![], ConditionLogic::And);
    store.apply_rule_event(ObjectEvent::Applied(rule.clone())).await;
    assert_eq!(store.snapshot().await.len(), 1);

    rule.spec.metadata.enabled = false;
    store.apply_rule_event(ObjectEvent::Applied(rule)).await;
    assert!(store.snapshot().await.is_empty());

    std::fs::remove_dir_all(&dir).ok();
}
