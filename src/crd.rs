use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{EngineError, EngineResult};

/* ============================= METRICS & OPERATORS ============================= */

/// A metric NodeGuardian knows how to resolve for a node.
///
/// Closed set — an unknown value fails rule validation at ingest rather than
/// at evaluation time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum Metric {
    CpuUtilizationPercent,
    MemoryUtilizationPercent,
    DiskUtilizationPercent,
    CpuLoadRatio,
}

impl Metric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::CpuUtilizationPercent => "cpuUtilizationPercent",
            Metric::MemoryUtilizationPercent => "memoryUtilizationPercent",
            Metric::DiskUtilizationPercent => "diskUtilizationPercent",
            Metric::CpuLoadRatio => "cpuLoadRatio",
        }
    }
}

/// Comparison operator applied to a resolved metric against a threshold.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum Operator {
    #[serde(rename = "GT")]
    GreaterThan,
    #[serde(rename = "GE")]
    GreaterThanOrEqual,
    #[serde(rename = "LT")]
    LessThan,
    #[serde(rename = "LE")]
    LessThanOrEqual,
    #[serde(rename = "EQ")]
    EqualTo,
    #[serde(rename = "NE")]
    NotEqualTo,
}

/// Absolute tolerance for `EQ`/`NE` comparisons.
pub const EQUALITY_TOLERANCE: f64 = 1e-3;

impl Operator {
    pub fn apply(&self, value: f64, threshold: f64) -> bool {
        match self {
            Operator::GreaterThan => value > threshold,
            Operator::GreaterThanOrEqual => value >= threshold,
            Operator::LessThan => value < threshold,
            Operator::LessThanOrEqual => value <= threshold,
            Operator::EqualTo => (value - threshold).abs() < EQUALITY_TOLERANCE,
            Operator::NotEqualTo => (value - threshold).abs() >= EQUALITY_TOLERANCE,
        }
    }
}

/// How a rule's condition list combines into a single verdict.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConditionLogic {
    #[default]
    And,
    Or,
}

/// A single `(metric, operator, threshold)` condition.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub metric: Metric,
    pub operator: Operator,
    pub value: f64,

    /// Sustained-breach window. Parsed with the duration grammar; not yet
    /// enforced as a sliding window by the evaluator (single-sample today).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/* ============================= ACTIONS ============================= */

/// Taint effect, mirroring the platform's node-taint vocabulary.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum TaintEffect {
    NoSchedule,
    PreferNoSchedule,
    NoExecute,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaintSpec {
    pub key: String,
    pub value: String,
    pub effect: TaintEffect,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UntaintSpec {
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LabelSpec {
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RemoveLabelSpec {
    pub keys: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AnnotationSpec {
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RemoveAnnotationSpec {
    pub keys: Vec<String>,
}

fn default_max_pods() -> u32 {
    10
}

fn default_exclude_namespaces() -> Vec<String> {
    vec!["kube-system".to_string(), "kube-public".to_string()]
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EvictSpec {
    #[serde(default = "default_max_pods")]
    pub max_pods: u32,
    #[serde(default = "default_exclude_namespaces")]
    pub exclude_namespaces: Vec<String>,
}

impl Default for EvictSpec {
    fn default() -> Self {
        EvictSpec {
            max_pods: default_max_pods(),
            exclude_namespaces: default_exclude_namespaces(),
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AlertActionSpec {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub template: String,
    #[serde(default)]
    pub channels: Vec<String>,
}

/// A single remediation or recovery action.
///
/// Each variant carries its own payload schema; unrecognized tags fail
/// `serde` deserialization at rule ingest rather than being matched on at
/// fire time.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Action {
    Taint(TaintSpec),
    Untaint(UntaintSpec),
    Label(LabelSpec),
    RemoveLabel(RemoveLabelSpec),
    Annotation(AnnotationSpec),
    RemoveAnnotation(RemoveAnnotationSpec),
    Evict(EvictSpec),
    Alert(AlertActionSpec),
}

/* ============================= NODE SELECTOR ============================= */

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct NodeSelector {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_labels: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_names: Option<Vec<String>>,
}

impl NodeSelector {
    /// The platform's label-selector wire form, `k1=v1,k2=v2`, with keys in
    /// lexicographic order so the generated expression is stable.
    pub fn label_selector_expr(&self) -> Option<String> {
        let labels = self.match_labels.as_ref()?;
        if labels.is_empty() {
            return None;
        }
        let mut pairs: Vec<String> = labels.iter().map(|(k, v)| format!("{k}={v}")).collect();
        pairs.sort();
        Some(pairs.join(","))
    }
}

/* ============================= MONITORING & METADATA ============================= */

fn default_check_interval() -> String {
    "30s".to_string()
}

fn default_cooldown_period() -> String {
    "5m".to_string()
}

fn default_recovery_cooldown_period() -> String {
    "2m".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringSpec {
    #[serde(default = "default_check_interval")]
    pub check_interval: String,
    #[serde(default = "default_cooldown_period")]
    pub cooldown_period: String,
    #[serde(default = "default_recovery_cooldown_period")]
    pub recovery_cooldown_period: String,
}

impl Default for MonitoringSpec {
    fn default() -> Self {
        MonitoringSpec {
            check_interval: default_check_interval(),
            cooldown_period: default_cooldown_period(),
            recovery_cooldown_period: default_recovery_cooldown_period(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum Severity {
    Critical,
    High,
    #[default]
    Medium,
    Low,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct RuleMetadata {
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/* ============================= NodeGuardianRule ============================= */

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "nodeguardian.io",
    version = "v1",
    kind = "NodeGuardianRule",
    plural = "nodeguardianrules",
    status = "NodeGuardianRuleStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct NodeGuardianRuleSpec {
    #[serde(default)]
    pub node_selector: NodeSelector,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub condition_logic: ConditionLogic,
    #[serde(default)]
    pub actions: Vec<Action>,
    #[serde(default)]
    pub recovery_conditions: Vec<Condition>,
    #[serde(default)]
    pub recovery_actions: Vec<Action>,
    #[serde(default)]
    pub monitoring: MonitoringSpec,
    #[serde(default)]
    pub metadata: RuleMetadata,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase")]
pub enum RulePhase {
    #[default]
    Active,
    Invalid,
    Inactive,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct NodeGuardianRuleStatus {
    #[serde(default)]
    pub phase: RulePhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_triggered: Option<String>,
    #[serde(default)]
    pub triggered_nodes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_recovery: Option<String>,
}

/* ============================= AlertTemplate ============================= */

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChannelRef {
    pub channel_type: String,
}

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "nodeguardian.io",
    version = "v1",
    kind = "AlertTemplate",
    plural = "alerttemplates"
)]
#[serde(rename_all = "camelCase")]
pub struct AlertTemplateSpec {
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub channels: Vec<String>,
}

/* ============================= DURATION GRAMMAR ============================= */

/// Parses the `<int>[s|m|h|d]` grammar. No compound forms (`1h30m` is invalid).
pub fn parse_duration(raw: &str) -> Result<std::time::Duration, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err("empty duration".to_string());
    }
    let (digits, unit) = raw.split_at(raw.len() - 1);
    let (digits, unit) = if unit.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        (raw, "s")
    } else {
        (digits, unit)
    };
    let amount: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration: {raw}"))?;
    let seconds = match unit {
        "s" => amount,
        "m" => amount * 60,
        "h" => amount * 3600,
        "d" => amount * 86400,
        other => return Err(format!("unknown duration unit: {other}")),
    };
    Ok(std::time::Duration::from_secs(seconds))
}

/// Validates the rule invariants the schema can't express: durations parse
/// and sit in a sane order, and there's at least one trigger condition.
/// Shared by rule ingest (`RuleStore::upsert_rule`) and the `nodeguardian
/// check` dry run so both paths reject the same rules the same way.
pub fn validate_rule_spec(spec: &NodeGuardianRuleSpec) -> EngineResult<()> {
    let check_interval = parse_duration(&spec.monitoring.check_interval)
        .map_err(|e| EngineError::Config(format!("checkInterval: {e}")))?;
    if check_interval.as_secs() < 1 {
        return Err(EngineError::Config("checkInterval must be at least 1s".to_string()));
    }
    let cooldown = parse_duration(&spec.monitoring.cooldown_period)
        .map_err(|e| EngineError::Config(format!("cooldownPeriod: {e}")))?;
    if cooldown < check_interval {
        return Err(EngineError::Config("cooldownPeriod must be >= checkInterval".to_string()));
    }
    parse_duration(&spec.monitoring.recovery_cooldown_period)
        .map_err(|e| EngineError::Config(format!("recoveryCooldownPeriod: {e}")))?;
    if spec.conditions.is_empty() {
        return Err(EngineError::Config("no trigger conditions configured".to_string()));
    }
    Ok(())
}
