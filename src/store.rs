use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::cooldown::CooldownLedger;
use crate::crd::{validate_rule_spec, AlertTemplate, NodeGuardianRule, NodeGuardianRuleStatus, RulePhase};
use crate::platform::{ObjectEvent, PlatformAdapter};

/// In-memory catalog of rules and alert templates, populated by watch
/// events and mirrored to disk for crash restart. All mutations serialize
/// through a single writer (the `RwLock` write half); evaluation ticks take
/// an immutable snapshot via the read half.
pub struct RuleStore {
    rules: RwLock<BTreeMap<String, NodeGuardianRule>>,
    templates: RwLock<BTreeMap<String, AlertTemplate>>,
    state_dir: PathBuf,
    cooldown: Arc<CooldownLedger>,
    platform: Option<Arc<dyn PlatformAdapter>>,
}

impl RuleStore {
    pub fn new(state_dir: impl Into<PathBuf>, cooldown: Arc<CooldownLedger>) -> Self {
        RuleStore {
            rules: RwLock::new(BTreeMap::new()),
            templates: RwLock::new(BTreeMap::new()),
            state_dir: state_dir.into(),
            cooldown,
            platform: None,
        }
    }

    /// Wires a platform handle so an invalid rule's `status.phase` can be
    /// patched back to the live object. Without one, rejection is still
    /// enforced locally (the rule never enters the live index) but the
    /// object itself isn't updated.
    pub fn with_platform(mut self, platform: Arc<dyn PlatformAdapter>) -> Self {
        self.platform = Some(platform);
        self
    }

    fn rules_dir(&self) -> PathBuf {
        self.state_dir.join("rules")
    }

    /// An immutable copy of the active, enabled rule set for one evaluation
    /// tick.
    pub async fn snapshot(&self) -> Vec<NodeGuardianRule> {
        self.rules.read().await.values().cloned().collect()
    }

    pub async fn get_template(&self, name: &str) -> Option<AlertTemplate> {
        self.templates.read().await.get(name).cloned()
    }

    fn rule_name(rule: &NodeGuardianRule) -> Option<String> {
        rule.metadata.name.clone()
    }

    fn template_name(template: &AlertTemplate) -> Option<String> {
        template.metadata.name.clone()
    }

    async fn upsert_rule(&self, rule: NodeGuardianRule) {
        let Some(name) = Self::rule_name(&rule) else {
            warn!("ignoring rule with no name");
            return;
        };
        if !rule.spec.metadata.enabled {
            self.remove_rule(&name).await;
            return;
        }
        if let Err(e) = validate_rule_spec(&rule.spec) {
            warn!(rule = %name, error = %e, "rejecting invalid rule, not adding to live index");
            self.remove_rule(&name).await;
            self.mark_invalid(&name, &e.to_string()).await;
            return;
        }
        if let Err(e) = persist_rule(&self.rules_dir(), &name, &rule) {
            warn!(rule = %name, error = %e, "failed to persist rule mirror");
        }
        info!(rule = %name, "rule registered");
        self.rules.write().await.insert(name, rule);
    }

    /// Best-effort: patches `status.phase = Invalid` / `lastError` back to
    /// the live object. A failure here is logged, not propagated — the rule
    /// is already kept out of the live index regardless of whether the
    /// status patch lands.
    async fn mark_invalid(&self, name: &str, reason: &str) {
        let Some(platform) = &self.platform else {
            return;
        };
        let status = NodeGuardianRuleStatus {
            phase: RulePhase::Invalid,
            last_error: Some(reason.to_string()),
            ..Default::default()
        };
        if let Err(e) = platform.patch_rule_status(name, &status).await {
            warn!(rule = %name, error = %e, "failed to patch invalid rule status");
        }
    }

    async fn remove_rule(&self, name: &str) {
        self.rules.write().await.remove(name);
        let _ = std::fs::remove_file(self.rules_dir().join(format!("{name}.json")));
        self.cooldown.clear_rule(name).await;
        info!(rule = %name, "rule unregistered");
    }

    async fn upsert_template(&self, template: AlertTemplate) {
        let Some(name) = Self::template_name(&template) else {
            warn!("ignoring alert template with no name");
            return;
        };
        self.templates.write().await.insert(name, template);
    }

    async fn remove_template(&self, name: &str) {
        self.templates.write().await.remove(name);
    }

    /// Applies one watch event to the rule index.
    pub async fn apply_rule_event(&self, event: ObjectEvent<NodeGuardianRule>) {
        match event {
            ObjectEvent::Applied(rule) => self.upsert_rule(rule).await,
            ObjectEvent::Deleted(rule) => {
                if let Some(name) = Self::rule_name(&rule) {
                    self.remove_rule(&name).await;
                }
            }
            ObjectEvent::Synchronization(rules) => {
                let seen: Vec<String> = rules.iter().filter_map(Self::rule_name).collect();
                let stale: Vec<String> = {
                    let current = self.rules.read().await;
                    current
                        .keys()
                        .filter(|k| !seen.contains(k))
                        .cloned()
                        .collect()
                };
                for name in stale {
                    self.remove_rule(&name).await;
                }
                for rule in rules {
                    self.upsert_rule(rule).await;
                }
            }
        }
    }

    /// Applies one watch event to the template index.
    pub async fn apply_template_event(&self, event: ObjectEvent<AlertTemplate>) {
        match event {
            ObjectEvent::Applied(template) => self.upsert_template(template).await,
            ObjectEvent::Deleted(template) => {
                if let Some(name) = Self::template_name(&template) {
                    self.remove_template(&name).await;
                }
            }
            ObjectEvent::Synchronization(templates) => {
                let seen: Vec<String> = templates.iter().filter_map(Self::template_name).collect();
                let stale: Vec<String> = {
                    let current = self.templates.read().await;
                    current
                        .keys()
                        .filter(|k| !seen.contains(k))
                        .cloned()
                        .collect()
                };
                for name in stale {
                    self.remove_template(&name).await;
                }
                for template in templates {
                    self.upsert_template(template).await;
                }
            }
        }
    }
}

fn persist_rule(dir: &Path, name: &str, rule: &NodeGuardianRule) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let final_path = dir.join(format!("{name}.json"));
    let tmp_path = dir.join(format!("{name}.json.tmp"));
    let json = serde_json::to_vec_pretty(rule)?;
    std::fs::write(&tmp_path, json)?;
    std::fs::rename(&tmp_path, &final_path)
}

pub type SharedRuleStore = Arc<RuleStore>;
