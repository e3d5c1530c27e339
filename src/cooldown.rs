use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

use crate::clock::Clock;

/// The phase a cooldown entry is keyed on. Trigger and recovery cooldowns
/// are tracked independently per `(rule, node)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Trigger,
    Recovery,
}

impl Phase {
    fn file_suffix(&self) -> &'static str {
        match self {
            Phase::Trigger => "",
            Phase::Recovery => "_recovery",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Key {
    rule: String,
    node: String,
    phase: Phase,
}

/// Per-(rule, node, phase) last-fire timestamps, backed by an on-disk
/// mirror. The sole authority for "is this rule cooling down on this node".
///
/// `may_fire` takes `period` as an explicit parameter rather than reading it
/// from anywhere implicit — the source this was distilled from read an
/// out-of-scope free variable here, which is the bug this signature fixes.
pub struct CooldownLedger {
    entries: Mutex<HashMap<Key, i64>>,
    state_dir: PathBuf,
    clock: Arc<dyn Clock>,
}

impl CooldownLedger {
    pub fn new(state_dir: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        let state_dir = state_dir.into();
        let entries = load_from_disk(&state_dir.join("cooldown"));
        CooldownLedger {
            entries: Mutex::new(entries),
            state_dir,
            clock,
        }
    }

    fn cooldown_dir(&self) -> PathBuf {
        self.state_dir.join("cooldown")
    }

    /// True iff no entry exists for `(rule, node, phase)` or the time since
    /// the last `mark` is `>= period`.
    pub async fn may_fire(&self, rule: &str, node: &str, phase: Phase, period_secs: i64) -> bool {
        let key = Key {
            rule: rule.to_string(),
            node: node.to_string(),
            phase,
        };
        let entries = self.entries.lock().await;
        match entries.get(&key) {
            None => true,
            Some(&last) => self.clock.now().timestamp() - last >= period_secs,
        }
    }

    /// Records that `(rule, node, phase)` fired now.
    pub async fn mark(&self, rule: &str, node: &str, phase: Phase) {
        let now = self.clock.now().timestamp();
        let key = Key {
            rule: rule.to_string(),
            node: node.to_string(),
            phase,
        };
        self.entries.lock().await.insert(key.clone(), now);
        if let Err(e) = persist_entry(&self.cooldown_dir(), &key, now) {
            warn!(rule, node, ?phase, error = %e, "failed to persist cooldown mark");
        }
    }

    /// Clears every cooldown entry for `rule` (both phases, all nodes) —
    /// used when a rule is disabled or deleted.
    pub async fn clear_rule(&self, rule: &str) {
        let mut entries = self.entries.lock().await;
        entries.retain(|k, _| k.rule != rule);
        let dir = self.cooldown_dir();
        let Ok(read_dir) = std::fs::read_dir(&dir) else {
            return;
        };
        let prefix = format!("{rule}_");
        for entry in read_dir.flatten() {
            if entry
                .file_name()
                .to_str()
                .is_some_and(|n| n.starts_with(&prefix))
            {
                let _ = std::fs::remove_file(entry.path());
            }
        }
    }
}

fn file_name(key: &Key) -> String {
    format!("{}{}_{}", key.rule, key.phase.file_suffix(), key.node)
}

fn persist_entry(dir: &Path, key: &Key, timestamp: i64) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let name = file_name(key);
    let tmp_path = dir.join(format!("{name}.tmp"));
    let final_path = dir.join(name);
    std::fs::write(&tmp_path, format!("{:.6}", timestamp as f64))?;
    std::fs::rename(&tmp_path, &final_path)
}

fn load_from_disk(dir: &Path) -> HashMap<Key, i64> {
    let mut entries = HashMap::new();
    let Ok(read_dir) = std::fs::read_dir(dir) else {
        return entries;
    };
    for entry in read_dir.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.ends_with(".tmp") {
            continue;
        }
        let Ok(raw) = std::fs::read_to_string(entry.path()) else {
            continue;
        };
        let Ok(timestamp) = raw.trim().parse::<f64>() else {
            continue;
        };
        let timestamp = timestamp as i64;
        if let Some(key) = parse_file_name(&name) {
            entries.insert(key, timestamp);
        }
    }
    entries
}

fn parse_file_name(name: &str) -> Option<Key> {
    if let Some(rest) = name.find("_recovery_").map(|i| (i, "_recovery_")) {
        let (idx, marker) = rest;
        let rule = name[..idx].to_string();
        let node = name[idx + marker.len()..].to_string();
        return Some(Key {
            rule,
            node,
            phase: Phase::Recovery,
        });
    }
    let idx = name.find('_')?;
    Some(Key {
        rule: name[..idx].to_string(),
        node: name[idx + 1..].to_string(),
        phase: Phase::Trigger,
    })
}
