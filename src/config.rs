use serde::{Deserialize, Serialize};
use std::path::Path;

fn default_smtp_port() -> u16 {
    587
}

fn default_true() -> bool {
    true
}

fn default_prometheus_timeout_secs() -> u64 {
    10
}

fn default_metrics_server_url() -> String {
    "https://kubernetes.default.svc".to_string()
}

fn default_max_concurrent_checks() -> usize {
    10
}

fn default_webhook_timeout_secs() -> u64 {
    30
}

fn default_chat_timeout_secs() -> u64 {
    10
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_state_dir() -> String {
    "/var/lib/nodeguardian".to_string()
}

fn default_channels() -> Vec<String> {
    vec!["log".to_string()]
}

/// SMTP settings for the email alert channel.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct EmailConfig {
    #[serde(default)]
    pub smtp_server: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: Vec<String>,
    #[serde(default = "default_true")]
    pub use_tls: bool,
    #[serde(default)]
    pub use_ssl: bool,
}

/// Time-series query endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrometheusConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_prometheus_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        PrometheusConfig {
            url: String::new(),
            timeout_secs: default_prometheus_timeout_secs(),
        }
    }
}

/// Alert fan-out settings shared across channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertConfig {
    #[serde(default)]
    pub webhook_url: String,
    #[serde(default)]
    pub webhook_headers: std::collections::BTreeMap<String, String>,
    #[serde(default)]
    pub chat_url: String,
    #[serde(default = "default_channels")]
    pub default_channels: Vec<String>,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_webhook_timeout_secs")]
    pub webhook_timeout_secs: u64,
    #[serde(default = "default_chat_timeout_secs")]
    pub chat_timeout_secs: u64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        AlertConfig {
            webhook_url: String::new(),
            webhook_headers: Default::default(),
            chat_url: String::new(),
            default_channels: default_channels(),
            retry_attempts: default_retry_attempts(),
            webhook_timeout_secs: default_webhook_timeout_secs(),
            chat_timeout_secs: default_chat_timeout_secs(),
        }
    }
}

/// Control-loop scheduling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringConfig {
    #[serde(default = "default_metrics_server_url")]
    pub metrics_server_url: String,
    #[serde(default = "default_max_concurrent_checks")]
    pub max_concurrent_checks: usize,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        MonitoringConfig {
            metrics_server_url: default_metrics_server_url(),
            max_concurrent_checks: default_max_concurrent_checks(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// The resolved configuration record the engine consumes. Loading it from
/// mounted config/secret volumes is a bootstrap concern outside the engine's
/// scope; only the shape of the record lives here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    #[serde(default)]
    pub email: EmailConfig,
    #[serde(default)]
    pub prometheus: PrometheusConfig,
    #[serde(default)]
    pub alert: AlertConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            email: EmailConfig::default(),
            prometheus: PrometheusConfig::default(),
            alert: AlertConfig::default(),
            monitoring: MonitoringConfig::default(),
            log: LogConfig::default(),
            state_dir: default_state_dir(),
        }
    }
}

impl EngineConfig {
    /// Loads a resolved config record from a JSON or YAML file, chosen by
    /// extension (`.json` vs anything else is treated as YAML).
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("reading config file {}: {e}", path.display()))?;
        let config = if path.extension().and_then(|e| e.to_str()) == Some("json") {
            serde_json::from_str(&raw)?
        } else {
            serde_yaml::from_str(&raw)?
        };
        Ok(config)
    }

    /// Overlays secrets mounted at `/etc/nodeguardian/secrets/*` onto this
    /// config, matching the original out-of-band secret loading path.
    pub fn overlay_secrets(&mut self, secrets_dir: impl AsRef<Path>) {
        let dir = secrets_dir.as_ref();
        if let Some(username) = read_secret_file(dir, "email-username") {
            self.email.username = username;
        }
        if let Some(password) = read_secret_file(dir, "email-password") {
            self.email.password = password;
        }
        if let Some(webhook_url) = read_secret_file(dir, "webhook-url") {
            self.alert.webhook_url = webhook_url;
        }
    }
}

fn read_secret_file(dir: &Path, name: &str) -> Option<String> {
    std::fs::read_to_string(dir.join(name))
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.monitoring.max_concurrent_checks, 10);
        assert_eq!(config.alert.default_channels, vec!["log".to_string()]);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_overlay_secrets_from_mounted_files() {
        let dir = tempdir();
        std::fs::write(dir.join("email-username"), "svc@example.com\n").unwrap();
        std::fs::write(dir.join("webhook-url"), "https://hooks.example/abc\n").unwrap();

        let mut config = EngineConfig::default();
        config.overlay_secrets(&dir);
        assert_eq!(config.email.username, "svc@example.com");
        assert_eq!(config.alert.webhook_url, "https://hooks.example/abc");
        assert_eq!(config.email.password, "");

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_overlay_secrets_missing_dir_is_noop() {
        let mut config = EngineConfig::default();
        config.overlay_secrets("/nonexistent/path/for/test");
        assert_eq!(config.email.username, "");
    }

    #[test]
    fn test_from_file_json() {
        let dir = tempdir();
        let path = dir.join("config.json");
        std::fs::write(&path, r#"{"monitoring":{"maxConcurrentChecks":5}}"#).unwrap();
        let config = EngineConfig::from_file(&path).unwrap();
        assert_eq!(config.monitoring.max_concurrent_checks, 5);
        std::fs::remove_dir_all(&dir).ok();
    }

    fn tempdir() -> std::path::PathBuf {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!(
            "nodeguardian-config-test-{}-{n}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}
