use async_trait::async_trait;
use lettre::message::{MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{AlertConfig, EmailConfig};
use crate::crd::{AlertActionSpec, AlertTemplate, Severity};
use crate::executor::{AlertContext, AlertSink};
use crate::store::SharedRuleStore;

/// Resolves `{{ path.dotted }}` placeholders and `{{#each x as y}}...{{/each}}`
/// blocks against a JSON context. Not a general template language: no
/// conditionals, no nested each, no helpers. An unresolved path renders as
/// the empty string rather than failing the render.
fn render(template: &str, context: &Value) -> String {
    let mut out = String::new();
    let mut rest = template;
    while let Some(each_start) = rest.find("{{#each ") {
        out.push_str(&rest[..each_start]);
        let after = &rest[each_start + "{{#each ".len()..];
        let Some(header_end) = after.find("}}") else {
            out.push_str(&rest[each_start..]);
            rest = "";
            break;
        };
        let header = &after[..header_end];
        let Some(close_tag) = find_each_close(&after[header_end + 2..]) else {
            out.push_str(&rest[each_start..]);
            rest = "";
            break;
        };
        let body = &after[header_end + 2..header_end + 2 + close_tag];
        let body_end_abs = header_end + 2 + close_tag + "{{/each}}".len();
        rest = &after[body_end_abs..];

        let mut parts = header.splitn(2, " as ");
        let path = parts.next().unwrap_or("").trim();
        let alias = parts.next().unwrap_or("item").trim();
        if let Some(Value::Array(items)) = lookup(context, path) {
            for item in items {
                out.push_str(&render_simple(body, item, alias));
            }
        }
    }
    out.push_str(&render_simple(rest, context, ""));
    out
}

fn find_each_close(haystack: &str) -> Option<usize> {
    haystack.find("{{/each}}")
}

/// Resolves plain `{{ path }}` placeholders with no `#each`. When `alias` is
/// non-empty, a leading `alias.` prefix in the path is stripped before
/// looking the remainder up in `scope`.
fn render_simple(template: &str, scope: &Value, alias: &str) -> String {
    let mut out = String::new();
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let Some(end) = rest[start..].find("}}") else {
            out.push_str(&rest[start..]);
            return out;
        };
        let path = rest[start + 2..start + end].trim();
        let resolved_path = if !alias.is_empty() {
            path.strip_prefix(alias)
                .and_then(|r| r.strip_prefix('.'))
                .unwrap_or(path)
        } else {
            path
        };
        let value = if resolved_path == path && !alias.is_empty() && path == alias {
            Some(scope.clone())
        } else {
            lookup(scope, resolved_path)
        };
        out.push_str(&value.map(value_to_string).unwrap_or_default());
        rest = &rest[start + end + 2..];
    }
    out.push_str(rest);
    out
}

fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        if segment.is_empty() {
            continue;
        }
        current = current.get(segment)?;
    }
    Some(current)
}

fn value_to_string(value: Value) -> String {
    match value {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn context_to_json(context: &AlertContext) -> Value {
    serde_json::json!({
        "rule_name": context.rule_name,
        "rule_description": context.rule_description,
        "severity": context.severity,
        "timestamp_utc_iso": context.timestamp_utc.to_rfc3339(),
        "triggered_nodes": context.triggered_nodes.iter().map(|n| {
            serde_json::json!({
                "name": n.name,
                "metrics": {
                    "cpuUtilizationPercent": n.metrics.cpu_utilization_percent,
                    "memoryUtilizationPercent": n.metrics.memory_utilization_percent,
                    "diskUtilizationPercent": n.metrics.disk_utilization_percent,
                    "cpuLoadRatio": n.metrics.cpu_load_ratio,
                },
                "problem_pods": n.problem_pods.iter().take(5).map(|p| serde_json::json!({
                    "namespace": p.namespace,
                    "name": p.name,
                    "phase": p.phase,
                })).collect::<Vec<_>>(),
            })
        }).collect::<Vec<_>>(),
    })
}

/// Renders and fans an alert out across channels. One channel failing never
/// blocks the others for the same fire.
pub struct AlertDispatcher {
    email: EmailConfig,
    alert: AlertConfig,
    http: reqwest::Client,
    store: Option<SharedRuleStore>,
}

impl AlertDispatcher {
    pub fn new(email: EmailConfig, alert: AlertConfig) -> Self {
        AlertDispatcher {
            email,
            alert,
            http: reqwest::Client::new(),
            store: None,
        }
    }

    /// Wires a rule store for template lookup by name. Without one, every
    /// dispatch falls back to the built-in template.
    pub fn with_store(mut self, store: SharedRuleStore) -> Self {
        self.store = Some(store);
        self
    }

    async fn fetch_template(&self, name: &str) -> Option<AlertTemplate> {
        self.store.as_ref()?.get_template(name).await
    }

    fn channels_for<'a>(&'a self, spec: &'a AlertActionSpec, template: &'a AlertTemplate) -> Vec<String> {
        if !spec.channels.is_empty() {
            spec.channels.clone()
        } else if !template.spec.channels.is_empty() {
            template.spec.channels.clone()
        } else {
            self.alert.default_channels.clone()
        }
    }

    async fn send(&self, channel: &str, subject: &str, body: &str, context: &Value, is_recovery: bool) {
        match channel {
            "log" => self.send_log(subject, body, is_recovery),
            "email" => {
                if let Err(e) = self.send_email(subject, body).await {
                    warn!(channel, error = %e, "alert channel failed");
                }
            }
            "webhook" => {
                if let Err(e) = self.send_webhook(context).await {
                    warn!(channel, error = %e, "alert channel failed");
                }
            }
            "chat" => {
                if let Err(e) = self.send_chat(subject, body).await {
                    warn!(channel, error = %e, "alert channel failed");
                }
            }
            other => {
                warn!(channel = other, "unknown alert channel, skipping");
            }
        }
    }

    fn send_log(&self, subject: &str, body: &str, is_recovery: bool) {
        if is_recovery {
            info!(subject, body, "alert (recovery)");
        } else {
            warn!(subject, body, "alert (trigger)");
        }
    }

    async fn send_email(&self, subject: &str, body: &str) -> Result<(), String> {
        if self.email.smtp_server.is_empty() || self.email.to.is_empty() {
            return Err("email channel configured with no server or recipients".to_string());
        }
        let mut builder = Message::builder()
            .from(self.email.from.parse().map_err(|e| format!("{e}"))?)
            .subject(subject);
        for to in &self.email.to {
            builder = builder.to(to.parse().map_err(|e| format!("{e}"))?);
        }
        let message = builder
            .multipart(
                MultiPart::alternative()
                    .singlepart(SinglePart::plain(body.to_string()))
                    .singlepart(SinglePart::html(plain_text_to_html(body))),
            )
            .map_err(|e| e.to_string())?;

        let mut transport_builder = if self.email.use_ssl {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&self.email.smtp_server)
                .map_err(|e| e.to_string())?
        } else if self.email.use_tls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&self.email.smtp_server)
                .map_err(|e| e.to_string())?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&self.email.smtp_server)
        };
        transport_builder = transport_builder.port(self.email.smtp_port);
        if !self.email.username.is_empty() {
            transport_builder = transport_builder.credentials(Credentials::new(
                self.email.username.clone(),
                self.email.password.clone(),
            ));
        }
        transport_builder
            .build()
            .send(message)
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    async fn send_webhook(&self, context: &Value) -> Result<(), String> {
        if self.alert.webhook_url.is_empty() {
            return Err("webhook channel configured with no url".to_string());
        }
        let mut request = self
            .http
            .post(&self.alert.webhook_url)
            .timeout(Duration::from_secs(self.alert.webhook_timeout_secs))
            .json(context);
        for (key, value) in &self.alert.webhook_headers {
            request = request.header(key, value);
        }
        let response = request.send().await.map_err(|e| e.to_string())?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("webhook returned {}", response.status()))
        }
    }

    async fn send_chat(&self, subject: &str, body: &str) -> Result<(), String> {
        if self.alert.chat_url.is_empty() {
            return Err("chat channel configured with no url".to_string());
        }
        let payload = serde_json::json!({ "text": format!("{subject}\n{body}") });
        let response = self
            .http
            .post(&self.alert.chat_url)
            .timeout(Duration::from_secs(self.alert.chat_timeout_secs))
            .json(&payload)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("chat webhook returned {}", response.status()))
        }
    }
}

#[async_trait]
impl AlertSink for AlertDispatcher {
    async fn dispatch(&self, spec: &AlertActionSpec, context: &AlertContext, is_recovery: bool) {
        let template = match self.fetch_template(&spec.template).await {
            Some(t) => t,
            None => {
                debug!(template = spec.template, "alert template unavailable, using built-in fallback");
                fallback_template(context)
            }
        };
        let json_context = context_to_json(context);
        let subject = render(&template.spec.subject, &json_context);
        let body = render(&template.spec.body, &json_context);
        let channels = self.channels_for(spec, &template);
        for channel in channels {
            self.send(&channel, &subject, &body, &json_context, is_recovery)
                .await;
        }
    }
}

/// Synthesizes the HTML sibling of a rendered plain-text alert body: escapes
/// the five HTML special characters and turns line breaks into `<br>`, since
/// templates are authored once as plain text with no separate HTML variant.
fn plain_text_to_html(body: &str) -> String {
    let escaped = body
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;");
    format!("<html><body>{}</body></html>", escaped.replace('\n', "<br>\n"))
}

fn fallback_template(context: &AlertContext) -> AlertTemplate {
    AlertTemplate {
        metadata: Default::default(),
        spec: crate::crd::AlertTemplateSpec {
            subject: format!("[{}] {}", context.severity, context.rule_name),
            body: "{{ rule_description }}\n{{#each triggered_nodes as node}}- {{ node.name }}\n{{/each}}"
                .to_string(),
            severity: Severity::Medium,
            channels: vec![],
        },
    }
}
