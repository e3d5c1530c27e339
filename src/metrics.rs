use async_trait::async_trait;
use regex::escape;
use std::time::Duration;
use tracing::debug;

use crate::crd::Metric;
use crate::platform::NodeInfo;

const PRIMARY_DEADLINE: Duration = Duration::from_secs(10);

/// Resolves a metric for a node. Never raises: exhausting every tier yields
/// `None`, which the evaluator treats as an unsatisfied condition.
#[async_trait]
pub trait MetricsResolver: Send + Sync {
    async fn resolve(&self, node: &NodeInfo, metric: Metric) -> Option<f64>;
}

pub struct HttpMetricsResolver {
    client: reqwest::Client,
    prometheus_url: String,
    metrics_server_url: String,
}

impl HttpMetricsResolver {
    pub fn new(prometheus_url: String, metrics_server_url: String) -> Self {
        HttpMetricsResolver {
            client: reqwest::Client::new(),
            prometheus_url,
            metrics_server_url,
        }
    }

    /// Builds the promql expression for a metric, suffix-matching the
    /// `instance` label against the (regex-escaped) node name.
    fn query_for(&self, metric: Metric, node_name: &str) -> String {
        let escaped = escape(node_name);
        match metric {
            Metric::CpuUtilizationPercent => {
                format!("instance:node_cpu_utilisation:rate5m{{instance=~\"{escaped}(:.*)?$\"}} * 100")
            }
            Metric::MemoryUtilizationPercent => {
                format!("instance:node_memory_utilisation:ratio{{instance=~\"{escaped}(:.*)?$\"}} * 100")
            }
            Metric::DiskUtilizationPercent => {
                format!("instance:node_filesystem_usage:ratio{{instance=~\"{escaped}(:.*)?$\"}} * 100")
            }
            Metric::CpuLoadRatio => {
                format!("instance:node_load1_per_cpu:ratio{{instance=~\"{escaped}(:.*)?$\"}}")
            }
        }
    }

    async fn query_primary(&self, metric: Metric, node_name: &str) -> Option<f64> {
        if self.prometheus_url.is_empty() {
            return None;
        }
        let query = self.query_for(metric, node_name);
        let url = format!("{}/api/v1/query", self.prometheus_url.trim_end_matches('/'));
        let response = self
            .client
            .get(&url)
            .query(&[("query", query.as_str())])
            .timeout(PRIMARY_DEADLINE)
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            debug!(status = %response.status(), "time-series query failed");
            return None;
        }
        let body: serde_json::Value = response.json().await.ok()?;
        let value = body
            .get("data")?
            .get("result")?
            .get(0)?
            .get("value")?
            .get(1)?
            .as_str()?;
        value.parse::<f64>().ok()
    }

    async fn query_node_usage(&self, node_name: &str) -> Option<NodeUsage> {
        if self.metrics_server_url.is_empty() {
            return None;
        }
        let url = format!(
            "{}/nodes/{}",
            self.metrics_server_url.trim_end_matches('/'),
            node_name
        );
        let response = self
            .client
            .get(&url)
            .timeout(PRIMARY_DEADLINE)
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            return None;
        }
        let body: serde_json::Value = response.json().await.ok()?;
        Some(NodeUsage {
            usage_cpu: parse_cpu_value(body.get("usage")?.get("cpu")?.as_str()?)?,
            capacity_cpu: parse_cpu_value(body.get("capacity")?.get("cpu")?.as_str()?)?,
            usage_memory: parse_memory_value(body.get("usage")?.get("memory")?.as_str()?)?,
            capacity_memory: parse_memory_value(body.get("capacity")?.get("memory")?.as_str()?)?,
        })
    }
}

struct NodeUsage {
    usage_cpu: f64,
    capacity_cpu: f64,
    usage_memory: f64,
    capacity_memory: f64,
}

#[async_trait]
impl MetricsResolver for HttpMetricsResolver {
    async fn resolve(&self, node: &NodeInfo, metric: Metric) -> Option<f64> {
        if let Some(value) = self.query_primary(metric, &node.name).await {
            return Some(value);
        }

        match metric {
            Metric::CpuUtilizationPercent => {
                let usage = self.query_node_usage(&node.name).await?;
                if usage.capacity_cpu == 0.0 {
                    return None;
                }
                Some((usage.usage_cpu / usage.capacity_cpu) * 100.0)
            }
            Metric::MemoryUtilizationPercent => {
                let usage = self.query_node_usage(&node.name).await?;
                if usage.capacity_memory == 0.0 {
                    return None;
                }
                Some((usage.usage_memory / usage.capacity_memory) * 100.0)
            }
            Metric::DiskUtilizationPercent => {
                // The node-usage endpoint carries no disk fields; skip
                // straight to inference from the node's condition.
                if node.disk_pressure {
                    Some(90.0)
                } else {
                    None
                }
            }
            Metric::CpuLoadRatio => {
                // primary failed; infer from utilisation if we can resolve it
                self.resolve(node, Metric::CpuUtilizationPercent)
                    .await
                    .map(|cpu_pct| cpu_pct / 100.0)
            }
        }
    }
}

/// Parses the platform's compact CPU notation: `500m` (millicores), `500n`
/// (nanocores), or a bare core count.
pub fn parse_cpu_value(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    if let Some(stripped) = raw.strip_suffix('n') {
        stripped.parse::<f64>().ok().map(|n| n / 1_000_000_000.0)
    } else if let Some(stripped) = raw.strip_suffix('m') {
        stripped.parse::<f64>().ok().map(|m| m / 1000.0)
    } else {
        raw.parse::<f64>().ok()
    }
}

/// Parses the platform's compact base-2 memory notation: `Ki`, `Mi`, `Gi`,
/// `Ti` suffixes, or a bare byte count.
pub fn parse_memory_value(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    const UNITS: &[(&str, f64)] = &[
        ("Ki", 1024.0),
        ("Mi", 1024.0 * 1024.0),
        ("Gi", 1024.0 * 1024.0 * 1024.0),
        ("Ti", 1024.0 * 1024.0 * 1024.0 * 1024.0),
    ];
    for (suffix, factor) in UNITS {
        if let Some(stripped) = raw.strip_suffix(suffix) {
            return stripped.parse::<f64>().ok().map(|v| v * factor);
        }
    }
    raw.parse::<f64>().ok()
}
