use std::fmt;

/// Engine-level error taxonomy.
///
/// Distinct from `anyhow::Error`, which the CLI and bootstrap layers use for
/// "report and move on" failures. These variants carry the retry/surface
/// policy the control loop needs to decide at the call site.
#[derive(Debug)]
pub enum EngineError {
    /// Invalid rule spec at ingest: bad operator, unknown metric, malformed
    /// duration. Never retried until the rule is edited.
    Config(String),
    /// Timeout, 5xx, or optimistic-lock conflict. Caller may retry.
    PlatformTransient(String),
    /// 4xx (non-conflict) or auth failure. Not retried this tick.
    PlatformFatal(String),
    /// All metrics-resolver tiers exhausted for this metric/node pair.
    MetricUnavailable { metric: String, node: String },
    /// A single alert channel failed; isolated to that channel.
    Channel { channel: String, reason: String },
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Config(msg) => write!(f, "config error: {msg}"),
            EngineError::PlatformTransient(msg) => write!(f, "platform transient error: {msg}"),
            EngineError::PlatformFatal(msg) => write!(f, "platform fatal error: {msg}"),
            EngineError::MetricUnavailable { metric, node } => {
                write!(f, "metric {metric} unavailable for node {node}")
            }
            EngineError::Channel { channel, reason } => {
                write!(f, "channel {channel} failed: {reason}")
            }
        }
    }
}

impl std::error::Error for EngineError {}

pub type EngineResult<T> = Result<T, EngineError>;
