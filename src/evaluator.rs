use tracing::debug;

use crate::crd::{Condition, ConditionLogic};
use crate::metrics::MetricsResolver;
use crate::platform::NodeInfo;

/// Resolves and combines a condition list against one node.
///
/// An unavailable metric counts as unsatisfied, never as an error — the
/// resolver already logs at debug level when a tier is exhausted.
pub struct ConditionEvaluator<'a> {
    resolver: &'a dyn MetricsResolver,
}

impl<'a> ConditionEvaluator<'a> {
    pub fn new(resolver: &'a dyn MetricsResolver) -> Self {
        ConditionEvaluator { resolver }
    }

    async fn condition_satisfied(&self, condition: &Condition, node: &NodeInfo) -> bool {
        match self.resolver.resolve(node, condition.metric).await {
            Some(value) => condition.operator.apply(value, condition.value),
            None => {
                debug!(
                    node = %node.name,
                    metric = condition.metric.as_str(),
                    "metric unavailable, condition unsatisfied"
                );
                false
            }
        }
    }

    /// Evaluates a condition list with its combining logic. An empty list
    /// never triggers, for both the trigger and recovery paths.
    pub async fn evaluate(
        &self,
        conditions: &[Condition],
        logic: ConditionLogic,
        node: &NodeInfo,
    ) -> bool {
        if conditions.is_empty() {
            return false;
        }
        match logic {
            ConditionLogic::And => {
                for condition in conditions {
                    if !self.condition_satisfied(condition, node).await {
                        return false;
                    }
                }
                true
            }
            ConditionLogic::Or => {
                for condition in conditions {
                    if self.condition_satisfied(condition, node).await {
                        return true;
                    }
                }
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{Metric, Operator};
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct FixedResolver {
        values: HashMap<(String, Metric), f64>,
    }

    #[async_trait]
    impl MetricsResolver for FixedResolver {
        async fn resolve(&self, node: &NodeInfo, metric: Metric) -> Option<f64> {
            self.values.get(&(node.name.clone(), metric)).copied()
        }
    }

    fn node(name: &str) -> NodeInfo {
        NodeInfo {
            name: name.to_string(),
            ..Default::default()
        }
    }

    fn condition(metric: Metric, operator: Operator, value: f64) -> Condition {
        Condition {
            metric,
            operator,
            value,
            duration: None,
            description: None,
        }
    }

    #[tokio::test]
    async fn test_empty_conditions_never_trigger() {
        let resolver = FixedResolver {
            values: HashMap::new(),
        };
        let evaluator = ConditionEvaluator::new(&resolver);
        assert!(!evaluator.evaluate(&[], ConditionLogic::And, &node("w1")).await);
        assert!(!evaluator.evaluate(&[], ConditionLogic::Or, &node("w1")).await);
    }

    #[tokio::test]
    async fn test_and_requires_all_satisfied() {
        let mut values = HashMap::new();
        values.insert(("w1".to_string(), Metric::CpuUtilizationPercent), 85.0);
        values.insert(("w1".to_string(), Metric::MemoryUtilizationPercent), 40.0);
        let resolver = FixedResolver { values };
        let evaluator = ConditionEvaluator::new(&resolver);
        let conditions = vec![
            condition(Metric::CpuUtilizationPercent, Operator::GreaterThan, 80.0),
            condition(Metric::MemoryUtilizationPercent, Operator::GreaterThan, 90.0),
        ];
        assert!(!evaluator.evaluate(&conditions, ConditionLogic::And, &node("w1")).await);
    }

    #[tokio::test]
    async fn test_or_partial_match() {
        let mut values = HashMap::new();
        values.insert(("w1".to_string(), Metric::CpuUtilizationPercent), 85.0);
        values.insert(("w1".to_string(), Metric::MemoryUtilizationPercent), 50.0);
        let resolver = FixedResolver { values };
        let evaluator = ConditionEvaluator::new(&resolver);
        let conditions = vec![
            condition(Metric::CpuUtilizationPercent, Operator::GreaterThan, 80.0),
            condition(Metric::MemoryUtilizationPercent, Operator::GreaterThan, 90.0),
        ];
        assert!(evaluator.evaluate(&conditions, ConditionLogic::Or, &node("w1")).await);
    }

    #[tokio::test]
    async fn test_unavailable_metric_counts_as_unsatisfied() {
        let resolver = FixedResolver {
            values: HashMap::new(),
        };
        let evaluator = ConditionEvaluator::new(&resolver);
        let conditions = vec![condition(Metric::CpuUtilizationPercent, Operator::GreaterThan, 80.0)];
        assert!(!evaluator.evaluate(&conditions, ConditionLogic::Or, &node("w1")).await);
    }
}
