//! Engine Status
//!
//! Serializable snapshot of the engine state for operators: queue usage and
//! reservations, rules in force, and cache sizes.

use serde::Serialize;

use crate::admission::QueueSnapshot;
use crate::rate_limit::RateLimitConfig;
use crate::rules::RuleSet;

/// Status of a running engine
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    /// Timestamp of snapshot generation
    pub timestamp: chrono::DateTime<chrono::Utc>,

    /// Generation of the rule set in force
    pub generation: u64,

    /// Summary of the rules in force
    pub rules: RuleSummary,

    /// Per-queue admission state
    pub queues: Vec<QueueSnapshot>,

    /// Rate limiter state
    pub rate_limit: RateLimitStatus,

    /// Task quotas in force
    pub task_quotas: usize,

    /// Tasks holding task quota permits
    pub permit_holders: usize,

    /// Projects with a tracked size
    pub size_accounts: usize,
}

/// Scopes of the rules in force, in match order
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleSummary {
    pub global: bool,
    pub groups: Vec<String>,
    pub namespaces: Vec<String>,
}

impl RuleSummary {
    pub fn of(rules: &RuleSet) -> Self {
        Self {
            global: rules.global().is_some(),
            groups: rules.groups().iter().map(|r| r.scope.to_string()).collect(),
            namespaces: rules
                .namespaces()
                .iter()
                .map(|r| r.scope.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RateLimitStatus {
    pub enabled: bool,
    pub grace_permits: u32,
    pub cached_buckets: usize,
}

impl RateLimitStatus {
    pub fn new(config: &RateLimitConfig, cached_buckets: usize) -> Self {
        Self {
            enabled: config.enabled,
            grace_permits: config.grace_permits,
            cached_buckets,
        }
    }
}

impl EngineStatus {
    /// Render as pretty-printed JSON
    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::{QueueAdmissionController, QueueConfig};
    use crate::rules::{NamespacePattern, Rule, Scope};

    #[test]
    fn test_rule_summary() {
        let rules = RuleSet::from_rules([
            Rule::new(Scope::Global),
            Rule::new(Scope::Group("Users".to_string())),
            Rule::new(Scope::Namespace(NamespacePattern::parse("a/*").unwrap())),
        ]);
        let summary = RuleSummary::of(&rules);
        assert!(summary.global);
        assert_eq!(summary.groups, vec!["group \"Users\""]);
        assert_eq!(summary.namespaces, vec!["namespace \"a/*\""]);
    }

    #[test]
    fn test_status_serialization() {
        let queues = QueueAdmissionController::from_config(&QueueConfig::default());
        let status = EngineStatus {
            timestamp: chrono::Utc::now(),
            generation: 3,
            rules: RuleSummary::of(&RuleSet::default()),
            queues: queues.snapshot(),
            rate_limit: RateLimitStatus::new(&RateLimitConfig::default(), 0),
            task_quotas: 0,
            permit_holders: 0,
            size_accounts: 0,
        };

        let json = status.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["generation"], 3);
        assert_eq!(value["queues"][1]["queue"], "batch");
        assert_eq!(value["queues"][1]["max_threads"], 2);
        assert_eq!(value["rate_limit"]["enabled"], true);
    }
}
