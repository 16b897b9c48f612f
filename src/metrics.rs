// Prometheus metrics for quota enforcement
//
// Exposes:
// - Rate limit grants and denials per rate type (counter)
// - Task admissions per queue and outcome (counter)
// - Running tasks per queue (gauge)
// - Size quota rejections per operation (counter)
//
// Quotagate serves no HTTP itself; the host scrapes `gather_metrics`
// from its own endpoint.

use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Registry, TextEncoder};
use std::sync::Arc;

lazy_static! {
    pub static ref REGISTRY: Arc<Registry> = Arc::new(Registry::new());

    // Rate limit metrics
    pub static ref RATE_LIMIT_GRANTS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("quota_rate_limit_grants_total", "Units of work granted by the rate limiter"),
        &["type"]
    ).expect("Failed to create rate limit grants metric");

    pub static ref RATE_LIMIT_DENIALS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("quota_rate_limit_denials_total", "Units of work denied by the rate limiter"),
        &["type"]
    ).expect("Failed to create rate limit denials metric");

    // Queue admission metrics
    pub static ref TASK_ADMISSIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("quota_task_admissions_total", "Task start attempts by queue and outcome"),
        &["queue", "outcome"]
    ).expect("Failed to create task admissions metric");

    pub static ref RUNNING_TASKS: IntGaugeVec = IntGaugeVec::new(
        prometheus::Opts::new("quota_running_tasks", "Tasks currently admitted per queue"),
        &["queue"]
    ).expect("Failed to create running tasks metric");

    // Size quota metrics
    pub static ref SIZE_REJECTIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("quota_size_rejections_total", "Size quota requests rejected by operation"),
        &["operation"]
    ).expect("Failed to create size rejections metric");
}

/// Initialize metrics registry - must be called once at startup
pub fn init() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(RATE_LIMIT_GRANTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RATE_LIMIT_DENIALS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(TASK_ADMISSIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RUNNING_TASKS.clone()))?;
    REGISTRY.register(Box::new(SIZE_REJECTIONS_TOTAL.clone()))?;
    Ok(())
}

/// Gather all metrics in Prometheus text format.
///
/// This is the export point for the embedding host: call it from the
/// host's metrics endpoint after `init`. Families with no samples yet are
/// omitted from the output.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| anyhow::anyhow!("Failed to encode metrics: {}", e))?;
    String::from_utf8(buffer).map_err(|e| anyhow::anyhow!("Invalid UTF-8 in metrics: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_metrics() {
        let before = RATE_LIMIT_DENIALS_TOTAL.with_label_values(&["metrics-test"]).get();
        RATE_LIMIT_DENIALS_TOTAL.with_label_values(&["metrics-test"]).inc();
        assert_eq!(
            RATE_LIMIT_DENIALS_TOTAL.with_label_values(&["metrics-test"]).get(),
            before + 1
        );
    }

    #[test]
    fn test_gather_after_init() {
        // Registration fails on the second call in the same process, which is fine
        let _ = init();

        TASK_ADMISSIONS_TOTAL
            .with_label_values(&["batch", "admitted"])
            .inc();
        let text = gather_metrics().unwrap();
        assert!(text.contains("quota_task_admissions_total"));
    }

    #[test]
    fn test_gather_reports_limiter_denials() {
        use crate::rate_limit::{RateLimitConfig, RateLimiter};
        use crate::rules::parse::parse_rate;
        use crate::rules::{Identity, Limit, Rule, RuleSet, RuleStore, Scope};

        let _ = init();
        let limiter = RateLimiter::new(
            RuleStore::with_internal_groups(RuleSet::from_rules([Rule::new(Scope::Global)
                .with(Limit::Rate(
                    parse_rate("gather-test", "1 / hour burst 1").unwrap(),
                ))])),
            RateLimitConfig {
                grace_permits: 0,
                ..RateLimitConfig::default()
            },
        );
        let identity = Identity::account(1, ["Registered Users"]);
        assert!(limiter.acquire(&identity, "gather-test"));
        assert!(!limiter.acquire(&identity, "gather-test"));

        let text = gather_metrics().unwrap();
        assert!(text.contains("quota_rate_limit_grants_total{type=\"gather-test\"} 1"));
        assert!(text.contains("quota_rate_limit_denials_total{type=\"gather-test\"} 1"));
    }
}
