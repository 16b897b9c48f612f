//! Rate Limiter
//!
//! One token bucket per `(identity, rate type)`, built lazily from the rule
//! resolved for the identity and cached until the rule set changes.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::bucket::TokenBucket;
use super::config::RateLimitConfig;
use crate::metrics;
use crate::rules::{Identity, IdentityKey, RateLimit, RuleStore};

/// Outcome of a rate limit check
#[derive(Debug, Clone, PartialEq)]
pub enum RateDecision {
    /// The unit of work may proceed
    Granted,
    /// The caller must reject with `message`
    Denied {
        message: String,
        limit: RateLimit,
        retry_after: Option<Duration>,
    },
}

impl RateDecision {
    pub fn is_granted(&self) -> bool {
        matches!(self, RateDecision::Granted)
    }
}

type BucketKey = (IdentityKey, String);

/// Cached bucket; `None` means no rate applies to this key
#[derive(Debug)]
struct CachedBucket {
    limit: Option<RateLimit>,
    bucket: Option<TokenBucket>,
}

#[derive(Debug, Default)]
struct BucketCache {
    generation: u64,
    buckets: HashMap<BucketKey, Arc<CachedBucket>>,
}

/// Per-identity token bucket rate limiter
#[derive(Debug)]
pub struct RateLimiter {
    rules: RuleStore,
    config: RateLimitConfig,
    cache: RwLock<BucketCache>,
}

impl RateLimiter {
    /// Create a new rate limiter reading rules from `rules`
    pub fn new(rules: RuleStore, config: RateLimitConfig) -> Self {
        Self {
            rules,
            config,
            cache: RwLock::new(BucketCache::default()),
        }
    }

    /// Take one permit for `identity`; `true` means the work may proceed
    pub fn acquire(&self, identity: &Identity, rate_type: &str) -> bool {
        self.check(identity, rate_type).is_granted()
    }

    /// Take one permit for `identity`, returning a deny message on failure
    pub fn check(&self, identity: &Identity, rate_type: &str) -> RateDecision {
        if !self.config.enabled {
            return RateDecision::Granted;
        }

        let cached = self.bucket_for(identity, rate_type);
        let (Some(limit), Some(bucket)) = (&cached.limit, &cached.bucket) else {
            return RateDecision::Granted;
        };

        if bucket.try_acquire() {
            metrics::RATE_LIMIT_GRANTS_TOTAL
                .with_label_values(&[rate_type])
                .inc();
            return RateDecision::Granted;
        }

        metrics::RATE_LIMIT_DENIALS_TOTAL
            .with_label_values(&[rate_type])
            .inc();
        tracing::debug!(identity = %identity.key, rate_type, "Rate limit exceeded");
        RateDecision::Denied {
            message: self.config.format_message(limit),
            limit: limit.clone(),
            retry_after: bucket.time_until_available(),
        }
    }

    /// Cached bucket for the key, building it on first use
    fn bucket_for(&self, identity: &Identity, rate_type: &str) -> Arc<CachedBucket> {
        let resolver = self.rules.resolver();
        let generation = resolver.rules().generation();
        let key = (identity.key.clone(), rate_type.to_string());

        {
            let cache = self.cache.read();
            if cache.generation == generation {
                if let Some(cached) = cache.buckets.get(&key) {
                    return cached.clone();
                }
            }
        }

        let mut cache = self.cache.write();
        if cache.generation != generation {
            tracing::debug!(
                old = cache.generation,
                new = generation,
                "Rule set changed, dropping cached buckets"
            );
            cache.buckets.clear();
            cache.generation = generation;
        }

        let capacity = self.config.max_cached_buckets.max(1);
        if cache.buckets.len() >= capacity && !cache.buckets.contains_key(&key) {
            shrink(&mut cache.buckets, capacity, Instant::now());
        }

        cache
            .buckets
            .entry(key)
            .or_insert_with(|| {
                let group_limit = resolver
                    .resolve_identity_where(identity, |rule| rule.rate(rate_type).is_some())
                    .and_then(|rule| rule.rate(rate_type).cloned());
                let global_limit = resolver
                    .global()
                    .and_then(|rule| rule.rate(rate_type).cloned());

                let limit = match (group_limit, global_limit) {
                    (Some(group), Some(global)) if global.is_stricter_than(&group) => Some(global),
                    (Some(group), _) => Some(group),
                    (None, global) => global,
                };

                let bucket = limit
                    .as_ref()
                    .map(|l| TokenBucket::from_limit(l, self.config.grace_permits));
                Arc::new(CachedBucket { limit, bucket })
            })
            .clone()
    }

    /// Drop every cached bucket of `key` (e.g. the account was deleted)
    pub fn invalidate(&self, key: &IdentityKey) {
        self.cache.write().buckets.retain(|(k, _), _| k != key);
    }

    /// Number of cached buckets
    pub fn cached_buckets(&self) -> usize {
        self.cache.read().buckets.len()
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }
}

/// Make room in a cache holding `capacity` buckets.
///
/// Keys no rate applies to and buckets that have refilled completely go
/// first; both are rebuilt unchanged on next use, except that a rebuilt
/// bucket hands out its grace permits again. When that is not enough, the
/// buckets with the most stored permits go next, so callers that used up
/// their burst keep their state.
fn shrink(buckets: &mut HashMap<BucketKey, Arc<CachedBucket>>, capacity: usize, now: Instant) {
    let before = buckets.len();
    buckets.retain(|_, cached| match &cached.bucket {
        Some(bucket) => !bucket.is_full_at(now),
        None => false,
    });

    // leave some headroom so the next misses do not shrink again right away
    let target = (capacity - capacity / 10).min(capacity - 1);
    if buckets.len() > target {
        let mut by_stored: Vec<(BucketKey, f64)> = buckets
            .iter()
            .map(|(key, cached)| {
                let stored = cached
                    .bucket
                    .as_ref()
                    .map_or(f64::MAX, |bucket| bucket.available_at(now));
                (key.clone(), stored)
            })
            .collect();
        by_stored.sort_by(|a, b| b.1.total_cmp(&a.1));

        let excess = buckets.len() - target;
        for (key, _) in by_stored.into_iter().take(excess) {
            buckets.remove(&key);
        }
    }

    tracing::debug!(before, after = buckets.len(), capacity, "Shrunk rate limit bucket cache");
}
