//! Rate Limit Configuration
//!
//! Options shared by every token bucket; the rates themselves come from the
//! rule set.

use serde::{Deserialize, Serialize};

use crate::rules::RateLimit;

/// Default number of permits granted unconditionally to a fresh bucket
pub const DEFAULT_GRACE_PERMITS: u32 = 0;

/// Default number of token buckets kept in memory
pub const DEFAULT_MAX_CACHED_BUCKETS: usize = 100_000;

/// Default deny message; `${type}`, `${rate}` and `${burst}` are interpolated
pub const DEFAULT_EXCEEDED_MESSAGE: &str = "Exceeded rate limit of ${rate} ${type} requests/hour \
     (or idle time used up in bursts of max ${burst} requests)";

/// Rate limit configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting
    pub enabled: bool,

    /// Permits a new bucket grants without consuming tokens
    pub grace_permits: u32,

    /// Message template returned with a denial
    pub exceeded_message: String,

    /// Upper bound on cached token buckets
    pub max_cached_buckets: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            grace_permits: DEFAULT_GRACE_PERMITS,
            exceeded_message: DEFAULT_EXCEEDED_MESSAGE.to_string(),
            max_cached_buckets: DEFAULT_MAX_CACHED_BUCKETS,
        }
    }
}

impl RateLimitConfig {
    /// Create a new rate limit configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Disable rate limiting (for testing)
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Render the deny message for `limit`
    pub fn format_message(&self, limit: &RateLimit) -> String {
        self.exceeded_message
            .replace("${type}", &limit.rate_type)
            .replace("${rate}", &format!("{:.2}", limit.permits_per_hour()))
            .replace("${burst}", &limit.burst.to_string())
    }
}
