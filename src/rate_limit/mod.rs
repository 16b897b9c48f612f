//! Rate Limiting Module
//!
//! Per-identity token bucket rate limiting for inbound units of work.
//!
//! # Features
//!
//! - Token buckets with continuous refill and a burst cap (idle time
//!   accumulates up to `burst` requests)
//! - Buckets keyed by account id or, for anonymous callers, remote host
//! - Group rules resolved in declared order, combined with the global rule
//!   (the stricter one wins)
//! - Grace permits and a configurable deny message
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Rate Limiter                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  RuleResolver ──▶ RateLimit ──▶ TokenBucket (lazy, cached)  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Bucket cache keyed by (identity, rate type), per generation│
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod bucket;
pub mod config;
pub mod limiter;

pub use bucket::TokenBucket;
pub use config::RateLimitConfig;
pub use limiter::{RateDecision, RateLimiter};
