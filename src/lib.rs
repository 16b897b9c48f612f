//! Quotagate Library
//!
//! Quota and admission control for a shared server running work for many
//! tenants: request rate limits, worker queue admission with reservations,
//! and byte quotas per project and namespace, all driven by one rule set.

pub mod admission;
pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod projects;
pub mod rate_limit;
pub mod rules;
pub mod size;
pub mod status;

pub use engine::{EngineOptions, QuotaEngine};
pub use error::{QuotaError, RuleError, StorageError};
