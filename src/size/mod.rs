//! Size Quota Module
//!
//! Byte quotas per project (`maxRepoSize`) and per resolved namespace
//! (`maxTotalSize`): a byte-oriented token bucket without time-based refill.
//! Writes are checked with a dry run before they are accepted, committed
//! once stored, and refunded when storage is reclaimed.

pub mod enforcer;
pub mod probe;

pub use enforcer::{SizeDecision, SizeQuotaEnforcer};
pub use probe::{FsRepoSizeProbe, ProjectList, ProjectLister, RepoSizeProbe};
