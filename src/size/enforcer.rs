//! Size Quota Enforcer
//!
//! Tracks the size of each project and checks writes against the
//! `maxRepoSize` of the project and the `maxTotalSize` of its resolved
//! namespace. Sizes are read from storage on first use and then kept up to
//! date by commits and refunds until evicted.
//!
//! The namespace total is summed over the sibling projects before the
//! project's own account is locked. Two concurrent commits to different
//! projects of one namespace can therefore both pass and overshoot
//! `maxTotalSize` by at most one request each. Commits to the same project
//! are serialized.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use super::probe::{ProjectLister, RepoSizeProbe};
use crate::error::StorageError;
use crate::metrics;
use crate::rules::{NamespacePattern, RuleStore};

/// Outcome of a size request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeDecision {
    /// Within quota
    Ok,
    /// No size quota applies to the project
    NoOp,
    /// The request does not fit
    Exceeded { requested: u64, available: u64 },
}

impl SizeDecision {
    /// Whether the write may go ahead
    pub fn is_allowed(&self) -> bool {
        !matches!(self, SizeDecision::Exceeded { .. })
    }

    /// Message for the user whose write was refused
    pub fn message(&self, project: &str) -> Option<String> {
        match self {
            SizeDecision::Exceeded {
                requested,
                available,
            } => Some(format!(
                "Requested space of {} bytes for project {} exceeds the available quota of {} bytes",
                requested, project, available
            )),
            _ => None,
        }
    }
}

/// Cached size of one project; `None` until read from storage
type Account = Arc<tokio::sync::Mutex<Option<u64>>>;

/// Ceilings that apply to a project
#[derive(Debug, Clone)]
struct Ceilings {
    max_repo_size: Option<u64>,
    max_total_size: Option<(u64, NamespacePattern)>,
}

/// Per-project and per-namespace byte quotas
pub struct SizeQuotaEnforcer {
    rules: RuleStore,
    probe: Arc<dyn RepoSizeProbe>,
    projects: Arc<dyn ProjectLister>,
    accounts: Mutex<HashMap<String, Account>>,
}

impl SizeQuotaEnforcer {
    pub fn new(
        rules: RuleStore,
        probe: Arc<dyn RepoSizeProbe>,
        projects: Arc<dyn ProjectLister>,
    ) -> Self {
        Self {
            rules,
            probe,
            projects,
            accounts: Mutex::new(HashMap::new()),
        }
    }

    fn account(&self, project: &str) -> Account {
        self.accounts
            .lock()
            .entry(project.to_string())
            .or_default()
            .clone()
    }

    fn ceilings(&self, project: &str) -> Option<Ceilings> {
        let resolved = self.rules.resolver().resolve_project(project)?;
        if !resolved.rule.has_size_limits() {
            return None;
        }
        Some(Ceilings {
            max_repo_size: resolved.rule.max_repo_size(),
            max_total_size: resolved
                .rule
                .max_total_size()
                .map(|max| (max, resolved.namespace)),
        })
    }

    /// Fill an unloaded account from storage. A missing repository counts as
    /// empty; other failures leave the account unloaded.
    async fn load(
        &self,
        project: &str,
        size: &mut Option<u64>,
        operation: &'static str,
    ) -> Result<u64, StorageError> {
        if let Some(size) = *size {
            return Ok(size);
        }

        let loaded = match self.probe.size_of(project).await {
            Ok(bytes) => bytes,
            Err(e) if e.is_not_found() => 0,
            Err(error) => {
                tracing::error!(project, operation, %error, "Failed to read repository size");
                return Err(error);
            }
        };
        *size = Some(loaded);
        Ok(loaded)
    }

    /// Current size of `project` in bytes
    pub async fn current_size(&self, project: &str) -> Result<u64, StorageError> {
        let account = self.account(project);
        let mut size = account.lock().await;
        self.load(project, &mut size, "current_size").await
    }

    /// Summed size of the projects other than `project` in `namespace`
    async fn sibling_total(
        &self,
        project: &str,
        namespace: &NamespacePattern,
    ) -> Result<u64, StorageError> {
        let projects = self.projects.projects().await.map_err(|error| {
            tracing::error!(project, %error, "Failed to list projects");
            error
        })?;

        let mut total = 0u64;
        for sibling in projects
            .iter()
            .filter(|p| p.as_str() != project && namespace.matches(p))
        {
            total = total.saturating_add(self.current_size(sibling).await?);
        }
        Ok(total)
    }

    /// Bytes `project` may still grow by; `None` if no size quota applies
    pub async fn available_headroom(&self, project: &str) -> Result<Option<u64>, StorageError> {
        let Some(ceilings) = self.ceilings(project) else {
            return Ok(None);
        };
        let siblings = self.sibling_total_for(project, &ceilings).await?;

        let account = self.account(project);
        let mut size = account.lock().await;
        let own = self.load(project, &mut size, "headroom").await?;
        Ok(Some(headroom(&ceilings, own, siblings)))
    }

    async fn sibling_total_for(
        &self,
        project: &str,
        ceilings: &Ceilings,
    ) -> Result<u64, StorageError> {
        match &ceilings.max_total_size {
            Some((_, namespace)) => self.sibling_total(project, namespace).await,
            None => Ok(0),
        }
    }

    /// Check whether `bytes` more would fit, without recording anything
    pub async fn dry_run(&self, project: &str, bytes: u64) -> Result<SizeDecision, StorageError> {
        let decision = match self.available_headroom(project).await? {
            None => SizeDecision::NoOp,
            Some(available) if bytes <= available => SizeDecision::Ok,
            Some(available) => SizeDecision::Exceeded {
                requested: bytes,
                available,
            },
        };
        record_rejection(project, "dry_run", &decision);
        Ok(decision)
    }

    /// Record `bytes` more for `project` if they fit
    pub async fn commit(&self, project: &str, bytes: u64) -> Result<SizeDecision, StorageError> {
        let Some(ceilings) = self.ceilings(project) else {
            // keep a loaded size accurate even when no quota applies
            let cached = self.accounts.lock().get(project).cloned();
            if let Some(account) = cached {
                let mut size = account.lock().await;
                if let Some(size) = size.as_mut() {
                    *size = size.saturating_add(bytes);
                }
            }
            return Ok(SizeDecision::NoOp);
        };
        let siblings = self.sibling_total_for(project, &ceilings).await?;

        let account = self.account(project);
        let mut size = account.lock().await;
        let own = self.load(project, &mut size, "commit").await?;
        let available = headroom(&ceilings, own, siblings);

        let decision = if bytes <= available {
            *size = Some(own.saturating_add(bytes));
            SizeDecision::Ok
        } else {
            SizeDecision::Exceeded {
                requested: bytes,
                available,
            }
        };
        record_rejection(project, "commit", &decision);
        Ok(decision)
    }

    /// Give back `bytes` previously committed for `project`. The tracked size
    /// never goes below zero. A size not loaded yet is left to the next read
    /// from storage.
    pub async fn refund(&self, project: &str, bytes: u64) {
        let cached = self.accounts.lock().get(project).cloned();
        let Some(account) = cached else {
            return;
        };
        let mut size = account.lock().await;
        if let Some(size) = size.as_mut() {
            *size = size.saturating_sub(bytes);
        }
    }

    /// Override the tracked size of `project`
    pub async fn set_size(&self, project: &str, bytes: u64) {
        let account = self.account(project);
        *account.lock().await = Some(bytes);
    }

    /// Forget the tracked size of `project`; the next use reads storage again
    pub fn evict(&self, project: &str) -> bool {
        self.accounts.lock().remove(project).is_some()
    }

    /// Number of projects with a tracked size
    pub fn cached_accounts(&self) -> usize {
        self.accounts.lock().len()
    }
}

impl std::fmt::Debug for SizeQuotaEnforcer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SizeQuotaEnforcer")
            .field("cached_accounts", &self.cached_accounts())
            .finish()
    }
}

fn headroom(ceilings: &Ceilings, own: u64, siblings: u64) -> u64 {
    let repo = ceilings.max_repo_size.map(|max| max.saturating_sub(own));
    let total = ceilings
        .max_total_size
        .as_ref()
        .map(|(max, _)| max.saturating_sub(own.saturating_add(siblings)));

    match (repo, total) {
        (Some(a), Some(b)) => a.min(b),
        (Some(a), None) | (None, Some(a)) => a,
        (None, None) => u64::MAX,
    }
}

fn record_rejection(project: &str, operation: &'static str, decision: &SizeDecision) {
    if let SizeDecision::Exceeded {
        requested,
        available,
    } = decision
    {
        metrics::SIZE_REJECTIONS_TOTAL
            .with_label_values(&[operation])
            .inc();
        tracing::debug!(project, operation, requested, available, "Size quota exceeded");
    }
}
