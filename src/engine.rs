//! Quota Engine
//!
//! Composition root: one rule store shared by the rate limiter, task
//! admission, and size and project-count enforcers, plus the hooks the host
//! calls into.

use parking_lot::Mutex;
use std::sync::Arc;

use crate::admission::{QueueConfig, Task, TaskAdmission};
use crate::config::Config;
use crate::error::StorageError;
use crate::projects::{CreateDecision, ProjectCountEnforcer};
use crate::rate_limit::{RateDecision, RateLimitConfig, RateLimiter};
use crate::rules::{
    GroupDirectory, Identity, IdentityKey, InternalGroups, RuleScopes, RuleSet, RuleStore,
    SkippedEntry,
};
use crate::size::{FsRepoSizeProbe, ProjectLister, RepoSizeProbe, SizeDecision, SizeQuotaEnforcer};
use crate::status::{EngineStatus, RateLimitStatus, RuleSummary};

/// Quota and admission control engine
#[derive(Debug)]
pub struct QuotaEngine {
    rules: RuleStore,
    rate_limiter: RateLimiter,
    admission: TaskAdmission,
    sizes: SizeQuotaEnforcer,
    projects: ProjectCountEnforcer,
    /// Serializes reloads so task quotas follow the rule set last installed
    reload_lock: Mutex<()>,
}

/// Host collaborators and options of an engine
pub struct EngineOptions {
    pub queues: QueueConfig,
    pub rate_limit: RateLimitConfig,
    pub directory: Arc<dyn GroupDirectory>,
    pub probe: Arc<dyn RepoSizeProbe>,
    pub projects: Arc<dyn ProjectLister>,
}

impl EngineOptions {
    /// Options reading sizes and projects from the repository root of `config`
    pub fn from_config(config: &Config) -> Self {
        let storage = Arc::new(FsRepoSizeProbe::new(&config.storage.repo_root));
        Self {
            queues: config.queues,
            rate_limit: config.rate_limit.clone(),
            directory: Arc::new(InternalGroups),
            probe: storage.clone(),
            projects: storage,
        }
    }
}

impl QuotaEngine {
    /// Create an engine enforcing `rules`.
    ///
    /// Queue reservations are registered here, once; later reloads do not
    /// touch them.
    pub fn new(rules: RuleSet, options: EngineOptions) -> Self {
        let store = RuleStore::new(rules, options.directory);
        let current = store.current();

        let admission = TaskAdmission::from_config(&options.queues);
        admission.register_reservations(&current);
        admission.apply_rules(&current);

        tracing::info!(
            generation = current.generation(),
            groups = current.groups().len(),
            namespaces = current.namespaces().len(),
            "Quota engine ready"
        );

        Self {
            rate_limiter: RateLimiter::new(store.clone(), options.rate_limit),
            admission,
            sizes: SizeQuotaEnforcer::new(store.clone(), options.probe, options.projects.clone()),
            projects: ProjectCountEnforcer::new(store.clone(), options.projects),
            rules: store,
            reload_lock: Mutex::new(()),
        }
    }

    /// Create an engine from a loaded configuration, returning the rule
    /// entries that were skipped
    pub fn from_config(config: &Config) -> (Self, Vec<SkippedEntry>) {
        let (rules, skipped) = config.rule_set();
        (Self::new(rules, EngineOptions::from_config(config)), skipped)
    }

    /// Install a new rule set; returns its generation.
    ///
    /// Rate buckets are rebuilt lazily and task quotas right away. Running
    /// tasks keep the permits they hold.
    pub fn reload(&self, rules: RuleSet) -> u64 {
        let _reload = self.reload_lock.lock();
        let installed = self.rules.install(rules);
        self.admission.apply_rules(&installed);
        installed.generation()
    }

    /// Parse `scopes` and install the result
    pub fn reload_scopes(&self, scopes: &RuleScopes) -> (u64, Vec<SkippedEntry>) {
        let (rules, skipped) = RuleSet::build(scopes);
        (self.reload(rules), skipped)
    }

    // Request entry

    /// A unit of work of `rate_type` arrives for `identity`
    pub fn on_begin_unit_of_work(&self, identity: &Identity, rate_type: &str) -> RateDecision {
        self.rate_limiter.check(identity, rate_type)
    }

    // Task lifecycle

    pub fn on_task_ready_to_start(&self, task: &Arc<Task>) -> bool {
        self.admission.on_task_ready_to_start(task)
    }

    pub fn on_task_stopped(&self, task: &Task) {
        self.admission.on_task_stopped(task)
    }

    pub fn on_task_not_ready_to_start(&self, task: &Task) {
        self.admission.on_task_not_ready_to_start(task)
    }

    // Storage writes

    pub async fn dry_run_size(&self, project: &str, bytes: u64) -> Result<SizeDecision, StorageError> {
        self.sizes.dry_run(project, bytes).await
    }

    pub async fn request_size(&self, project: &str, bytes: u64) -> Result<SizeDecision, StorageError> {
        self.sizes.commit(project, bytes).await
    }

    pub async fn refill_size(&self, project: &str, bytes: u64) {
        self.sizes.refund(project, bytes).await
    }

    pub async fn current_size(&self, project: &str) -> Result<u64, StorageError> {
        self.sizes.current_size(project).await
    }

    pub async fn available_headroom(&self, project: &str) -> Result<Option<u64>, StorageError> {
        self.sizes.available_headroom(project).await
    }

    pub fn evict_size(&self, project: &str) -> bool {
        self.sizes.evict(project)
    }

    pub async fn set_size(&self, project: &str, bytes: u64) {
        self.sizes.set_size(project, bytes).await
    }

    pub async fn check_create_project(&self, project: &str) -> Result<CreateDecision, StorageError> {
        self.projects.check_create(project).await
    }

    // Tenant lifecycle

    /// The account or host behind `key` is gone; drop its token buckets
    pub fn on_account_deleted(&self, key: &IdentityKey) {
        self.rate_limiter.invalidate(key);
        tracing::debug!(identity = %key, "Dropped token buckets of deleted account");
    }

    // Storage lifecycle

    /// Garbage collection changed the size of `project` on disk
    pub fn on_gc_completed(&self, project: &str) {
        if self.sizes.evict(project) {
            tracing::debug!(project, "Dropped cached size after gc");
        }
    }

    pub fn on_project_deleted(&self, project: &str) {
        if self.sizes.evict(project) {
            tracing::debug!(project, "Dropped cached size of deleted project");
        }
    }

    // Introspection

    pub fn rules(&self) -> &RuleStore {
        &self.rules
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn admission(&self) -> &TaskAdmission {
        &self.admission
    }

    pub fn sizes(&self) -> &SizeQuotaEnforcer {
        &self.sizes
    }

    pub fn status(&self) -> EngineStatus {
        let rules = self.rules.current();
        EngineStatus {
            timestamp: chrono::Utc::now(),
            generation: rules.generation(),
            rules: RuleSummary::of(&rules),
            queues: self.admission.queues().snapshot(),
            rate_limit: RateLimitStatus::new(
                self.rate_limiter.config(),
                self.rate_limiter.cached_buckets(),
            ),
            task_quotas: self.admission.permits().quota_count(),
            permit_holders: self.admission.permits().holders(),
            size_accounts: self.sizes.cached_accounts(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::QueueKind;
    use crate::rules::{Limit, NamespacePattern, ReservationSpec, Rule, Scope, TaskQuotaSpec};
    use crate::rules::parse::parse_rate;
    use crate::size::ProjectList;
    use async_trait::async_trait;

    struct EmptyStorage;

    #[async_trait]
    impl RepoSizeProbe for EmptyStorage {
        async fn size_of(&self, project: &str) -> Result<u64, StorageError> {
            Err(StorageError::NotFound(project.to_string()))
        }
    }

    fn options(batch: usize) -> EngineOptions {
        EngineOptions {
            queues: QueueConfig {
                batch,
                ..QueueConfig::default()
            },
            rate_limit: RateLimitConfig::default(),
            directory: Arc::new(InternalGroups),
            probe: Arc::new(EmptyStorage),
            projects: Arc::new(ProjectList::default()),
        }
    }

    fn rules() -> RuleSet {
        RuleSet::from_rules([
            Rule::new(Scope::Group("Service Users".to_string()))
                .with(Limit::Rate(parse_rate("uploadpack", "1 / hour burst 2").unwrap()))
                .with(Limit::ReservedSlots(ReservationSpec {
                    capacity: 1,
                    queue: QueueKind::Batch,
                })),
            Rule::new(Scope::Namespace(NamespacePattern::parse("small/*").unwrap()))
                .with(Limit::MaxRepoSize(100)),
        ])
    }

    #[test]
    fn test_rate_limit_hook() {
        let engine = QuotaEngine::new(rules(), options(3));
        let ci = Identity::account(9, ["Service Users"]);
        assert!(engine.on_begin_unit_of_work(&ci, "uploadpack").is_granted());
        assert!(engine.on_begin_unit_of_work(&ci, "uploadpack").is_granted());
        assert!(!engine.on_begin_unit_of_work(&ci, "uploadpack").is_granted());
    }

    #[test]
    fn test_reservations_registered_at_startup_only() {
        let engine = QuotaEngine::new(rules(), options(3));
        assert_eq!(
            engine.admission().queues().spare_threads(QueueKind::Batch),
            Some(2)
        );

        engine.reload(rules());
        assert_eq!(
            engine.admission().queues().spare_threads(QueueKind::Batch),
            Some(2)
        );
    }

    #[test]
    fn test_reload_rebuilds_task_quotas() {
        let engine = QuotaEngine::new(RuleSet::default(), options(4));
        let task = |id| Arc::new(Task::new(id, QueueKind::Batch));
        assert!(engine.on_task_ready_to_start(&task(1)));

        let generation = engine.reload(RuleSet::from_rules([Rule::new(Scope::Global).with(
            Limit::MaxConcurrent(TaskQuotaSpec::ForQueue {
                permits: 1,
                queue: QueueKind::Batch,
            }),
        )]));
        assert!(generation > 1);

        assert!(engine.on_task_ready_to_start(&task(2)));
        assert!(!engine.on_task_ready_to_start(&task(3)));

        // task 1 held no permit of the new quota
        engine.on_task_stopped(&task(1));
        assert!(!engine.on_task_ready_to_start(&task(3)));
        engine.on_task_stopped(&task(2));
        assert!(engine.on_task_ready_to_start(&task(3)));
    }

    #[tokio::test]
    async fn test_size_hooks() {
        let engine = QuotaEngine::new(rules(), options(3));
        assert_eq!(
            engine.dry_run_size("small/repo", 100).await.unwrap(),
            SizeDecision::Ok
        );
        assert_eq!(
            engine.request_size("small/repo", 60).await.unwrap(),
            SizeDecision::Ok
        );
        assert!(!engine
            .request_size("small/repo", 60)
            .await
            .unwrap()
            .is_allowed());

        engine.refill_size("small/repo", 20).await;
        assert_eq!(engine.current_size("small/repo").await.unwrap(), 40);

        engine.on_gc_completed("small/repo");
        assert_eq!(engine.current_size("small/repo").await.unwrap(), 0);

        engine.set_size("small/repo", 90).await;
        assert_eq!(engine.available_headroom("small/repo").await.unwrap(), Some(10));
        engine.on_project_deleted("small/repo");
        assert_eq!(engine.status().size_accounts, 0);

        assert_eq!(
            engine.dry_run_size("big/repo", 1 << 30).await.unwrap(),
            SizeDecision::NoOp
        );
    }

    #[test]
    fn test_status() {
        let engine = QuotaEngine::new(rules(), options(3));
        let status = engine.status();
        assert_eq!(status.rules.groups.len(), 1);
        assert_eq!(status.queues.len(), 3);
        assert_eq!(status.rate_limit.cached_buckets, 0);
    }

    #[test]
    fn test_account_deletion_drops_buckets() {
        let engine = QuotaEngine::new(rules(), options(3));
        let ci = Identity::account(9, ["Service Users"]);
        let other = Identity::account(10, ["Service Users"]);
        for _ in 0..2 {
            assert!(engine.on_begin_unit_of_work(&ci, "uploadpack").is_granted());
        }
        assert!(!engine.on_begin_unit_of_work(&ci, "uploadpack").is_granted());
        assert!(engine.on_begin_unit_of_work(&other, "uploadpack").is_granted());
        assert_eq!(engine.rate_limiter().cached_buckets(), 2);

        engine.on_account_deleted(&ci.key);
        assert_eq!(engine.rate_limiter().cached_buckets(), 1);
        assert!(engine.on_begin_unit_of_work(&ci, "uploadpack").is_granted());
    }

    #[test]
    fn test_concurrent_reloads_leave_quotas_of_installed_rules() {
        let engine = Arc::new(QuotaEngine::new(RuleSet::default(), options(4)));
        let with_quotas = |n: usize| {
            RuleSet::from_rules([(0..n).fold(Rule::new(Scope::Global), |rule, i| {
                rule.with(Limit::MaxConcurrent(TaskQuotaSpec::ForTask {
                    permits: 1,
                    task_group: format!("group-{}", i),
                }))
            })])
        };

        std::thread::scope(|s| {
            for worker in 0..8usize {
                let engine = engine.clone();
                s.spawn(move || {
                    for round in 0..50usize {
                        engine.reload(with_quotas((worker + round) % 5));
                    }
                });
            }
        });

        let installed: usize = engine
            .rules()
            .current()
            .iter()
            .map(|rule| rule.task_quotas().count())
            .sum();
        assert_eq!(engine.admission().permits().quota_count(), installed);
    }
}
