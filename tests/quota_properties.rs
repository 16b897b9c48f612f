// Behavioural properties of the quota engine, exercised through the public API.

use async_trait::async_trait;
use quotagate::admission::{QueueAdmissionController, QueueKind, Task, TaskPredicate};
use quotagate::rate_limit::TokenBucket;
use quotagate::rules::{Limit, NamespacePattern, Rule, RuleSet, RuleStore, Scope};
use quotagate::size::{ProjectList, RepoSizeProbe, SizeDecision, SizeQuotaEnforcer};
use quotagate::{QuotaError, StorageError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn controller(batch: usize) -> QueueAdmissionController {
    QueueAdmissionController::new([(QueueKind::Batch, batch)])
}

fn batch_task(id: u64) -> Arc<Task> {
    Arc::new(Task::new(id, QueueKind::Batch))
}

#[test]
fn test_token_bucket_burst_cap() {
    let bucket = TokenBucket::new(0.2, 20.0, 0);
    let start = Instant::now();

    for _ in 0..4 {
        assert!(bucket.try_acquire_at(start));
    }
    assert!(!bucket.try_acquire_at(start));

    let later = start + Duration::from_secs(20);
    for _ in 0..4 {
        assert!(bucket.try_acquire_at(later));
    }
    assert!(!bucket.try_acquire_at(later));
}

#[test]
fn test_namespace_precedence_follows_declared_order() {
    let broad = || {
        Rule::new(Scope::Namespace(NamespacePattern::parse("a/*").unwrap()))
            .with(Limit::MaxProjects(1))
    };
    let narrow = || {
        Rule::new(Scope::Namespace(NamespacePattern::parse("a/b/*").unwrap()))
            .with(Limit::MaxProjects(2))
    };

    let store = RuleStore::with_internal_groups(RuleSet::from_rules([broad(), narrow()]));
    let resolved = store.resolver().resolve_project("a/b/c").unwrap();
    assert_eq!(resolved.namespace.as_str(), "a/*");
    assert_eq!(resolved.rule.max_projects(), Some(1));

    let store = RuleStore::with_internal_groups(RuleSet::from_rules([narrow(), broad()]));
    let resolved = store.resolver().resolve_project("a/b/c").unwrap();
    assert_eq!(resolved.namespace.as_str(), "a/b/*");
    assert_eq!(resolved.rule.max_projects(), Some(2));
}

#[test]
fn test_concurrent_admission_respects_capacity() {
    let queues = Arc::new(controller(3));
    let admitted = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..8u64)
        .map(|worker| {
            let queues = queues.clone();
            let admitted = admitted.clone();
            std::thread::spawn(move || {
                for i in 0..125u64 {
                    if queues.try_start(&batch_task(worker * 1000 + i)) {
                        admitted.fetch_add(1, Ordering::SeqCst);
                    }
                    assert!(queues.running(QueueKind::Batch) <= 3);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(admitted.load(Ordering::SeqCst), 3);
    assert_eq!(queues.running(QueueKind::Batch), 3);
}

#[test]
fn test_concurrent_start_and_complete_never_exceed_capacity() {
    let queues = Arc::new(controller(3));

    let handles: Vec<_> = (0..6u64)
        .map(|worker| {
            let queues = queues.clone();
            std::thread::spawn(move || {
                for i in 0..200u64 {
                    let task = batch_task(worker * 1000 + i);
                    if queues.try_start(&task) {
                        assert!(queues.running(QueueKind::Batch) <= 3);
                        queues.complete(&task);
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(queues.running(QueueKind::Batch), 0);
}

#[test]
fn test_reservation_floor() {
    let queues = controller(3);
    let granted = queues
        .register_reservation(
            QueueKind::Batch,
            5,
            TaskPredicate::MemberOf("Service Users".to_string()),
        )
        .unwrap();
    assert_eq!(granted, 2);
    assert_eq!(queues.spare_threads(QueueKind::Batch), Some(1));

    let result = queues.register_reservation(
        QueueKind::Batch,
        1,
        TaskPredicate::MemberOf("Other".to_string()),
    );
    assert!(matches!(result, Err(QuotaError::ReservationRejected { .. })));
    assert_eq!(queues.spare_threads(QueueKind::Batch), Some(1));
}

#[test]
fn test_reservation_isolation() {
    let queues = controller(3);
    queues
        .register_reservation(
            QueueKind::Batch,
            1,
            TaskPredicate::MemberOf("Service Users".to_string()),
        )
        .unwrap();

    assert!(queues.try_start(&batch_task(1)));
    assert!(queues.try_start(&batch_task(2)));
    assert!(!queues.try_start(&batch_task(3)));
    assert_eq!(queues.running(QueueKind::Batch), 2);

    let ci = Arc::new(Task::new(4, QueueKind::Batch).with_groups(["Service Users"]));
    assert!(queues.try_start(&ci));
    assert_eq!(queues.running(QueueKind::Batch), 3);
}

#[test]
fn test_idempotent_completion() {
    let queues = controller(1);
    let task = batch_task(1);
    assert!(queues.try_start(&task));

    assert!(queues.complete(&task));
    assert!(!queues.complete(&task));
    assert_eq!(queues.running(QueueKind::Batch), 0);

    assert!(queues.try_start(&batch_task(2)));
    assert!(!queues.try_start(&batch_task(3)));
}

struct FixedSizes;

#[async_trait]
impl RepoSizeProbe for FixedSizes {
    async fn size_of(&self, project: &str) -> Result<u64, StorageError> {
        match project {
            "team/app" => Ok(400),
            _ => Err(StorageError::NotFound(project.to_string())),
        }
    }
}

#[tokio::test]
async fn test_size_round_trip() {
    let rules = RuleSet::from_rules([
        Rule::new(Scope::Namespace(NamespacePattern::parse("team/*").unwrap()))
            .with(Limit::MaxRepoSize(1000)),
    ]);
    let sizes = SizeQuotaEnforcer::new(
        RuleStore::with_internal_groups(rules),
        Arc::new(FixedSizes),
        Arc::new(ProjectList::new(["team/app"])),
    );

    let before = sizes.current_size("team/app").await.unwrap();
    assert_eq!(before, 400);

    assert_eq!(sizes.commit("team/app", 100).await.unwrap(), SizeDecision::Ok);
    assert_eq!(sizes.current_size("team/app").await.unwrap(), 500);
    sizes.refund("team/app", 100).await;
    assert_eq!(sizes.current_size("team/app").await.unwrap(), before);

    let decision = sizes.commit("team/app", 601).await.unwrap();
    assert_eq!(
        decision,
        SizeDecision::Exceeded {
            requested: 601,
            available: 600
        }
    );
    assert_eq!(sizes.current_size("team/app").await.unwrap(), before);
}
