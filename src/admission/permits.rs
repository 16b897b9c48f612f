//! Task quotas
//!
//! Concurrency caps layered on top of queue admission. Every applicable
//! quota must grant a permit before a task starts, and a task that cannot
//! collect all of them gives back the ones it already took.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::task::{QueueKind, Task, TaskId, TaskPredicate};
use crate::rules::{RuleSet, TaskQuotaSpec};

/// Fixed-size pool of permits
#[derive(Debug)]
pub struct PermitPool {
    capacity: usize,
    used: usize,
}

impl PermitPool {
    fn new(capacity: usize) -> Self {
        Self { capacity, used: 0 }
    }

    fn try_take(&mut self, n: usize) -> bool {
        if self.used + n > self.capacity {
            return false;
        }
        self.used += n;
        true
    }

    fn give_back(&mut self, n: usize) {
        self.used = self.used.saturating_sub(n);
    }
}

/// Shared pool of a soft-max quota and the running count of each user
#[derive(Debug)]
pub struct SoftMaxState {
    pool: PermitPool,
    per_user: HashMap<String, usize>,
}

/// One concurrency cap, scoped to the tasks its rule covers
#[derive(Debug)]
pub enum TaskQuota {
    /// `maxStartForQueue`: shared pool for every task of the queue
    ForQueue {
        scope: TaskPredicate,
        queue: QueueKind,
        pool: Mutex<PermitPool>,
    },
    /// `maxStartForTask`: pool for a task group in any queue
    ForTask {
        scope: TaskPredicate,
        task_group: String,
        pool: Mutex<PermitPool>,
    },
    /// `maxStartForTaskForQueue`
    ForTaskForQueue {
        scope: TaskPredicate,
        task_group: String,
        queue: QueueKind,
        pool: Mutex<PermitPool>,
    },
    /// `maxStartForTaskForUserForQueue`
    ForTaskForUserForQueue {
        scope: TaskPredicate,
        task_group: String,
        user: String,
        queue: QueueKind,
        pool: Mutex<PermitPool>,
    },
    /// `softMaxStartPerUserForQueue`: a user below `soft_max` running tasks
    /// pays one permit, above it two, out of a pool as large as the queue.
    SoftMaxPerUser {
        scope: TaskPredicate,
        queue: QueueKind,
        soft_max: usize,
        state: Mutex<SoftMaxState>,
    },
}

impl TaskQuota {
    /// Build a quota for `spec` declared in a rule covering `scope`.
    ///
    /// `max_threads` sizes the shared pool of soft-max quotas.
    pub fn new(spec: &TaskQuotaSpec, scope: TaskPredicate, max_threads: usize) -> Self {
        match spec.clone() {
            TaskQuotaSpec::ForQueue { permits, queue } => TaskQuota::ForQueue {
                scope,
                queue,
                pool: Mutex::new(PermitPool::new(permits)),
            },
            TaskQuotaSpec::ForTask {
                permits,
                task_group,
            } => TaskQuota::ForTask {
                scope,
                task_group,
                pool: Mutex::new(PermitPool::new(permits)),
            },
            TaskQuotaSpec::ForTaskForQueue {
                permits,
                task_group,
                queue,
            } => TaskQuota::ForTaskForQueue {
                scope,
                task_group,
                queue,
                pool: Mutex::new(PermitPool::new(permits)),
            },
            TaskQuotaSpec::ForTaskForUserForQueue {
                permits,
                task_group,
                user,
                queue,
            } => TaskQuota::ForTaskForUserForQueue {
                scope,
                task_group,
                user,
                queue,
                pool: Mutex::new(PermitPool::new(permits)),
            },
            TaskQuotaSpec::SoftMaxPerUser { soft_max, queue } => TaskQuota::SoftMaxPerUser {
                scope,
                queue,
                soft_max,
                state: Mutex::new(SoftMaxState {
                    pool: PermitPool::new(max_threads),
                    per_user: HashMap::new(),
                }),
            },
        }
    }

    /// Whether this quota governs `task`
    pub fn is_applicable(&self, task: &Task) -> bool {
        let task_group = |group: &str| task.task_group.as_deref() == Some(group);
        match self {
            TaskQuota::ForQueue { scope, queue, .. } => {
                task.queue == *queue && scope.matches(task)
            }
            TaskQuota::ForTask {
                scope, task_group: group, ..
            } => task_group(group) && scope.matches(task),
            TaskQuota::ForTaskForQueue {
                scope,
                task_group: group,
                queue,
                ..
            } => task.queue == *queue && task_group(group) && scope.matches(task),
            TaskQuota::ForTaskForUserForQueue {
                scope,
                task_group: group,
                user,
                queue,
                ..
            } => {
                task.queue == *queue
                    && task_group(group)
                    && task.user.as_deref() == Some(user.as_str())
                    && scope.matches(task)
            }
            TaskQuota::SoftMaxPerUser { scope, queue, .. } => {
                task.queue == *queue && task.user.is_some() && scope.matches(task)
            }
        }
    }

    /// Take the permits `task` needs; returns how many were taken
    pub fn try_acquire(&self, task: &Task) -> Option<usize> {
        match self {
            TaskQuota::ForQueue { pool, .. }
            | TaskQuota::ForTask { pool, .. }
            | TaskQuota::ForTaskForQueue { pool, .. }
            | TaskQuota::ForTaskForUserForQueue { pool, .. } => {
                pool.lock().try_take(1).then_some(1)
            }
            TaskQuota::SoftMaxPerUser {
                soft_max, state, ..
            } => {
                let user = task.user.as_deref()?;
                let mut state = state.lock();
                let running = state.per_user.get(user).copied().unwrap_or(0);
                let cost = if running < *soft_max { 1 } else { 2 };
                if !state.pool.try_take(cost) {
                    return None;
                }
                *state.per_user.entry(user.to_string()).or_insert(0) += 1;
                Some(cost)
            }
        }
    }

    /// Give back `cost` permits taken by `task`
    pub fn release(&self, task: &Task, cost: usize) {
        match self {
            TaskQuota::ForQueue { pool, .. }
            | TaskQuota::ForTask { pool, .. }
            | TaskQuota::ForTaskForQueue { pool, .. }
            | TaskQuota::ForTaskForUserForQueue { pool, .. } => pool.lock().give_back(cost),
            TaskQuota::SoftMaxPerUser { state, .. } => {
                let mut state = state.lock();
                state.pool.give_back(cost);
                if let Some(user) = task.user.as_deref() {
                    if let Some(count) = state.per_user.get_mut(user) {
                        *count = count.saturating_sub(1);
                        if *count == 0 {
                            state.per_user.remove(user);
                        }
                    }
                }
            }
        }
    }

    /// Permits currently handed out
    pub fn in_use(&self) -> usize {
        match self {
            TaskQuota::ForQueue { pool, .. }
            | TaskQuota::ForTask { pool, .. }
            | TaskQuota::ForTaskForQueue { pool, .. }
            | TaskQuota::ForTaskForUserForQueue { pool, .. } => pool.lock().used,
            TaskQuota::SoftMaxPerUser { state, .. } => state.lock().pool.used,
        }
    }
}

impl fmt::Display for TaskQuota {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskQuota::ForQueue { scope, queue, .. } => {
                write!(f, "maxStartForQueue {} ({})", queue, scope)
            }
            TaskQuota::ForTask {
                scope, task_group, ..
            } => write!(f, "maxStartForTask {} ({})", task_group, scope),
            TaskQuota::ForTaskForQueue {
                scope,
                task_group,
                queue,
                ..
            } => write!(f, "maxStartForTaskForQueue {} {} ({})", task_group, queue, scope),
            TaskQuota::ForTaskForUserForQueue {
                scope,
                task_group,
                user,
                queue,
                ..
            } => write!(
                f,
                "maxStartForTaskForUserForQueue {} {} {} ({})",
                task_group, user, queue, scope
            ),
            TaskQuota::SoftMaxPerUser {
                scope,
                queue,
                soft_max,
                ..
            } => write!(f, "softMaxStartPerUserForQueue {} {} ({})", soft_max, queue, scope),
        }
    }
}

/// Permit taken from one quota
#[derive(Debug)]
struct Permit {
    quota: Arc<TaskQuota>,
    cost: usize,
}

#[derive(Debug)]
struct Held {
    task: Arc<Task>,
    permits: Vec<Permit>,
}

/// Every task quota of the current rule set, and the permits held by
/// running tasks.
///
/// Permits remember the quota they came from, so a task started before a
/// rebuild returns its permits to the old pools.
#[derive(Debug, Default)]
pub struct TaskPermits {
    quotas: RwLock<Arc<Vec<Arc<TaskQuota>>>>,
    held: Mutex<HashMap<TaskId, Held>>,
}

impl TaskPermits {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the quotas with the ones declared in `rules`
    pub fn rebuild(&self, rules: &RuleSet, max_threads: impl Fn(QueueKind) -> usize) {
        let quotas: Vec<Arc<TaskQuota>> = rules
            .iter()
            .flat_map(|rule| {
                let scope = TaskPredicate::for_scope(&rule.scope);
                rule.task_quotas()
                    .map(|spec| {
                        let threads = match spec {
                            TaskQuotaSpec::SoftMaxPerUser { queue, .. } => max_threads(*queue),
                            _ => 0,
                        };
                        Arc::new(TaskQuota::new(spec, scope.clone(), threads))
                    })
                    .collect::<Vec<_>>()
            })
            .collect();

        tracing::debug!(
            generation = rules.generation(),
            quotas = quotas.len(),
            "Rebuilt task quotas"
        );
        *self.quotas.write() = Arc::new(quotas);
    }

    /// Take a permit from every quota applicable to `task`, or none at all.
    ///
    /// The holder table stays locked from the lookup to the insert, so a
    /// task started twice at once takes its permits only once.
    pub fn try_acquire(&self, task: &Arc<Task>) -> bool {
        let mut held = self.held.lock();
        if held.contains_key(&task.id) {
            return true;
        }

        let quotas = self.quotas.read().clone();
        let mut permits: Vec<Permit> = Vec::new();

        for quota in quotas.iter().filter(|q| q.is_applicable(task)) {
            match quota.try_acquire(task) {
                Some(cost) => permits.push(Permit {
                    quota: quota.clone(),
                    cost,
                }),
                None => {
                    tracing::debug!(task_id = task.id, quota = %quota, "Task quota exhausted");
                    for permit in permits {
                        permit.quota.release(task, permit.cost);
                    }
                    return false;
                }
            }
        }

        held.insert(
            task.id,
            Held {
                task: task.clone(),
                permits,
            },
        );
        true
    }

    /// Give back every permit `task` holds; returns whether it held any
    pub fn release(&self, task: &Task) -> bool {
        let Some(held) = self.held.lock().remove(&task.id) else {
            return false;
        };
        for permit in held.permits {
            permit.quota.release(&held.task, permit.cost);
        }
        true
    }

    /// Number of quotas in force
    pub fn quota_count(&self) -> usize {
        self.quotas.read().len()
    }

    /// Number of tasks holding permits
    pub fn holders(&self) -> usize {
        self.held.lock().len()
    }
}
