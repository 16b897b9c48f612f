//! Task Admission Module
//!
//! Decides whether a task may start in one of the managed worker queues.
//!
//! # Features
//!
//! - Fixed-size queues with reservations that guarantee slots to tasks
//!   matching a predicate (`minStartForQueue`)
//! - At least one general-purpose thread always stays unreserved
//! - Concurrency caps per queue, task group and user, including soft
//!   per-user caps that cost double once exceeded
//! - All-or-nothing permit acquisition, released together on stop
//!
//! # Architecture
//!
//! ```text
//! on_task_ready_to_start
//!        │
//!        ▼
//! ┌──────────────────────────┐  refused  ┌──────────┐
//! │ QueueAdmissionController ├──────────▶│  Parked  │ (host retries)
//! └────────────┬─────────────┘           └──────────┘
//!              │ admitted                      ▲
//!              ▼                               │ refused (queue slot rolled back)
//! ┌──────────────────────────┐                 │
//! │ TaskPermits (quotas)     ├─────────────────┘
//! └────────────┬─────────────┘
//!              ▼
//!           Running ── on_task_stopped ──▶ Idle
//! ```

pub mod config;
pub mod permits;
pub mod queue;
pub mod task;

#[cfg(test)]
mod proptests;

use std::sync::Arc;

use crate::error::QuotaError;
use crate::rules::RuleSet;

pub use config::QueueConfig;
pub use permits::{TaskPermits, TaskQuota};
pub use queue::{Admission, QueueAdmissionController, QueueSnapshot, Reservation};
pub use task::{QueueKind, Task, TaskId, TaskPredicate};

/// Host-facing task lifecycle hooks over queue admission and task quotas
#[derive(Debug)]
pub struct TaskAdmission {
    queues: QueueAdmissionController,
    permits: TaskPermits,
}

impl TaskAdmission {
    pub fn new(queues: QueueAdmissionController) -> Self {
        Self {
            queues,
            permits: TaskPermits::new(),
        }
    }

    pub fn from_config(config: &QueueConfig) -> Self {
        Self::new(QueueAdmissionController::from_config(config))
    }

    /// Register the `minStartForQueue` reservations of `rules`.
    ///
    /// Meant to run once at startup. Rejected reservations are logged and
    /// returned; the others stay registered.
    pub fn register_reservations(&self, rules: &RuleSet) -> Vec<QuotaError> {
        let mut errors = Vec::new();
        for rule in rules.iter() {
            for spec in rule.reservations() {
                let predicate = TaskPredicate::for_scope(&rule.scope);
                if let Err(error) =
                    self.queues
                        .register_reservation(spec.queue, spec.capacity, predicate)
                {
                    tracing::error!(scope = %rule.scope, %error, "Reservation not registered");
                    errors.push(error);
                }
            }
        }
        errors
    }

    /// Rebuild task quotas from `rules`
    pub fn apply_rules(&self, rules: &RuleSet) {
        self.permits
            .rebuild(rules, |queue| self.queues.max_threads(queue).unwrap_or(0));
    }

    /// The host wants to start `task`; `false` parks it for a later retry
    pub fn on_task_ready_to_start(&self, task: &Arc<Task>) -> bool {
        if !self.queues.try_start(task) {
            return false;
        }

        if !self.permits.try_acquire(task) {
            self.queues.complete(task);
            return false;
        }

        tracing::debug!(task_id = task.id, queue = %task.queue, "Task admitted");
        true
    }

    /// `task` finished; frees its slot and permits
    pub fn on_task_stopped(&self, task: &Task) {
        self.release(task);
    }

    /// The host decided not to run `task` after all
    pub fn on_task_not_ready_to_start(&self, task: &Task) {
        self.release(task);
    }

    fn release(&self, task: &Task) {
        self.permits.release(task);
        self.queues.complete(task);
    }

    pub fn queues(&self) -> &QueueAdmissionController {
        &self.queues
    }

    pub fn permits(&self) -> &TaskPermits {
        &self.permits
    }
}
