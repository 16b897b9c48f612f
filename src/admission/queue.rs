//! Queue Admission Controller
//!
//! Each managed queue has a fixed number of threads, a set of running tasks
//! and an ordered list of reservations. A reservation sets aside capacity
//! for tasks matching its predicate; whatever is left over ("spare threads")
//! is open to every task.
//!
//! All state of one queue lives behind a single mutex, so an admission is
//! add, validate, and roll back on failure, with no other caller observing
//! the intermediate state.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use super::config::QueueConfig;
use super::task::{QueueKind, Task, TaskPredicate};
use crate::error::QuotaError;
use crate::metrics;

/// Capacity set aside for tasks matching a predicate
#[derive(Debug, Clone)]
pub struct Reservation {
    pub capacity: usize,
    pub predicate: TaskPredicate,
}

#[derive(Debug)]
struct QueueState {
    max_threads: usize,
    spare_threads: usize,
    /// Admitted tasks, in admission order
    running: Vec<Arc<Task>>,
    reservations: Vec<Reservation>,
}

impl QueueState {
    fn new(max_threads: usize) -> Self {
        Self {
            max_threads,
            spare_threads: max_threads,
            running: Vec::new(),
            reservations: Vec::new(),
        }
    }

    /// Whether the running tasks fit the reservations plus the spare threads.
    ///
    /// Each task claims a slot of the first reservation that matches it and
    /// still has room; tasks no reservation takes count against the spare
    /// threads.
    fn can_allocate(&self) -> bool {
        let mut claimed = vec![0usize; self.reservations.len()];
        let mut unreserved = 0usize;

        'tasks: for task in &self.running {
            for (slot, reservation) in self.reservations.iter().enumerate() {
                if claimed[slot] < reservation.capacity && reservation.predicate.matches(task) {
                    claimed[slot] += 1;
                    continue 'tasks;
                }
            }
            unreserved += 1;
        }

        unreserved <= self.spare_threads
    }

    fn position(&self, task: &Task) -> Option<usize> {
        self.running.iter().position(|t| t.id == task.id)
    }
}

/// Why a start attempt was turned down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    /// Every thread of the queue is busy
    QueueFull,
    /// A thread is free but it is reserved for other tasks
    Reserved,
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted)
    }

    fn as_label(&self) -> &'static str {
        match self {
            Admission::Admitted => "admitted",
            Admission::QueueFull => "queue_full",
            Admission::Reserved => "reserved",
        }
    }
}

/// Point-in-time view of one queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueSnapshot {
    pub queue: QueueKind,
    pub max_threads: usize,
    pub spare_threads: usize,
    pub running: usize,
    pub reservations: Vec<ReservationSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReservationSnapshot {
    pub capacity: usize,
    pub predicate: String,
}

/// Admission control over the managed queues
#[derive(Debug)]
pub struct QueueAdmissionController {
    queues: HashMap<QueueKind, Mutex<QueueState>>,
}

impl QueueAdmissionController {
    /// Create a controller managing the given queues
    pub fn new(sizes: impl IntoIterator<Item = (QueueKind, usize)>) -> Self {
        let queues = sizes
            .into_iter()
            .map(|(queue, max_threads)| (queue, Mutex::new(QueueState::new(max_threads))))
            .collect();
        Self { queues }
    }

    pub fn from_config(config: &QueueConfig) -> Self {
        Self::new(config.sizes())
    }

    pub fn is_managed(&self, queue: QueueKind) -> bool {
        self.queues.contains_key(&queue)
    }

    /// Try to admit `task`; `true` means it may start now.
    ///
    /// Tasks of unmanaged queues are always admitted and not tracked. A task
    /// that is already running is admitted again without taking a second
    /// slot.
    pub fn try_start(&self, task: &Arc<Task>) -> bool {
        self.admit(task).is_admitted()
    }

    /// Like [`try_start`](Self::try_start), reporting why a task was refused
    pub fn admit(&self, task: &Arc<Task>) -> Admission {
        let Some(state) = self.queues.get(&task.queue) else {
            return Admission::Admitted;
        };

        let mut state = state.lock();
        if state.position(task).is_some() {
            tracing::debug!(task_id = task.id, queue = %task.queue, "Task already running");
            return Admission::Admitted;
        }

        let outcome = if state.running.len() >= state.max_threads {
            Admission::QueueFull
        } else {
            state.running.push(task.clone());
            if state.can_allocate() {
                Admission::Admitted
            } else {
                state.running.pop();
                Admission::Reserved
            }
        };

        let queue = task.queue.as_str();
        metrics::TASK_ADMISSIONS_TOTAL
            .with_label_values(&[queue, outcome.as_label()])
            .inc();
        metrics::RUNNING_TASKS
            .with_label_values(&[queue])
            .set(state.running.len() as i64);

        if !outcome.is_admitted() {
            tracing::debug!(
                task_id = task.id,
                queue = %task.queue,
                running = state.running.len(),
                outcome = outcome.as_label(),
                "Task not admitted"
            );
        }
        outcome
    }

    /// Release the slot of `task`; returns whether it was running
    pub fn complete(&self, task: &Task) -> bool {
        let Some(state) = self.queues.get(&task.queue) else {
            return false;
        };

        let mut state = state.lock();
        let Some(position) = state.position(task) else {
            return false;
        };
        state.running.remove(position);
        metrics::RUNNING_TASKS
            .with_label_values(&[task.queue.as_str()])
            .set(state.running.len() as i64);
        true
    }

    /// Whether at least `n` threads of `queue` are free. Unmanaged queues
    /// are never constrained.
    pub fn ensure_idle(&self, queue: QueueKind, n: usize) -> bool {
        match self.queues.get(&queue) {
            Some(state) => {
                let state = state.lock();
                state.max_threads.saturating_sub(state.running.len()) >= n
            }
            None => true,
        }
    }

    /// Set aside `capacity` threads of `queue` for tasks matching `predicate`.
    ///
    /// At least one spare thread always remains: a reservation that would
    /// take it is truncated, and one arriving when at most one spare thread
    /// is left is rejected. Returns the capacity actually reserved.
    pub fn register_reservation(
        &self,
        queue: QueueKind,
        capacity: usize,
        predicate: TaskPredicate,
    ) -> Result<usize, QuotaError> {
        let state = self
            .queues
            .get(&queue)
            .ok_or_else(|| QuotaError::UnmanagedQueue(queue.to_string()))?;

        let mut state = state.lock();
        if capacity == 0 {
            return Ok(0);
        }

        if state.spare_threads <= 1 {
            tracing::error!(
                %queue,
                capacity,
                predicate = %predicate,
                spare = state.spare_threads,
                "Rejecting reservation, no spare threads left"
            );
            return Err(QuotaError::ReservationRejected {
                queue: queue.to_string(),
                spare: state.spare_threads,
            });
        }

        let allowed = state.spare_threads - 1;
        let reserved = if capacity > allowed {
            tracing::warn!(
                %queue,
                requested = capacity,
                reserved = allowed,
                predicate = %predicate,
                "Truncating reservation to keep one spare thread"
            );
            allowed
        } else {
            capacity
        };

        state.spare_threads -= reserved;
        state.reservations.push(Reservation {
            capacity: reserved,
            predicate,
        });
        tracing::info!(%queue, reserved, spare = state.spare_threads, "Registered reservation");
        Ok(reserved)
    }

    pub fn max_threads(&self, queue: QueueKind) -> Option<usize> {
        self.queues.get(&queue).map(|s| s.lock().max_threads)
    }

    pub fn spare_threads(&self, queue: QueueKind) -> Option<usize> {
        self.queues.get(&queue).map(|s| s.lock().spare_threads)
    }

    /// Number of running tasks in `queue`
    pub fn running(&self, queue: QueueKind) -> usize {
        self.queues
            .get(&queue)
            .map(|s| s.lock().running.len())
            .unwrap_or(0)
    }

    pub fn is_running(&self, task: &Task) -> bool {
        self.queues
            .get(&task.queue)
            .map(|s| s.lock().position(task).is_some())
            .unwrap_or(false)
    }

    /// Snapshot of every managed queue, ordered by queue
    pub fn snapshot(&self) -> Vec<QueueSnapshot> {
        let mut snapshots: Vec<QueueSnapshot> = self
            .queues
            .iter()
            .map(|(queue, state)| {
                let state = state.lock();
                QueueSnapshot {
                    queue: *queue,
                    max_threads: state.max_threads,
                    spare_threads: state.spare_threads,
                    running: state.running.len(),
                    reservations: state
                        .reservations
                        .iter()
                        .map(|r| ReservationSnapshot {
                            capacity: r.capacity,
                            predicate: r.predicate.to_string(),
                        })
                        .collect(),
                }
            })
            .collect();
        snapshots.sort_by_key(|s| s.queue);
        snapshots
    }
}
