//! Property-Based Tests for Queue Admission
//!
//! Random sequences of start and complete calls must never push a queue
//! past its thread count, and with reservations the tasks outside every
//! reservation must never occupy more than the spare threads.
//!
//! ```bash
//! cargo test --lib admission::proptests
//! ```

use proptest::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;

use super::queue::QueueAdmissionController;
use super::task::{QueueKind, Task, TaskPredicate};

#[derive(Debug, Clone)]
enum Op {
    Start { id: u64, privileged: bool },
    Complete { id: u64 },
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0u64..20, any::<bool>()).prop_map(|(id, privileged)| Op::Start { id, privileged }),
        2 => (0u64..20).prop_map(|id| Op::Complete { id }),
    ]
}

fn make_task(id: u64, privileged: bool) -> Arc<Task> {
    let task = Task::new(id, QueueKind::Batch);
    Arc::new(if privileged {
        task.with_groups(["Privileged"])
    } else {
        task
    })
}

proptest! {
    /// Without reservations a start succeeds exactly when a thread is free
    #[test]
    fn prop_capacity_matches_model(
        max_threads in 1usize..6,
        ops in prop::collection::vec(arb_op(), 1..200)
    ) {
        let queues = QueueAdmissionController::new([(QueueKind::Batch, max_threads)]);
        let mut model: BTreeSet<u64> = BTreeSet::new();

        for op in ops {
            match op {
                Op::Start { id, privileged } => {
                    let expected = model.contains(&id) || model.len() < max_threads;
                    let admitted = queues.try_start(&make_task(id, privileged));
                    prop_assert_eq!(admitted, expected);
                    if admitted {
                        model.insert(id);
                    }
                }
                Op::Complete { id } => {
                    let was_running = model.remove(&id);
                    prop_assert_eq!(queues.complete(&make_task(id, false)), was_running);
                }
            }
            prop_assert!(queues.running(QueueKind::Batch) <= max_threads);
            prop_assert_eq!(queues.running(QueueKind::Batch), model.len());
        }
    }

    /// Unprivileged tasks never take more than the spare threads
    #[test]
    fn prop_reservation_accounting(
        max_threads in 2usize..8,
        reserved in 1usize..8,
        ops in prop::collection::vec(arb_op(), 1..200)
    ) {
        let queues = QueueAdmissionController::new([(QueueKind::Batch, max_threads)]);
        let reserved = queues
            .register_reservation(
                QueueKind::Batch,
                reserved,
                TaskPredicate::MemberOf("Privileged".to_string()),
            )
            .unwrap();
        prop_assert!(reserved < max_threads);
        let spare = queues.spare_threads(QueueKind::Batch).unwrap();
        prop_assert_eq!(spare, max_threads - reserved);

        let mut running: BTreeSet<(u64, bool)> = BTreeSet::new();
        for op in ops {
            match op {
                Op::Start { id, privileged } => {
                    if running.iter().any(|(r, _)| *r == id) {
                        continue;
                    }
                    if queues.try_start(&make_task(id, privileged)) {
                        running.insert((id, privileged));
                    }
                }
                Op::Complete { id } => {
                    queues.complete(&make_task(id, false));
                    running.retain(|(r, _)| *r != id);
                }
            }

            let unprivileged = running.iter().filter(|(_, p)| !p).count();
            prop_assert!(unprivileged <= spare);
            prop_assert!(running.len() <= max_threads);
            prop_assert_eq!(queues.running(QueueKind::Batch), running.len());
        }
    }
}
