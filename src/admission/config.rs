//! Queue sizing configuration

use serde::{Deserialize, Serialize};

use super::task::QueueKind;

/// Maximum threads of each managed queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub interactive: usize,
    pub batch: usize,
    pub receive_commits: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            interactive: 8,
            batch: 2,
            receive_commits: 4,
        }
    }
}

impl QueueConfig {
    pub fn max_threads(&self, queue: QueueKind) -> usize {
        match queue {
            QueueKind::Interactive => self.interactive,
            QueueKind::Batch => self.batch,
            QueueKind::ReceiveCommits => self.receive_commits,
        }
    }

    /// `(queue, max threads)` for every managed queue
    pub fn sizes(&self) -> Vec<(QueueKind, usize)> {
        QueueKind::ALL
            .iter()
            .map(|&queue| (queue, self.max_threads(queue)))
            .collect()
    }
}
