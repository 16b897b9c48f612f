//! Tasks and the managed worker queues they run in.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::error::RuleError;
use crate::rules::{NamespacePattern, Scope};

/// Identifier the host's executor assigns to a task
pub type TaskId = u64;

/// Managed worker queues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    /// Interactive requests (fetch/push from users)
    Interactive,
    /// Batch requests (service accounts, CI)
    Batch,
    /// Receive-commits processing
    ReceiveCommits,
}

impl QueueKind {
    pub const ALL: [QueueKind; 3] = [
        QueueKind::Interactive,
        QueueKind::Batch,
        QueueKind::ReceiveCommits,
    ];

    /// Parse a queue name as written in rule text
    pub fn parse(name: &str) -> Result<Self, RuleError> {
        match name.to_lowercase().as_str() {
            "interactive" | "ssh-interactive-worker" => Ok(QueueKind::Interactive),
            "batch" | "ssh-batch-worker" => Ok(QueueKind::Batch),
            "receive-commits" | "receive_commits" | "receivecommits" => {
                Ok(QueueKind::ReceiveCommits)
            }
            _ => Err(RuleError::UnknownQueue(name.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueKind::Interactive => "interactive",
            QueueKind::Batch => "batch",
            QueueKind::ReceiveCommits => "receive-commits",
        }
    }
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work asking to run in a managed queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub id: TaskId,
    pub queue: QueueKind,
    /// Task group, e.g. `uploadpack` or `receivepack`
    pub task_group: Option<String>,
    /// User the task runs for
    pub user: Option<String>,
    /// Groups of that user
    pub groups: BTreeSet<String>,
    /// Project the task operates on
    pub project: Option<String>,
}

impl Task {
    pub fn new(id: TaskId, queue: QueueKind) -> Self {
        Self {
            id,
            queue,
            task_group: None,
            user: None,
            groups: BTreeSet::new(),
            project: None,
        }
    }

    pub fn with_task_group(mut self, group: &str) -> Self {
        self.task_group = Some(group.to_string());
        self
    }

    pub fn with_user(mut self, user: &str) -> Self {
        self.user = Some(user.to_string());
        self
    }

    pub fn with_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups = groups.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_project(mut self, project: &str) -> Self {
        self.project = Some(project.to_string());
        self
    }

    fn is_task_group(&self, group: &str) -> bool {
        self.task_group.as_deref() == Some(group)
    }

    fn is_user(&self, user: &str) -> bool {
        self.user.as_deref() == Some(user)
    }
}

/// Which tasks a reservation or task quota applies to
#[derive(Debug, Clone, PartialEq)]
pub enum TaskPredicate {
    /// Every task
    Any,
    /// Tasks on a project matching the pattern
    Project(NamespacePattern),
    /// Tasks whose user belongs to the group
    MemberOf(String),
    /// Tasks of the given task group
    TaskGroup(String),
    /// Tasks run for the given user
    User(String),
    /// Tasks matching every predicate
    All(Vec<TaskPredicate>),
}

impl TaskPredicate {
    /// Predicate selecting the tasks a rule scope covers
    pub fn for_scope(scope: &Scope) -> Self {
        match scope {
            Scope::Global => TaskPredicate::Any,
            Scope::Group(name) => TaskPredicate::MemberOf(name.clone()),
            Scope::Namespace(pattern) => TaskPredicate::Project(pattern.clone()),
        }
    }

    pub fn matches(&self, task: &Task) -> bool {
        match self {
            TaskPredicate::Any => true,
            TaskPredicate::Project(pattern) => task
                .project
                .as_deref()
                .map(|p| pattern.matches(p))
                .unwrap_or(false),
            TaskPredicate::MemberOf(group) => task.groups.contains(group),
            TaskPredicate::TaskGroup(group) => task.is_task_group(group),
            TaskPredicate::User(user) => task.is_user(user),
            TaskPredicate::All(all) => all.iter().all(|p| p.matches(task)),
        }
    }
}

impl fmt::Display for TaskPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskPredicate::Any => f.write_str("any"),
            TaskPredicate::Project(pattern) => write!(f, "project {}", pattern),
            TaskPredicate::MemberOf(group) => write!(f, "member of {}", group),
            TaskPredicate::TaskGroup(group) => write!(f, "task {}", group),
            TaskPredicate::User(user) => write!(f, "user {}", user),
            TaskPredicate::All(all) => {
                let parts: Vec<String> = all.iter().map(ToString::to_string).collect();
                f.write_str(&parts.join(" and "))
            }
        }
    }
}
