//! Project count quota (`maxProjects`)

use std::sync::Arc;

use crate::error::StorageError;
use crate::rules::RuleStore;
use crate::size::ProjectLister;

/// Outcome of a project creation check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateDecision {
    Allowed,
    /// The resolved namespace already holds `max_projects` projects
    Denied {
        namespace: String,
        max_projects: u64,
    },
}

impl CreateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, CreateDecision::Allowed)
    }

    pub fn message(&self) -> Option<String> {
        match self {
            CreateDecision::Allowed => None,
            CreateDecision::Denied {
                namespace,
                max_projects,
            } => Some(format!(
                "Project cannot be created: namespace {} is limited to {} projects",
                namespace, max_projects
            )),
        }
    }
}

/// Limits how many projects a namespace may hold
pub struct ProjectCountEnforcer {
    rules: RuleStore,
    projects: Arc<dyn ProjectLister>,
}

impl ProjectCountEnforcer {
    pub fn new(rules: RuleStore, projects: Arc<dyn ProjectLister>) -> Self {
        Self { rules, projects }
    }

    /// Whether `project` may be created
    pub async fn check_create(&self, project: &str) -> Result<CreateDecision, StorageError> {
        let Some(resolved) = self.rules.resolver().resolve_project(project) else {
            return Ok(CreateDecision::Allowed);
        };
        let Some(max_projects) = resolved.rule.max_projects() else {
            return Ok(CreateDecision::Allowed);
        };

        let existing = self
            .projects
            .projects()
            .await?
            .iter()
            .filter(|p| p.as_str() != project && resolved.namespace.matches(p))
            .count() as u64;

        if existing >= max_projects {
            tracing::debug!(
                project,
                namespace = %resolved.namespace,
                existing,
                max_projects,
                "Project count quota reached"
            );
            return Ok(CreateDecision::Denied {
                namespace: resolved.namespace.to_string(),
                max_projects,
            });
        }
        Ok(CreateDecision::Allowed)
    }
}

impl std::fmt::Debug for ProjectCountEnforcer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectCountEnforcer").finish_non_exhaustive()
    }
}
