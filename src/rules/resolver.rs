//! Rule Resolver
//!
//! Maps an identity or a project name to the single best-matching rule.
//! Resolution is a pure function of the rule set snapshot it was created
//! over, so a resolver can be shared freely between threads.

use std::collections::HashMap;
use std::sync::Arc;

use super::identity::Identity;
use super::namespace::NamespacePattern;
use super::{Rule, RuleSet, Scope};

/// How the host knows a group referenced by a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStatus {
    /// Internal, visible group; rules scoped to it apply
    Internal,
    /// Group backed by an external system; ignored
    External,
    /// Group exists but is not visible to the engine
    NotVisible,
    /// No such group
    Missing,
}

/// Group lookup supplied by the host
pub trait GroupDirectory: Send + Sync {
    fn status(&self, group: &str) -> GroupStatus;
}

/// Directory treating every group as internal and visible
#[derive(Debug, Clone, Copy, Default)]
pub struct InternalGroups;

impl GroupDirectory for InternalGroups {
    fn status(&self, _group: &str) -> GroupStatus {
        GroupStatus::Internal
    }
}

/// Fixed group table; unknown groups report `Missing`
#[derive(Debug, Clone, Default)]
pub struct StaticGroupDirectory {
    groups: HashMap<String, GroupStatus>,
}

impl StaticGroupDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_group(mut self, name: &str, status: GroupStatus) -> Self {
        self.groups.insert(name.to_string(), status);
        self
    }
}

impl GroupDirectory for StaticGroupDirectory {
    fn status(&self, group: &str) -> GroupStatus {
        self.groups
            .get(group)
            .copied()
            .unwrap_or(GroupStatus::Missing)
    }
}

/// Rule matched for a project, with the namespace used for aggregation
#[derive(Debug, Clone)]
pub struct ProjectRule {
    pub rule: Arc<Rule>,
    /// Resolved namespace; `*` when the global fallback matched
    pub namespace: NamespacePattern,
}

/// Resolver over one rule set snapshot
#[derive(Clone)]
pub struct RuleResolver {
    rules: Arc<RuleSet>,
    directory: Arc<dyn GroupDirectory>,
}

impl RuleResolver {
    pub fn new(rules: Arc<RuleSet>, directory: Arc<dyn GroupDirectory>) -> Self {
        Self { rules, directory }
    }

    /// Rule set this resolver reads from
    pub fn rules(&self) -> &Arc<RuleSet> {
        &self.rules
    }

    /// Global fallback rule, if configured
    pub fn global(&self) -> Option<Arc<Rule>> {
        self.rules.global().cloned()
    }

    /// First group rule, in declared order, whose group `identity` belongs to
    pub fn resolve_identity(&self, identity: &Identity) -> Option<Arc<Rule>> {
        self.resolve_identity_where(identity, |_| true)
    }

    /// Like [`resolve_identity`](Self::resolve_identity), only considering
    /// rules accepted by `filter` (e.g. rules carrying a given rate type).
    pub fn resolve_identity_where<F>(&self, identity: &Identity, filter: F) -> Option<Arc<Rule>>
    where
        F: Fn(&Rule) -> bool,
    {
        for rule in self.rules.groups() {
            let Scope::Group(name) = &rule.scope else {
                continue;
            };
            if !filter(rule) {
                continue;
            }
            match self.directory.status(name) {
                GroupStatus::Internal => {}
                status => {
                    tracing::debug!(group = %name, ?status, "Ignoring rule for unusable group");
                    continue;
                }
            }
            if identity.is_member(name) {
                return Some(rule.clone());
            }
        }
        None
    }

    /// First namespace rule, in declared order, matching `project`; falls
    /// back to the global rule when none does.
    pub fn resolve_project(&self, project: &str) -> Option<ProjectRule> {
        for rule in self.rules.namespaces() {
            let Scope::Namespace(pattern) = &rule.scope else {
                continue;
            };
            if let Some(namespace) = pattern.resolve(project) {
                return Some(ProjectRule {
                    rule: rule.clone(),
                    namespace,
                });
            }
        }

        self.rules.global().map(|rule| ProjectRule {
            rule: rule.clone(),
            namespace: NamespacePattern::all(),
        })
    }
}

impl std::fmt::Debug for RuleResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleResolver")
            .field("generation", &self.rules.generation())
            .finish()
    }
}
