//! Rules and Rule Resolution
//!
//! A [`Rule`] scopes a list of typed limits to a group, a namespace pattern,
//! or the global fallback. Rules are immutable; a configuration reload
//! builds a fresh [`RuleSet`] and swaps it into the [`RuleStore`] in one step,
//! so readers see either the old set or the new one, never a mix.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   parse::parse_entry   ┌─────────┐   RuleStore::replace
//! │  RuleScopes  │ ─────────────────────▶ │ RuleSet │ ──────────────────▶ readers
//! │  (TOML)      │  bad entries skipped   │ (Arc)   │   RuleResolver snapshot
//! └──────────────┘                        └─────────┘
//! ```

pub mod identity;
pub mod namespace;
pub mod parse;
pub mod resolver;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::RuleError;

pub use identity::{Identity, IdentityKey};
pub use namespace::NamespacePattern;
pub use parse::{Limit, RateLimit, ReservationSpec, RuleValue, TaskQuotaSpec, TimeUnit};
pub use resolver::{
    GroupDirectory, GroupStatus, InternalGroups, ProjectRule, RuleResolver, StaticGroupDirectory,
};

/// Raw rule scopes as they appear in the configuration file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleScopes {
    /// Global fallback scope
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global: Option<BTreeMap<String, RuleValue>>,

    /// Group scopes, in declared order
    #[serde(default)]
    pub group: Vec<GroupScope>,

    /// Namespace scopes, in declared order
    #[serde(default)]
    pub namespace: Vec<NamespaceScope>,
}

/// `[[group]]` entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupScope {
    pub name: String,
    #[serde(flatten)]
    pub entries: BTreeMap<String, RuleValue>,
}

/// `[[namespace]]` entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamespaceScope {
    pub pattern: String,
    #[serde(flatten)]
    pub entries: BTreeMap<String, RuleValue>,
}

/// What a rule applies to
#[derive(Debug, Clone, PartialEq)]
pub enum Scope {
    Global,
    Group(String),
    Namespace(NamespacePattern),
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Global => f.write_str("global"),
            Scope::Group(name) => write!(f, "group \"{}\"", name),
            Scope::Namespace(ns) => write!(f, "namespace \"{}\"", ns),
        }
    }
}

/// A parsed rule: a scope plus its limits
#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    pub scope: Scope,
    pub limits: Vec<Limit>,
}

impl Rule {
    pub fn new(scope: Scope) -> Self {
        Self {
            scope,
            limits: Vec::new(),
        }
    }

    /// Builder-style limit append
    pub fn with(mut self, limit: Limit) -> Self {
        self.limits.push(limit);
        self
    }

    /// First rate limit declared for `rate_type`
    pub fn rate(&self, rate_type: &str) -> Option<&RateLimit> {
        self.limits.iter().find_map(|l| match l {
            Limit::Rate(r) if r.rate_type == rate_type => Some(r),
            _ => None,
        })
    }

    pub fn task_quotas(&self) -> impl Iterator<Item = &TaskQuotaSpec> {
        self.limits.iter().filter_map(|l| match l {
            Limit::MaxConcurrent(spec) => Some(spec),
            _ => None,
        })
    }

    pub fn reservations(&self) -> impl Iterator<Item = &ReservationSpec> {
        self.limits.iter().filter_map(|l| match l {
            Limit::ReservedSlots(spec) => Some(spec),
            _ => None,
        })
    }

    pub fn max_projects(&self) -> Option<u64> {
        self.limits.iter().find_map(|l| match l {
            Limit::MaxProjects(n) => Some(*n),
            _ => None,
        })
    }

    pub fn max_repo_size(&self) -> Option<u64> {
        self.limits.iter().find_map(|l| match l {
            Limit::MaxRepoSize(n) => Some(*n),
            _ => None,
        })
    }

    pub fn max_total_size(&self) -> Option<u64> {
        self.limits.iter().find_map(|l| match l {
            Limit::MaxTotalSize(n) => Some(*n),
            _ => None,
        })
    }

    /// Whether the rule carries any size ceiling
    pub fn has_size_limits(&self) -> bool {
        self.max_repo_size().is_some() || self.max_total_size().is_some()
    }
}

/// Configuration entry that was skipped while building a rule set
#[derive(Debug, Clone, PartialEq)]
pub struct SkippedEntry {
    pub scope: String,
    pub key: String,
    pub error: RuleError,
}

impl fmt::Display for SkippedEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.scope, self.key, self.error)
    }
}

/// Immutable, ordered set of rules
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    groups: Vec<Arc<Rule>>,
    namespaces: Vec<Arc<Rule>>,
    global: Option<Arc<Rule>>,
    generation: u64,
}

impl RuleSet {
    /// Assemble a rule set from already-parsed rules; declared order is kept
    pub fn from_rules(rules: impl IntoIterator<Item = Rule>) -> Self {
        let mut set = Self::default();
        for rule in rules {
            match rule.scope {
                Scope::Global => set.global = Some(Arc::new(rule)),
                Scope::Group(_) => set.groups.push(Arc::new(rule)),
                Scope::Namespace(_) => set.namespaces.push(Arc::new(rule)),
            }
        }
        set
    }

    /// Parse raw scopes into a rule set.
    ///
    /// Malformed entries are logged and skipped; the rest of the scope stays
    /// active. A namespace whose pattern cannot be parsed is skipped whole.
    pub fn build(scopes: &RuleScopes) -> (Self, Vec<SkippedEntry>) {
        let mut skipped = Vec::new();
        let mut rules = Vec::new();

        if let Some(entries) = &scopes.global {
            rules.push(build_rule(Scope::Global, entries, &mut skipped));
        }

        for group in &scopes.group {
            rules.push(build_rule(
                Scope::Group(group.name.clone()),
                &group.entries,
                &mut skipped,
            ));
        }

        for ns in &scopes.namespace {
            match NamespacePattern::parse(&ns.pattern) {
                Ok(pattern) => {
                    rules.push(build_rule(Scope::Namespace(pattern), &ns.entries, &mut skipped))
                }
                Err(error) => {
                    tracing::error!(pattern = %ns.pattern, %error, "Skipping namespace scope");
                    skipped.push(SkippedEntry {
                        scope: format!("namespace \"{}\"", ns.pattern),
                        key: "pattern".to_string(),
                        error,
                    });
                }
            }
        }

        (Self::from_rules(rules), skipped)
    }

    pub fn groups(&self) -> &[Arc<Rule>] {
        &self.groups
    }

    pub fn namespaces(&self) -> &[Arc<Rule>] {
        &self.namespaces
    }

    pub fn global(&self) -> Option<&Arc<Rule>> {
        self.global.as_ref()
    }

    /// Every rule, global first, then groups, then namespaces
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Rule>> {
        self.global
            .iter()
            .chain(self.groups.iter())
            .chain(self.namespaces.iter())
    }

    /// Generation number assigned when the set was installed
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_empty(&self) -> bool {
        self.global.is_none() && self.groups.is_empty() && self.namespaces.is_empty()
    }
}

fn build_rule(
    scope: Scope,
    entries: &BTreeMap<String, RuleValue>,
    skipped: &mut Vec<SkippedEntry>,
) -> Rule {
    let mut rule = Rule::new(scope);
    for (key, value) in entries {
        for parsed in parse::parse_entry(key, value) {
            match parsed {
                Ok(limit) => rule.limits.push(limit),
                Err(error) => {
                    tracing::error!(scope = %rule.scope, key = %key, %error, "Skipping invalid rule entry");
                    skipped.push(SkippedEntry {
                        scope: rule.scope.to_string(),
                        key: key.clone(),
                        error,
                    });
                }
            }
        }
    }
    rule
}

/// Shared handle to the current rule set
#[derive(Clone)]
pub struct RuleStore {
    current: Arc<RwLock<Arc<RuleSet>>>,
    directory: Arc<dyn GroupDirectory>,
    next_generation: Arc<AtomicU64>,
}

impl RuleStore {
    /// Create a store holding `rules` as generation 1
    pub fn new(rules: RuleSet, directory: Arc<dyn GroupDirectory>) -> Self {
        let store = Self {
            current: Arc::new(RwLock::new(Arc::new(RuleSet::default()))),
            directory,
            next_generation: Arc::new(AtomicU64::new(1)),
        };
        store.replace(rules);
        store
    }

    /// Store whose groups are all considered internal and visible
    pub fn with_internal_groups(rules: RuleSet) -> Self {
        Self::new(rules, Arc::new(InternalGroups))
    }

    /// Atomically install a new rule set; returns its generation
    pub fn replace(&self, rules: RuleSet) -> u64 {
        self.install(rules).generation()
    }

    /// Atomically install a new rule set and return it as installed
    pub fn install(&self, mut rules: RuleSet) -> Arc<RuleSet> {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        rules.generation = generation;
        let rules = Arc::new(rules);
        *self.current.write() = rules.clone();
        tracing::info!(generation, "Installed rule set");
        rules
    }

    /// Current rule set
    pub fn current(&self) -> Arc<RuleSet> {
        self.current.read().clone()
    }

    /// Resolver over a snapshot of the current rule set
    pub fn resolver(&self) -> RuleResolver {
        RuleResolver::new(self.current(), self.directory.clone())
    }
}

impl fmt::Debug for RuleStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleStore")
            .field("generation", &self.current().generation())
            .finish()
    }
}
