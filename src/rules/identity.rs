//! Caller identities used for group-scoped rule resolution.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Key a token bucket is cached under
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IdentityKey {
    /// Authenticated account
    Account(u64),
    /// Anonymous caller, keyed by remote host
    RemoteHost(String),
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityKey::Account(id) => write!(f, "account:{}", id),
            IdentityKey::RemoteHost(host) => write!(f, "host:{}", host),
        }
    }
}

/// A tenant identity together with the groups it belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub key: IdentityKey,
    pub groups: BTreeSet<String>,
}

impl Identity {
    /// Authenticated account with its group memberships
    pub fn account<I, S>(id: u64, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            key: IdentityKey::Account(id),
            groups: groups.into_iter().map(Into::into).collect(),
        }
    }

    /// Anonymous caller identified by remote host
    pub fn anonymous<I, S>(host: &str, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            key: IdentityKey::RemoteHost(host.to_string()),
            groups: groups.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether the identity is a member of `group`
    pub fn is_member(&self, group: &str) -> bool {
        self.groups.contains(group)
    }
}
