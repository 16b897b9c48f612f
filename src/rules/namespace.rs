//! Namespace Patterns
//!
//! A namespace scope names the projects a rule applies to. Four forms:
//!
//! - `a/b` exact project name
//! - `a/*` prefix glob, matches every project starting with `a/`
//! - `a/?/*` single-level wildcard, matches `a/<segment>/<rest>`; the matched
//!   segment is part of the resolved namespace (`a/b/c` resolves to `a/b/*`)
//! - `^a/.*-test$` raw regex

use regex::Regex;
use std::fmt;

use crate::error::RuleError;

const WILDCARD_SUFFIX: &str = "?/*";

/// A parsed namespace pattern
#[derive(Debug, Clone)]
pub enum NamespacePattern {
    /// Exact project name
    Exact(String),
    /// Prefix glob; holds the original pattern and the prefix before `*`
    Prefix { pattern: String, prefix: String },
    /// Single-level wildcard; holds the original pattern and the prefix before `?/*`
    Wildcard { pattern: String, prefix: String },
    /// Raw regex (leading `^`)
    Regex(Regex),
}

impl NamespacePattern {
    /// Parse a scope string
    pub fn parse(pattern: &str) -> Result<Self, RuleError> {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return Err(RuleError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: "empty pattern".to_string(),
            });
        }

        if pattern.starts_with('^') {
            let regex = Regex::new(pattern).map_err(|e| RuleError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: e.to_string(),
            })?;
            return Ok(NamespacePattern::Regex(regex));
        }

        if let Some(prefix) = pattern.strip_suffix(WILDCARD_SUFFIX) {
            if prefix.is_empty() || prefix.ends_with('/') {
                return Ok(NamespacePattern::Wildcard {
                    pattern: pattern.to_string(),
                    prefix: prefix.to_string(),
                });
            }
        }

        if let Some(prefix) = pattern.strip_suffix('*') {
            return Ok(NamespacePattern::Prefix {
                pattern: pattern.to_string(),
                prefix: prefix.to_string(),
            });
        }

        Ok(NamespacePattern::Exact(pattern.to_string()))
    }

    /// Pattern matching every project; used to aggregate under the global rule
    pub fn all() -> Self {
        NamespacePattern::Prefix {
            pattern: "*".to_string(),
            prefix: String::new(),
        }
    }

    /// The pattern as written in configuration
    pub fn as_str(&self) -> &str {
        match self {
            NamespacePattern::Exact(name) => name,
            NamespacePattern::Prefix { pattern, .. } => pattern,
            NamespacePattern::Wildcard { pattern, .. } => pattern,
            NamespacePattern::Regex(regex) => regex.as_str(),
        }
    }

    /// Whether `project` falls under this pattern
    pub fn matches(&self, project: &str) -> bool {
        match self {
            NamespacePattern::Exact(name) => name == project,
            NamespacePattern::Prefix { prefix, .. } => project.starts_with(prefix.as_str()),
            NamespacePattern::Wildcard { prefix, .. } => wildcard_segment(prefix, project).is_some(),
            NamespacePattern::Regex(regex) => regex.is_match(project),
        }
    }

    /// Match `project` and return the namespace used for aggregation.
    ///
    /// For every form except the single-level wildcard the resolved namespace
    /// is the pattern itself. A wildcard expands into a prefix glob over the
    /// matched segment.
    pub fn resolve(&self, project: &str) -> Option<NamespacePattern> {
        match self {
            NamespacePattern::Wildcard { prefix, .. } => {
                let segment = wildcard_segment(prefix, project)?;
                let resolved_prefix = format!("{}{}/", prefix, segment);
                Some(NamespacePattern::Prefix {
                    pattern: format!("{}*", resolved_prefix),
                    prefix: resolved_prefix,
                })
            }
            _ if self.matches(project) => Some(self.clone()),
            _ => None,
        }
    }
}

/// Segment matched by `<prefix>?/*`: one non-empty path segment followed by a
/// non-empty sub-path.
fn wildcard_segment<'a>(prefix: &str, project: &'a str) -> Option<&'a str> {
    let rest = project.strip_prefix(prefix)?;
    let (segment, tail) = rest.split_once('/')?;
    if segment.is_empty() || tail.is_empty() {
        return None;
    }
    Some(segment)
}

impl PartialEq for NamespacePattern {
    fn eq(&self, other: &Self) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
            && self.as_str() == other.as_str()
    }
}

impl Eq for NamespacePattern {}

impl fmt::Display for NamespacePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact() {
        let ns = NamespacePattern::parse("a/b").unwrap();
        assert!(matches!(ns, NamespacePattern::Exact(_)));
        assert!(ns.matches("a/b"));
        assert!(!ns.matches("a/b/c"));
        assert_eq!(ns.resolve("a/b"), Some(ns.clone()));
    }

    #[test]
    fn test_prefix_glob() {
        let ns = NamespacePattern::parse("a/*").unwrap();
        assert!(ns.matches("a/b"));
        assert!(ns.matches("a/b/c"));
        assert!(!ns.matches("ab/c"));
        assert_eq!(ns.resolve("a/b/c").unwrap().as_str(), "a/*");
    }

    #[test]
    fn test_wildcard_resolves_segment() {
        let ns = NamespacePattern::parse("a/?/*").unwrap();
        let resolved = ns.resolve("a/b/c").unwrap();
        assert_eq!(resolved.as_str(), "a/b/*");
        assert!(resolved.matches("a/b/d"));
        assert!(!resolved.matches("a/x/d"));
    }

    #[test]
    fn test_wildcard_requires_sub_path() {
        let ns = NamespacePattern::parse("a/?/*").unwrap();
        assert!(!ns.matches("a/b"));
        assert!(!ns.matches("a/b/"));
        assert!(!ns.matches("a//c"));
        assert!(ns.matches("a/b/c/d"));
    }

    #[test]
    fn test_top_level_wildcard() {
        let ns = NamespacePattern::parse("?/*").unwrap();
        assert_eq!(ns.resolve("team/repo").unwrap().as_str(), "team/*");
        assert!(!ns.matches("repo"));
    }

    #[test]
    fn test_regex() {
        let ns = NamespacePattern::parse("^test-.*$").unwrap();
        assert!(ns.matches("test-one"));
        assert!(!ns.matches("prod/test-one"));
        assert_eq!(ns.resolve("test-two").unwrap().as_str(), "^test-.*$");
    }

    #[test]
    fn test_invalid_regex() {
        let err = NamespacePattern::parse("^(unclosed").unwrap_err();
        assert!(matches!(err, RuleError::InvalidPattern { .. }));
    }

    #[test]
    fn test_all_matches_everything() {
        let all = NamespacePattern::all();
        assert!(all.matches("x"));
        assert!(all.matches("x/y/z"));
    }
}
