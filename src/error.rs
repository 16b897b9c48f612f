//! Quota Engine Error Types
//!
//! Expected denials (rate limited, queue full, size exceeded) are never
//! errors; they are reported through typed decision values. The types here
//! cover configuration problems and storage failures.

use std::path::PathBuf;

/// Error raised while turning a configuration entry into a rule.
///
/// These are logged and the offending entry is skipped; they never abort a
/// whole rule set.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuleError {
    /// Rate expression did not match `<N> / <unit> burst <B>`
    #[error("Invalid rate expression '{0}': expected '<N> / <unit> [burst <B>]'")]
    InvalidRate(String),

    /// Unknown time unit in a rate expression
    #[error("Unknown time unit '{0}'")]
    UnknownUnit(String),

    /// Size value could not be parsed
    #[error("Invalid size '{0}'")]
    InvalidSize(String),

    /// Integer value could not be parsed
    #[error("Invalid count '{0}'")]
    InvalidCount(String),

    /// Task quota text had the wrong shape for its key
    #[error("Invalid value '{value}' for {key}: expected '{expected}'")]
    InvalidTaskQuota {
        key: String,
        value: String,
        expected: &'static str,
    },

    /// Queue name is not one of the managed queues
    #[error("Unknown queue '{0}'")]
    UnknownQueue(String),

    /// Namespace regex failed to compile
    #[error("Invalid namespace pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// Value had the wrong TOML type for its key
    #[error("Unsupported value for {0}")]
    UnsupportedValue(String),
}

/// Error raised while reading a project's size from storage.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The project has no repository yet; treated as zero bytes
    #[error("Repository not found for project {0}")]
    NotFound(String),

    /// Any other read failure; the request is rejected
    #[error("Failed to read size of {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Probe could not complete (e.g. a blocking task was cancelled)
    #[error("Size probe failed for project {project}: {reason}")]
    Probe { project: String, reason: String },
}

impl StorageError {
    /// Whether this error means "no repository yet"
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}

/// Crate-level error type
#[derive(Debug, thiserror::Error)]
pub enum QuotaError {
    /// Configuration could not be turned into rules
    #[error("Rule error: {0}")]
    Rule(#[from] RuleError),

    /// Size lookup failed
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Queue is not managed by this controller
    #[error("Queue {0} is not managed")]
    UnmanagedQueue(String),

    /// Reservation could not be registered
    #[error("Reservation rejected on queue {queue}: {spare} spare thread(s) left")]
    ReservationRejected { queue: String, spare: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_is_distinguished() {
        assert!(StorageError::NotFound("a/b".to_string()).is_not_found());

        let io = StorageError::Io {
            path: PathBuf::from("/srv/a.git"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        assert!(!io.is_not_found());
    }

    #[test]
    fn test_error_messages() {
        let err = RuleError::InvalidRate("ten per hour".to_string());
        assert!(err.to_string().contains("ten per hour"));

        let err = QuotaError::ReservationRejected {
            queue: "batch".to_string(),
            spare: 1,
        };
        assert_eq!(
            err.to_string(),
            "Reservation rejected on queue batch: 1 spare thread(s) left"
        );
    }
}
