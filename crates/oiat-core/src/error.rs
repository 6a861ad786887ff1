//! Error types and result aliases shared across the OIAT components.
//!
//! Errors carry a stable kind tag so logs and run records can be filtered
//! programmatically. Per-document and per-phase recovery policy lives with
//! the callers; this module only classifies.

use std::fmt;

/// The result type used throughout OIAT.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in OIAT operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed or incomplete tenant configuration.
    #[error("config error: {message}")]
    Config {
        /// Description of what is wrong with the configuration.
        message: String,
    },

    /// A credential environment variable is not set.
    #[error("credential missing: {env_key} is not set")]
    CredentialMissing {
        /// The environment variable that was expected.
        env_key: String,
    },

    /// The OAuth2 refresh-token grant failed; operator re-auth is required.
    #[error("token refresh failed: {message}")]
    TokenRefreshFailed {
        /// Description of the refresh failure.
        message: String,
    },

    /// A network-level failure talking to the remote accounting service.
    #[error("remote network error: {message}")]
    RemoteNetwork {
        /// Description of the transport failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The remote service rejected a document.
    #[error("remote validation error {code}: {message}")]
    RemoteValidation {
        /// Remote fault code.
        code: String,
        /// Remote fault detail.
        message: String,
    },

    /// A document was blocked by an inventory rule on the remote side.
    #[error("inventory blocked: {message}")]
    InventoryBlocked {
        /// Remediation guidance for the operator.
        message: String,
    },

    /// A duplicate document was detected where creation was expected.
    #[error("duplicate detected: {doc_number}")]
    DuplicateDetected {
        /// The conflicting document number.
        doc_number: String,
    },

    /// Merging a spill file into a split file failed.
    #[error("spill merge error: {message}")]
    SpillMerge {
        /// Description of the merge failure.
        message: String,
    },

    /// Archival failed after a successful upload.
    #[error("archive error: {message}")]
    Archive {
        /// Description of the archive failure.
        message: String,
    },

    /// The global run lock is held by another process.
    #[error("run lock held by pid {pid}")]
    LockHeld {
        /// PID recorded in the lock file.
        pid: i32,
    },

    /// A storage (database or file) operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// An invalid identifier was provided.
    #[error("invalid identifier: {message}")]
    InvalidId {
        /// Description of what made the identifier invalid.
        message: String,
    },

    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The requested resource was not found.
    #[error("not found: {resource_type} with id {id}")]
    ResourceNotFound {
        /// The type of resource that was not found.
        resource_type: &'static str,
        /// The identifier that was looked up.
        id: String,
    },

    /// An I/O error with path context.
    #[error("io error at {path}: {source}")]
    Io {
        /// Path involved in the failed operation.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// An internal error that should not happen in normal operation.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl Error {
    /// Creates a new config error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a new storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source cause.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new network error with a source cause.
    #[must_use]
    pub fn network(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::RemoteNetwork {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new resource not found error.
    #[must_use]
    pub fn resource_not_found(resource_type: &'static str, id: impl fmt::Display) -> Self {
        Self::ResourceNotFound {
            resource_type,
            id: id.to_string(),
        }
    }

    /// Creates an I/O error with path context.
    #[must_use]
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Stable machine-readable kind tag for structured logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Config { .. } => "config",
            Self::CredentialMissing { .. } => "credential_missing",
            Self::TokenRefreshFailed { .. } => "token_refresh_failed",
            Self::RemoteNetwork { .. } => "remote_network",
            Self::RemoteValidation { .. } => "remote_validation",
            Self::InventoryBlocked { .. } => "inventory_blocked",
            Self::DuplicateDetected { .. } => "duplicate_detected",
            Self::SpillMerge { .. } => "spill_merge",
            Self::Archive { .. } => "archive",
            Self::LockHeld { .. } => "lock_held",
            Self::Storage { .. } => "storage",
            Self::InvalidId { .. } => "invalid_id",
            Self::InvalidInput(_) => "invalid_input",
            Self::ResourceNotFound { .. } => "not_found",
            Self::Io { .. } => "io",
            Self::Internal { .. } => "internal",
        }
    }

    /// Concise operator-facing failure reason, capped at 200 characters.
    ///
    /// Full details stay in the run log; this string is what the run record
    /// and the portal render inline.
    #[must_use]
    pub fn failure_reason(&self) -> String {
        let mut reason = self.to_string();
        if reason.len() > 200 {
            let mut cut = 200;
            while !reason.is_char_boundary(cut) {
                cut -= 1;
            }
            reason.truncate(cut);
        }
        reason
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_tags_are_stable() {
        assert_eq!(Error::config("x").kind(), "config");
        assert_eq!(Error::LockHeld { pid: 42 }.kind(), "lock_held");
        assert_eq!(
            Error::RemoteValidation {
                code: "6140".into(),
                message: "dup".into()
            }
            .kind(),
            "remote_validation"
        );
    }

    #[test]
    fn failure_reason_is_capped() {
        let long = "x".repeat(500);
        let err = Error::config(long);
        assert!(err.failure_reason().len() <= 200);
    }

    #[test]
    fn storage_error_preserves_source() {
        use std::error::Error as StdError;
        let source = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = Error::storage_with_source("ledger read", source);
        assert!(StdError::source(&err).is_some());
        assert!(err.to_string().contains("storage error"));
    }

    #[test]
    fn lock_held_names_the_pid() {
        let err = Error::LockHeld { pid: 1234 };
        assert!(err.to_string().contains("1234"));
    }
}
