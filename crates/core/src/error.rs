use serde::{Deserialize, Serialize};

/// Errors returned by the API store and adapters.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum StoreError {
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("already_exists: {0}")]
    AlreadyExists(String),
    #[error("version_conflict: {0}")]
    VersionConflict(String),
    /// Malformed name or key.
    #[error("invalid: {0}")]
    Invalid(String),
    /// Rejected by the store's lifecycle rules (e.g. create in a terminating namespace).
    #[error("forbidden: {0}")]
    Forbidden(String),
    /// Store unavailable or throttled.
    #[error("transient: {0}")]
    Transient(String),
    #[error("permanent: {0}")]
    Permanent(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    pub fn is_not_found(&self) -> bool { matches!(self, StoreError::NotFound(_)) }

    pub fn is_conflict(&self) -> bool { matches!(self, StoreError::VersionConflict(_)) }

    /// Whether retrying the same call later can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Transient(_) | StoreError::VersionConflict(_) => true,
            StoreError::NotFound(_)
            | StoreError::AlreadyExists(_)
            | StoreError::Invalid(_)
            | StoreError::Forbidden(_)
            | StoreError::Permanent(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(StoreError::Transient("x".into()).is_retryable());
        assert!(StoreError::VersionConflict("x".into()).is_retryable());
        assert!(!StoreError::Permanent("x".into()).is_retryable());
        assert!(!StoreError::Invalid("x".into()).is_retryable());
        assert!(StoreError::NotFound("x".into()).is_not_found());
        assert_eq!(StoreError::NotFound("ns/a".into()).to_string(), "not_found: ns/a");
    }
}
