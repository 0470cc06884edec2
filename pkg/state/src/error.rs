//! Error classes returned by the object store.
//!
//! Callers branch on the class (not found, already exists, conflict,
//! timeout); everything else is an opaque backend failure.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} \"{name}\" not found")]
    NotFound { kind: String, name: String },

    #[error("{kind} \"{name}\" already exists")]
    AlreadyExists { kind: String, name: String },

    /// The caller's `resourceVersion` is stale.
    #[error("conflict writing {kind} \"{name}\": stored version {stored}, given {given}")]
    Conflict {
        kind: String,
        name: String,
        stored: u64,
        given: u64,
    },

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid object: {0}")]
    Invalid(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage error: {0}")]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, StoreError::AlreadyExists { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, StoreError::Timeout(_))
    }
}

fn classify(err: &anyhow::Error, pred: fn(&StoreError) -> bool) -> bool {
    err.chain()
        .filter_map(|e| e.downcast_ref::<StoreError>())
        .any(pred)
}

/// `true` when any error in the chain is a `NotFound` store error.
pub fn is_not_found(err: &anyhow::Error) -> bool {
    classify(err, StoreError::is_not_found)
}

pub fn is_already_exists(err: &anyhow::Error) -> bool {
    classify(err, StoreError::is_already_exists)
}

pub fn is_conflict(err: &anyhow::Error) -> bool {
    classify(err, StoreError::is_conflict)
}

pub fn is_timeout(err: &anyhow::Error) -> bool {
    classify(err, StoreError::is_timeout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn classes_survive_anyhow_wrapping() {
        let err: anyhow::Error = StoreError::NotFound {
            kind: "Deployment".to_string(),
            name: "web".to_string(),
        }
        .into();
        assert!(is_not_found(&err));
        assert!(!is_conflict(&err));

        let wrapped: anyhow::Result<()> =
            Err(StoreError::Timeout(Duration::from_secs(1))).context("creating pool");
        let wrapped = wrapped.unwrap_err();
        assert!(is_timeout(&wrapped));
        assert!(!is_already_exists(&wrapped));
    }
}
