//! Error types for store access and reconciliation.

use qualification_core::ObjectKey;
use thiserror::Error;

/// Failure of an object store call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// No object under the key.
    #[error("{kind} {key} not found")]
    NotFound {
        /// Object kind.
        kind: &'static str,
        /// Object key.
        key: ObjectKey,
    },
    /// Create of a key that is taken.
    #[error("{kind} {key} already exists")]
    AlreadyExists {
        /// Object kind.
        kind: &'static str,
        /// Object key.
        key: ObjectKey,
    },
    /// Update based on a stale resource version.
    #[error("conflict updating {kind} {key}: resource version {expected} is stale, current is {current}")]
    Conflict {
        /// Object kind.
        kind: &'static str,
        /// Object key.
        key: ObjectKey,
        /// Version the caller read.
        expected: u64,
        /// Version in the store.
        current: u64,
    },
    /// The object was rejected.
    #[error("invalid {kind}: {reason}")]
    Invalid {
        /// Object kind.
        kind: &'static str,
        /// Why.
        reason: String,
    },
    /// The store could not serve the call.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// True for [`StoreError::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// True for [`StoreError::Conflict`].
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Failure of one reconciliation.
///
/// Everything except [`ReconcileError::Terminal`] is retried with backoff.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Reading an object failed.
    #[error("failed to get {what}: {source}")]
    Fetch {
        /// What was read.
        what: String,
        /// Cause.
        #[source]
        source: StoreError,
    },
    /// Listing objects failed.
    #[error("failed to list {what}: {source}")]
    List {
        /// What was listed.
        what: String,
        /// Cause.
        #[source]
        source: StoreError,
    },
    /// Writing an object failed, including conflicts left after retrying.
    #[error("failed to update {what}: {source}")]
    Update {
        /// What was written.
        what: String,
        /// Cause.
        #[source]
        source: StoreError,
    },
    /// Retrying cannot help.
    #[error("{0}")]
    Terminal(String),
}

impl ReconcileError {
    /// True if the key should not be re-queued.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminal(_))
    }

    pub(crate) fn fetch(what: impl ToString, source: StoreError) -> Self {
        Self::Fetch {
            what: what.to_string(),
            source,
        }
    }

    pub(crate) fn list(what: impl ToString, source: StoreError) -> Self {
        Self::List {
            what: what.to_string(),
            source,
        }
    }

    pub(crate) fn update(what: impl ToString, source: StoreError) -> Self {
        Self::Update {
            what: what.to_string(),
            source,
        }
    }
}
