//! Error taxonomy shared by the tracker, caches, schedulers and the leader
//! coordinator.

use std::time::Duration;

use thiserror::Error;

/// Failure to establish or use a remote cluster connection. Always retried by
/// the next access; surfaced to reconcilers as a transient error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("resolving credentials for {cluster}: {reason}")]
    Credentials { cluster: String, reason: String },
    #[error("cluster {cluster} unreachable: {reason}")]
    Unreachable { cluster: String, reason: String },
    #[error("cluster {cluster} rejected credentials: {reason}")]
    Unauthorized { cluster: String, reason: String },
    #[error("cache for {cluster} did not sync within {timeout:?}")]
    StartupTimeout { cluster: String, timeout: Duration },
    #[error("cluster {cluster}: {source}")]
    Store { cluster: String, source: StoreError },
    #[error("connection tracker is shutting down")]
    ShuttingDown,
}

impl ConnectionError {
    pub fn is_unsupported_kind(&self) -> bool {
        matches!(self, ConnectionError::Store { source: StoreError::UnsupportedKind { .. }, .. })
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Configuration error: the kind is not in the cache's watch set.
    #[error("kind {kind} is not watched by this cache")]
    UnsupportedKind { kind: String },
    #[error("index {index} already registered for {kind}")]
    DuplicateIndex { kind: String, index: String },
    #[error("cache stopped")]
    Stopped,
}

/// Watch stream failure; the stream is reopened (with a fresh listing).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WatchError {
    #[error("watch stream failed: {0}")]
    Stream(String),
    #[error("decoding object: {0}")]
    Decode(String),
}

/// Outcome of a failed reconcile attempt.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Retried with exponential backoff; never abandoned.
    #[error("transient: {0}")]
    Transient(String),
    /// Not retried; the reconciler records a terminal condition on the object.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl ReconcileError {
    pub fn transient(msg: impl std::fmt::Display) -> Self {
        ReconcileError::Transient(msg.to_string())
    }

    pub fn fatal(msg: impl std::fmt::Display) -> Self {
        ReconcileError::Fatal(msg.to_string())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ReconcileError::Transient(_))
    }
}

impl From<ConnectionError> for ReconcileError {
    fn from(e: ConnectionError) -> Self {
        if e.is_unsupported_kind() {
            ReconcileError::Fatal(e.to_string())
        } else {
            ReconcileError::Transient(e.to_string())
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LeaseError {
    #[error("lease backend: {0}")]
    Backend(String),
    #[error("lease {lease} lost by {identity}")]
    Lost { lease: String, identity: String },
}
