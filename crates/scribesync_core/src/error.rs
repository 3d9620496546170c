//! The error taxonomy shared by every component in this crate.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, SyncCoreError>;

/// Everything that can go wrong while syncing notes.
///
/// Each variant corresponds to one of the error kinds a component is allowed
/// to raise; callers match on the variant rather than a string to decide how
/// to react (retry, surface to the user, or just log and move on).
#[derive(Debug, Error)]
pub enum SyncCoreError {
    /// The persistence port failed to complete an operation.
    #[error("storage error: {0}")]
    Storage(String),

    /// A transport-layer failure: socket closed, HTTP connect failed, DNS, etc.
    #[error("network error: {0}")]
    Network(String),

    /// A frame or response body did not parse as valid JSON/protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Invalid base64, or a CRDT update that failed to decode.
    #[error("decode error: {0}")]
    Decode(String),

    /// Missing or rejected credentials.
    #[error("auth error: {0}")]
    Auth(String),

    /// An internally-impossible state was observed (id mismatch, etc).
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// The remote full-sync endpoint answered with a non-2xx status.
    #[error("sync request failed with status {0}")]
    Http(u16),
}

impl SyncCoreError {
    /// Build a [`SyncCoreError::Storage`] from any displayable cause.
    pub fn storage(cause: impl std::fmt::Display) -> Self {
        Self::Storage(cause.to_string())
    }

    /// Build a [`SyncCoreError::Network`] from any displayable cause.
    pub fn network(cause: impl std::fmt::Display) -> Self {
        Self::Network(cause.to_string())
    }

    /// Build a [`SyncCoreError::Protocol`] from any displayable cause.
    pub fn protocol(cause: impl std::fmt::Display) -> Self {
        Self::Protocol(cause.to_string())
    }

    /// Build a [`SyncCoreError::Decode`] from any displayable cause.
    pub fn decode(cause: impl std::fmt::Display) -> Self {
        Self::Decode(cause.to_string())
    }

    /// Build an [`SyncCoreError::Invariant`] from any displayable cause.
    pub fn invariant(cause: impl std::fmt::Display) -> Self {
        Self::Invariant(cause.to_string())
    }
}
