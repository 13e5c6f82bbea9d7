//! Error types for the sync cache.

use thiserror::Error;

/// Errors that can occur while synchronizing a scope.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Authentication failed. Not retried by the cache; propagated upward
    /// for session handling.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Network-level fetch failure. Retryable by the caller.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The scope no longer exists upstream. The scope is evicted.
    #[error("scope gone: {scope_id}")]
    ScopeGone { scope_id: String },

    /// The scope is not present in the cache (never opened, or evicted).
    #[error("scope not open: {scope_id}")]
    ScopeNotOpen { scope_id: String },

    /// The target item is not in the scope's cached window.
    #[error("item not found: {id} in scope {scope_id}")]
    ItemNotFound { scope_id: String, id: String },

    /// Invalid response from server.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// WebSocket transport error.
    #[error("channel error: {0}")]
    Channel(String),

    /// Optimistic mutation rejected by the server; the local change was
    /// rolled back.
    #[error("mutation failed: {0}")]
    MutationFailed(String),
}

impl SyncError {
    /// Whether the error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Network(_) | SyncError::Channel(_))
    }
}
