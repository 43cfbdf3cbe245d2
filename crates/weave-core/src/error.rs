//! Error types for WEAVE

use thiserror::Error;

/// Core WEAVE errors
///
/// Most failures are per-item and recoverable: an unmet dependency is
/// retried, an unknown type or malformed message is skipped. Only
/// transport failures surface to the connection adapter.
#[derive(Error, Debug)]
pub enum SyncError {
    // Wire errors
    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Unknown request discriminator: {0}")]
    UnknownDiscriminator(String),

    // Codec errors
    #[error("Unknown type tag: {0}")]
    UnknownType(String),

    #[error("Payload mismatch for type {tag}: {reason}")]
    PayloadMismatch { tag: String, reason: String },

    // Dependency errors (retried)
    #[error("Missing resource dependency: {0}")]
    MissingResource(String),

    #[error("Missing object: {0}")]
    MissingObject(String),

    // Transport errors
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Not connected")]
    NotConnected,
}

impl SyncError {
    /// Whether applying this request again later could succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::MissingResource(_) | SyncError::MissingObject(_)
        )
    }
}

/// Result type for WEAVE operations
pub type SyncResult<T> = Result<T, SyncError>;
