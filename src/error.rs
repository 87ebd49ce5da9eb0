//! Error types for the OCI image-editor core.

use std::path::PathBuf;

/// Result type alias for image-editor operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the CAS engine and image mutator.
///
/// Each variant is a distinct kind suitable for programmatic handling;
/// the rendered message is advisory.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Not-Found Errors
    // =========================================================================
    /// Requested blob does not exist in the store.
    #[error("blob not found: {digest}")]
    BlobNotFound { digest: String },

    /// Requested reference does not exist in the store.
    #[error("reference not found: {name}")]
    ReferenceNotFound { name: String },

    // =========================================================================
    // Layout Errors
    // =========================================================================
    /// `create` targeted a non-empty directory.
    #[error("layout already exists at {path}: refusing to clobber")]
    LayoutExists { path: PathBuf },

    /// Directory is not a valid image layout.
    #[error("invalid layout at {path}: {reason}")]
    InvalidLayout { path: PathBuf, reason: String },

    // =========================================================================
    // Argument Errors
    // =========================================================================
    /// Malformed digest string.
    #[error("invalid digest '{digest}': {reason}")]
    InvalidDigest { digest: String, reason: String },

    /// Reference name is not a valid single path component.
    #[error("invalid reference name '{name}': {reason}")]
    InvalidReferenceName { name: String, reason: String },

    /// Descriptor media type is not usable for the requested operation.
    #[error("unexpected media type '{media_type}', expected {expected}")]
    UnexpectedMediaType {
        media_type: String,
        expected: String,
    },

    /// Image graph violates a structural invariant (layer/diff-id/history
    /// bookkeeping out of sync).
    #[error("invalid image: {0}")]
    InvalidImage(String),

    // =========================================================================
    // Integrity Errors
    // =========================================================================
    /// A stored blob's content does not hash to its key.
    #[error("digest mismatch for {digest}: computed {actual}")]
    DigestMismatch { digest: String, actual: String },

    // =========================================================================
    // Store State Errors
    // =========================================================================
    /// Write attempted on a read-only store.
    #[error("store at {path} is read-only")]
    ReadOnly { path: PathBuf },

    /// Operation attempted on a closed engine.
    #[error("engine is closed")]
    Closed,

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Wrapped filesystem or stream failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // =========================================================================
    // Cancellation
    // =========================================================================
    /// Ambient cancellation token fired mid-operation.
    #[error("operation cancelled: {operation}")]
    Cancelled { operation: &'static str },
}

impl Error {
    /// Whether this error means "the requested item does not exist".
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::BlobNotFound { .. } | Error::ReferenceNotFound { .. }
        )
    }
}
