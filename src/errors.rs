//! Storage error types.
//!
//! Every failure the adapter can report is a [`StorageError`] variant with
//! a stable [`code`](StorageError::code).  Object-store failures that are
//! not "not found" are carried unchanged in [`StorageError::Remote`].

use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors raised by the storage adapter.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The configured location prefix begins with a slash.
    #[error("storage location cannot begin with a leading slash. Found '{location}'. Use '{}' instead.", .location.trim_start_matches('/'))]
    InvalidLocation { location: String },

    /// A name resolves outside of the configured location prefix.
    #[error("attempted access to '{name}' denied: it is located outside of the base path component")]
    SuspiciousOperation { name: String },

    /// The upload session has already been closed.
    #[error("upload session for '{key}' is closed")]
    UseAfterClose { key: String },

    /// Unsupported open mode, or I/O in the wrong direction for the handle.
    #[error("{message}")]
    InvalidMode { message: String },

    /// The requested object does not exist.
    #[error("object '{key}' not found in bucket '{bucket}'")]
    NotFound { bucket: String, key: String },

    /// The requested bucket does not exist.
    #[error("bucket '{bucket}' does not exist")]
    BucketNotFound { bucket: String },

    /// The bucket exists but lives in another region than the client.
    #[error("bucket '{bucket}' exists, but in a different region than we are connecting to. Set the region to connect to by setting `region` in the storage settings")]
    BucketWrongRegion { bucket: String },

    /// A part upload failed earlier, so the multipart upload cannot complete.
    #[error("multipart upload {upload_id} for '{key}' was abandoned after a failed part upload")]
    UploadAborted { key: String, upload_id: String },

    /// The object would need more parts than the protocol allows.
    #[error("upload for '{key}' exceeds the maximum of {max} parts")]
    TooManyParts { key: String, max: u32 },

    /// Configuration could not be read or is inconsistent.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Local I/O failure (compression stream, local files).
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Any other object-store failure, propagated unchanged.
    #[error(transparent)]
    Remote(#[from] anyhow::Error),
}

impl StorageError {
    /// Return a short, stable error code.
    pub fn code(&self) -> &'static str {
        match self {
            StorageError::InvalidLocation { .. } => "InvalidLocation",
            StorageError::SuspiciousOperation { .. } => "SuspiciousOperation",
            StorageError::UseAfterClose { .. } => "UseAfterClose",
            StorageError::InvalidMode { .. } => "InvalidMode",
            StorageError::NotFound { .. } => "NotFound",
            StorageError::BucketNotFound { .. } => "BucketNotFound",
            StorageError::BucketWrongRegion { .. } => "BucketWrongRegion",
            StorageError::UploadAborted { .. } => "UploadAborted",
            StorageError::TooManyParts { .. } => "TooManyParts",
            StorageError::Config(_) => "Config",
            StorageError::Io(_) => "Io",
            StorageError::Remote(_) => "RemoteError",
        }
    }

    /// Whether this error means the object or bucket does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StorageError::NotFound { .. } | StorageError::BucketNotFound { .. }
        )
    }

    pub(crate) fn invalid_mode(message: impl Into<String>) -> Self {
        StorageError::InvalidMode {
            message: message.into(),
        }
    }
}
