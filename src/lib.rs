//! bucketfs: file storage on S3-compatible object stores.
//!
//! Names are cleaned and confined under a location prefix, writes stream
//! through a buffered multipart upload, and each thread gets its own
//! object store client handle.

pub mod config;
pub mod connections;
pub mod content;
pub mod errors;
pub mod file;
pub mod filestore;
pub mod metrics;
pub mod naming;
pub mod storage;
pub mod upload;
pub mod urls;

pub use config::{load_config, Config, StorageSettings};
pub use errors::{StorageError, StorageResult};
pub use file::{OpenMode, S3File};
pub use filestore::{FileStorage, ModifiedTime, S3Storage};
pub use upload::{CloseOutcome, UploadSession};
