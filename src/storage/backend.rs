//! Abstract object-store client trait.
//!
//! Every object store must implement [`ObjectStoreClient`].  The trait
//! mirrors the small slice of the S3 API the adapter relies on: bucket
//! lookup and creation, object HEAD/GET/PUT/DELETE, the multipart upload
//! calls, delimited listing and presigned GET URLs.
//!
//! "Not found" is reported as [`StorageError::NotFound`] or
//! [`StorageError::BucketNotFound`] so callers can tell it apart from any
//! other failure.
//!
//! [`StorageError::NotFound`]: crate::errors::StorageError::NotFound
//! [`StorageError::BucketNotFound`]: crate::errors::StorageError::BucketNotFound

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use crate::errors::StorageResult;

/// Metadata returned by a HEAD on an object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectHead {
    pub content_length: u64,
    pub last_modified: Option<DateTime<Utc>>,
    pub e_tag: Option<String>,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
}

/// S3 storage classes the adapter can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageClass {
    Standard,
    ReducedRedundancy,
}

impl StorageClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageClass::Standard => "STANDARD",
            StorageClass::ReducedRedundancy => "REDUCED_REDUNDANCY",
        }
    }
}

/// Headers sent with a PUT or a multipart initiation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteParameters {
    pub content_type: String,
    pub content_encoding: Option<String>,
    /// Canned ACL name, e.g. `public-read`.
    pub acl: Option<String>,
    pub storage_class: Option<StorageClass>,
    /// Request `AES256` server-side encryption.
    pub server_side_encryption: bool,
    pub cache_control: Option<String>,
}

/// One part of a multipart upload as listed by, or sent to, the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub e_tag: String,
}

/// One page of a delimited listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPage {
    /// Common prefixes, as returned by the store (full keys).
    pub prefixes: Vec<String>,
    /// Object keys, as returned by the store (full keys).
    pub keys: Vec<String>,
    /// Token for the next page, `None` on the last page.
    pub next_token: Option<String>,
}

/// Async object-store contract.
pub trait ObjectStoreClient: Send + Sync + 'static {
    /// Region the client is configured for, if known.
    fn region(&self) -> Option<String>;

    /// Check that `bucket` exists and is reachable.
    fn head_bucket(
        &self,
        bucket: &str,
    ) -> Pin<Box<dyn Future<Output = StorageResult<()>> + Send + '_>>;

    /// Create `bucket` with an optional canned ACL and location constraint.
    fn create_bucket(
        &self,
        bucket: &str,
        acl: Option<&str>,
        location_constraint: Option<&str>,
    ) -> Pin<Box<dyn Future<Output = StorageResult<()>> + Send + '_>>;

    /// Fetch object metadata.
    fn head_object(
        &self,
        bucket: &str,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = StorageResult<ObjectHead>> + Send + '_>>;

    /// Read the full object body.
    fn get_object(
        &self,
        bucket: &str,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = StorageResult<Bytes>> + Send + '_>>;

    /// Write a whole object in one request, returning its ETag if reported.
    fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        params: &WriteParameters,
    ) -> Pin<Box<dyn Future<Output = StorageResult<Option<String>>> + Send + '_>>;

    /// Delete an object.  Deleting a missing key is not an error.
    fn delete_object(
        &self,
        bucket: &str,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = StorageResult<()>> + Send + '_>>;

    /// Start a multipart upload, returning its upload id.
    fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        params: &WriteParameters,
    ) -> Pin<Box<dyn Future<Output = StorageResult<String>> + Send + '_>>;

    /// Upload one part, returning the part ETag if the response carried one.
    fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> Pin<Box<dyn Future<Output = StorageResult<Option<String>>> + Send + '_>>;

    /// List the parts the store holds for an upload, in part-number order.
    fn list_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Pin<Box<dyn Future<Output = StorageResult<Vec<CompletedPart>>> + Send + '_>>;

    /// Commit a multipart upload from `parts` (ascending part numbers),
    /// returning the ETag of the assembled object if reported.
    fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Pin<Box<dyn Future<Output = StorageResult<Option<String>>> + Send + '_>>;

    /// Abandon a multipart upload and discard its parts.
    fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Pin<Box<dyn Future<Output = StorageResult<()>> + Send + '_>>;

    /// List one page of keys and common prefixes under `prefix`.
    fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        delimiter: Option<&str>,
        continuation_token: Option<&str>,
    ) -> Pin<Box<dyn Future<Output = StorageResult<ListPage>> + Send + '_>>;

    /// Build a presigned GET URL valid for `expires_in`.
    fn presign_get(
        &self,
        bucket: &str,
        key: &str,
        expires_in: Duration,
    ) -> Pin<Box<dyn Future<Output = StorageResult<String>> + Send + '_>>;
}
