//! In-memory object store.
//!
//! Buckets, objects and pending multipart uploads are held in
//! `tokio::sync::RwLock` maps.  Every call is appended to a journal so
//! callers can assert on the exact sequence of store operations, and
//! failures can be injected per operation.
//!
//! Multipart completion enforces the same rules S3 does: ascending part
//! numbers, matching part ETags and a minimum size for every part but the
//! last.  A configurable memory limit (`max_size_bytes`) caps total stored
//! bytes.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

use super::backend::{CompletedPart, ListPage, ObjectHead, ObjectStoreClient, WriteParameters};
use crate::config::MIN_PART_SIZE;
use crate::connections::ClientFactory;
use crate::errors::{StorageError, StorageResult};
use crate::urls::filepath_to_uri;

/// Construction options for [`MemoryClient`].
#[derive(Debug, Clone)]
pub struct MemoryOptions {
    /// Buckets that exist from the start.
    pub buckets: Vec<String>,
    /// Maximum bytes stored across objects and parts.  0 means unlimited.
    pub max_size_bytes: u64,
    /// Minimum size of every part but the last at completion.
    pub min_part_size: usize,
    /// Maximum entries per listing page.
    pub page_size: usize,
    /// Region reported by [`ObjectStoreClient::region`].
    pub region: Option<String>,
    /// Answer part uploads without an ETag.
    pub omit_part_etags: bool,
}

impl Default for MemoryOptions {
    fn default() -> Self {
        Self {
            buckets: Vec::new(),
            max_size_bytes: 0,
            min_part_size: MIN_PART_SIZE,
            page_size: 1000,
            region: None,
            omit_part_etags: false,
        }
    }
}

/// A recorded call against the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    HeadBucket {
        bucket: String,
    },
    CreateBucket {
        bucket: String,
        acl: Option<String>,
        location_constraint: Option<String>,
    },
    HeadObject {
        bucket: String,
        key: String,
    },
    GetObject {
        bucket: String,
        key: String,
    },
    PutObject {
        bucket: String,
        key: String,
        body: Bytes,
        params: WriteParameters,
    },
    DeleteObject {
        bucket: String,
        key: String,
    },
    CreateMultipartUpload {
        bucket: String,
        key: String,
        params: WriteParameters,
    },
    UploadPart {
        bucket: String,
        key: String,
        upload_id: String,
        part_number: u32,
        body: Bytes,
    },
    ListParts {
        bucket: String,
        key: String,
        upload_id: String,
    },
    CompleteMultipartUpload {
        bucket: String,
        key: String,
        upload_id: String,
        parts: Vec<CompletedPart>,
    },
    AbortMultipartUpload {
        bucket: String,
        key: String,
        upload_id: String,
    },
    ListObjects {
        bucket: String,
        prefix: String,
        delimiter: Option<String>,
        continuation_token: Option<String>,
    },
    PresignGet {
        bucket: String,
        key: String,
        expires_in: Duration,
    },
}

/// Operations that can be made to fail on demand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailPoint {
    /// Fail the upload of the given part number.
    UploadPart(u32),
    CreateMultipartUpload,
    CompleteMultipartUpload,
    PutObject,
    HeadObject,
    /// Answer HEAD bucket as if the bucket lived in another region.
    HeadBucketWrongRegion,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    e_tag: String,
    params: WriteParameters,
    last_modified: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct BucketState {
    acl: Option<String>,
    location_constraint: Option<String>,
    objects: BTreeMap<String, StoredObject>,
}

#[derive(Debug)]
struct PendingUpload {
    bucket: String,
    key: String,
    params: WriteParameters,
    /// part_number -> (data, etag)
    parts: BTreeMap<u32, (Bytes, String)>,
}

struct MemoryState {
    options: MemoryOptions,
    buckets: tokio::sync::RwLock<HashMap<String, BucketState>>,
    uploads: tokio::sync::RwLock<HashMap<String, PendingUpload>>,
    current_size: tokio::sync::RwLock<u64>,
    journal: Mutex<Vec<StoreOp>>,
    fail_points: Mutex<Vec<FailPoint>>,
}

/// In-memory [`ObjectStoreClient`].
///
/// Clones share the same underlying state, so a clone handed to a
/// storage can be inspected from the test that built it.
#[derive(Clone)]
pub struct MemoryClient {
    state: Arc<MemoryState>,
}

impl MemoryClient {
    pub fn new(options: MemoryOptions) -> Self {
        let buckets = options
            .buckets
            .iter()
            .map(|name| (name.clone(), BucketState::default()))
            .collect();
        Self {
            state: Arc::new(MemoryState {
                options,
                buckets: tokio::sync::RwLock::new(buckets),
                uploads: tokio::sync::RwLock::new(HashMap::new()),
                current_size: tokio::sync::RwLock::new(0),
                journal: Mutex::new(Vec::new()),
                fail_points: Mutex::new(Vec::new()),
            }),
        }
    }

    /// A store that already holds `bucket`.
    pub fn with_bucket(bucket: &str) -> Self {
        Self::new(MemoryOptions {
            buckets: vec![bucket.to_string()],
            ..Default::default()
        })
    }

    /// Factory handing out a fresh handle over this store on every call.
    pub fn factory(&self) -> ClientFactory {
        let client = self.clone();
        Arc::new(move || Ok(Arc::new(client.clone()) as Arc<dyn ObjectStoreClient>))
    }

    // ── Journal and fault injection ─────────────────────────────────

    /// Every call made so far, oldest first.
    pub fn journal(&self) -> Vec<StoreOp> {
        self.state
            .journal
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn clear_journal(&self) {
        self.state
            .journal
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Make every future call matching `point` fail.
    pub fn fail_on(&self, point: FailPoint) {
        self.state
            .fail_points
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(point);
    }

    fn record(&self, op: StoreOp) {
        self.state
            .journal
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(op);
    }

    fn should_fail(&self, point: &FailPoint) -> bool {
        self.state
            .fail_points
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(point)
    }

    fn injected(point: &FailPoint) -> StorageError {
        StorageError::Remote(anyhow::anyhow!("injected failure: {point:?}"))
    }

    // ── Inspection ──────────────────────────────────────────────────

    /// Body of a stored object.
    pub async fn object(&self, bucket: &str, key: &str) -> Option<Bytes> {
        let buckets = self.state.buckets.read().await;
        buckets
            .get(bucket)
            .and_then(|b| b.objects.get(key))
            .map(|o| o.data.clone())
    }

    /// Write parameters a stored object was written with.
    pub async fn object_params(&self, bucket: &str, key: &str) -> Option<WriteParameters> {
        let buckets = self.state.buckets.read().await;
        buckets
            .get(bucket)
            .and_then(|b| b.objects.get(key))
            .map(|o| o.params.clone())
    }

    /// `(acl, location_constraint)` a bucket was created with.
    pub async fn bucket_info(&self, bucket: &str) -> Option<(Option<String>, Option<String>)> {
        let buckets = self.state.buckets.read().await;
        buckets
            .get(bucket)
            .map(|b| (b.acl.clone(), b.location_constraint.clone()))
    }

    /// Number of multipart uploads neither completed nor aborted.
    pub async fn pending_uploads(&self) -> usize {
        self.state.uploads.read().await.len()
    }

    /// Store an object directly, bypassing the journal.
    pub async fn insert_object(
        &self,
        bucket: &str,
        key: &str,
        data: impl Into<Bytes>,
        last_modified: DateTime<Utc>,
    ) {
        let data = data.into();
        let mut buckets = self.state.buckets.write().await;
        let objects = &mut buckets.entry(bucket.to_string()).or_default().objects;
        objects.insert(
            key.to_string(),
            StoredObject {
                e_tag: Self::compute_etag(&data),
                data,
                params: WriteParameters::default(),
                last_modified,
            },
        );
    }

    // ── ETag helpers ────────────────────────────────────────────────

    /// Compute the quoted MD5-hex ETag for a byte slice.
    fn compute_etag(data: &[u8]) -> String {
        let mut hasher = Md5::new();
        hasher.update(data);
        format!("\"{}\"", hex::encode(hasher.finalize()))
    }

    /// Compute the multipart ETag: MD5 of the concatenated binary part
    /// MD5s, suffixed with the part count.
    fn compute_composite_etag(parts: &[&Bytes]) -> String {
        let mut combined = Vec::with_capacity(parts.len() * 16);
        for data in parts {
            let mut hasher = Md5::new();
            hasher.update(data.as_ref());
            combined.extend_from_slice(&hasher.finalize());
        }
        let mut hasher = Md5::new();
        hasher.update(&combined);
        format!("\"{}-{}\"", hex::encode(hasher.finalize()), parts.len())
    }

    // ── Memory accounting ───────────────────────────────────────────

    async fn check_capacity(&self, additional: u64) -> StorageResult<()> {
        let max = self.state.options.max_size_bytes;
        if max == 0 {
            return Ok(());
        }
        let current = *self.state.current_size.read().await;
        if current + additional > max {
            return Err(StorageError::Remote(anyhow::anyhow!(
                "Memory limit exceeded: current={current}, additional={additional}, max={max}"
            )));
        }
        Ok(())
    }

    async fn adjust_size(&self, delta: i64) {
        let mut size = self.state.current_size.write().await;
        if delta >= 0 {
            *size = size.saturating_add(delta as u64);
        } else {
            *size = size.saturating_sub(delta.unsigned_abs());
        }
    }

    /// Store `data` at `bucket/key`, replacing any previous object.
    async fn store(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        e_tag: String,
        params: WriteParameters,
    ) -> StorageResult<()> {
        let old_len = {
            let buckets = self.state.buckets.read().await;
            let state = buckets.get(bucket).ok_or_else(|| StorageError::BucketNotFound {
                bucket: bucket.to_string(),
            })?;
            state.objects.get(key).map_or(0, |o| o.data.len() as i64)
        };
        let delta = data.len() as i64 - old_len;
        if delta > 0 {
            self.check_capacity(delta as u64).await?;
        }

        {
            let mut buckets = self.state.buckets.write().await;
            let state = buckets.get_mut(bucket).ok_or_else(|| StorageError::BucketNotFound {
                bucket: bucket.to_string(),
            })?;
            state.objects.insert(
                key.to_string(),
                StoredObject {
                    data,
                    e_tag,
                    params,
                    last_modified: Utc::now(),
                },
            );
        }
        self.adjust_size(delta).await;
        Ok(())
    }

    async fn require_bucket(&self, bucket: &str) -> StorageResult<()> {
        if self.state.buckets.read().await.contains_key(bucket) {
            Ok(())
        } else {
            Err(StorageError::BucketNotFound {
                bucket: bucket.to_string(),
            })
        }
    }

    async fn stored(&self, bucket: &str, key: &str) -> StorageResult<StoredObject> {
        let buckets = self.state.buckets.read().await;
        let state = buckets.get(bucket).ok_or_else(|| StorageError::BucketNotFound {
            bucket: bucket.to_string(),
        })?;
        state
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
    }
}

fn no_such_upload(upload_id: &str) -> StorageError {
    StorageError::Remote(anyhow::anyhow!(
        "NoSuchUpload: the specified multipart upload {upload_id} does not exist"
    ))
}

impl ObjectStoreClient for MemoryClient {
    fn region(&self) -> Option<String> {
        self.state.options.region.clone()
    }

    fn head_bucket(
        &self,
        bucket: &str,
    ) -> Pin<Box<dyn Future<Output = StorageResult<()>> + Send + '_>> {
        let bucket = bucket.to_string();
        Box::pin(async move {
            self.record(StoreOp::HeadBucket {
                bucket: bucket.clone(),
            });
            if self.should_fail(&FailPoint::HeadBucketWrongRegion) {
                return Err(StorageError::BucketWrongRegion { bucket });
            }
            self.require_bucket(&bucket).await
        })
    }

    fn create_bucket(
        &self,
        bucket: &str,
        acl: Option<&str>,
        location_constraint: Option<&str>,
    ) -> Pin<Box<dyn Future<Output = StorageResult<()>> + Send + '_>> {
        let bucket = bucket.to_string();
        let acl = acl.map(String::from);
        let location_constraint = location_constraint.map(String::from);
        Box::pin(async move {
            self.record(StoreOp::CreateBucket {
                bucket: bucket.clone(),
                acl: acl.clone(),
                location_constraint: location_constraint.clone(),
            });
            let mut buckets = self.state.buckets.write().await;
            if buckets.contains_key(&bucket) {
                return Err(StorageError::Remote(anyhow::anyhow!(
                    "BucketAlreadyOwnedByYou: {bucket}"
                )));
            }
            debug!("memory create_bucket: bucket={}", bucket);
            buckets.insert(
                bucket,
                BucketState {
                    acl,
                    location_constraint,
                    objects: BTreeMap::new(),
                },
            );
            Ok(())
        })
    }

    fn head_object(
        &self,
        bucket: &str,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = StorageResult<ObjectHead>> + Send + '_>> {
        let bucket = bucket.to_string();
        let key = key.to_string();
        Box::pin(async move {
            self.record(StoreOp::HeadObject {
                bucket: bucket.clone(),
                key: key.clone(),
            });
            if self.should_fail(&FailPoint::HeadObject) {
                return Err(Self::injected(&FailPoint::HeadObject));
            }
            let object = self.stored(&bucket, &key).await?;
            Ok(ObjectHead {
                content_length: object.data.len() as u64,
                last_modified: Some(object.last_modified),
                e_tag: Some(object.e_tag),
                content_type: Some(object.params.content_type).filter(|t| !t.is_empty()),
                content_encoding: object.params.content_encoding,
            })
        })
    }

    fn get_object(
        &self,
        bucket: &str,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = StorageResult<Bytes>> + Send + '_>> {
        let bucket = bucket.to_string();
        let key = key.to_string();
        Box::pin(async move {
            self.record(StoreOp::GetObject {
                bucket: bucket.clone(),
                key: key.clone(),
            });
            Ok(self.stored(&bucket, &key).await?.data)
        })
    }

    fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        params: &WriteParameters,
    ) -> Pin<Box<dyn Future<Output = StorageResult<Option<String>>> + Send + '_>> {
        let bucket = bucket.to_string();
        let key = key.to_string();
        let params = params.clone();
        Box::pin(async move {
            self.record(StoreOp::PutObject {
                bucket: bucket.clone(),
                key: key.clone(),
                body: body.clone(),
                params: params.clone(),
            });
            if self.should_fail(&FailPoint::PutObject) {
                return Err(Self::injected(&FailPoint::PutObject));
            }
            debug!("memory put_object: bucket={} key={} len={}", bucket, key, body.len());
            let e_tag = Self::compute_etag(&body);
            self.store(&bucket, &key, body, e_tag.clone(), params).await?;
            Ok(Some(e_tag))
        })
    }

    fn delete_object(
        &self,
        bucket: &str,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = StorageResult<()>> + Send + '_>> {
        let bucket = bucket.to_string();
        let key = key.to_string();
        Box::pin(async move {
            self.record(StoreOp::DeleteObject {
                bucket: bucket.clone(),
                key: key.clone(),
            });
            let removed = {
                let mut buckets = self.state.buckets.write().await;
                let state = buckets
                    .get_mut(&bucket)
                    .ok_or_else(|| StorageError::BucketNotFound {
                        bucket: bucket.clone(),
                    })?;
                state.objects.remove(&key)
            };
            if let Some(object) = removed {
                self.adjust_size(-(object.data.len() as i64)).await;
            }
            Ok(())
        })
    }

    fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        params: &WriteParameters,
    ) -> Pin<Box<dyn Future<Output = StorageResult<String>> + Send + '_>> {
        let bucket = bucket.to_string();
        let key = key.to_string();
        let params = params.clone();
        Box::pin(async move {
            self.record(StoreOp::CreateMultipartUpload {
                bucket: bucket.clone(),
                key: key.clone(),
                params: params.clone(),
            });
            if self.should_fail(&FailPoint::CreateMultipartUpload) {
                return Err(Self::injected(&FailPoint::CreateMultipartUpload));
            }
            self.require_bucket(&bucket).await?;

            let upload_id = uuid::Uuid::new_v4().simple().to_string();
            debug!(
                "memory create_multipart_upload: bucket={} key={} upload_id={}",
                bucket, key, upload_id
            );
            self.state.uploads.write().await.insert(
                upload_id.clone(),
                PendingUpload {
                    bucket,
                    key,
                    params,
                    parts: BTreeMap::new(),
                },
            );
            Ok(upload_id)
        })
    }

    fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> Pin<Box<dyn Future<Output = StorageResult<Option<String>>> + Send + '_>> {
        let bucket = bucket.to_string();
        let key = key.to_string();
        let upload_id = upload_id.to_string();
        Box::pin(async move {
            self.record(StoreOp::UploadPart {
                bucket,
                key,
                upload_id: upload_id.clone(),
                part_number,
                body: body.clone(),
            });
            let point = FailPoint::UploadPart(part_number);
            if self.should_fail(&point) {
                return Err(Self::injected(&point));
            }

            let previous_len = {
                let uploads = self.state.uploads.read().await;
                let upload = uploads
                    .get(&upload_id)
                    .ok_or_else(|| no_such_upload(&upload_id))?;
                upload
                    .parts
                    .get(&part_number)
                    .map_or(0, |(data, _)| data.len() as i64)
            };
            let delta = body.len() as i64 - previous_len;
            if delta > 0 {
                self.check_capacity(delta as u64).await?;
            }

            let e_tag = Self::compute_etag(&body);
            {
                let mut uploads = self.state.uploads.write().await;
                let upload = uploads
                    .get_mut(&upload_id)
                    .ok_or_else(|| no_such_upload(&upload_id))?;
                upload.parts.insert(part_number, (body, e_tag.clone()));
            }
            self.adjust_size(delta).await;

            if self.state.options.omit_part_etags {
                Ok(None)
            } else {
                Ok(Some(e_tag))
            }
        })
    }

    fn list_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Pin<Box<dyn Future<Output = StorageResult<Vec<CompletedPart>>> + Send + '_>> {
        let bucket = bucket.to_string();
        let key = key.to_string();
        let upload_id = upload_id.to_string();
        Box::pin(async move {
            self.record(StoreOp::ListParts {
                bucket,
                key,
                upload_id: upload_id.clone(),
            });
            let uploads = self.state.uploads.read().await;
            let upload = uploads
                .get(&upload_id)
                .ok_or_else(|| no_such_upload(&upload_id))?;
            Ok(upload
                .parts
                .iter()
                .map(|(part_number, (_, e_tag))| CompletedPart {
                    part_number: *part_number,
                    e_tag: e_tag.clone(),
                })
                .collect())
        })
    }

    fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Pin<Box<dyn Future<Output = StorageResult<Option<String>>> + Send + '_>> {
        let bucket = bucket.to_string();
        let key = key.to_string();
        let upload_id = upload_id.to_string();
        let parts = parts.to_vec();
        Box::pin(async move {
            self.record(StoreOp::CompleteMultipartUpload {
                bucket: bucket.clone(),
                key: key.clone(),
                upload_id: upload_id.clone(),
                parts: parts.clone(),
            });
            if self.should_fail(&FailPoint::CompleteMultipartUpload) {
                return Err(Self::injected(&FailPoint::CompleteMultipartUpload));
            }
            if parts.is_empty() {
                return Err(StorageError::Remote(anyhow::anyhow!(
                    "MalformedXML: a multipart upload needs at least one part"
                )));
            }
            if parts.windows(2).any(|w| w[0].part_number >= w[1].part_number) {
                return Err(StorageError::Remote(anyhow::anyhow!(
                    "InvalidPartOrder: part numbers must be ascending"
                )));
            }

            let (params, data, e_tag, parts_len) = {
                let uploads = self.state.uploads.read().await;
                let upload = uploads
                    .get(&upload_id)
                    .ok_or_else(|| no_such_upload(&upload_id))?;
                if upload.bucket != bucket || upload.key != key {
                    return Err(no_such_upload(&upload_id));
                }

                let mut selected = Vec::with_capacity(parts.len());
                for (index, part) in parts.iter().enumerate() {
                    let (data, stored_etag) =
                        upload.parts.get(&part.part_number).ok_or_else(|| {
                            StorageError::Remote(anyhow::anyhow!(
                                "InvalidPart: part {} was never uploaded",
                                part.part_number
                            ))
                        })?;
                    if stored_etag.trim_matches('"') != part.e_tag.trim_matches('"') {
                        return Err(StorageError::Remote(anyhow::anyhow!(
                            "InvalidPart: ETag mismatch for part {}",
                            part.part_number
                        )));
                    }
                    let is_last = index + 1 == parts.len();
                    if !is_last && data.len() < self.state.options.min_part_size {
                        return Err(StorageError::Remote(anyhow::anyhow!(
                            "EntityTooSmall: part {} is {} bytes, minimum is {}",
                            part.part_number,
                            data.len(),
                            self.state.options.min_part_size
                        )));
                    }
                    selected.push(data);
                }

                let e_tag = Self::compute_composite_etag(&selected);
                let mut combined = Vec::with_capacity(selected.iter().map(|d| d.len()).sum());
                for data in &selected {
                    combined.extend_from_slice(data);
                }
                let parts_len: usize = upload.parts.values().map(|(d, _)| d.len()).sum();
                (upload.params.clone(), Bytes::from(combined), e_tag, parts_len)
            };

            debug!(
                "memory complete_multipart_upload: bucket={} key={} upload_id={} parts={}",
                bucket,
                key,
                upload_id,
                parts.len()
            );
            self.state.uploads.write().await.remove(&upload_id);
            self.adjust_size(-(parts_len as i64)).await;
            self.store(&bucket, &key, data, e_tag.clone(), params).await?;
            Ok(Some(e_tag))
        })
    }

    fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Pin<Box<dyn Future<Output = StorageResult<()>> + Send + '_>> {
        let bucket = bucket.to_string();
        let key = key.to_string();
        let upload_id = upload_id.to_string();
        Box::pin(async move {
            self.record(StoreOp::AbortMultipartUpload {
                bucket,
                key,
                upload_id: upload_id.clone(),
            });
            let removed = self
                .state
                .uploads
                .write()
                .await
                .remove(&upload_id)
                .ok_or_else(|| no_such_upload(&upload_id))?;
            let freed: usize = removed.parts.values().map(|(d, _)| d.len()).sum();
            self.adjust_size(-(freed as i64)).await;
            Ok(())
        })
    }

    fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        delimiter: Option<&str>,
        continuation_token: Option<&str>,
    ) -> Pin<Box<dyn Future<Output = StorageResult<ListPage>> + Send + '_>> {
        let bucket = bucket.to_string();
        let prefix = prefix.to_string();
        let delimiter = delimiter.map(String::from);
        let continuation_token = continuation_token.map(String::from);
        Box::pin(async move {
            self.record(StoreOp::ListObjects {
                bucket: bucket.clone(),
                prefix: prefix.clone(),
                delimiter: delimiter.clone(),
                continuation_token: continuation_token.clone(),
            });

            // Roll keys up to their common prefix; `true` marks a prefix.
            let entries: BTreeSet<(String, bool)> = {
                let buckets = self.state.buckets.read().await;
                let state = buckets.get(&bucket).ok_or_else(|| StorageError::BucketNotFound {
                    bucket: bucket.clone(),
                })?;
                state
                    .objects
                    .range(prefix.clone()..)
                    .take_while(|(key, _)| key.starts_with(&prefix))
                    .map(|(key, _)| {
                        let rest = &key[prefix.len()..];
                        match delimiter.as_deref().and_then(|d| rest.find(d).map(|i| i + d.len())) {
                            Some(end) => (format!("{prefix}{}", &rest[..end]), true),
                            None => (key.clone(), false),
                        }
                    })
                    .collect()
            };

            let page_size = self.state.options.page_size.max(1);
            let mut remaining = entries
                .into_iter()
                .filter(|(entry, _)| {
                    continuation_token
                        .as_deref()
                        .map_or(true, |token| entry.as_str() > token)
                })
                .peekable();

            let mut page = ListPage::default();
            let mut last = None;
            for (entry, is_prefix) in remaining.by_ref().take(page_size) {
                last = Some(entry.clone());
                if is_prefix {
                    page.prefixes.push(entry);
                } else {
                    page.keys.push(entry);
                }
            }
            if remaining.peek().is_some() {
                page.next_token = last;
            }
            Ok(page)
        })
    }

    fn presign_get(
        &self,
        bucket: &str,
        key: &str,
        expires_in: Duration,
    ) -> Pin<Box<dyn Future<Output = StorageResult<String>> + Send + '_>> {
        let bucket = bucket.to_string();
        let key = key.to_string();
        Box::pin(async move {
            self.record(StoreOp::PresignGet {
                bucket: bucket.clone(),
                key: key.clone(),
                expires_in,
            });
            let region = self.region().unwrap_or_else(|| "us-east-1".to_string());
            let date = Utc::now().format("%Y%m%dT%H%M%SZ");
            let signature = {
                let mut hasher = Md5::new();
                hasher.update(format!("{bucket}/{key}/{}", expires_in.as_secs()));
                hex::encode(hasher.finalize())
            };
            Ok(format!(
                "https://{bucket}.s3.{region}.amazonaws.com/{}?X-Amz-Algorithm=AWS4-HMAC-SHA256\
                 &X-Amz-Credential=memory%2F{region}%2Fs3%2Faws4_request&X-Amz-Date={date}\
                 &X-Amz-Expires={}&X-Amz-SignedHeaders=host&X-Amz-Signature={signature}",
                filepath_to_uri(&key),
                expires_in.as_secs()
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_client() -> MemoryClient {
        MemoryClient::new(MemoryOptions {
            buckets: vec!["test-bucket".to_string()],
            min_part_size: 4,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_put_and_get_roundtrip() {
        let client = test_client();
        let data = Bytes::from("hello world");
        let etag = client
            .put_object("test-bucket", "key.txt", data.clone(), &WriteParameters::default())
            .await
            .unwrap()
            .unwrap();

        assert!(etag.starts_with('"'));
        assert!(etag.ends_with('"'));
        assert_eq!(client.get_object("test-bucket", "key.txt").await.unwrap(), data);

        let head = client.head_object("test-bucket", "key.txt").await.unwrap();
        assert_eq!(head.content_length, 11);
        assert_eq!(head.e_tag.as_deref(), Some(etag.as_str()));
    }

    #[tokio::test]
    async fn test_missing_object_and_bucket() {
        let client = test_client();
        let err = client.head_object("test-bucket", "nope").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound { .. }));

        let err = client.head_bucket("other").await.unwrap_err();
        assert!(matches!(err, StorageError::BucketNotFound { .. }));
    }

    #[tokio::test]
    async fn test_multipart_roundtrip() {
        let client = test_client();
        let params = WriteParameters::default();
        let upload_id = client
            .create_multipart_upload("test-bucket", "big.bin", &params)
            .await
            .unwrap();
        let e1 = client
            .upload_part("test-bucket", "big.bin", &upload_id, 1, Bytes::from("aaaa"))
            .await
            .unwrap()
            .unwrap();
        let e2 = client
            .upload_part("test-bucket", "big.bin", &upload_id, 2, Bytes::from("bb"))
            .await
            .unwrap()
            .unwrap();

        let parts = vec![
            CompletedPart { part_number: 1, e_tag: e1 },
            CompletedPart { part_number: 2, e_tag: e2 },
        ];
        let etag = client
            .complete_multipart_upload("test-bucket", "big.bin", &upload_id, &parts)
            .await
            .unwrap()
            .unwrap();

        assert!(etag.ends_with("-2\""));
        assert_eq!(
            client.object("test-bucket", "big.bin").await.unwrap(),
            Bytes::from("aaaabb")
        );
        assert_eq!(client.pending_uploads().await, 0);
    }

    #[tokio::test]
    async fn test_complete_rejects_small_and_unordered_parts() {
        let client = test_client();
        let upload_id = client
            .create_multipart_upload("test-bucket", "k", &WriteParameters::default())
            .await
            .unwrap();
        let e1 = client
            .upload_part("test-bucket", "k", &upload_id, 1, Bytes::from("a"))
            .await
            .unwrap()
            .unwrap();
        let e2 = client
            .upload_part("test-bucket", "k", &upload_id, 2, Bytes::from("b"))
            .await
            .unwrap()
            .unwrap();

        let unordered = vec![
            CompletedPart { part_number: 2, e_tag: e2.clone() },
            CompletedPart { part_number: 1, e_tag: e1.clone() },
        ];
        let err = client
            .complete_multipart_upload("test-bucket", "k", &upload_id, &unordered)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("InvalidPartOrder"));

        let small = vec![
            CompletedPart { part_number: 1, e_tag: e1 },
            CompletedPart { part_number: 2, e_tag: e2 },
        ];
        let err = client
            .complete_multipart_upload("test-bucket", "k", &upload_id, &small)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("EntityTooSmall"));
    }

    #[tokio::test]
    async fn test_list_objects_delimiter_and_pages() {
        let client = MemoryClient::new(MemoryOptions {
            buckets: vec!["b".to_string()],
            page_size: 2,
            ..Default::default()
        });
        for key in ["some/path/1.txt", "2.txt", "other/path/3.txt", "4.txt", "some/5.txt"] {
            client.insert_object("b", key, "x", Utc::now()).await;
        }

        let first = client.list_objects("b", "", Some("/"), None).await.unwrap();
        assert_eq!(first.keys, vec!["2.txt", "4.txt"]);
        assert!(first.prefixes.is_empty());
        let token = first.next_token.clone().unwrap();

        let second = client
            .list_objects("b", "", Some("/"), Some(&token))
            .await
            .unwrap();
        assert_eq!(second.prefixes, vec!["other/", "some/"]);
        assert!(second.next_token.is_none());
    }

    #[tokio::test]
    async fn test_memory_limit() {
        let client = MemoryClient::new(MemoryOptions {
            buckets: vec!["b".to_string()],
            max_size_bytes: 4,
            ..Default::default()
        });
        client
            .put_object("b", "a", Bytes::from("1234"), &WriteParameters::default())
            .await
            .unwrap();
        let err = client
            .put_object("b", "c", Bytes::from("5"), &WriteParameters::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Memory limit exceeded"));
    }

    #[tokio::test]
    async fn test_factory_hands_out_distinct_handles() {
        let client = test_client();
        let factory = client.factory();
        let a = factory().unwrap();
        let b = factory().unwrap();
        assert!(!Arc::ptr_eq(&a, &b));

        a.put_object("test-bucket", "shared", Bytes::from("x"), &WriteParameters::default())
            .await
            .unwrap();
        assert!(b.head_object("test-bucket", "shared").await.is_ok());
    }
}
