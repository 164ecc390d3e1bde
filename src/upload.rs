//! Buffered streaming upload session.
//!
//! An [`UploadSession`] accumulates written bytes in a buffer bounded by
//! `buffer_size`.  Below the threshold nothing reaches the store until
//! close, which issues a single PUT.  Once the buffer fills, a multipart
//! upload is initiated lazily and every full buffer is sent as the next
//! part; close then flushes the remainder as the final part and completes
//! the upload with the parts in ascending order.
//!
//! ```text
//! Empty -> Buffering -> SingleShotPending -> Closed
//!                    \-> MultipartActive ---/
//!              (part or initiation error) -> Failed -> Closed
//! ```

use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::content::GzipStream;
use crate::errors::{StorageError, StorageResult};
use crate::metrics::{
    BYTES_UPLOADED_TOTAL, PARTS_UPLOADED_TOTAL, UPLOADS_TOTAL, UPLOAD_FAILURES_TOTAL,
};
use crate::storage::backend::{CompletedPart, ObjectStoreClient, WriteParameters};

/// Largest part number a multipart upload may use.
pub const MAX_PARTS: u32 = 10_000;

/// Lifecycle of an [`UploadSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    /// Nothing written yet.
    Empty,
    /// Bytes buffered, below the threshold, no multipart upload.
    Buffering,
    /// Close in progress on the single-PUT path.
    SingleShotPending,
    /// A multipart upload has been initiated.
    MultipartActive,
    /// Initiation or a part upload failed; completion is impossible.
    Failed,
    Closed,
}

/// What `close` did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseOutcome {
    /// One PUT carried the whole object.
    Put { e_tag: Option<String>, size: u64 },
    /// A multipart upload was completed.
    Completed {
        upload_id: String,
        parts: u32,
        e_tag: Option<String>,
    },
    /// The key already existed and the write was not sent.
    Skipped,
}

/// Per-session knobs.
#[derive(Debug, Clone, Copy)]
pub struct UploadOptions {
    /// Threshold at which the buffer is sent as a part.
    pub buffer_size: usize,
    /// When false, an existing key is never replaced by a single PUT.
    pub overwrite: bool,
    /// Gzip the payload on the fly.
    pub compress: bool,
}

/// One open write handle to a single key.
pub struct UploadSession {
    client: Arc<dyn ObjectStoreClient>,
    bucket: String,
    key: String,
    params: WriteParameters,
    options: UploadOptions,
    buffer: Vec<u8>,
    gzip: Option<GzipStream>,
    upload_id: Option<String>,
    /// Set once the multipart upload has been completed.
    committed: bool,
    /// (part_number, etag) in upload order.
    parts: Vec<(u32, Option<String>)>,
    state: UploadState,
    bytes_written: u64,
}

impl UploadSession {
    /// Open a session.  No remote call is made until the buffer fills or
    /// the session is closed.
    pub fn new(
        client: Arc<dyn ObjectStoreClient>,
        bucket: impl Into<String>,
        key: impl Into<String>,
        params: WriteParameters,
        options: UploadOptions,
    ) -> Self {
        let options = UploadOptions {
            buffer_size: options.buffer_size.max(1),
            ..options
        };
        Self {
            client,
            bucket: bucket.into(),
            key: key.into(),
            params,
            gzip: options.compress.then(GzipStream::new),
            options,
            buffer: Vec::new(),
            upload_id: None,
            committed: false,
            parts: Vec::new(),
            state: UploadState::Empty,
            bytes_written: 0,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn state(&self) -> UploadState {
        self.state
    }

    pub fn params(&self) -> &WriteParameters {
        &self.params
    }

    /// Id of the multipart upload, if one was initiated and not aborted.
    pub fn upload_id(&self) -> Option<&str> {
        self.upload_id.as_deref()
    }

    /// Whether `abort` has anything left to do: the session is still open,
    /// or a failed close left an uncommitted multipart upload behind.
    pub fn is_abortable(&self) -> bool {
        self.state != UploadState::Closed || (!self.committed && self.upload_id.is_some())
    }

    /// Uncompressed bytes accepted by `write` so far.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Bytes waiting in the buffer.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn part_count(&self) -> usize {
        self.parts.len()
    }

    fn aborted_error(&self) -> StorageError {
        StorageError::UploadAborted {
            key: self.key.clone(),
            upload_id: self
                .upload_id
                .clone()
                .unwrap_or_else(|| "(not initiated)".to_string()),
        }
    }

    fn fail(&mut self, stage: &'static str) {
        self.state = UploadState::Failed;
        self.gzip = None;
        self.buffer = Vec::new();
        metrics::counter!(UPLOAD_FAILURES_TOTAL, "stage" => stage).increment(1);
    }

    /// Append `data`, sending a part whenever the buffer reaches the
    /// threshold.
    pub async fn write(&mut self, data: &[u8]) -> StorageResult<()> {
        match self.state {
            UploadState::Closed => {
                return Err(StorageError::UseAfterClose {
                    key: self.key.clone(),
                })
            }
            UploadState::Failed => return Err(self.aborted_error()),
            _ => {}
        }

        match self.gzip.as_mut() {
            Some(gzip) => gzip.write(data, &mut self.buffer)?,
            None => self.buffer.extend_from_slice(data),
        }
        self.bytes_written += data.len() as u64;
        if self.state == UploadState::Empty {
            self.state = UploadState::Buffering;
        }

        if self.buffer.len() >= self.options.buffer_size {
            self.flush_part().await?;
        }
        Ok(())
    }

    /// Initiate the multipart upload if needed and send the buffer as the
    /// next part.
    async fn flush_part(&mut self) -> StorageResult<()> {
        let upload_id = match &self.upload_id {
            Some(id) => id.clone(),
            None => {
                let id = match self
                    .client
                    .create_multipart_upload(&self.bucket, &self.key, &self.params)
                    .await
                {
                    Ok(id) => id,
                    Err(e) => {
                        self.fail("initiate");
                        return Err(e);
                    }
                };
                debug!(
                    "initiated multipart upload: bucket={} key={} upload_id={}",
                    self.bucket, self.key, id
                );
                self.upload_id = Some(id.clone());
                self.state = UploadState::MultipartActive;
                id
            }
        };

        let part_number = self.parts.last().map_or(1, |(n, _)| n + 1);
        if part_number > MAX_PARTS {
            self.fail("part");
            return Err(StorageError::TooManyParts {
                key: self.key.clone(),
                max: MAX_PARTS,
            });
        }

        let body = Bytes::from(std::mem::take(&mut self.buffer));
        let len = body.len() as u64;
        match self
            .client
            .upload_part(&self.bucket, &self.key, &upload_id, part_number, body)
            .await
        {
            Ok(e_tag) => {
                debug!(
                    "uploaded part {} ({} bytes) of {} for key={}",
                    part_number, len, upload_id, self.key
                );
                self.parts.push((part_number, e_tag));
                metrics::counter!(PARTS_UPLOADED_TOTAL).increment(1);
                metrics::counter!(BYTES_UPLOADED_TOTAL).increment(len);
                Ok(())
            }
            Err(e) => {
                warn!(
                    "part {} of multipart upload {} for key={} failed: {}",
                    part_number, upload_id, self.key, e
                );
                self.fail("part");
                Err(e)
            }
        }
    }

    /// Commit the object.  The session is closed afterwards whatever the
    /// result; a multipart upload a failed close leaves behind can still be
    /// aborted.
    pub async fn close(&mut self) -> StorageResult<CloseOutcome> {
        match self.state {
            UploadState::Closed => {
                return Err(StorageError::UseAfterClose {
                    key: self.key.clone(),
                })
            }
            UploadState::Failed => {
                self.state = UploadState::Closed;
                return Err(self.aborted_error());
            }
            _ => {}
        }

        let result = self.finish().await;
        self.state = UploadState::Closed;
        self.gzip = None;
        self.buffer = Vec::new();
        result
    }

    async fn finish(&mut self) -> StorageResult<CloseOutcome> {
        if let Some(gzip) = self.gzip.take() {
            gzip.finish(&mut self.buffer)?;
        }

        if self.upload_id.is_some() {
            if !self.buffer.is_empty() {
                self.flush_part().await?;
            }
            return self.complete().await;
        }

        self.state = UploadState::SingleShotPending;
        if !self.options.overwrite || self.bytes_written == 0 {
            match self.client.head_object(&self.bucket, &self.key).await {
                Ok(_) => {
                    debug!(
                        "skipping write of existing key: bucket={} key={}",
                        self.bucket, self.key
                    );
                    metrics::counter!(UPLOADS_TOTAL, "mode" => "skipped").increment(1);
                    return Ok(CloseOutcome::Skipped);
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }

        let body = Bytes::from(std::mem::take(&mut self.buffer));
        let size = body.len() as u64;
        let e_tag = self
            .client
            .put_object(&self.bucket, &self.key, body, &self.params)
            .await
            .inspect_err(|_| {
                metrics::counter!(UPLOAD_FAILURES_TOTAL, "stage" => "put").increment(1);
            })?;

        debug!(
            "put object: bucket={} key={} size={}",
            self.bucket, self.key, size
        );
        metrics::counter!(UPLOADS_TOTAL, "mode" => "single").increment(1);
        metrics::counter!(BYTES_UPLOADED_TOTAL).increment(size);
        Ok(CloseOutcome::Put { e_tag, size })
    }

    async fn complete(&mut self) -> StorageResult<CloseOutcome> {
        let upload_id = match &self.upload_id {
            Some(id) => id.clone(),
            None => return Err(self.aborted_error()),
        };

        let mut parts = if self.parts.iter().any(|(_, e_tag)| e_tag.is_none()) {
            self.merge_remote_parts(&upload_id).await?
        } else {
            self.parts
                .iter()
                .filter_map(|(part_number, e_tag)| {
                    e_tag.as_ref().map(|e_tag| CompletedPart {
                        part_number: *part_number,
                        e_tag: e_tag.clone(),
                    })
                })
                .collect()
        };
        parts.sort_by_key(|p| p.part_number);

        let e_tag = self
            .client
            .complete_multipart_upload(&self.bucket, &self.key, &upload_id, &parts)
            .await
            .inspect_err(|_| {
                metrics::counter!(UPLOAD_FAILURES_TOTAL, "stage" => "complete").increment(1);
            })?;
        self.committed = true;

        info!(
            "completed multipart upload: bucket={} key={} upload_id={} parts={}",
            self.bucket,
            self.key,
            upload_id,
            parts.len()
        );
        metrics::counter!(UPLOADS_TOTAL, "mode" => "multipart").increment(1);
        Ok(CloseOutcome::Completed {
            upload_id,
            parts: parts.len() as u32,
            e_tag,
        })
    }

    /// Fill ETags missing from part responses with the store's part list.
    async fn merge_remote_parts(&self, upload_id: &str) -> StorageResult<Vec<CompletedPart>> {
        debug!(
            "part ETags incomplete, listing parts of upload {} for key={}",
            upload_id, self.key
        );
        let remote = self
            .client
            .list_parts(&self.bucket, &self.key, upload_id)
            .await?;

        self.parts
            .iter()
            .map(|(part_number, e_tag)| {
                let e_tag = match e_tag {
                    Some(e_tag) => e_tag.clone(),
                    None => remote
                        .iter()
                        .find(|p| p.part_number == *part_number)
                        .map(|p| p.e_tag.clone())
                        .ok_or_else(|| {
                            StorageError::Remote(anyhow::anyhow!(
                                "part {part_number} of upload {upload_id} has no ETag"
                            ))
                        })?,
                };
                Ok(CompletedPart {
                    part_number: *part_number,
                    e_tag,
                })
            })
            .collect()
    }

    /// Abandon the session, aborting the remote multipart upload if one
    /// was initiated and never completed.
    pub async fn abort(&mut self) -> StorageResult<()> {
        if !self.is_abortable() {
            return Err(StorageError::UseAfterClose {
                key: self.key.clone(),
            });
        }
        self.state = UploadState::Closed;
        self.gzip = None;
        self.buffer = Vec::new();

        if let Some(upload_id) = self.upload_id.take() {
            info!(
                "aborting multipart upload: bucket={} key={} upload_id={}",
                self.bucket, self.key, upload_id
            );
            if let Err(e) = self
                .client
                .abort_multipart_upload(&self.bucket, &self.key, &upload_id)
                .await
            {
                self.upload_id = Some(upload_id);
                return Err(e);
            }
        }
        Ok(())
    }
}

impl Drop for UploadSession {
    fn drop(&mut self) {
        if !self.committed {
            if let Some(upload_id) = &self.upload_id {
                warn!(
                    "upload session for key={} dropped uncommitted; multipart upload {} left in bucket {}",
                    self.key, upload_id, self.bucket
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::backend::StorageClass;
    use crate::storage::memory::{FailPoint, MemoryClient, MemoryOptions, StoreOp};
    use flate2::read::GzDecoder;
    use std::io::Read;

    const BUCKET: &str = "test-bucket";

    fn test_client(min_part_size: usize) -> MemoryClient {
        MemoryClient::new(MemoryOptions {
            buckets: vec![BUCKET.to_string()],
            min_part_size,
            ..Default::default()
        })
    }

    fn upload_params() -> WriteParameters {
        WriteParameters {
            content_type: "text/plain".to_string(),
            acl: Some("public-read".to_string()),
            storage_class: Some(StorageClass::ReducedRedundancy),
            server_side_encryption: true,
            ..Default::default()
        }
    }

    fn session(client: &MemoryClient, key: &str, buffer_size: usize, overwrite: bool) -> UploadSession {
        UploadSession::new(
            Arc::new(client.clone()),
            BUCKET,
            key,
            upload_params(),
            UploadOptions {
                buffer_size,
                overwrite,
                compress: false,
            },
        )
    }

    fn parts_of(journal: &[StoreOp]) -> Vec<(u32, Bytes)> {
        journal
            .iter()
            .filter_map(|op| match op {
                StoreOp::UploadPart {
                    part_number, body, ..
                } => Some((*part_number, body.clone())),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_small_write_is_single_put() {
        let client = test_client(1024);
        let mut file = session(&client, "small.txt", 1024, true);
        file.write(b"new content").await.unwrap();
        assert_eq!(file.state(), UploadState::Buffering);

        let outcome = file.close().await.unwrap();
        assert!(matches!(outcome, CloseOutcome::Put { size: 11, .. }));
        assert_eq!(file.state(), UploadState::Closed);

        let journal = client.journal();
        assert_eq!(journal.len(), 1);
        match &journal[0] {
            StoreOp::PutObject { key, body, params, .. } => {
                assert_eq!(key, "small.txt");
                assert_eq!(body.as_ref(), b"new content");
                assert_eq!(params, &upload_params());
            }
            other => panic!("unexpected op {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_open_write_initiates_with_parameters() {
        let client = test_client(4);
        let mut file = session(&client, "test_open_for_writing.txt", 8, true);

        file.write(b"new content").await.unwrap();
        assert_eq!(file.state(), UploadState::MultipartActive);
        match &client.journal()[0] {
            StoreOp::CreateMultipartUpload { params, .. } => {
                assert_eq!(params.acl.as_deref(), Some("public-read"));
                assert_eq!(params.content_type, "text/plain");
                assert!(params.server_side_encryption);
                assert_eq!(params.storage_class, Some(StorageClass::ReducedRedundancy));
            }
            other => panic!("unexpected op {other:?}"),
        }

        let outcome = file.close().await.unwrap();
        assert!(matches!(outcome, CloseOutcome::Completed { parts: 1, .. }));
        assert_eq!(
            client.object(BUCKET, "test_open_for_writing.txt").await.unwrap(),
            Bytes::from("new content")
        );
    }

    #[tokio::test]
    async fn test_write_beyond_buffer_size() {
        let client = test_client(1024);
        let mut file = session(&client, "beyond.txt", 1024, true);

        let mut written = Vec::new();
        let mut counter = 1;
        while written.len() < 2 * 1024 {
            let mut chunk = format!("hello, aws {counter}\n").into_bytes();
            chunk.extend(std::iter::repeat(b'*').take(1024 / 10));
            file.write(&chunk).await.unwrap();
            written.extend_from_slice(&chunk);
            counter += 1;
        }
        file.close().await.unwrap();
        assert_eq!(file.key(), "beyond.txt");
        assert_eq!(file.params(), &upload_params());
        assert_eq!(file.part_count(), 2);
        assert_eq!(file.buffered_len(), 0);

        let journal = client.journal();
        let parts = parts_of(&journal);
        assert_eq!(
            parts.iter().map(|(n, _)| *n).collect::<Vec<_>>(),
            vec![1, 2]
        );
        let uploaded: Vec<u8> = parts.iter().flat_map(|(_, b)| b.to_vec()).collect();
        assert_eq!(uploaded, written);

        let completions: Vec<_> = journal
            .iter()
            .filter_map(|op| match op {
                StoreOp::CompleteMultipartUpload { parts, .. } => Some(parts.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(completions.len(), 1);
        assert_eq!(
            completions[0].iter().map(|p| p.part_number).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert!(!journal
            .iter()
            .any(|op| matches!(op, StoreOp::PutObject { .. })));
        assert_eq!(client.object(BUCKET, "beyond.txt").await.unwrap().to_vec(), written);
    }

    #[tokio::test]
    async fn test_open_no_write_puts_empty_body() {
        let client = test_client(1024);
        let mut file = session(&client, "test_open_no_write.txt", 1024, true);
        file.close().await.unwrap();

        let journal = client.journal();
        assert_eq!(journal.len(), 2);
        assert!(matches!(journal[0], StoreOp::HeadObject { .. }));
        match &journal[1] {
            StoreOp::PutObject { body, params, .. } => {
                assert!(body.is_empty());
                assert_eq!(params, &upload_params());
            }
            other => panic!("unexpected op {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_open_no_overwrite_existing() {
        let client = test_client(1024);
        client
            .insert_object(BUCKET, "existing.txt", "old", chrono::Utc::now())
            .await;

        let mut file = session(&client, "existing.txt", 1024, true);
        assert_eq!(file.close().await.unwrap(), CloseOutcome::Skipped);

        let journal = client.journal();
        assert_eq!(journal.len(), 1);
        assert!(matches!(journal[0], StoreOp::HeadObject { .. }));
    }

    #[tokio::test]
    async fn test_no_overwrite_empty_write_skips_existing_key() {
        let client = test_client(1024);
        client
            .insert_object(BUCKET, "existing.txt", "old", chrono::Utc::now())
            .await;

        let mut file = session(&client, "existing.txt", 1024, false);
        assert_eq!(file.close().await.unwrap(), CloseOutcome::Skipped);

        assert_eq!(
            client.journal(),
            vec![StoreOp::HeadObject {
                bucket: BUCKET.to_string(),
                key: "existing.txt".to_string(),
            }]
        );
        assert_eq!(
            client.object(BUCKET, "existing.txt").await.unwrap(),
            Bytes::from("old")
        );
    }

    #[tokio::test]
    async fn test_overwrite_disabled_skips_existing_key() {
        let client = test_client(1024);
        client
            .insert_object(BUCKET, "existing.txt", "old", chrono::Utc::now())
            .await;

        let mut file = session(&client, "existing.txt", 1024, false);
        file.write(b"new").await.unwrap();
        assert_eq!(file.close().await.unwrap(), CloseOutcome::Skipped);
        assert_eq!(
            client.object(BUCKET, "existing.txt").await.unwrap(),
            Bytes::from("old")
        );
    }

    #[tokio::test]
    async fn test_head_error_propagates() {
        let client = test_client(1024);
        client.fail_on(FailPoint::HeadObject);
        let mut file = session(&client, "k.txt", 1024, false);
        file.write(b"data").await.unwrap();
        let err = file.close().await.unwrap_err();
        assert_eq!(err.code(), "RemoteError");
        assert_eq!(file.state(), UploadState::Closed);
    }

    #[tokio::test]
    async fn test_use_after_close() {
        let client = test_client(1024);
        let mut file = session(&client, "k.txt", 1024, true);
        file.write(b"data").await.unwrap();
        file.close().await.unwrap();

        let err = file.write(b"more").await.unwrap_err();
        assert!(matches!(err, StorageError::UseAfterClose { .. }));
        let err = file.close().await.unwrap_err();
        assert!(matches!(err, StorageError::UseAfterClose { .. }));
    }

    #[tokio::test]
    async fn test_failed_part_never_completes() {
        let client = test_client(4);
        client.fail_on(FailPoint::UploadPart(2));
        let mut file = session(&client, "k.txt", 4, true);

        file.write(b"aaaa").await.unwrap();
        assert!(file.write(b"bbbb").await.is_err());
        assert_eq!(file.state(), UploadState::Failed);

        let err = file.write(b"cccc").await.unwrap_err();
        assert!(matches!(err, StorageError::UploadAborted { .. }));

        let err = file.close().await.unwrap_err();
        assert_eq!(err.code(), "UploadAborted");
        assert!(!client
            .journal()
            .iter()
            .any(|op| matches!(op, StoreOp::CompleteMultipartUpload { .. })));
        assert_eq!(client.pending_uploads().await, 1);
    }

    #[tokio::test]
    async fn test_failed_initiation() {
        let client = test_client(4);
        client.fail_on(FailPoint::CreateMultipartUpload);
        let mut file = session(&client, "k.txt", 4, true);

        let err = file.write(b"aaaa").await.unwrap_err();
        assert_eq!(err.code(), "RemoteError");
        assert_eq!(file.state(), UploadState::Failed);
        assert_eq!(file.upload_id(), None);
        assert_eq!(file.buffered_len(), 0);

        match file.write(b"bbbb").await.unwrap_err() {
            StorageError::UploadAborted { key, upload_id } => {
                assert_eq!(key, "k.txt");
                assert_eq!(upload_id, "(not initiated)");
            }
            other => panic!("unexpected error {other:?}"),
        }

        assert_eq!(file.close().await.unwrap_err().code(), "UploadAborted");
        assert_eq!(file.state(), UploadState::Closed);
        assert!(!file.is_abortable());
        assert!(!client.journal().iter().any(|op| matches!(
            op,
            StoreOp::UploadPart { .. } | StoreOp::PutObject { .. }
        )));
    }

    #[tokio::test]
    async fn test_failed_completion_is_reported() {
        let client = test_client(4);
        client.fail_on(FailPoint::CompleteMultipartUpload);
        let mut file = session(&client, "k.txt", 4, true);

        file.write(b"aaaa").await.unwrap();
        file.write(b"bb").await.unwrap();
        let err = file.close().await.unwrap_err();
        assert_eq!(err.code(), "RemoteError");
        assert_eq!(file.state(), UploadState::Closed);
        assert_eq!(file.part_count(), 2);
        assert!(client.object(BUCKET, "k.txt").await.is_none());

        // The uncommitted upload can still be cleaned up, once.
        assert!(file.upload_id().is_some());
        assert!(file.is_abortable());
        assert_eq!(client.pending_uploads().await, 1);
        file.abort().await.unwrap();
        assert_eq!(client.pending_uploads().await, 0);
        assert_eq!(file.upload_id(), None);

        let err = file.abort().await.unwrap_err();
        assert!(matches!(err, StorageError::UseAfterClose { .. }));
    }

    #[tokio::test]
    async fn test_failed_put_propagates() {
        let client = test_client(1024);
        client.fail_on(FailPoint::PutObject);
        let mut file = session(&client, "k.txt", 1024, true);

        file.write(b"data").await.unwrap();
        let err = file.close().await.unwrap_err();
        assert_eq!(err.code(), "RemoteError");
        assert_eq!(file.state(), UploadState::Closed);
        assert!(client.object(BUCKET, "k.txt").await.is_none());

        assert!(!file.is_abortable());
        let err = file.abort().await.unwrap_err();
        assert!(matches!(err, StorageError::UseAfterClose { .. }));
    }

    #[tokio::test]
    async fn test_completed_upload_is_not_abortable() {
        let client = test_client(4);
        let mut file = session(&client, "k.txt", 4, true);
        file.write(b"aaaa").await.unwrap();
        file.close().await.unwrap();

        assert!(file.upload_id().is_some());
        assert!(!file.is_abortable());
        assert!(file.abort().await.is_err());
        assert!(client.object(BUCKET, "k.txt").await.is_some());
    }

    #[tokio::test]
    async fn test_abort_after_failed_part() {
        let client = test_client(4);
        client.fail_on(FailPoint::UploadPart(1));
        let mut file = session(&client, "k.txt", 4, true);

        assert!(file.write(b"aaaa").await.is_err());
        file.abort().await.unwrap();
        assert_eq!(file.state(), UploadState::Closed);
        assert_eq!(client.pending_uploads().await, 0);
        assert!(client
            .journal()
            .iter()
            .any(|op| matches!(op, StoreOp::AbortMultipartUpload { .. })));
    }

    #[tokio::test]
    async fn test_missing_part_etags_list_parts_once() {
        let client = MemoryClient::new(MemoryOptions {
            buckets: vec![BUCKET.to_string()],
            min_part_size: 4,
            omit_part_etags: true,
            ..Default::default()
        });
        let mut file = session(&client, "k.txt", 4, true);
        file.write(b"aaaa").await.unwrap();
        file.write(b"bbbb").await.unwrap();
        file.write(b"cc").await.unwrap();
        let outcome = file.close().await.unwrap();
        assert!(matches!(outcome, CloseOutcome::Completed { parts: 3, .. }));

        let listings = client
            .journal()
            .iter()
            .filter(|op| matches!(op, StoreOp::ListParts { .. }))
            .count();
        assert_eq!(listings, 1);
        assert_eq!(
            client.object(BUCKET, "k.txt").await.unwrap(),
            Bytes::from("aaaabbbbcc")
        );
    }

    #[tokio::test]
    async fn test_complete_tracks_etags_locally() {
        let client = test_client(4);
        let mut file = session(&client, "k.txt", 4, true);
        file.write(b"aaaa").await.unwrap();
        file.write(b"bb").await.unwrap();
        file.close().await.unwrap();

        assert!(!client
            .journal()
            .iter()
            .any(|op| matches!(op, StoreOp::ListParts { .. })));
    }

    #[tokio::test]
    async fn test_gzip_multipart_roundtrip() {
        let client = test_client(0);
        let mut file = UploadSession::new(
            Arc::new(client.clone()),
            BUCKET,
            "site.css",
            WriteParameters {
                content_type: "text/css".to_string(),
                content_encoding: Some("gzip".to_string()),
                ..Default::default()
            },
            UploadOptions {
                buffer_size: 64,
                overwrite: true,
                compress: true,
            },
        );

        let mut written = Vec::new();
        for i in 0..200u32 {
            let line = format!("body {{ margin: {i}px; }} /* {} */\n", i.wrapping_mul(2654435761));
            file.write(line.as_bytes()).await.unwrap();
            written.extend_from_slice(line.as_bytes());
        }
        file.close().await.unwrap();

        let stored = client.object(BUCKET, "site.css").await.unwrap();
        let mut decoded = Vec::new();
        GzDecoder::new(stored.as_ref()).read_to_end(&mut decoded).unwrap();
        assert_eq!(decoded, written);
    }

    #[tokio::test]
    async fn test_too_many_parts() {
        let client = test_client(0);
        let mut file = session(&client, "k.bin", 1, true);
        for _ in 0..MAX_PARTS {
            file.write(b"x").await.unwrap();
        }
        let err = file.write(b"x").await.unwrap_err();
        assert!(matches!(err, StorageError::TooManyParts { max: MAX_PARTS, .. }));
        assert_eq!(file.state(), UploadState::Failed);
        file.abort().await.unwrap();
    }
}
