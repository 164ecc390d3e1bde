//! File storage on top of an object store.
//!
//! [`FileStorage`] is the generic save/open/exists/url/listdir contract.
//! [`S3Storage`] implements it against any [`ObjectStoreClient`]: names
//! are cleaned and joined under the configured location, writes stream
//! through an [`UploadSession`], and client handles come from a
//! per-thread [`ConnectionCache`].
//!
//! The bucket is looked up once per storage and memoized.  With
//! `auto_create_bucket` the first lookup creates a missing bucket.
//! `exists` and `listdir` address the bucket by name and never trigger
//! that lookup.

use bytes::Bytes;
use chrono::{DateTime, NaiveDateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::config::StorageSettings;
use crate::connections::{ClientFactory, ConnectionCache};
use crate::content::negotiate;
use crate::errors::{StorageError, StorageResult};
use crate::file::{OpenMode, S3File};
use crate::metrics::BUCKETS_CREATED_TOTAL;
use crate::naming::{clean_name, normalize_name, ObjectKey};
use crate::storage::aws::AwsS3Client;
use crate::storage::backend::{ObjectHead, ObjectStoreClient, StorageClass, WriteParameters};
use crate::upload::{UploadOptions, UploadSession};
use crate::urls::{filepath_to_uri, strip_signing_parameters};

/// Region in which buckets are created without a location constraint.
const DEFAULT_REGION: &str = "us-east-1";

/// Modification time, timezone-aware or naive (UTC) depending on `use_tz`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifiedTime {
    Aware(DateTime<Utc>),
    Naive(NaiveDateTime),
}

impl ModifiedTime {
    pub fn is_aware(&self) -> bool {
        matches!(self, ModifiedTime::Aware(_))
    }

    pub fn naive_utc(&self) -> NaiveDateTime {
        match self {
            ModifiedTime::Aware(dt) => dt.naive_utc(),
            ModifiedTime::Naive(dt) => *dt,
        }
    }
}

/// Generic file-storage contract.
pub trait FileStorage: Send + Sync {
    /// Store `content` under `name`, returning the name it was stored as.
    fn save(
        &self,
        name: &str,
        content: Bytes,
        content_type: Option<&str>,
    ) -> Pin<Box<dyn Future<Output = StorageResult<String>> + Send + '_>>;

    /// Open `name` for reading or writing.
    fn open(
        &self,
        name: &str,
        mode: OpenMode,
    ) -> Pin<Box<dyn Future<Output = StorageResult<S3File>> + Send + '_>>;

    fn exists(&self, name: &str) -> Pin<Box<dyn Future<Output = StorageResult<bool>> + Send + '_>>;

    fn delete(&self, name: &str) -> Pin<Box<dyn Future<Output = StorageResult<()>> + Send + '_>>;

    /// Size in bytes.
    fn size(&self, name: &str) -> Pin<Box<dyn Future<Output = StorageResult<u64>> + Send + '_>>;

    /// Last modification as a naive UTC timestamp.
    fn modified_time(
        &self,
        name: &str,
    ) -> Pin<Box<dyn Future<Output = StorageResult<NaiveDateTime>> + Send + '_>>;

    /// Last modification, aware or naive per configuration.
    fn get_modified_time(
        &self,
        name: &str,
    ) -> Pin<Box<dyn Future<Output = StorageResult<ModifiedTime>> + Send + '_>>;

    /// `(directories, files)` directly under `path`.
    fn listdir(
        &self,
        path: &str,
    ) -> Pin<Box<dyn Future<Output = StorageResult<(Vec<String>, Vec<String>)>> + Send + '_>>;

    /// Public URL for `name`; presigned URLs live for `expire` seconds.
    fn url(
        &self,
        name: &str,
        expire: Option<u64>,
    ) -> Pin<Box<dyn Future<Output = StorageResult<String>> + Send + '_>>;
}

/// A bucket that has been looked up (and possibly created).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bucket {
    pub name: String,
}

/// [`FileStorage`] over an S3-compatible object store.
pub struct S3Storage {
    settings: StorageSettings,
    connections: ConnectionCache,
    bucket: OnceCell<Bucket>,
}

impl S3Storage {
    /// Build a storage from settings and a client factory.
    pub fn new(settings: StorageSettings, factory: ClientFactory) -> StorageResult<Self> {
        settings.validate()?;
        Ok(Self {
            settings,
            connections: ConnectionCache::new(factory),
            bucket: OnceCell::new(),
        })
    }

    /// Build a storage talking to AWS S3 (or a compatible endpoint).
    pub async fn from_settings(settings: StorageSettings) -> StorageResult<Self> {
        settings.validate()?;
        let factory = AwsS3Client::factory(&settings).await;
        Self::new(settings, factory)
    }

    /// Settings this storage was built from.  They rebuild an equivalent
    /// storage; client handles and the memoized bucket are not part of
    /// them.
    pub fn settings(&self) -> &StorageSettings {
        &self.settings
    }

    /// Whether the bucket lookup has already happened.
    pub fn has_bucket(&self) -> bool {
        self.bucket.initialized()
    }

    pub fn connections(&self) -> &ConnectionCache {
        &self.connections
    }

    /// Client handle of the calling thread.
    pub fn connection(&self) -> StorageResult<Arc<dyn ObjectStoreClient>> {
        self.connections.current()
    }

    /// The memoized bucket, looked up (or created) on first access.
    pub async fn bucket(&self) -> StorageResult<&Bucket> {
        self.bucket
            .get_or_try_init(|| self.get_or_create_bucket(&self.settings.bucket_name))
            .await
    }

    async fn get_or_create_bucket(&self, name: &str) -> StorageResult<Bucket> {
        if self.settings.auto_create_bucket {
            let client = self.connection()?;
            match client.head_bucket(name).await {
                Ok(()) => {}
                Err(StorageError::BucketNotFound { .. }) => {
                    let constraint = client.region().filter(|r| r != DEFAULT_REGION);
                    client
                        .create_bucket(
                            name,
                            self.settings.bucket_acl.as_deref(),
                            constraint.as_deref(),
                        )
                        .await?;
                    info!(
                        "created bucket {} (acl={:?}, location_constraint={:?})",
                        name, self.settings.bucket_acl, constraint
                    );
                    metrics::counter!(BUCKETS_CREATED_TOTAL).increment(1);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(Bucket {
            name: name.to_string(),
        })
    }

    /// Map a storage name to its object key under the location.
    pub fn normalize(&self, name: &str) -> StorageResult<ObjectKey> {
        normalize_name(&self.settings.location, name)
    }

    /// Headers and compression for a write to `key`.
    fn write_parameters(&self, key: &str, content_type: Option<&str>) -> (WriteParameters, bool) {
        let negotiated = negotiate(
            key,
            content_type,
            self.settings.gzip,
            &self.settings.gzip_content_types,
        );
        let params = WriteParameters {
            content_type: negotiated.content_type,
            content_encoding: negotiated.content_encoding,
            acl: self.settings.default_acl.clone(),
            storage_class: self
                .settings
                .reduced_redundancy
                .then_some(StorageClass::ReducedRedundancy),
            server_side_encryption: self.settings.encryption,
            cache_control: self.settings.cache_control.clone(),
        };
        (params, negotiated.compress)
    }

    async fn open_file(
        &self,
        name: &str,
        mode: OpenMode,
        content_type: Option<&str>,
    ) -> StorageResult<S3File> {
        let cleaned = clean_name(name);
        let key = self.normalize(&cleaned)?.into_string();
        let bucket = self.bucket().await?.name.clone();
        let client = self.connection()?;

        debug!("open {}: bucket={} key={}", mode, bucket, key);
        match mode {
            OpenMode::Read => Ok(S3File::reader(cleaned, client, bucket, key)),
            OpenMode::Write => {
                let (params, compress) = self.write_parameters(&key, content_type);
                let session = UploadSession::new(
                    client,
                    bucket,
                    key,
                    params,
                    UploadOptions {
                        buffer_size: self.settings.buffer_size,
                        overwrite: self.settings.overwrite,
                        compress,
                    },
                );
                Ok(S3File::writer(cleaned, session))
            }
        }
    }

    async fn head(&self, name: &str) -> StorageResult<ObjectHead> {
        let key = self.normalize(&clean_name(name))?;
        let bucket = self.bucket().await?.name.clone();
        self.connection()?.head_object(&bucket, key.as_str()).await
    }
}

/// Abort whatever a failed write or close left behind.
async fn abandon(file: &mut S3File) {
    if !file.upload().is_some_and(UploadSession::is_abortable) {
        return;
    }
    if let Err(e) = file.abort().await {
        warn!("failed to abort upload of {}: {}", file.name(), e);
    }
}

impl FileStorage for S3Storage {
    fn save(
        &self,
        name: &str,
        content: Bytes,
        content_type: Option<&str>,
    ) -> Pin<Box<dyn Future<Output = StorageResult<String>> + Send + '_>> {
        let name = name.to_string();
        let content_type = content_type.map(String::from);
        Box::pin(async move {
            let mut file = self
                .open_file(&name, OpenMode::Write, content_type.as_deref())
                .await?;

            let mut result = Ok(());
            for chunk in content.chunks(self.settings.buffer_size.max(1)) {
                result = file.write(chunk).await;
                if result.is_err() {
                    break;
                }
            }
            if result.is_ok() {
                result = file.close().await.map(|_| ());
            }

            if let Err(e) = result {
                abandon(&mut file).await;
                return Err(e);
            }
            Ok(file.name().to_string())
        })
    }

    fn open(
        &self,
        name: &str,
        mode: OpenMode,
    ) -> Pin<Box<dyn Future<Output = StorageResult<S3File>> + Send + '_>> {
        let name = name.to_string();
        Box::pin(async move { self.open_file(&name, mode, None).await })
    }

    fn exists(&self, name: &str) -> Pin<Box<dyn Future<Output = StorageResult<bool>> + Send + '_>> {
        let name = name.to_string();
        Box::pin(async move {
            let key = self.normalize(&clean_name(&name))?;
            match self
                .connection()?
                .head_object(&self.settings.bucket_name, key.as_str())
                .await
            {
                Ok(_) => Ok(true),
                Err(e) if e.is_not_found() => Ok(false),
                Err(e) => Err(e),
            }
        })
    }

    fn delete(&self, name: &str) -> Pin<Box<dyn Future<Output = StorageResult<()>> + Send + '_>> {
        let name = name.to_string();
        Box::pin(async move {
            let key = self.normalize(&clean_name(&name))?;
            let bucket = self.bucket().await?.name.clone();
            self.connection()?.delete_object(&bucket, key.as_str()).await
        })
    }

    fn size(&self, name: &str) -> Pin<Box<dyn Future<Output = StorageResult<u64>> + Send + '_>> {
        let name = name.to_string();
        Box::pin(async move { Ok(self.head(&name).await?.content_length) })
    }

    fn modified_time(
        &self,
        name: &str,
    ) -> Pin<Box<dyn Future<Output = StorageResult<NaiveDateTime>> + Send + '_>> {
        let name = name.to_string();
        Box::pin(async move {
            let head = self.head(&name).await?;
            head.last_modified
                .map(|dt| dt.naive_utc())
                .ok_or_else(|| {
                    StorageError::Remote(anyhow::anyhow!("no Last-Modified reported for '{name}'"))
                })
        })
    }

    fn get_modified_time(
        &self,
        name: &str,
    ) -> Pin<Box<dyn Future<Output = StorageResult<ModifiedTime>> + Send + '_>> {
        let name = name.to_string();
        Box::pin(async move {
            let head = self.head(&name).await?;
            let last_modified = head.last_modified.ok_or_else(|| {
                StorageError::Remote(anyhow::anyhow!("no Last-Modified reported for '{name}'"))
            })?;
            Ok(if self.settings.use_tz {
                ModifiedTime::Aware(last_modified)
            } else {
                ModifiedTime::Naive(last_modified.naive_utc())
            })
        })
    }

    fn listdir(
        &self,
        path: &str,
    ) -> Pin<Box<dyn Future<Output = StorageResult<(Vec<String>, Vec<String>)>> + Send + '_>> {
        let path = path.to_string();
        Box::pin(async move {
            let mut prefix = self.normalize(&clean_name(&path))?.into_string();
            if !prefix.is_empty() && !prefix.ends_with('/') {
                prefix.push('/');
            }

            let client = self.connection()?;
            let relative = |entry: &str| -> String {
                entry
                    .strip_prefix(prefix.as_str())
                    .unwrap_or(entry)
                    .trim_end_matches('/')
                    .to_string()
            };

            let mut directories = Vec::new();
            let mut files = Vec::new();
            let mut token: Option<String> = None;
            loop {
                let page = client
                    .list_objects(
                        &self.settings.bucket_name,
                        &prefix,
                        Some("/"),
                        token.as_deref(),
                    )
                    .await?;

                directories.extend(page.prefixes.iter().map(|p| relative(p)));
                files.extend(
                    page.keys
                        .iter()
                        .map(|k| relative(k))
                        .filter(|name| !name.is_empty()),
                );

                match page.next_token {
                    Some(next) => token = Some(next),
                    None => break,
                }
            }
            Ok((directories, files))
        })
    }

    fn url(
        &self,
        name: &str,
        expire: Option<u64>,
    ) -> Pin<Box<dyn Future<Output = StorageResult<String>> + Send + '_>> {
        let name = name.to_string();
        Box::pin(async move {
            let key = self.normalize(&clean_name(&name))?;

            if let Some(domain) = &self.settings.custom_domain {
                return Ok(format!(
                    "{}//{}/{}",
                    self.settings.url_protocol,
                    domain,
                    filepath_to_uri(key.as_str())
                ));
            }

            let expire = expire.unwrap_or(self.settings.querystring_expire);
            let bucket = self.bucket().await?.name.clone();
            let url = self
                .connection()?
                .presign_get(&bucket, key.as_str(), Duration::from_secs(expire))
                .await?;

            if self.settings.querystring_auth {
                Ok(url)
            } else {
                Ok(strip_signing_parameters(&url))
            }
        })
    }
}
