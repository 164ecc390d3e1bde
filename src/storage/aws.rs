//! AWS S3 object-store client.
//!
//! Wraps `aws_sdk_s3::Client`.  Credentials come from the storage settings
//! when both halves are configured (directly or through the
//! `AWS_S3_*`/`AWS_*` environment variables), otherwise from the standard
//! AWS credential chain (env vars, `~/.aws/credentials`, IAM role, etc.).
//! A custom endpoint and path-style addressing make it usable against
//! S3-compatible stores such as MinIO.

use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_sdk_s3::config::Credentials;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    BucketCannedAcl, BucketLocationConstraint, CompletedMultipartUpload, CreateBucketConfiguration,
    ObjectCannedAcl, ServerSideEncryption,
};
use aws_sdk_s3::Client;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::backend::{CompletedPart, ListPage, ObjectHead, ObjectStoreClient, WriteParameters};
use crate::config::StorageSettings;
use crate::connections::ClientFactory;
use crate::errors::{StorageError, StorageResult};

/// [`ObjectStoreClient`] backed by the AWS SDK.
pub struct AwsS3Client {
    client: Client,
    region: Option<String>,
}

impl AwsS3Client {
    /// Resolve the shared SDK configuration for `settings`.
    pub async fn load_sdk_config(settings: &StorageSettings) -> SdkConfig {
        let mut config_loader = aws_config::defaults(BehaviorVersion::latest());

        if let Some(region) = &settings.region {
            config_loader = config_loader.region(Region::new(region.clone()));
        }
        if let Some(endpoint) = &settings.endpoint_url {
            config_loader = config_loader.endpoint_url(endpoint);
        }
        if let Some((access_key, secret_key)) = settings.resolved_credentials() {
            let creds = Credentials::new(
                access_key,
                secret_key,
                None, // session_token
                None, // expiry
                "bucketfs-config",
            );
            config_loader = config_loader.credentials_provider(creds);
        }

        config_loader.load().await
    }

    /// Build a client from an already loaded SDK configuration.
    pub fn from_sdk_config(sdk_config: &SdkConfig, use_path_style: bool) -> Self {
        let s3_config = aws_sdk_s3::config::Builder::from(sdk_config)
            .force_path_style(use_path_style)
            .build();
        Self {
            client: Client::from_conf(s3_config),
            region: sdk_config.region().map(|r| r.to_string()),
        }
    }

    /// Factory building a new SDK client per call over one loaded
    /// configuration.
    pub async fn factory(settings: &StorageSettings) -> ClientFactory {
        let sdk_config = Self::load_sdk_config(settings).await;
        let use_path_style = settings.use_path_style;
        info!(
            "AWS S3 client configured: region={:?} endpoint={:?} path_style={}",
            sdk_config.region(),
            settings.endpoint_url,
            use_path_style
        );
        Arc::new(move || {
            Ok(Arc::new(Self::from_sdk_config(&sdk_config, use_path_style))
                as Arc<dyn ObjectStoreClient>)
        })
    }

    /// Map an AWS SDK error to a storage error with context.
    fn map_sdk_error(context: &str, err: impl std::fmt::Display) -> StorageError {
        StorageError::Remote(anyhow::anyhow!("AWS S3 {context}: {err}"))
    }

    fn object_acl(params: &WriteParameters) -> Option<ObjectCannedAcl> {
        params.acl.as_deref().map(ObjectCannedAcl::from)
    }

    fn storage_class(params: &WriteParameters) -> Option<aws_sdk_s3::types::StorageClass> {
        params
            .storage_class
            .map(|class| aws_sdk_s3::types::StorageClass::from(class.as_str()))
    }

    fn encryption(params: &WriteParameters) -> Option<ServerSideEncryption> {
        params
            .server_side_encryption
            .then_some(ServerSideEncryption::Aes256)
    }
}

/// Convert an SDK timestamp to a `chrono` UTC time.
fn to_chrono(dt: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(dt.secs(), dt.subsec_nanos())
}

impl ObjectStoreClient for AwsS3Client {
    fn region(&self) -> Option<String> {
        self.region.clone()
    }

    fn head_bucket(
        &self,
        bucket: &str,
    ) -> Pin<Box<dyn Future<Output = StorageResult<()>> + Send + '_>> {
        let bucket = bucket.to_string();
        Box::pin(async move {
            debug!("AWS head_bucket: bucket={}", bucket);

            match self.client.head_bucket().bucket(&bucket).send().await {
                Ok(_) => Ok(()),
                Err(err) => {
                    let status = err.raw_response().map(|r| r.status().as_u16());
                    if status == Some(301) {
                        return Err(StorageError::BucketWrongRegion { bucket });
                    }
                    let service_err = err.into_service_error();
                    if service_err.is_not_found() || status == Some(404) {
                        Err(StorageError::BucketNotFound { bucket })
                    } else {
                        Err(Self::map_sdk_error("head_bucket", service_err))
                    }
                }
            }
        })
    }

    fn create_bucket(
        &self,
        bucket: &str,
        acl: Option<&str>,
        location_constraint: Option<&str>,
    ) -> Pin<Box<dyn Future<Output = StorageResult<()>> + Send + '_>> {
        let bucket = bucket.to_string();
        let acl = acl.map(BucketCannedAcl::from);
        let location_constraint = location_constraint.map(BucketLocationConstraint::from);
        Box::pin(async move {
            debug!(
                "AWS create_bucket: bucket={} location_constraint={:?}",
                bucket, location_constraint
            );

            let mut req = self.client.create_bucket().bucket(&bucket).set_acl(acl);
            if let Some(constraint) = location_constraint {
                req = req.create_bucket_configuration(
                    CreateBucketConfiguration::builder()
                        .location_constraint(constraint)
                        .build(),
                );
            }
            req.send()
                .await
                .map_err(|e| Self::map_sdk_error("create_bucket", e.into_service_error()))?;
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
            debug!("AWS head_object: bucket={} key={}", bucket, key);

            let resp = match self.client.head_object().bucket(&bucket).key(&key).send().await {
                Ok(resp) => resp,
                Err(e) => {
                    let service_err = e.into_service_error();
                    return if service_err.is_not_found() {
                        Err(StorageError::NotFound { bucket, key })
                    } else {
                        Err(Self::map_sdk_error("head_object", service_err))
                    };
                }
            };

            Ok(ObjectHead {
                content_length: resp.content_length().unwrap_or(0).max(0) as u64,
                last_modified: resp.last_modified().and_then(to_chrono),
                e_tag: resp.e_tag().map(String::from),
                content_type: resp.content_type().map(String::from),
                content_encoding: resp.content_encoding().map(String::from),
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
            debug!("AWS get_object: bucket={} key={}", bucket, key);

            let resp = match self.client.get_object().bucket(&bucket).key(&key).send().await {
                Ok(resp) => resp,
                Err(e) => {
                    let service_err = e.into_service_error();
                    return if service_err.is_no_such_key() {
                        Err(StorageError::NotFound { bucket, key })
                    } else {
                        Err(Self::map_sdk_error("get_object", service_err))
                    };
                }
            };

            let body = resp
                .body
                .collect()
                .await
                .map_err(|e| Self::map_sdk_error("get_object body", e))?
                .into_bytes();
            Ok(body)
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
            debug!(
                "AWS put_object: bucket={} key={} len={} content_type={}",
                bucket,
                key,
                body.len(),
                params.content_type
            );

            let resp = self
                .client
                .put_object()
                .bucket(&bucket)
                .key(&key)
                .body(ByteStream::from(body))
                .content_type(&params.content_type)
                .set_content_encoding(params.content_encoding.clone())
                .set_cache_control(params.cache_control.clone())
                .set_acl(Self::object_acl(&params))
                .set_storage_class(Self::storage_class(&params))
                .set_server_side_encryption(Self::encryption(&params))
                .send()
                .await
                .map_err(|e| Self::map_sdk_error("put_object", e.into_service_error()))?;

            Ok(resp.e_tag().map(String::from))
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
            debug!("AWS delete_object: bucket={} key={}", bucket, key);

            // S3 delete_object is idempotent -- no error for missing keys.
            self.client
                .delete_object()
                .bucket(&bucket)
                .key(&key)
                .send()
                .await
                .map_err(|e| Self::map_sdk_error("delete_object", e.into_service_error()))?;
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
            debug!("AWS create_multipart_upload: bucket={} key={}", bucket, key);

            let resp = self
                .client
                .create_multipart_upload()
                .bucket(&bucket)
                .key(&key)
                .content_type(&params.content_type)
                .set_content_encoding(params.content_encoding.clone())
                .set_cache_control(params.cache_control.clone())
                .set_acl(Self::object_acl(&params))
                .set_storage_class(Self::storage_class(&params))
                .set_server_side_encryption(Self::encryption(&params))
                .send()
                .await
                .map_err(|e| {
                    Self::map_sdk_error("create_multipart_upload", e.into_service_error())
                })?;

            resp.upload_id()
                .map(String::from)
                .ok_or_else(|| StorageError::Remote(anyhow::anyhow!("AWS did not return upload ID")))
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
            debug!(
                "AWS upload_part: bucket={} key={} upload_id={} part={} len={}",
                bucket,
                key,
                upload_id,
                part_number,
                body.len()
            );

            let resp = self
                .client
                .upload_part()
                .bucket(&bucket)
                .key(&key)
                .upload_id(&upload_id)
                .part_number(part_number as i32)
                .body(ByteStream::from(body))
                .send()
                .await
                .map_err(|e| Self::map_sdk_error("upload_part", e.into_service_error()))?;

            Ok(resp.e_tag().map(String::from))
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
            debug!(
                "AWS list_parts: bucket={} key={} upload_id={}",
                bucket, key, upload_id
            );

            let mut parts = Vec::new();
            let mut marker: Option<String> = None;
            loop {
                let resp = self
                    .client
                    .list_parts()
                    .bucket(&bucket)
                    .key(&key)
                    .upload_id(&upload_id)
                    .set_part_number_marker(marker.take())
                    .send()
                    .await
                    .map_err(|e| Self::map_sdk_error("list_parts", e.into_service_error()))?;

                parts.extend(resp.parts().iter().filter_map(|part| {
                    Some(CompletedPart {
                        part_number: u32::try_from(part.part_number()?).ok()?,
                        e_tag: part.e_tag()?.to_string(),
                    })
                }));

                if resp.is_truncated() == Some(true) {
                    marker = resp.next_part_number_marker().map(String::from);
                    if marker.is_none() {
                        break;
                    }
                } else {
                    break;
                }
            }

            parts.sort_by_key(|p| p.part_number);
            Ok(parts)
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
        let completed: Vec<aws_sdk_s3::types::CompletedPart> = parts
            .iter()
            .map(|p| {
                aws_sdk_s3::types::CompletedPart::builder()
                    .part_number(p.part_number as i32)
                    .e_tag(&p.e_tag)
                    .build()
            })
            .collect();
        Box::pin(async move {
            debug!(
                "AWS complete_multipart_upload: bucket={} key={} upload_id={} parts={}",
                bucket,
                key,
                upload_id,
                completed.len()
            );

            let resp = self
                .client
                .complete_multipart_upload()
                .bucket(&bucket)
                .key(&key)
                .upload_id(&upload_id)
                .multipart_upload(
                    CompletedMultipartUpload::builder()
                        .set_parts(Some(completed))
                        .build(),
                )
                .send()
                .await
                .map_err(|e| {
                    Self::map_sdk_error("complete_multipart_upload", e.into_service_error())
                })?;

            Ok(resp.e_tag().map(String::from))
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
            debug!(
                "AWS abort_multipart_upload: bucket={} key={} upload_id={}",
                bucket, key, upload_id
            );

            self.client
                .abort_multipart_upload()
                .bucket(&bucket)
                .key(&key)
                .upload_id(&upload_id)
                .send()
                .await
                .map_err(|e| {
                    Self::map_sdk_error("abort_multipart_upload", e.into_service_error())
                })?;
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
            debug!(
                "AWS list_objects_v2: bucket={} prefix={} delimiter={:?}",
                bucket, prefix, delimiter
            );

            let resp = self
                .client
                .list_objects_v2()
                .bucket(&bucket)
                .prefix(&prefix)
                .set_delimiter(delimiter)
                .set_continuation_token(continuation_token)
                .send()
                .await
                .map_err(|e| {
                    let service_err = e.into_service_error();
                    if service_err.is_no_such_bucket() {
                        StorageError::BucketNotFound {
                            bucket: bucket.clone(),
                        }
                    } else {
                        Self::map_sdk_error("list_objects_v2", service_err)
                    }
                })?;

            let next_token = if resp.is_truncated() == Some(true) {
                resp.next_continuation_token().map(String::from)
            } else {
                None
            };

            Ok(ListPage {
                prefixes: resp
                    .common_prefixes()
                    .iter()
                    .filter_map(|p| p.prefix().map(String::from))
                    .collect(),
                keys: resp
                    .contents()
                    .iter()
                    .filter_map(|o| o.key().map(String::from))
                    .collect(),
                next_token,
            })
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
            debug!(
                "AWS presign get_object: bucket={} key={} expires_in={}s",
                bucket,
                key,
                expires_in.as_secs()
            );

            let config = PresigningConfig::expires_in(expires_in)
                .map_err(|e| Self::map_sdk_error("presigning config", e))?;
            let presigned = self
                .client
                .get_object()
                .bucket(&bucket)
                .key(&key)
                .presigned(config)
                .await
                .map_err(|e| Self::map_sdk_error("presign get_object", e))?;

            Ok(presigned.uri().to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::backend::StorageClass;

    fn local_settings() -> StorageSettings {
        StorageSettings {
            access_key: Some("AKIDEXAMPLE".to_string()),
            secret_key: Some("wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".to_string()),
            bucket_name: "media".to_string(),
            region: Some("eu-west-1".to_string()),
            endpoint_url: Some("http://localhost:9000".to_string()),
            use_path_style: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_write_parameter_mapping() {
        let params = WriteParameters {
            content_type: "text/plain".to_string(),
            acl: Some("public-read".to_string()),
            storage_class: Some(StorageClass::ReducedRedundancy),
            server_side_encryption: true,
            ..Default::default()
        };
        assert_eq!(AwsS3Client::object_acl(&params), Some(ObjectCannedAcl::PublicRead));
        assert_eq!(
            AwsS3Client::storage_class(&params),
            Some(aws_sdk_s3::types::StorageClass::ReducedRedundancy)
        );
        assert_eq!(
            AwsS3Client::encryption(&params),
            Some(ServerSideEncryption::Aes256)
        );

        let plain = WriteParameters::default();
        assert_eq!(AwsS3Client::object_acl(&plain), None);
        assert_eq!(AwsS3Client::storage_class(&plain), None);
        assert_eq!(AwsS3Client::encryption(&plain), None);
    }

    #[test]
    fn test_to_chrono() {
        let dt = aws_sdk_s3::primitives::DateTime::from_secs(1_700_000_000);
        let converted = to_chrono(&dt).unwrap();
        assert_eq!(converted.timestamp(), 1_700_000_000);
    }

    #[tokio::test]
    async fn test_region_from_settings() {
        let sdk_config = AwsS3Client::load_sdk_config(&local_settings()).await;
        let client = AwsS3Client::from_sdk_config(&sdk_config, true);
        assert_eq!(client.region().as_deref(), Some("eu-west-1"));
    }

    #[tokio::test]
    async fn test_presign_get_is_local() {
        let factory = AwsS3Client::factory(&local_settings()).await;
        let client = factory().unwrap();
        let url = client
            .presign_get("media", "dir/file name.txt", Duration::from_secs(3600))
            .await
            .unwrap();

        assert!(url.starts_with("http://localhost:9000/media/dir/file%20name.txt?"));
        assert!(url.contains("X-Amz-Expires=3600"));
        assert!(url.contains("X-Amz-Signature="));
    }
}
