//! Configuration loading and types for bucketfs.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct.  The `storage` section is a [`StorageSettings`]: the
//! complete, serializable description of an [`S3Storage`] that can be
//! handed to another process and rebuilt there.  Live client handles and
//! the memoized bucket are never part of it.
//!
//! [`S3Storage`]: crate::filestore::S3Storage

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

use crate::content::default_gzip_content_types;
use crate::errors::{StorageError, StorageResult};

/// Minimum size of a non-final multipart part accepted by S3 (5 MiB).
pub const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Storage adapter settings.
    #[serde(default)]
    pub storage: StorageSettings,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Settings of one storage adapter instance.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct StorageSettings {
    /// Access key (falls back to `AWS_S3_ACCESS_KEY_ID` / `AWS_ACCESS_KEY_ID`).
    #[serde(default, alias = "access_key_id")]
    pub access_key: Option<String>,

    /// Secret key (falls back to `AWS_S3_SECRET_ACCESS_KEY` / `AWS_SECRET_ACCESS_KEY`).
    #[serde(default, alias = "secret_access_key")]
    pub secret_key: Option<String>,

    /// Bucket holding the stored files.
    #[serde(default)]
    pub bucket_name: String,

    /// Key prefix every name is stored under.  Must not begin with `/`.
    #[serde(default)]
    pub location: String,

    /// Region to connect to (default: the SDK's provider chain).
    #[serde(default)]
    pub region: Option<String>,

    /// Custom S3-compatible endpoint (e.g. MinIO, LocalStack).
    #[serde(default)]
    pub endpoint_url: Option<String>,

    /// Force path-style URL addressing.
    #[serde(default)]
    pub use_path_style: bool,

    /// Canned ACL applied to written objects.
    #[serde(default = "default_acl")]
    pub default_acl: Option<String>,

    /// Canned ACL applied to an auto-created bucket.
    #[serde(default = "default_acl")]
    pub bucket_acl: Option<String>,

    /// Create the bucket on first use if it does not exist.
    #[serde(default)]
    pub auto_create_bucket: bool,

    /// Gzip content whose type is in `gzip_content_types`.
    #[serde(default)]
    pub gzip: bool,

    /// Content types compressed when `gzip` is enabled.
    #[serde(default = "default_gzip_content_types")]
    pub gzip_content_types: BTreeSet<String>,

    /// Request AES256 server-side encryption.
    #[serde(default)]
    pub encryption: bool,

    /// Store objects with the `REDUCED_REDUNDANCY` storage class.
    #[serde(default)]
    pub reduced_redundancy: bool,

    /// `Cache-Control` header set on written objects.
    #[serde(default)]
    pub cache_control: Option<String>,

    /// CDN-style domain; URLs built against it are never presigned.
    #[serde(default)]
    pub custom_domain: Option<String>,

    /// Scheme prefix for custom-domain URLs.
    #[serde(default = "default_url_protocol")]
    pub url_protocol: String,

    /// Keep signing parameters in generated URLs.
    #[serde(default = "default_true")]
    pub querystring_auth: bool,

    /// Default presigned URL lifetime in seconds.
    #[serde(default = "default_querystring_expire")]
    pub querystring_expire: u64,

    /// Overwrite existing objects on close.  When false, a below-threshold
    /// upload of an existing key is skipped.
    #[serde(default = "default_true", alias = "file_overwrite")]
    pub overwrite: bool,

    /// Write buffer size; also the size of each multipart part.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Report timezone-aware modification times.
    #[serde(default = "default_true")]
    pub use_tz: bool,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            access_key: None,
            secret_key: None,
            bucket_name: String::new(),
            location: String::new(),
            region: None,
            endpoint_url: None,
            use_path_style: false,
            default_acl: default_acl(),
            bucket_acl: default_acl(),
            auto_create_bucket: false,
            gzip: false,
            gzip_content_types: default_gzip_content_types(),
            encryption: false,
            reduced_redundancy: false,
            cache_control: None,
            custom_domain: None,
            url_protocol: default_url_protocol(),
            querystring_auth: true,
            querystring_expire: default_querystring_expire(),
            overwrite: true,
            buffer_size: default_buffer_size(),
            use_tz: true,
        }
    }
}

impl StorageSettings {
    /// Check invariants that must hold before a storage is built.
    pub fn validate(&self) -> StorageResult<()> {
        if self.location.starts_with('/') {
            return Err(StorageError::InvalidLocation {
                location: self.location.clone(),
            });
        }
        if self.buffer_size == 0 {
            return Err(StorageError::Config(
                "buffer_size must be greater than zero".to_string(),
            ));
        }
        if self.buffer_size < MIN_PART_SIZE {
            tracing::warn!(
                "buffer_size {} is below the 5 MiB S3 minimum part size; multipart uploads may be rejected",
                self.buffer_size
            );
        }
        Ok(())
    }

    /// Resolve static credentials from the settings or the environment.
    ///
    /// Returns `None` when either half is missing, in which case the SDK's
    /// default credential chain applies.
    pub fn resolved_credentials(&self) -> Option<(String, String)> {
        let access_key = self
            .access_key
            .clone()
            .or_else(|| env_first(&["AWS_S3_ACCESS_KEY_ID", "AWS_ACCESS_KEY_ID"]))?;
        let secret_key = self
            .secret_key
            .clone()
            .or_else(|| env_first(&["AWS_S3_SECRET_ACCESS_KEY", "AWS_SECRET_ACCESS_KEY"]))?;
        Some((access_key, secret_key))
    }
}

fn env_first(names: &[&str]) -> Option<String> {
    names
        .iter()
        .find_map(|name| std::env::var(name).ok().filter(|v| !v.is_empty()))
}

// -- Defaults ----------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_acl() -> Option<String> {
    Some("public-read".to_string())
}

fn default_url_protocol() -> String {
    "https:".to_string()
}

fn default_querystring_expire() -> u64 {
    3600
}

fn default_buffer_size() -> usize {
    MIN_PART_SIZE
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> StorageResult<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let config: Config = serde_yaml::from_str(&contents)
        .map_err(|e| StorageError::Config(format!("{}: {e}", path.as_ref().display())))?;
    config.storage.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let settings = StorageSettings::default();
        assert_eq!(settings.default_acl.as_deref(), Some("public-read"));
        assert_eq!(settings.bucket_acl.as_deref(), Some("public-read"));
        assert_eq!(settings.querystring_expire, 3600);
        assert_eq!(settings.buffer_size, MIN_PART_SIZE);
        assert_eq!(settings.url_protocol, "https:");
        assert!(settings.overwrite);
        assert!(settings.querystring_auth);
        assert!(settings.gzip_content_types.contains("text/css"));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_location_leading_slash_rejected() {
        let settings = StorageSettings {
            location: "/".to_string(),
            ..Default::default()
        };
        let err = settings.validate().unwrap_err();
        assert!(matches!(err, StorageError::InvalidLocation { .. }));
    }

    #[test]
    fn test_zero_buffer_rejected() {
        let settings = StorageSettings {
            buffer_size: 0,
            ..Default::default()
        };
        assert!(matches!(
            settings.validate().unwrap_err(),
            StorageError::Config(_)
        ));
    }

    #[test]
    fn test_load_config_from_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "storage:\n  bucket_name: media\n  location: static\n  file_overwrite: false\n  gzip: true\nlogging:\n  level: debug"
        )
        .unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.storage.bucket_name, "media");
        assert_eq!(config.storage.location, "static");
        assert!(!config.storage.overwrite);
        assert!(config.storage.gzip);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, "text");
    }

    #[test]
    fn test_load_config_rejects_bad_location() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "storage:\n  location: /abs").unwrap();
        let err = load_config(file.path()).unwrap_err();
        assert!(matches!(err, StorageError::InvalidLocation { .. }));
    }

    #[test]
    fn test_settings_yaml_roundtrip() {
        let settings = StorageSettings {
            bucket_name: "media".to_string(),
            location: "foo1".to_string(),
            custom_domain: Some("cdn.example.com".to_string()),
            ..Default::default()
        };
        let yaml = serde_yaml::to_string(&settings).unwrap();
        let restored: StorageSettings = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(restored, settings);
    }

    #[test]
    fn test_explicit_credentials_win() {
        let settings = StorageSettings {
            access_key: Some("foo".to_string()),
            secret_key: Some("bar".to_string()),
            ..Default::default()
        };
        assert_eq!(
            settings.resolved_credentials(),
            Some(("foo".to_string(), "bar".to_string()))
        );
    }
}
