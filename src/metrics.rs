//! Prometheus metrics for bucketfs.
//!
//! Installs a global Prometheus recorder using `metrics-exporter-prometheus`
//! and defines the metric name constants recorded by the upload path and
//! the connection cache.  Without an installed recorder every counter is a
//! no-op.

use metrics::describe_counter;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::{Mutex, OnceLock};

// -- Metric name constants ----------------------------------------------------

/// Finished uploads (counter). Labels: mode (`single`, `multipart`, `skipped`).
pub const UPLOADS_TOTAL: &str = "bucketfs_uploads_total";

/// Multipart parts uploaded (counter).
pub const PARTS_UPLOADED_TOTAL: &str = "bucketfs_parts_uploaded_total";

/// Bytes sent to the store in PUT and part bodies (counter).
pub const BYTES_UPLOADED_TOTAL: &str = "bucketfs_bytes_uploaded_total";

/// Failed uploads (counter). Labels: stage (`initiate`, `part`, `complete`, `put`).
pub const UPLOAD_FAILURES_TOTAL: &str = "bucketfs_upload_failures_total";

/// Buckets created on first use (counter).
pub const BUCKETS_CREATED_TOTAL: &str = "bucketfs_buckets_created_total";

/// Object store client handles built by the connection cache (counter).
pub const CLIENT_HANDLES_CREATED: &str = "bucketfs_client_handles_created_total";

// -- Global recorder installation ---------------------------------------------

/// Singleton handle to the Prometheus recorder.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Serializes recorder installation; the global recorder can be set once.
static INSTALL_LOCK: Mutex<()> = Mutex::new(());

/// Install the global Prometheus metrics recorder.  Idempotent, so tests
/// may call it repeatedly.
pub fn init_metrics() -> anyhow::Result<&'static PrometheusHandle> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle);
    }
    let _guard = INSTALL_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle);
    }
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("failed to install Prometheus recorder: {e}"))?;
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle))
}

/// Register metric descriptions with the global recorder.  Call once after
/// `init_metrics()`.
pub fn describe_metrics() {
    describe_counter!(UPLOADS_TOTAL, "Finished uploads by mode");
    describe_counter!(PARTS_UPLOADED_TOTAL, "Multipart parts uploaded");
    describe_counter!(BYTES_UPLOADED_TOTAL, "Bytes sent in PUT and part bodies");
    describe_counter!(UPLOAD_FAILURES_TOTAL, "Failed uploads by stage");
    describe_counter!(BUCKETS_CREATED_TOTAL, "Buckets created on first use");
    describe_counter!(CLIENT_HANDLES_CREATED, "Object store client handles created");
}

/// Render the Prometheus exposition text, if a recorder is installed.
pub fn render() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(PrometheusHandle::render)
}

// -- Tests --------------------------------------------------------------------
