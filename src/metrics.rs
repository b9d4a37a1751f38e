//! Prometheus metrics for blobfs.
//!
//! Metric name constants live here so call sites and the description
//! table stay in sync.  Recording is a no-op until a recorder is
//! installed, which only the binary does.

use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::OnceLock;

// -- Metric name constants ----------------------------------------------------

/// Metadata cache hits (counter).
pub const CACHE_HITS_TOTAL: &str = "blobfs_cache_hits_total";

/// Metadata cache misses, including expired entries (counter).
pub const CACHE_MISSES_TOTAL: &str = "blobfs_cache_misses_total";

/// File handles opened (counter). Labels: mode.
pub const FILES_OPENED_TOTAL: &str = "blobfs_files_opened_total";

/// File handles closed (counter). Labels: outcome.
pub const FILES_CLOSED_TOTAL: &str = "blobfs_files_closed_total";

/// Currently open file handles (gauge).
pub const FILES_OPEN: &str = "blobfs_files_open";

/// Blocks staged by buffered writers (counter).
pub const BLOCKS_STAGED_TOTAL: &str = "blobfs_blocks_staged_total";

/// Bytes returned by buffered readers (counter).
pub const BYTES_READ_TOTAL: &str = "blobfs_bytes_read_total";

/// Bytes accepted by buffered writers (counter).
pub const BYTES_WRITTEN_TOTAL: &str = "blobfs_bytes_written_total";

/// Write-mode opens rejected because another writer held the lease (counter).
pub const LEASE_CONFLICTS_TOTAL: &str = "blobfs_lease_conflicts_total";

// -- Global recorder installation ---------------------------------------------

/// Singleton handle to the Prometheus recorder.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus recorder.  Idempotent.
pub fn init_metrics() -> anyhow::Result<&'static PrometheusHandle> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle);
    }
    let handle = PrometheusBuilder::new().install_recorder()?;
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle))
}

/// Install the global recorder behind a scrape endpoint on `addr`.
///
/// Must be called from within a tokio runtime.  Mutually exclusive with
/// [`init_metrics`].
pub fn serve_metrics(addr: SocketAddr) -> anyhow::Result<()> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    Ok(())
}

/// Register metric descriptions with the global recorder.
pub fn describe_metrics() {
    describe_counter!(CACHE_HITS_TOTAL, "Metadata cache hits");
    describe_counter!(CACHE_MISSES_TOTAL, "Metadata cache misses");
    describe_counter!(FILES_OPENED_TOTAL, "File handles opened by mode");
    describe_counter!(FILES_CLOSED_TOTAL, "File handles closed by outcome");
    describe_gauge!(FILES_OPEN, "Currently open file handles");
    describe_counter!(BLOCKS_STAGED_TOTAL, "Blocks staged by buffered writers");
    describe_counter!(BYTES_READ_TOTAL, "Bytes read through file handles");
    describe_counter!(BYTES_WRITTEN_TOTAL, "Bytes written through file handles");
    describe_counter!(LEASE_CONFLICTS_TOTAL, "Write opens rejected by lease conflicts");
}

/// Render the Prometheus exposition text, if a recorder is installed.
pub fn render() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(PrometheusHandle::render)
}
