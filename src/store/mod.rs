//! Object store client layer.
//!
//! The [`BlobStore`] trait is the capability set the file layer consumes:
//! container enumeration and attributes, ranged blob reads, block-list
//! uploads, and blob leases.  Implementations include an in-memory store
//! and a gateway to Azure Blob Storage.

pub mod azure;
pub mod memory;
#[cfg(test)]
pub(crate) mod testing;
pub mod xml;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// Errors reported by a [`BlobStore`] implementation.
///
/// These are classified at the store boundary so the file layer never has
/// to inspect raw HTTP statuses or backend error codes.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The container or blob does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The container or blob already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// A lease is held by someone else, or the supplied lease is not valid.
    #[error("lease conflict: {0}")]
    LeaseConflict(String),

    /// A conditional request (etag match) did not hold.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// The credentials do not allow the operation.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The store rejected the request as malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Network failure, timeout, throttling, or a server-side error.
    #[error("transient store failure: {0}")]
    Transient(String),
}

/// Result alias for store calls.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Boxed future returned by [`BlobStore`] methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = StoreResult<T>> + Send + 'a>>;

/// Public access level of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublicAccess {
    /// Anonymous read access to the container listing and its blobs.
    Public,
    /// Anonymous read access to blobs only.
    BlobOnly,
    /// No anonymous access.
    #[default]
    Private,
}

impl std::str::FromStr for PublicAccess {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "public" | "container" => Ok(PublicAccess::Public),
            "blob" | "blob_only" | "blob-only" => Ok(PublicAccess::BlobOnly),
            "private" | "off" => Ok(PublicAccess::Private),
            other => Err(format!("unknown container access level: {other}")),
        }
    }
}

/// Immutable snapshot of a container's properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerProperties {
    /// Container name.
    pub name: String,
    /// Creation time.  The store only reports a last-modified time, so
    /// this carries the same value.
    pub created: DateTime<Utc>,
    /// Last modification time.
    pub last_modified: DateTime<Utc>,
}

/// Container properties plus the user metadata and the entity tag used
/// for conditional metadata updates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerAttributes {
    /// Property snapshot.
    pub properties: ContainerProperties,
    /// User-defined metadata.
    pub metadata: HashMap<String, String>,
    /// Entity tag of the container at the time of the fetch.
    pub etag: String,
}

/// Properties of a single blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobProperties {
    /// Container holding the blob.
    pub container: String,
    /// Blob name.
    pub blob: String,
    /// Content length in bytes.
    pub size: u64,
    /// Entity tag.
    pub etag: String,
    /// Last modification time.
    pub last_modified: DateTime<Utc>,
    /// User-defined metadata.
    pub metadata: HashMap<String, String>,
    /// Whether a lease is currently held on the blob.
    pub leased: bool,
}

/// Async object store contract.
///
/// All calls are whole-request operations; there is no partial-byte-range
/// write.  Writes go through [`stage_block`](BlobStore::stage_block) and
/// become visible only at [`commit_block_list`](BlobStore::commit_block_list).
pub trait BlobStore: Send + Sync + 'static {
    /// List all container names, sorted.
    fn list_containers(&self) -> StoreFuture<'_, Vec<String>>;

    /// Check whether a container exists.
    fn container_exists<'a>(&'a self, container: &'a str) -> StoreFuture<'a, bool>;

    /// Create a container.  Fails with `AlreadyExists` on collision.
    fn create_container<'a>(
        &'a self,
        container: &'a str,
        access: PublicAccess,
    ) -> StoreFuture<'a, ()>;

    /// Set the public access level of an existing container.
    fn set_container_access<'a>(
        &'a self,
        container: &'a str,
        access: PublicAccess,
    ) -> StoreFuture<'a, ()>;

    /// Delete a container and everything in it.
    fn delete_container<'a>(&'a self, container: &'a str) -> StoreFuture<'a, ()>;

    /// Download container properties, metadata and etag.
    fn container_attributes<'a>(
        &'a self,
        container: &'a str,
    ) -> StoreFuture<'a, ContainerAttributes>;

    /// Replace the container metadata, returning the new etag.
    ///
    /// When `if_match` is set the upload only happens if the container is
    /// still at that etag; otherwise it fails with `PreconditionFailed`.
    fn set_container_metadata<'a>(
        &'a self,
        container: &'a str,
        metadata: HashMap<String, String>,
        if_match: Option<&'a str>,
    ) -> StoreFuture<'a, String>;

    /// Download blob properties.
    fn blob_properties<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
    ) -> StoreFuture<'a, BlobProperties>;

    /// Read up to `len` bytes starting at `offset`.  Returns an empty
    /// buffer when `offset` is at or past the end of the blob.
    ///
    /// With `if_match` the read fails with `PreconditionFailed` unless the
    /// blob is still at that etag.
    fn read_range<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
        offset: u64,
        len: u64,
        if_match: Option<&'a str>,
    ) -> StoreFuture<'a, Bytes>;

    /// Upload one uncommitted block.
    fn stage_block<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
        block_id: &'a str,
        data: Bytes,
        lease: Option<&'a str>,
    ) -> StoreFuture<'a, ()>;

    /// Atomically replace the blob with the concatenation of the given
    /// staged blocks, returning the new etag.
    fn commit_block_list<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
        block_ids: &'a [String],
        lease: Option<&'a str>,
    ) -> StoreFuture<'a, String>;

    /// Acquire an exclusive write lease and return its token.
    ///
    /// `duration` of `None` requests an infinite lease.  Leasing a blob
    /// name that does not exist yet reserves it for the caller.
    fn acquire_lease<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
        duration: Option<Duration>,
    ) -> StoreFuture<'a, String>;

    /// Renew a held lease for another full duration.
    fn renew_lease<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
        token: &'a str,
    ) -> StoreFuture<'a, ()>;

    /// Release a held lease.
    fn release_lease<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
        token: &'a str,
    ) -> StoreFuture<'a, ()>;
}
