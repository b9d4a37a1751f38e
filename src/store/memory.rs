//! In-memory object store.
//!
//! Containers, committed blobs, staged blocks and leases live in a single
//! map protected by a `tokio::sync::RwLock`, so every call observes and
//! mutates a consistent snapshot.  Lease expiry follows `tokio::time`, which
//! lets tests drive it with a paused clock.
//!
//! The store enforces the same rules a real blob service does: writes to a
//! leased blob must carry the lease token, a second acquire on a live lease
//! is a conflict, and a commit only succeeds if every listed block was
//! staged.

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

use super::{
    BlobProperties, BlobStore, ContainerAttributes, ContainerProperties, PublicAccess, StoreError,
    StoreFuture, StoreResult,
};

/// A committed blob.
#[derive(Debug, Clone)]
struct BlobEntry {
    data: Bytes,
    etag: String,
    last_modified: DateTime<Utc>,
    metadata: HashMap<String, String>,
}

/// A container and its committed blobs.
#[derive(Debug)]
struct ContainerEntry {
    access: PublicAccess,
    last_modified: DateTime<Utc>,
    metadata: HashMap<String, String>,
    /// Bumped on every attribute change; rendered as the container etag.
    version: u64,
    blobs: BTreeMap<String, BlobEntry>,
}

impl ContainerEntry {
    fn etag(&self) -> String {
        format!("\"0x{:016X}\"", self.version)
    }

    fn touch(&mut self) {
        self.version += 1;
        self.last_modified = Utc::now();
    }
}

/// An issued lease.
#[derive(Debug)]
struct LeaseEntry {
    token: String,
    /// `None` for an infinite lease.
    duration: Option<Duration>,
    expires_at: Option<Instant>,
}

impl LeaseEntry {
    fn is_active(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

type BlobKey = (String, String);

#[derive(Debug, Default)]
struct State {
    containers: BTreeMap<String, ContainerEntry>,
    leases: HashMap<BlobKey, LeaseEntry>,
    staged: HashMap<BlobKey, HashMap<String, Bytes>>,
}

impl State {
    fn container(&self, name: &str) -> StoreResult<&ContainerEntry> {
        self.containers
            .get(name)
            .ok_or_else(|| StoreError::NotFound(format!("container {name}")))
    }

    fn container_mut(&mut self, name: &str) -> StoreResult<&mut ContainerEntry> {
        self.containers
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(format!("container {name}")))
    }

    /// Check that a write carrying `token` is allowed on the blob.
    fn check_write_lease(
        &self,
        container: &str,
        blob: &str,
        token: Option<&str>,
    ) -> StoreResult<()> {
        let key = (container.to_string(), blob.to_string());
        let now = Instant::now();
        match (self.leases.get(&key).filter(|l| l.is_active(now)), token) {
            (None, None) => Ok(()),
            (Some(lease), Some(token)) if lease.token == token => Ok(()),
            (Some(_), _) => Err(StoreError::LeaseConflict(format!(
                "{container}/{blob} is leased and the request carries no matching lease"
            ))),
            (None, Some(_)) => Err(StoreError::LeaseConflict(format!(
                "{container}/{blob} has no active lease"
            ))),
        }
    }
}

/// In-memory [`BlobStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Compute the quoted MD5-hex etag for a byte slice.
    fn compute_etag(data: &[u8]) -> String {
        let mut hasher = Md5::new();
        hasher.update(data);
        format!("\"{}\"", hex::encode(hasher.finalize()))
    }
}

impl BlobStore for MemoryStore {
    fn list_containers(&self) -> StoreFuture<'_, Vec<String>> {
        Box::pin(async move {
            let state = self.state.read().await;
            Ok(state.containers.keys().cloned().collect())
        })
    }

    fn container_exists<'a>(&'a self, container: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move { Ok(self.state.read().await.containers.contains_key(container)) })
    }

    fn create_container<'a>(
        &'a self,
        container: &'a str,
        access: PublicAccess,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            if state.containers.contains_key(container) {
                return Err(StoreError::AlreadyExists(format!("container {container}")));
            }
            state.containers.insert(
                container.to_string(),
                ContainerEntry {
                    access,
                    last_modified: Utc::now(),
                    metadata: HashMap::new(),
                    version: 1,
                    blobs: BTreeMap::new(),
                },
            );
            Ok(())
        })
    }

    fn set_container_access<'a>(
        &'a self,
        container: &'a str,
        access: PublicAccess,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            let entry = state.container_mut(container)?;
            if entry.access != access {
                entry.access = access;
                entry.touch();
            }
            Ok(())
        })
    }

    fn delete_container<'a>(&'a self, container: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            if state.containers.remove(container).is_none() {
                return Err(StoreError::NotFound(format!("container {container}")));
            }
            state.leases.retain(|(c, _), _| c != container);
            state.staged.retain(|(c, _), _| c != container);
            Ok(())
        })
    }

    fn container_attributes<'a>(
        &'a self,
        container: &'a str,
    ) -> StoreFuture<'a, ContainerAttributes> {
        Box::pin(async move {
            let state = self.state.read().await;
            let entry = state.container(container)?;
            Ok(ContainerAttributes {
                properties: ContainerProperties {
                    name: container.to_string(),
                    created: entry.last_modified,
                    last_modified: entry.last_modified,
                },
                metadata: entry.metadata.clone(),
                etag: entry.etag(),
            })
        })
    }

    fn set_container_metadata<'a>(
        &'a self,
        container: &'a str,
        metadata: HashMap<String, String>,
        if_match: Option<&'a str>,
    ) -> StoreFuture<'a, String> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            let entry = state.container_mut(container)?;
            if let Some(expected) = if_match {
                if expected != entry.etag() {
                    return Err(StoreError::PreconditionFailed(format!(
                        "container {container} changed since etag {expected}"
                    )));
                }
            }
            entry.metadata = metadata;
            entry.touch();
            Ok(entry.etag())
        })
    }

    fn blob_properties<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
    ) -> StoreFuture<'a, BlobProperties> {
        Box::pin(async move {
            let state = self.state.read().await;
            let entry = state
                .container(container)?
                .blobs
                .get(blob)
                .ok_or_else(|| StoreError::NotFound(format!("blob {container}/{blob}")))?;
            let leased = state
                .leases
                .get(&(container.to_string(), blob.to_string()))
                .is_some_and(|l| l.is_active(Instant::now()));
            Ok(BlobProperties {
                container: container.to_string(),
                blob: blob.to_string(),
                size: entry.data.len() as u64,
                etag: entry.etag.clone(),
                last_modified: entry.last_modified,
                metadata: entry.metadata.clone(),
                leased,
            })
        })
    }

    fn read_range<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
        offset: u64,
        len: u64,
        if_match: Option<&'a str>,
    ) -> StoreFuture<'a, Bytes> {
        Box::pin(async move {
            let state = self.state.read().await;
            let entry = state
                .container(container)?
                .blobs
                .get(blob)
                .ok_or_else(|| StoreError::NotFound(format!("blob {container}/{blob}")))?;
            if let Some(expected) = if_match {
                if expected != entry.etag {
                    return Err(StoreError::PreconditionFailed(format!(
                        "blob {container}/{blob} changed since etag {expected}"
                    )));
                }
            }
            let size = entry.data.len() as u64;
            if offset >= size {
                return Ok(Bytes::new());
            }
            let end = offset.saturating_add(len).min(size);
            Ok(entry.data.slice(offset as usize..end as usize))
        })
    }

    fn stage_block<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
        block_id: &'a str,
        data: Bytes,
        lease: Option<&'a str>,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            state.container(container)?;
            state.check_write_lease(container, blob, lease)?;
            state
                .staged
                .entry((container.to_string(), blob.to_string()))
                .or_default()
                .insert(block_id.to_string(), data);
            Ok(())
        })
    }

    fn commit_block_list<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
        block_ids: &'a [String],
        lease: Option<&'a str>,
    ) -> StoreFuture<'a, String> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            state.container(container)?;
            state.check_write_lease(container, blob, lease)?;

            let key = (container.to_string(), blob.to_string());
            let mut data = BytesMut::new();
            {
                let empty = HashMap::new();
                let staged = state.staged.get(&key).unwrap_or(&empty);
                for id in block_ids {
                    let block = staged.get(id).ok_or_else(|| {
                        StoreError::InvalidRequest(format!(
                            "block {id} was not staged for {container}/{blob}"
                        ))
                    })?;
                    data.extend_from_slice(block);
                }
            }
            // A commit discards every uncommitted block of the blob.
            state.staged.remove(&key);

            let data = data.freeze();
            let etag = Self::compute_etag(&data);
            let entry = state.container_mut(container)?;
            let metadata = entry
                .blobs
                .get(blob)
                .map(|b| b.metadata.clone())
                .unwrap_or_default();
            entry.blobs.insert(
                blob.to_string(),
                BlobEntry {
                    data,
                    etag: etag.clone(),
                    last_modified: Utc::now(),
                    metadata,
                },
            );
            Ok(etag)
        })
    }

    fn acquire_lease<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
        duration: Option<Duration>,
    ) -> StoreFuture<'a, String> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            state.container(container)?;
            let now = Instant::now();
            let key = (container.to_string(), blob.to_string());
            if state.leases.get(&key).is_some_and(|l| l.is_active(now)) {
                return Err(StoreError::LeaseConflict(format!(
                    "{container}/{blob} already has an active lease"
                )));
            }
            let token = uuid::Uuid::new_v4().to_string();
            state.leases.insert(
                key,
                LeaseEntry {
                    token: token.clone(),
                    duration,
                    expires_at: duration.map(|d| now + d),
                },
            );
            Ok(token)
        })
    }

    fn renew_lease<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
        token: &'a str,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            let key = (container.to_string(), blob.to_string());
            let lease = state
                .leases
                .get_mut(&key)
                .filter(|l| l.token == token)
                .ok_or_else(|| {
                    StoreError::LeaseConflict(format!("lease on {container}/{blob} is not held"))
                })?;
            // An expired lease can still be renewed as long as nobody re-acquired it.
            lease.expires_at = lease.duration.map(|d| Instant::now() + d);
            Ok(())
        })
    }

    fn release_lease<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
        token: &'a str,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            let key = (container.to_string(), blob.to_string());
            match state.leases.get(&key) {
                Some(lease) if lease.token == token => {
                    state.leases.remove(&key);
                    Ok(())
                }
                _ => Err(StoreError::LeaseConflict(format!(
                    "lease on {container}/{blob} is not held"
                ))),
            }
        })
    }
}

// -- Tests --------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    async fn store_with_container(name: &str) -> MemoryStore {
        let store = MemoryStore::new();
        store
            .create_container(name, PublicAccess::Private)
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_create_and_list_containers() {
        let store = store_with_container("beta").await;
        store
            .create_container("alpha", PublicAccess::Public)
            .await
            .unwrap();
        assert_eq!(store.list_containers().await.unwrap(), vec!["alpha", "beta"]);
        assert!(store.container_exists("alpha").await.unwrap());
        assert!(!store.container_exists("gamma").await.unwrap());
    }

    #[tokio::test]
    async fn test_create_container_collision() {
        let store = store_with_container("docs").await;
        let err = store
            .create_container("docs", PublicAccess::Private)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_delete_container_missing() {
        let store = MemoryStore::new();
        let err = store.delete_container("nope").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_stage_and_commit_blocks() {
        let store = store_with_container("docs").await;
        store
            .stage_block("docs", "a.txt", "b1", Bytes::from("hello "), None)
            .await
            .unwrap();
        store
            .stage_block("docs", "a.txt", "b2", Bytes::from("world"), None)
            .await
            .unwrap();

        // Nothing is visible before the commit.
        let err = store.blob_properties("docs", "a.txt").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));

        let ids = vec!["b1".to_string(), "b2".to_string()];
        let etag = store
            .commit_block_list("docs", "a.txt", &ids, None)
            .await
            .unwrap();

        let props = store.blob_properties("docs", "a.txt").await.unwrap();
        assert_eq!(props.size, 11);
        assert_eq!(props.etag, etag);
        let data = store.read_range("docs", "a.txt", 0, 100, None).await.unwrap();
        assert_eq!(data, Bytes::from("hello world"));
    }

    #[tokio::test]
    async fn test_commit_unknown_block_fails() {
        let store = store_with_container("docs").await;
        let ids = vec!["missing".to_string()];
        let err = store
            .commit_block_list("docs", "a.txt", &ids, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_read_range_past_end_is_empty() {
        let store = store_with_container("docs").await;
        store
            .stage_block("docs", "a.txt", "b1", Bytes::from("abc"), None)
            .await
            .unwrap();
        store
            .commit_block_list("docs", "a.txt", &["b1".to_string()], None)
            .await
            .unwrap();

        let tail = store.read_range("docs", "a.txt", 1, 10, None).await.unwrap();
        assert_eq!(tail, Bytes::from("bc"));
        let past = store.read_range("docs", "a.txt", 3, 10, None).await.unwrap();
        assert!(past.is_empty());
    }

    #[tokio::test]
    async fn test_second_lease_conflicts() {
        let store = store_with_container("docs").await;
        let token = store
            .acquire_lease("docs", "a.txt", Some(Duration::from_secs(60)))
            .await
            .unwrap();
        let err = store
            .acquire_lease("docs", "a.txt", Some(Duration::from_secs(60)))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::LeaseConflict(_)));

        store.release_lease("docs", "a.txt", &token).await.unwrap();
        store
            .acquire_lease("docs", "a.txt", Some(Duration::from_secs(60)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_leased_blob_rejects_unleased_writes() {
        let store = store_with_container("docs").await;
        let token = store.acquire_lease("docs", "a.txt", None).await.unwrap();

        let err = store
            .stage_block("docs", "a.txt", "b1", Bytes::from("x"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::LeaseConflict(_)));

        store
            .stage_block("docs", "a.txt", "b1", Bytes::from("x"), Some(&token))
            .await
            .unwrap();
        store
            .commit_block_list("docs", "a.txt", &["b1".to_string()], Some(&token))
            .await
            .unwrap();
        assert!(store.blob_properties("docs", "a.txt").await.unwrap().leased);
    }

    #[tokio::test]
    async fn test_release_twice_fails() {
        let store = store_with_container("docs").await;
        let token = store.acquire_lease("docs", "a.txt", None).await.unwrap();
        store.release_lease("docs", "a.txt", &token).await.unwrap();
        let err = store
            .release_lease("docs", "a.txt", &token)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::LeaseConflict(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expires_and_renews() {
        let store = store_with_container("docs").await;
        let token = store
            .acquire_lease("docs", "a.txt", Some(Duration::from_secs(15)))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(10)).await;
        store.renew_lease("docs", "a.txt", &token).await.unwrap();

        // 20s after acquire but only 10s after renewal: still held.
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(store
            .acquire_lease("docs", "a.txt", Some(Duration::from_secs(15)))
            .await
            .is_err());

        tokio::time::advance(Duration::from_secs(6)).await;
        store
            .acquire_lease("docs", "a.txt", Some(Duration::from_secs(15)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_conditional_metadata_update() {
        let store = store_with_container("docs").await;
        let attrs = store.container_attributes("docs").await.unwrap();

        let mut md = HashMap::new();
        md.insert("owner".to_string(), "ops".to_string());
        let new_etag = store
            .set_container_metadata("docs", md.clone(), Some(&attrs.etag))
            .await
            .unwrap();
        assert_ne!(new_etag, attrs.etag);

        // The stale etag no longer matches.
        let err = store
            .set_container_metadata("docs", md, Some(&attrs.etag))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::PreconditionFailed(_)));

        let attrs = store.container_attributes("docs").await.unwrap();
        assert_eq!(attrs.metadata.get("owner").map(String::as_str), Some("ops"));
    }

    #[test]
    fn test_compute_etag_hello() {
        assert_eq!(
            MemoryStore::compute_etag(b"hello world"),
            "\"5eb63bbbe01eeed093cb22bb8f5acdc3\""
        );
    }
}
