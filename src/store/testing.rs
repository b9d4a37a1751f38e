//! Fault-injecting store wrapper for tests.
//!
//! [`FaultyStore`] forwards to an inner [`BlobStore`], counts the calls
//! that matter for lifecycle assertions, and fails selected operations
//! on demand.

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

use super::{
    BlobProperties, BlobStore, ContainerAttributes, PublicAccess, StoreError, StoreFuture,
};

pub(crate) struct FaultyStore {
    inner: Arc<dyn BlobStore>,
    stages: AtomicUsize,
    commits: AtomicUsize,
    acquires: AtomicUsize,
    renewals: AtomicUsize,
    releases: AtomicUsize,
    attribute_reads: AtomicUsize,
    /// Stage calls beyond this count fail.
    fail_stage_after: AtomicUsize,
    fail_commits: AtomicBool,
    fail_releases: AtomicBool,
    fail_reads: AtomicBool,
    /// Bump the container etag right before each metadata upload.
    race_metadata: AtomicBool,
    /// Commits never complete while set.
    hold_commits: AtomicBool,
    /// Parks the next blob property fetch after the inner store answered.
    props_gate: Mutex<Option<Arc<Gate>>>,
}

/// Rendezvous for one parked call.
pub(crate) struct Gate {
    /// Notified once the call is parked.
    pub(crate) reached: Notify,
    /// Notify to let the parked call return.
    pub(crate) release: Notify,
}

impl FaultyStore {
    pub(crate) fn new(inner: Arc<dyn BlobStore>) -> Self {
        Self {
            inner,
            stages: AtomicUsize::new(0),
            commits: AtomicUsize::new(0),
            acquires: AtomicUsize::new(0),
            renewals: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
            attribute_reads: AtomicUsize::new(0),
            fail_stage_after: AtomicUsize::new(usize::MAX),
            fail_commits: AtomicBool::new(false),
            fail_releases: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
            race_metadata: AtomicBool::new(false),
            hold_commits: AtomicBool::new(false),
            props_gate: Mutex::new(None),
        }
    }

    pub(crate) fn hold_commits(&self, hold: bool) {
        self.hold_commits.store(hold, Ordering::SeqCst);
    }

    /// Park the next `blob_properties` call after its inner fetch.
    pub(crate) fn gate_blob_properties(&self) -> Arc<Gate> {
        let gate = Arc::new(Gate {
            reached: Notify::new(),
            release: Notify::new(),
        });
        *self.props_gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    pub(crate) fn fail_stage_after(&self, successful: usize) {
        self.fail_stage_after.store(successful, Ordering::SeqCst);
    }

    pub(crate) fn fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_releases(&self, fail: bool) {
        self.fail_releases.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn race_metadata(&self, race: bool) {
        self.race_metadata.store(race, Ordering::SeqCst);
    }

    pub(crate) fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub(crate) fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    pub(crate) fn renewals(&self) -> usize {
        self.renewals.load(Ordering::SeqCst)
    }

    pub(crate) fn acquires(&self) -> usize {
        self.acquires.load(Ordering::SeqCst)
    }

    pub(crate) fn attribute_reads(&self) -> usize {
        self.attribute_reads.load(Ordering::SeqCst)
    }

    fn injected(what: &str) -> StoreError {
        StoreError::Transient(format!("injected {what} failure"))
    }
}

impl BlobStore for FaultyStore {
    fn list_containers(&self) -> StoreFuture<'_, Vec<String>> {
        self.inner.list_containers()
    }

    fn container_exists<'a>(&'a self, container: &'a str) -> StoreFuture<'a, bool> {
        self.inner.container_exists(container)
    }

    fn create_container<'a>(
        &'a self,
        container: &'a str,
        access: PublicAccess,
    ) -> StoreFuture<'a, ()> {
        self.inner.create_container(container, access)
    }

    fn set_container_access<'a>(
        &'a self,
        container: &'a str,
        access: PublicAccess,
    ) -> StoreFuture<'a, ()> {
        self.inner.set_container_access(container, access)
    }

    fn delete_container<'a>(&'a self, container: &'a str) -> StoreFuture<'a, ()> {
        self.inner.delete_container(container)
    }

    fn container_attributes<'a>(
        &'a self,
        container: &'a str,
    ) -> StoreFuture<'a, ContainerAttributes> {
        self.attribute_reads.fetch_add(1, Ordering::SeqCst);
        self.inner.container_attributes(container)
    }

    fn set_container_metadata<'a>(
        &'a self,
        container: &'a str,
        metadata: HashMap<String, String>,
        if_match: Option<&'a str>,
    ) -> StoreFuture<'a, String> {
        Box::pin(async move {
            if self.race_metadata.load(Ordering::SeqCst) {
                let mut current = self.inner.container_attributes(container).await?.metadata;
                current.insert("racer".to_string(), "1".to_string());
                self.inner
                    .set_container_metadata(container, current, None)
                    .await?;
            }
            self.inner
                .set_container_metadata(container, metadata, if_match)
                .await
        })
    }

    fn blob_properties<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
    ) -> StoreFuture<'a, BlobProperties> {
        Box::pin(async move {
            let props = self.inner.blob_properties(container, blob).await;
            let gate = self.props_gate.lock().unwrap().take();
            if let Some(gate) = gate {
                gate.reached.notify_one();
                gate.release.notified().await;
            }
            props
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
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(Self::injected("read"));
            }
            self.inner
                .read_range(container, blob, offset, len, if_match)
                .await
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
            let seen = self.stages.fetch_add(1, Ordering::SeqCst);
            if seen >= self.fail_stage_after.load(Ordering::SeqCst) {
                return Err(Self::injected("stage block"));
            }
            self.inner
                .stage_block(container, blob, block_id, data, lease)
                .await
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
            if self.fail_commits.load(Ordering::SeqCst) {
                return Err(Self::injected("commit"));
            }
            if self.hold_commits.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            self.commits.fetch_add(1, Ordering::SeqCst);
            self.inner
                .commit_block_list(container, blob, block_ids, lease)
                .await
        })
    }

    fn acquire_lease<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
        duration: Option<Duration>,
    ) -> StoreFuture<'a, String> {
        self.acquires.fetch_add(1, Ordering::SeqCst);
        self.inner.acquire_lease(container, blob, duration)
    }

    fn renew_lease<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
        token: &'a str,
    ) -> StoreFuture<'a, ()> {
        self.renewals.fetch_add(1, Ordering::SeqCst);
        self.inner.renew_lease(container, blob, token)
    }

    fn release_lease<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
        token: &'a str,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.releases.fetch_add(1, Ordering::SeqCst);
            if self.fail_releases.load(Ordering::SeqCst) {
                return Err(Self::injected("release"));
            }
            self.inner.release_lease(container, blob, token).await
        })
    }
}
