//! Exclusive write leases.
//!
//! A [`Lease`] is owned by exactly one open file.  It is not `Clone`, and
//! [`Lease::release`] consumes it, so a token cannot be reused once given
//! back to the store.

use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::errors::{BlobFsError, OpContext, Result};
use crate::store::BlobStore;

/// A held lease on one blob.
pub struct Lease {
    token: String,
    container: String,
    blob: String,
    acquired_at: DateTime<Utc>,
    /// `None` for an infinite lease.
    duration: Option<Duration>,
    renewed_at: Instant,
}

impl Lease {
    /// Acquire a lease on `container/blob`.
    ///
    /// Fails with `LeaseConflict` while another writer holds it.  No retry
    /// is attempted.
    pub async fn acquire(
        store: &dyn BlobStore,
        container: &str,
        blob: &str,
        duration: Option<Duration>,
    ) -> Result<Self> {
        let token = store
            .acquire_lease(container, blob, duration)
            .await
            .map_err(|e| {
                BlobFsError::from_store(
                    OpContext::new("acquire_lease", container).with_blob(blob),
                    e,
                )
            })?;
        debug!(container, blob, ?duration, "lease acquired");
        Ok(Self {
            token,
            container: container.to_string(),
            blob: blob.to_string(),
            acquired_at: Utc::now(),
            duration,
            renewed_at: Instant::now(),
        })
    }

    /// The lease token to attach to writes.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Container of the leased blob.
    pub fn container(&self) -> &str {
        &self.container
    }

    /// Name of the leased blob.
    pub fn blob(&self) -> &str {
        &self.blob
    }

    /// Wall-clock time the lease was acquired.
    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    /// Requested lease duration, `None` if infinite.
    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }

    /// Whether half the lease duration has passed since the last renewal.
    pub fn needs_renewal(&self) -> bool {
        self.duration
            .is_some_and(|d| self.renewed_at.elapsed() >= d / 2)
    }

    /// Renew the lease for another full duration.
    pub async fn renew(&mut self, store: &dyn BlobStore) -> Result<()> {
        store
            .renew_lease(&self.container, &self.blob, &self.token)
            .await
            .map_err(|e| {
                BlobFsError::from_store(
                    OpContext::new("renew_lease", self.container.as_str()).with_blob(&self.blob),
                    e,
                )
            })?;
        self.renewed_at = Instant::now();
        debug!(container = %self.container, blob = %self.blob, "lease renewed");
        Ok(())
    }

    /// Renew only if [`needs_renewal`](Self::needs_renewal) says so.
    pub async fn renew_if_due(&mut self, store: &dyn BlobStore) -> Result<()> {
        if self.needs_renewal() {
            self.renew(store).await?;
        }
        Ok(())
    }

    /// Give the lease back to the store.
    pub async fn release(self, store: &dyn BlobStore) -> Result<()> {
        self.send_release(store).await
    }

    /// Issue the release without consuming the lease, so an owner whose
    /// release was interrupted can still send it again.  The owner drops
    /// the lease once this returns.
    pub(crate) async fn send_release(&self, store: &dyn BlobStore) -> Result<()> {
        store
            .release_lease(&self.container, &self.blob, &self.token)
            .await
            .map_err(|e| {
                BlobFsError::from_store(
                    OpContext::new("release_lease", self.container.as_str()).with_blob(&self.blob),
                    e,
                )
            })?;
        debug!(container = %self.container, blob = %self.blob, "lease released");
        Ok(())
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("container", &self.container)
            .field("blob", &self.blob)
            .field("acquired_at", &self.acquired_at)
            .field("duration", &self.duration)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::store::memory::MemoryStore;
    use crate::store::PublicAccess;

    async fn store() -> MemoryStore {
        let store = MemoryStore::new();
        store
            .create_container("docs", PublicAccess::Private)
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_acquire_conflict_kind() {
        let store = store().await;
        let _held = Lease::acquire(&store, "docs", "a.txt", Some(Duration::from_secs(30)))
            .await
            .unwrap();
        let err = Lease::acquire(&store, "docs", "a.txt", Some(Duration::from_secs(30)))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LeaseConflict);
        assert_eq!(err.context().operation, "acquire_lease");
    }

    #[tokio::test]
    async fn test_acquire_missing_container() {
        let store = MemoryStore::new();
        let err = Lease::acquire(&store, "nope", "a.txt", None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test(start_paused = true)]
    async fn test_needs_renewal_after_half_duration() {
        let store = store().await;
        let mut lease = Lease::acquire(&store, "docs", "a.txt", Some(Duration::from_secs(20)))
            .await
            .unwrap();
        assert!(!lease.needs_renewal());

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(lease.needs_renewal());

        lease.renew_if_due(&store).await.unwrap();
        assert!(!lease.needs_renewal());
    }

    #[tokio::test]
    async fn test_infinite_lease_never_renews() {
        let store = store().await;
        let lease = Lease::acquire(&store, "docs", "a.txt", None).await.unwrap();
        assert!(!lease.needs_renewal());
        assert_eq!(lease.duration(), None);
    }

    #[tokio::test]
    async fn test_release_frees_blob() {
        let store = store().await;
        let lease = Lease::acquire(&store, "docs", "a.txt", None).await.unwrap();
        lease.release(&store).await.unwrap();
        Lease::acquire(&store, "docs", "a.txt", None).await.unwrap();
    }

    #[test]
    fn test_debug_hides_token() {
        let lease = Lease {
            token: "secret-token".to_string(),
            container: "docs".to_string(),
            blob: "a.txt".to_string(),
            acquired_at: Utc::now(),
            duration: None,
            renewed_at: Instant::now(),
        };
        let rendered = format!("{lease:?}");
        assert!(rendered.contains("docs"));
        assert!(!rendered.contains("secret-token"));
    }
}
