//! Buffered block-list writes.
//!
//! The blob store cannot write at a byte offset, so a writer accumulates
//! bytes and stages them as fixed-size blocks.  Nothing becomes visible
//! until [`BufferedWriter::commit`] lists every staged block in order.
//!
//! Strategy:
//!   `write()`  -> buffer, stage one block each time the buffer reaches `block_size`
//!   `commit()` -> stage the tail, then Put Block List
//!
//! Block IDs: `base64("{writer_id}:{sequence:06}")`.  The writer id is a
//! fresh UUID, so concurrent writers never collide and every ID of one
//! blob has the same encoded length.
//!
//! Once a block fails to stage the writer is `Failed` for good and never
//! commits, so the blob keeps its previous content.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use bytes::{Bytes, BytesMut};
use metrics::counter;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::errors::{BlobFsError, OpContext, Result};
use crate::metrics::{BLOCKS_STAGED_TOTAL, BYTES_WRITTEN_TOTAL};
use crate::store::BlobStore;

/// Default block threshold (4 MiB).
pub const DEFAULT_WRITE_BLOCK: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
enum WriterState {
    Open,
    Failed(String),
    Committed,
}

/// Accumulates writes for one blob and commits them as a block list.
pub struct BufferedWriter {
    store: Arc<dyn BlobStore>,
    container: String,
    blob: String,
    writer_id: Uuid,
    block_size: usize,
    buffer: BytesMut,
    block_ids: Vec<String>,
    bytes_written: u64,
    state: WriterState,
}

impl BufferedWriter {
    /// Create a writer that stages blocks of `block_size` bytes.
    pub fn new(store: Arc<dyn BlobStore>, container: &str, blob: &str, block_size: usize) -> Self {
        let block_size = block_size.max(1);
        Self {
            store,
            container: container.to_string(),
            blob: blob.to_string(),
            writer_id: Uuid::new_v4(),
            block_size,
            buffer: BytesMut::with_capacity(block_size),
            block_ids: Vec::new(),
            bytes_written: 0,
            state: WriterState::Open,
        }
    }

    /// Block ID for the `sequence`-th block of writer `writer_id`.
    fn block_id(writer_id: &Uuid, sequence: usize) -> String {
        let raw = format!("{}:{:06}", writer_id.simple(), sequence);
        BASE64_STANDARD.encode(raw.as_bytes())
    }

    fn ctx(&self, operation: &'static str) -> OpContext {
        OpContext::new(operation, self.container.as_str()).with_blob(&self.blob)
    }

    fn ensure_open(&self, operation: &'static str) -> Result<()> {
        match &self.state {
            WriterState::Open => Ok(()),
            WriterState::Failed(reason) => Err(BlobFsError::WriteFailed {
                ctx: self.ctx(operation),
                reason: format!("writer failed earlier: {reason}"),
            }),
            WriterState::Committed => Err(BlobFsError::WriteFailed {
                ctx: self.ctx(operation),
                reason: "writer is already committed".to_string(),
            }),
        }
    }

    /// Append `data`, staging full blocks as the buffer fills.
    pub async fn write(&mut self, data: &[u8], lease: Option<&str>) -> Result<()> {
        self.ensure_open("write_file")?;
        self.buffer.extend_from_slice(data);
        self.bytes_written += data.len() as u64;
        counter!(BYTES_WRITTEN_TOTAL).increment(data.len() as u64);

        while self.buffer.len() >= self.block_size {
            let block = self.buffer.split_to(self.block_size).freeze();
            self.stage(block, lease, "write_file").await?;
        }
        Ok(())
    }

    async fn stage(
        &mut self,
        block: Bytes,
        lease: Option<&str>,
        operation: &'static str,
    ) -> Result<()> {
        let id = Self::block_id(&self.writer_id, self.block_ids.len());
        let len = block.len();
        if let Err(e) = self
            .store
            .stage_block(&self.container, &self.blob, &id, block, lease)
            .await
        {
            let reason = format!("staging block {} failed: {e}", self.block_ids.len());
            self.state = WriterState::Failed(reason.clone());
            self.buffer.clear();
            return Err(BlobFsError::WriteFailed {
                ctx: self.ctx(operation),
                reason,
            });
        }
        debug!(
            container = %self.container,
            blob = %self.blob,
            block = self.block_ids.len(),
            len,
            "block staged"
        );
        counter!(BLOCKS_STAGED_TOTAL).increment(1);
        self.block_ids.push(id);
        Ok(())
    }

    /// Stage the remaining bytes and commit the block list.
    ///
    /// Calling this on a committed writer is a no-op.  On a failed writer
    /// it returns `WriteFailed` without touching the store.  A commit whose
    /// future was dropped can be called again.
    pub async fn commit(&mut self, lease: Option<&str>) -> Result<()> {
        if self.state == WriterState::Committed {
            return Ok(());
        }
        self.ensure_open("close_file")?;

        // The tail leaves the buffer only once staged, so a commit that is
        // cancelled here and called again stages it under the same ID.
        if !self.buffer.is_empty() {
            let tail = Bytes::copy_from_slice(&self.buffer);
            self.stage(tail, lease, "close_file").await?;
            self.buffer.clear();
        }

        if let Err(e) = self
            .store
            .commit_block_list(&self.container, &self.blob, &self.block_ids, lease)
            .await
        {
            let reason = format!("committing {} blocks failed: {e}", self.block_ids.len());
            self.state = WriterState::Failed(reason.clone());
            return Err(BlobFsError::WriteFailed {
                ctx: self.ctx("close_file"),
                reason,
            });
        }

        self.state = WriterState::Committed;
        debug!(
            container = %self.container,
            blob = %self.blob,
            blocks = self.block_ids.len(),
            bytes = self.bytes_written,
            "block list committed"
        );
        Ok(())
    }

    /// Total bytes accepted by [`write`](Self::write).
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Number of blocks staged so far.
    pub fn blocks_staged(&self) -> usize {
        self.block_ids.len()
    }

    /// Whether the block list was committed.
    pub fn is_committed(&self) -> bool {
        self.state == WriterState::Committed
    }

    /// Whether a block or commit failed.
    pub fn is_failed(&self) -> bool {
        matches!(self.state, WriterState::Failed(_))
    }
}

impl Drop for BufferedWriter {
    fn drop(&mut self) {
        if self.state == WriterState::Open {
            warn!(
                container = %self.container,
                blob = %self.blob,
                bytes = self.bytes_written,
                blocks = self.block_ids.len(),
                "buffered writer dropped without commit; the write is incomplete"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::store::memory::MemoryStore;
    use crate::store::testing::FaultyStore;
    use crate::store::PublicAccess;

    async fn memory_store() -> Arc<MemoryStore> {
        let store = MemoryStore::new();
        store
            .create_container("docs", PublicAccess::Private)
            .await
            .unwrap();
        Arc::new(store)
    }

    async fn contents(store: &dyn BlobStore, blob: &str) -> Bytes {
        store.read_range("docs", blob, 0, u64::MAX, None).await.unwrap()
    }

    #[test]
    fn test_block_ids_fixed_length_and_unique() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let first = BufferedWriter::block_id(&a, 0);
        let last = BufferedWriter::block_id(&a, 999_999);
        assert_eq!(first.len(), last.len());
        assert_ne!(first, BufferedWriter::block_id(&b, 0));

        let decoded = String::from_utf8(BASE64_STANDARD.decode(&first).unwrap()).unwrap();
        assert_eq!(decoded, format!("{}:000000", a.simple()));
    }

    #[tokio::test]
    async fn test_blocks_staged_at_threshold() {
        let store = memory_store().await;
        let mut writer = BufferedWriter::new(store.clone(), "docs", "a.bin", 4);

        writer.write(b"abc", None).await.unwrap();
        assert_eq!(writer.blocks_staged(), 0);
        writer.write(b"defghijkl", None).await.unwrap();
        // 12 bytes: three full blocks, nothing buffered.
        assert_eq!(writer.blocks_staged(), 3);

        writer.commit(None).await.unwrap();
        assert_eq!(writer.blocks_staged(), 3);
        assert_eq!(contents(store.as_ref(), "a.bin").await, Bytes::from("abcdefghijkl"));
    }

    #[tokio::test]
    async fn test_nothing_visible_before_commit() {
        let store = memory_store().await;
        let mut writer = BufferedWriter::new(store.clone(), "docs", "a.bin", 2);
        writer.write(b"hello", None).await.unwrap();
        assert!(store.blob_properties("docs", "a.bin").await.is_err());

        writer.commit(None).await.unwrap();
        assert_eq!(contents(store.as_ref(), "a.bin").await, Bytes::from("hello"));
    }

    #[tokio::test]
    async fn test_empty_commit_creates_empty_blob() {
        let store = memory_store().await;
        let mut writer = BufferedWriter::new(store.clone(), "docs", "empty", 8);
        writer.commit(None).await.unwrap();
        assert_eq!(store.blob_properties("docs", "empty").await.unwrap().size, 0);
    }

    #[tokio::test]
    async fn test_commit_twice_is_noop() {
        let store = Arc::new(FaultyStore::new(memory_store().await));
        let mut writer = BufferedWriter::new(store.clone(), "docs", "a", 8);
        writer.write(b"data", None).await.unwrap();
        writer.commit(None).await.unwrap();
        writer.commit(None).await.unwrap();
        assert_eq!(store.commits(), 1);

        let err = writer.write(b"more", None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WriteFailed);
    }

    #[tokio::test]
    async fn test_stage_failure_poisons_writer() {
        let inner = memory_store().await;
        // Seed prior content.
        let mut seed = BufferedWriter::new(inner.clone(), "docs", "a", 64);
        seed.write(b"original", None).await.unwrap();
        seed.commit(None).await.unwrap();

        let store = Arc::new(FaultyStore::new(inner.clone()));
        store.fail_stage_after(1);
        let mut writer = BufferedWriter::new(store.clone(), "docs", "a", 4);

        let err = writer.write(b"abcdefgh", None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WriteFailed);
        assert!(writer.is_failed());

        let err = writer.commit(None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WriteFailed);
        assert_eq!(store.commits(), 0);
        assert_eq!(contents(inner.as_ref(), "a").await, Bytes::from("original"));
    }

    #[tokio::test]
    async fn test_commit_failure_reports_write_failed() {
        let store = Arc::new(FaultyStore::new(memory_store().await));
        store.fail_commits(true);
        let mut writer = BufferedWriter::new(store.clone(), "docs", "a", 4);
        writer.write(b"ab", None).await.unwrap();

        let err = writer.commit(None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WriteFailed);
        assert!(writer.is_failed());
        assert!(!writer.is_committed());
    }
}
