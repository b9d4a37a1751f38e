//! Buffered sequential reads over a blob.
//!
//! The reader pulls the blob in fixed-size ranged reads and serves caller
//! reads from the current chunk, so a stream of small `read` calls costs
//! one store request per chunk rather than one per call.
//!
//! Every chunk is fetched conditioned on the etag seen at open.  If the
//! blob is replaced mid-stream the next read fails with
//! `TransientStoreError` instead of splicing two versions together.

use bytes::{Buf, Bytes, BytesMut};
use metrics::counter;
use std::sync::Arc;

use crate::errors::{BlobFsError, OpContext, Result};
use crate::metrics::BYTES_READ_TOTAL;
use crate::store::BlobStore;

/// Default size of one ranged read (4 MiB).
pub const DEFAULT_READ_CHUNK: usize = 4 * 1024 * 1024;

/// Forward-only reader over one blob.
pub struct BufferedReader {
    store: Arc<dyn BlobStore>,
    container: String,
    blob: String,
    chunk_size: usize,
    /// Blob size observed at open.
    size: u64,
    /// Etag observed at open; every ranged read is conditioned on it.
    etag: String,
    /// Store offset of the next chunk to fetch.
    next_offset: u64,
    buffer: Bytes,
    closed: bool,
}

impl BufferedReader {
    /// Open a reader on `container/blob`.
    ///
    /// Fails with `NotFound` if the blob does not exist.
    pub async fn open(
        store: Arc<dyn BlobStore>,
        container: &str,
        blob: &str,
        chunk_size: usize,
    ) -> Result<Self> {
        let props = store
            .blob_properties(container, blob)
            .await
            .map_err(|e| {
                BlobFsError::from_store(OpContext::new("open_read", container).with_blob(blob), e)
            })?;
        Ok(Self {
            store,
            container: container.to_string(),
            blob: blob.to_string(),
            chunk_size: chunk_size.max(1),
            size: props.size,
            etag: props.etag,
            next_offset: 0,
            buffer: Bytes::new(),
            closed: false,
        })
    }

    /// Blob size observed when the reader was opened.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Number of bytes handed to the caller so far.
    pub fn position(&self) -> u64 {
        self.next_offset - self.buffer.len() as u64
    }

    /// Copy the next bytes of the blob into `buf`.
    ///
    /// Returns 0 only at end of stream (or for an empty `buf`, or after
    /// [`close`](Self::close)).
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.closed || buf.is_empty() {
            return Ok(0);
        }
        if self.buffer.is_empty() && !self.fill().await? {
            return Ok(0);
        }
        let n = buf.len().min(self.buffer.len());
        buf[..n].copy_from_slice(&self.buffer[..n]);
        self.buffer.advance(n);
        counter!(BYTES_READ_TOTAL).increment(n as u64);
        Ok(n)
    }

    /// Read everything that remains.
    pub async fn read_to_end(&mut self) -> Result<Bytes> {
        let remaining = self.size.saturating_sub(self.position()) as usize;
        let mut out = BytesMut::with_capacity(remaining);
        while !self.closed {
            if self.buffer.is_empty() && !self.fill().await? {
                break;
            }
            let chunk = std::mem::take(&mut self.buffer);
            counter!(BYTES_READ_TOTAL).increment(chunk.len() as u64);
            out.extend_from_slice(&chunk);
        }
        Ok(out.freeze())
    }

    /// Fetch the next chunk.  Returns `false` at end of stream.
    async fn fill(&mut self) -> Result<bool> {
        if self.next_offset >= self.size {
            return Ok(false);
        }
        let chunk = self
            .store
            .read_range(
                &self.container,
                &self.blob,
                self.next_offset,
                self.chunk_size as u64,
                Some(self.etag.as_str()),
            )
            .await
            .map_err(|e| {
                BlobFsError::from_store(
                    OpContext::new("read_file", self.container.as_str()).with_blob(&self.blob),
                    e,
                )
            })?;
        if chunk.is_empty() {
            // Short of the size seen at open; stop where the data ends.
            self.size = self.next_offset;
            return Ok(false);
        }
        self.next_offset += chunk.len() as u64;
        self.buffer = chunk;
        Ok(true)
    }

    /// Drop the buffered chunk.  Idempotent.
    pub fn close(&mut self) {
        self.closed = true;
        self.buffer = Bytes::new();
    }

    /// Etag of the version being read.
    pub fn etag(&self) -> &str {
        &self.etag
    }

    /// Whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}
