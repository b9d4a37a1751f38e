//! Open file handles.
//!
//! An [`OpenFile`] ties one blob to at most one buffered reader, at most
//! one buffered writer, and the lease that makes the writer exclusive.
//!
//! ```text
//! Closed --open--> Opening --> Active(mode) --close--> Closing --> Closed
//! ```
//!
//! [`OpenFile::close`] runs one cleanup sequence on every path: close the
//! reader, commit the writer (or surface its failure), release the lease
//! even if the commit failed, drop the blob's cache entries, and end in
//! `Closed`.  A second `close` does nothing.  A close that was cancelled
//! part-way (dropped inside a timeout, say) leaves the handle `Closing`;
//! calling `close` again resumes from the first unfinished step.
//!
//! Container metadata written while a handle is open on one of its blobs
//! is not ordered with respect to the handle's buffered writes; those only
//! land at close.

use metrics::{counter, gauge};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::lease::Lease;
use super::read::{BufferedReader, DEFAULT_READ_CHUNK};
use super::write::{BufferedWriter, DEFAULT_WRITE_BLOCK};
use crate::cache::{CacheKey, MetadataCache};
use crate::errors::{BlobFsError, ErrorKind, OpContext, Result};
use crate::metrics::{FILES_CLOSED_TOTAL, FILES_OPEN, FILES_OPENED_TOTAL, LEASE_CONFLICTS_TOTAL};
use crate::naming::{validate_blob_name, validate_container_name};
use crate::store::BlobStore;

/// How a file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Sequential reads of the current content.
    Read,
    /// Leased write of new content, committed at close.
    Write,
    /// Both: reads see the content as of open, writes replace it at close.
    ReadWrite,
}

impl Mode {
    /// Whether the mode carries a reader.
    pub fn reads(self) -> bool {
        matches!(self, Mode::Read | Mode::ReadWrite)
    }

    /// Whether the mode carries a writer and a lease.
    pub fn writes(self) -> bool {
        matches!(self, Mode::Write | Mode::ReadWrite)
    }

    fn label(self) -> &'static str {
        match self {
            Mode::Read => "read",
            Mode::Write => "write",
            Mode::ReadWrite => "read_write",
        }
    }
}

/// Lifecycle state of an [`OpenFile`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Opening,
    Active(Mode),
    Closing,
    Closed,
}

/// Buffer and lease sizing for open files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileOptions {
    /// Bytes fetched per ranged read.
    pub read_chunk_bytes: usize,
    /// Block threshold for buffered writes.
    pub write_block_bytes: usize,
    /// Lease duration; `None` requests an infinite lease.
    pub lease_duration: Option<Duration>,
}

impl Default for FileOptions {
    fn default() -> Self {
        Self {
            read_chunk_bytes: DEFAULT_READ_CHUNK,
            write_block_bytes: DEFAULT_WRITE_BLOCK,
            lease_duration: Some(Duration::from_secs(60)),
        }
    }
}

/// A file opened on one blob.
pub struct OpenFile {
    id: Uuid,
    container: String,
    blob: String,
    mode: Mode,
    state: HandleState,
    lease: Option<Lease>,
    reader: Option<BufferedReader>,
    writer: Option<BufferedWriter>,
    /// Set once a writer exists; close then invalidates cached properties.
    mutated: bool,
    store: Arc<dyn BlobStore>,
    cache: Arc<MetadataCache>,
}

impl OpenFile {
    /// Open `container/blob` in `mode`.
    ///
    /// Write modes acquire the lease first and fail with `LeaseConflict`
    /// while another writer holds it; the caller decides whether to retry.
    pub async fn open(
        store: Arc<dyn BlobStore>,
        cache: Arc<MetadataCache>,
        container: &str,
        blob: &str,
        mode: Mode,
        options: FileOptions,
    ) -> Result<Self> {
        let ctx = || OpContext::new("open_file", container).with_blob(blob);
        validate_container_name(container).map_err(|reason| BlobFsError::InvalidName {
            ctx: ctx(),
            reason: reason.to_string(),
        })?;
        validate_blob_name(blob).map_err(|reason| BlobFsError::InvalidName {
            ctx: ctx(),
            reason: reason.to_string(),
        })?;

        let mut file = Self {
            id: Uuid::new_v4(),
            container: container.to_string(),
            blob: blob.to_string(),
            mode,
            state: HandleState::Opening,
            lease: None,
            reader: None,
            writer: None,
            mutated: false,
            store,
            cache,
        };

        if mode.writes() {
            let acquired =
                Lease::acquire(file.store.as_ref(), container, blob, options.lease_duration).await;
            match acquired {
                Ok(lease) => file.lease = Some(lease),
                Err(e) => {
                    if e.kind() == ErrorKind::LeaseConflict {
                        counter!(LEASE_CONFLICTS_TOTAL).increment(1);
                    }
                    file.state = HandleState::Closed;
                    return Err(e);
                }
            }
        }

        if mode.reads() {
            match BufferedReader::open(
                Arc::clone(&file.store),
                container,
                blob,
                options.read_chunk_bytes,
            )
            .await
            {
                Ok(reader) => file.reader = Some(reader),
                // A duplex open may create the blob.
                Err(e) if mode == Mode::ReadWrite && e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    file.abort_open().await;
                    return Err(e);
                }
            }
        }

        if mode.writes() {
            file.writer = Some(BufferedWriter::new(
                Arc::clone(&file.store),
                container,
                blob,
                options.write_block_bytes,
            ));
            file.mutated = true;
        }

        file.state = HandleState::Active(mode);
        counter!(FILES_OPENED_TOTAL, "mode" => mode.label()).increment(1);
        gauge!(FILES_OPEN).increment(1.0);
        debug!(id = %file.id, container, blob, mode = mode.label(), "file opened");
        Ok(file)
    }

    /// Release the lease of a handle whose open failed part-way.
    async fn abort_open(&mut self) {
        if let Some(lease) = self.lease.take() {
            if let Err(e) = lease.release(self.store.as_ref()).await {
                warn!(
                    container = %self.container,
                    blob = %self.blob,
                    error = %e,
                    "failed to release lease after aborted open"
                );
            }
        }
        self.state = HandleState::Closed;
    }

    fn ctx(&self, operation: &'static str) -> OpContext {
        OpContext::new(operation, self.container.as_str()).with_blob(&self.blob)
    }

    fn ensure_active(&self, operation: &'static str) -> Result<()> {
        match self.state {
            HandleState::Active(_) => Ok(()),
            _ => Err(BlobFsError::PermissionDenied {
                ctx: self.ctx(operation),
                reason: "handle is closed".to_string(),
            }),
        }
    }

    /// Read the next bytes into `buf`; 0 means end of stream.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.ensure_active("read_file")?;
        if !self.mode.reads() {
            return Err(BlobFsError::PermissionDenied {
                ctx: self.ctx("read_file"),
                reason: "handle is not open for reading".to_string(),
            });
        }
        match self.reader.as_mut() {
            Some(reader) => reader.read(buf).await,
            // Duplex handle on a blob that did not exist at open.
            None => Ok(0),
        }
    }

    /// Buffer `data` for the blob, renewing the lease when it is due.
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.ensure_active("write_file")?;
        if !self.mode.writes() {
            return Err(BlobFsError::PermissionDenied {
                ctx: self.ctx("write_file"),
                reason: "handle is not open for writing".to_string(),
            });
        }
        if let Some(lease) = self.lease.as_mut() {
            lease.renew_if_due(self.store.as_ref()).await?;
        }
        let token = self.lease.as_ref().map(Lease::token);
        match self.writer.as_mut() {
            Some(writer) => writer.write(data, token).await,
            None => Ok(()),
        }
    }

    /// Finish the handle: commit writes, release the lease, invalidate
    /// cached properties, and move to `Closed`.
    ///
    /// Every step is attempted even when an earlier one fails; the first
    /// failure is returned and later ones are logged.  Closing a closed
    /// handle returns `Ok(())` without touching the store.
    pub async fn close(&mut self) -> Result<()> {
        if self.state == HandleState::Closed {
            return Ok(());
        }
        self.state = HandleState::Closing;
        let mut first_err: Option<BlobFsError> = None;

        if let Some(reader) = self.reader.as_mut() {
            reader.close();
        }

        // The writer stays in place until the handle is closed: a commit
        // repeated after a cancelled close is a no-op once it went
        // through, and reports the same `WriteFailed` if it did not.
        if let Some(writer) = self.writer.as_mut() {
            let token = self.lease.as_ref().map(Lease::token);
            if let Err(e) = writer.commit(token).await {
                Self::record(&mut first_err, e);
            }
        }

        if let Some(lease) = self.lease.as_ref() {
            let released = lease.send_release(self.store.as_ref()).await;
            self.lease = None;
            if let Err(e) = released {
                Self::record(&mut first_err, e);
            }
        }

        if self.mutated {
            self.cache
                .invalidate(&CacheKey::blob(&self.container, &self.blob));
            self.cache.invalidate(&CacheKey::container(&self.container));
        }

        self.reader = None;
        self.writer = None;
        self.state = HandleState::Closed;
        gauge!(FILES_OPEN).decrement(1.0);
        let outcome = if first_err.is_some() { "error" } else { "ok" };
        counter!(FILES_CLOSED_TOTAL, "outcome" => outcome).increment(1);

        match first_err {
            Some(e) => Err(e),
            None => {
                info!(
                    id = %self.id,
                    container = %self.container,
                    blob = %self.blob,
                    mode = self.mode.label(),
                    "file closed"
                );
                Ok(())
            }
        }
    }

    fn record(first_err: &mut Option<BlobFsError>, err: BlobFsError) {
        match first_err {
            None => *first_err = Some(err),
            Some(_) => warn!(error = %err, "additional failure while closing file"),
        }
    }

    /// Unique id of this handle.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Container of the open blob.
    pub fn container(&self) -> &str {
        &self.container
    }

    /// Name of the open blob.
    pub fn blob(&self) -> &str {
        &self.blob
    }

    /// Mode the handle was opened with.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Current lifecycle state.
    pub fn state(&self) -> HandleState {
        self.state
    }

    /// Whether the handle reached `Closed`.
    pub fn is_closed(&self) -> bool {
        self.state == HandleState::Closed
    }

    /// Lease held by the handle, if any.
    pub fn lease(&self) -> Option<&Lease> {
        self.lease.as_ref()
    }
}

impl Drop for OpenFile {
    fn drop(&mut self) {
        let unfinished = match self.state {
            HandleState::Active(_) => "dropped without close",
            HandleState::Closing => "dropped while closing",
            HandleState::Opening | HandleState::Closed => return,
        };
        gauge!(FILES_OPEN).decrement(1.0);
        warn!(
            id = %self.id,
            container = %self.container,
            blob = %self.blob,
            mode = self.mode.label(),
            "file handle {unfinished}; uncommitted writes are lost, lease left to expire"
        );
    }
}

// -- Tests --------------------------------------------------------------------
