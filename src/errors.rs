//! Error types for the file layer and container facade.
//!
//! Every failure surfaces as one [`BlobFsError`] variant carrying an
//! [`OpContext`] (operation, container, blob, metadata key).  Raw store
//! errors never escape: [`BlobFsError::from_store`] classifies them.

use std::fmt;

use thiserror::Error;

use crate::store::StoreError;

/// Where an operation failed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpContext {
    /// Operation name, e.g. `open_file` or `set_container_metadata`.
    pub operation: &'static str,
    /// Target container.
    pub container: String,
    /// Target blob, for blob-level operations.
    pub blob: Option<String>,
    /// Metadata key, for metadata operations.
    pub key: Option<String>,
}

impl OpContext {
    /// Context for a container-level operation.
    pub fn new(operation: &'static str, container: impl Into<String>) -> Self {
        Self {
            operation,
            container: container.into(),
            blob: None,
            key: None,
        }
    }

    /// Add the blob name.
    pub fn with_blob(mut self, blob: impl Into<String>) -> Self {
        self.blob = Some(blob.into());
        self
    }

    /// Add the metadata key.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }
}

impl fmt::Display for OpContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.operation)?;
        if !self.container.is_empty() {
            write!(f, " container={}", self.container)?;
        }
        if let Some(blob) = &self.blob {
            write!(f, " blob={blob}")?;
        }
        if let Some(key) = &self.key {
            write!(f, " key={key}")?;
        }
        Ok(())
    }
}

/// Closed set of error kinds callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    InvalidName,
    LeaseConflict,
    TransientStoreError,
    WriteFailed,
    PermissionDenied,
}

impl ErrorKind {
    /// Stable string code for the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "NotFound",
            ErrorKind::AlreadyExists => "AlreadyExists",
            ErrorKind::InvalidName => "InvalidName",
            ErrorKind::LeaseConflict => "LeaseConflict",
            ErrorKind::TransientStoreError => "TransientStoreError",
            ErrorKind::WriteFailed => "WriteFailed",
            ErrorKind::PermissionDenied => "PermissionDenied",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed file-layer or container operation.
#[derive(Debug, Error)]
pub enum BlobFsError {
    /// The container or blob does not exist.
    #[error("{ctx}: the specified resource does not exist")]
    NotFound { ctx: OpContext },

    /// The resource already exists.
    #[error("{ctx}: the specified resource already exists")]
    AlreadyExists { ctx: OpContext },

    /// A container or blob name failed validation.  No store call was made.
    #[error("{ctx}: invalid name: {reason}")]
    InvalidName { ctx: OpContext, reason: String },

    /// Another writer holds the lease on the blob.
    #[error("{ctx}: the blob is leased by another writer")]
    LeaseConflict { ctx: OpContext },

    /// Network or backend failure.  Safe for the caller to retry.
    #[error("{ctx}: store request failed: {source}")]
    Transient {
        ctx: OpContext,
        #[source]
        source: StoreError,
    },

    /// A buffered write could not be made durable.
    #[error("{ctx}: write failed: {reason}")]
    WriteFailed { ctx: OpContext, reason: String },

    /// The operation is not allowed on this resource or handle.
    #[error("{ctx}: permission denied: {reason}")]
    PermissionDenied { ctx: OpContext, reason: String },
}

impl BlobFsError {
    /// Classify a store error under the given context.
    pub fn from_store(ctx: OpContext, err: StoreError) -> Self {
        match err {
            StoreError::NotFound(_) => BlobFsError::NotFound { ctx },
            StoreError::AlreadyExists(_) => BlobFsError::AlreadyExists { ctx },
            StoreError::LeaseConflict(_) => BlobFsError::LeaseConflict { ctx },
            StoreError::PermissionDenied(reason) => BlobFsError::PermissionDenied { ctx, reason },
            source @ (StoreError::PreconditionFailed(_)
            | StoreError::InvalidRequest(_)
            | StoreError::Transient(_)) => BlobFsError::Transient { ctx, source },
        }
    }

    /// The kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            BlobFsError::NotFound { .. } => ErrorKind::NotFound,
            BlobFsError::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            BlobFsError::InvalidName { .. } => ErrorKind::InvalidName,
            BlobFsError::LeaseConflict { .. } => ErrorKind::LeaseConflict,
            BlobFsError::Transient { .. } => ErrorKind::TransientStoreError,
            BlobFsError::WriteFailed { .. } => ErrorKind::WriteFailed,
            BlobFsError::PermissionDenied { .. } => ErrorKind::PermissionDenied,
        }
    }

    /// The operation context.
    pub fn context(&self) -> &OpContext {
        match self {
            BlobFsError::NotFound { ctx }
            | BlobFsError::AlreadyExists { ctx }
            | BlobFsError::InvalidName { ctx, .. }
            | BlobFsError::LeaseConflict { ctx }
            | BlobFsError::Transient { ctx, .. }
            | BlobFsError::WriteFailed { ctx, .. }
            | BlobFsError::PermissionDenied { ctx, .. } => ctx,
        }
    }

    /// Whether retrying the same call may succeed.
    ///
    /// A request the store rejected as malformed is reported as
    /// `TransientStoreError` but fails the same way on every retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            BlobFsError::Transient { source, .. } => {
                !matches!(source, StoreError::InvalidRequest(_))
            }
            BlobFsError::LeaseConflict { .. } => true,
            _ => false,
        }
    }
}

/// Result alias for file-layer operations.
pub type Result<T> = std::result::Result<T, BlobFsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_display() {
        let ctx = OpContext::new("set_container_metadata", "docs").with_key("owner");
        assert_eq!(ctx.to_string(), "set_container_metadata container=docs key=owner");

        let ctx = OpContext::new("open_file", "docs").with_blob("report.txt");
        assert_eq!(ctx.to_string(), "open_file container=docs blob=report.txt");
    }

    #[test]
    fn test_context_display_without_container() {
        let ctx = OpContext::new("list_containers", "");
        assert_eq!(ctx.to_string(), "list_containers");
    }

    #[test]
    fn test_from_store_classification() {
        let ctx = || OpContext::new("op", "c");
        let cases = [
            (StoreError::NotFound("x".into()), ErrorKind::NotFound),
            (StoreError::AlreadyExists("x".into()), ErrorKind::AlreadyExists),
            (StoreError::LeaseConflict("x".into()), ErrorKind::LeaseConflict),
            (StoreError::PermissionDenied("x".into()), ErrorKind::PermissionDenied),
            (
                StoreError::PreconditionFailed("x".into()),
                ErrorKind::TransientStoreError,
            ),
            (StoreError::InvalidRequest("x".into()), ErrorKind::TransientStoreError),
            (StoreError::Transient("x".into()), ErrorKind::TransientStoreError),
        ];
        for (store_err, kind) in cases {
            assert_eq!(BlobFsError::from_store(ctx(), store_err).kind(), kind);
        }
    }

    #[test]
    fn test_transient_keeps_source() {
        let err = BlobFsError::from_store(
            OpContext::new("read_file", "docs").with_blob("a"),
            StoreError::Transient("timeout".into()),
        );
        assert!(err.is_retryable());
        assert_eq!(
            err.to_string(),
            "read_file container=docs blob=a: store request failed: transient store failure: timeout"
        );
        let source = std::error::Error::source(&err).unwrap();
        assert_eq!(source.to_string(), "transient store failure: timeout");
    }

    #[test]
    fn test_malformed_request_is_not_retryable() {
        let ctx = || OpContext::new("set_container_metadata", "docs").with_key("bad key");
        let malformed = BlobFsError::from_store(
            ctx(),
            StoreError::InvalidRequest("invalid metadata key".into()),
        );
        assert_eq!(malformed.kind(), ErrorKind::TransientStoreError);
        assert!(!malformed.is_retryable());

        let raced = BlobFsError::from_store(ctx(), StoreError::PreconditionFailed("etag".into()));
        assert!(raced.is_retryable());
        let missing = BlobFsError::from_store(ctx(), StoreError::NotFound("docs".into()));
        assert!(!missing.is_retryable());
    }

    #[test]
    fn test_kind_codes() {
        assert_eq!(ErrorKind::LeaseConflict.as_str(), "LeaseConflict");
        assert_eq!(ErrorKind::TransientStoreError.to_string(), "TransientStoreError");
    }
}
