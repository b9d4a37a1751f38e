//! blobfs library: file-handle access to blob object storage.
//!
//! A caller opens a file on `container/blob`, streams reads or writes
//! through it, and closes it.  Write handles hold an exclusive lease and
//! buffer data into staged blocks that become visible only at close.
//! Container and blob properties are served from a short-lived in-memory
//! cache shared by every handle.
//!
//! [`BlobFs`] is the composition root: it owns the store client, the
//! cache, and the handle options, and hands them to each operation.

use std::sync::Arc;

pub mod cache;
pub mod config;
pub mod container;
pub mod errors;
pub mod file;
pub mod metrics;
pub mod naming;
pub mod store;

use crate::cache::MetadataCache;
use crate::config::{Config, StorageBackendKind};
use crate::container::ContainerService;
use crate::errors::Result;
use crate::file::{FileOptions, Mode, OpenFile};
use crate::store::{BlobProperties, BlobStore, ContainerProperties};

/// Entry point tying a store, a cache and handle options together.
#[derive(Clone)]
pub struct BlobFs {
    store: Arc<dyn BlobStore>,
    cache: Arc<MetadataCache>,
    containers: ContainerService,
    options: FileOptions,
}

impl BlobFs {
    /// Build from explicit parts.
    pub fn new(
        store: Arc<dyn BlobStore>,
        cache: Arc<MetadataCache>,
        options: FileOptions,
    ) -> Self {
        let containers = ContainerService::new(Arc::clone(&store), Arc::clone(&cache));
        Self {
            store,
            cache,
            containers,
            options,
        }
    }

    /// Build the store, cache and options described by `config`.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let store: Arc<dyn BlobStore> = match config.storage.backend {
            StorageBackendKind::Memory => Arc::new(store::memory::MemoryStore::new()),
            StorageBackendKind::Azure => {
                let azure = config.storage.azure.as_ref().ok_or_else(|| {
                    anyhow::anyhow!(
                        "storage.backend is 'azure' but storage.azure config section is missing"
                    )
                })?;
                Arc::new(store::azure::AzureStore::new(azure)?)
            }
        };
        let cache = Arc::new(MetadataCache::with_sweep_threshold(
            config.cache.ttl(),
            config.cache.sweep_threshold,
        ));
        Ok(Self::new(store, cache, config.file.options()))
    }

    /// Container facade sharing this instance's store and cache.
    pub fn containers(&self) -> &ContainerService {
        &self.containers
    }

    /// The shared metadata cache.
    pub fn cache(&self) -> &Arc<MetadataCache> {
        &self.cache
    }

    /// Handle options applied by [`open_file`](Self::open_file).
    pub fn options(&self) -> FileOptions {
        self.options
    }

    /// Open `container/blob` in `mode`.
    pub async fn open_file(&self, container: &str, blob: &str, mode: Mode) -> Result<OpenFile> {
        OpenFile::open(
            Arc::clone(&self.store),
            Arc::clone(&self.cache),
            container,
            blob,
            mode,
            self.options,
        )
        .await
    }

    /// Read from an open file; 0 means end of stream.
    pub async fn read_file(&self, file: &mut OpenFile, buf: &mut [u8]) -> Result<usize> {
        file.read(buf).await
    }

    /// Write to an open file.
    pub async fn write_file(&self, file: &mut OpenFile, data: &[u8]) -> Result<()> {
        file.write(data).await
    }

    /// Close a file, committing writes and releasing its lease.
    pub async fn close_file(&self, file: &mut OpenFile) -> Result<()> {
        file.close().await
    }

    /// Container properties (cached).
    pub async fn container_properties(&self, container: &str) -> Result<ContainerProperties> {
        self.containers.properties(container).await
    }

    /// First metadata value found among `keys`.
    pub async fn container_metadata(
        &self,
        container: &str,
        keys: &[&str],
    ) -> Result<Option<String>> {
        self.containers.metadata(container, keys).await
    }

    /// Set one container metadata entry.
    pub async fn set_container_metadata(
        &self,
        container: &str,
        key: &str,
        value: &str,
    ) -> Result<()> {
        self.containers.set_metadata(container, key, value).await
    }

    /// Remove one container metadata entry, returning the previous value.
    pub async fn remove_container_metadata(
        &self,
        container: &str,
        key: &str,
    ) -> Result<Option<String>> {
        self.containers.remove_metadata(container, key).await
    }

    /// Blob properties (cached).
    pub async fn blob_properties(&self, container: &str, blob: &str) -> Result<BlobProperties> {
        self.containers.blob_properties(container, blob).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::store::PublicAccess;

    fn memory_fs() -> BlobFs {
        BlobFs::from_config(&Config::default()).unwrap()
    }

    #[tokio::test]
    async fn test_report_scenario() {
        let fs = memory_fs();
        fs.containers()
            .create("docs", PublicAccess::Private)
            .await
            .unwrap();
        assert!(fs.blob_properties("docs", "report.txt").await.is_err());

        let mut writer = fs.open_file("docs", "report.txt", Mode::Write).await.unwrap();
        fs.write_file(&mut writer, b"hello").await.unwrap();

        let contender = fs.open_file("docs", "report.txt", Mode::Write).await;
        assert_eq!(contender.err().unwrap().kind(), ErrorKind::LeaseConflict);

        fs.close_file(&mut writer).await.unwrap();

        let mut reader = fs.open_file("docs", "report.txt", Mode::Read).await.unwrap();
        let mut buf = [0u8; 16];
        let n = fs.read_file(&mut reader, &mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(fs.read_file(&mut reader, &mut buf).await.unwrap(), 0);
        fs.close_file(&mut reader).await.unwrap();
    }

    #[tokio::test]
    async fn test_close_refreshes_blob_properties() {
        let fs = memory_fs();
        fs.containers()
            .create("docs", PublicAccess::Private)
            .await
            .unwrap();

        let mut f = fs.open_file("docs", "a.txt", Mode::Write).await.unwrap();
        f.write(b"one").await.unwrap();
        f.close().await.unwrap();
        assert_eq!(fs.blob_properties("docs", "a.txt").await.unwrap().size, 3);

        let mut f = fs.open_file("docs", "a.txt", Mode::Write).await.unwrap();
        f.write(b"three").await.unwrap();
        f.close().await.unwrap();
        // The cached 3-byte entry was dropped at close.
        assert_eq!(fs.blob_properties("docs", "a.txt").await.unwrap().size, 5);
    }

    #[tokio::test]
    async fn test_container_metadata_through_facade() {
        let fs = memory_fs();
        fs.containers()
            .create("docs", PublicAccess::Private)
            .await
            .unwrap();
        fs.container_properties("docs").await.unwrap();

        fs.set_container_metadata("docs", "owner", "alice")
            .await
            .unwrap();
        assert_eq!(
            fs.container_metadata("docs", &["owner"]).await.unwrap(),
            Some("alice".to_string())
        );
        assert_eq!(
            fs.remove_container_metadata("docs", "owner").await.unwrap(),
            Some("alice".to_string())
        );
        assert_eq!(fs.container_metadata("docs", &["owner"]).await.unwrap(), None);
    }

    #[test]
    fn test_from_config_requires_azure_section() {
        let mut config = Config::default();
        config.storage.backend = StorageBackendKind::Azure;
        assert!(BlobFs::from_config(&config).is_err());
    }
}
