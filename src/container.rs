//! Container facade.
//!
//! Thin layer over [`BlobStore`] container calls that validates names,
//! serves properties from the [`MetadataCache`], and turns metadata edits
//! into conditional read-modify-write cycles.
//!
//! Metadata keys are compared case-insensitively and stored lowercased,
//! matching how the blob service reports them.

use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use crate::cache::{CacheKey, CachedValue, MetadataCache};
use crate::errors::{BlobFsError, ErrorKind, OpContext, Result};
use crate::naming::{validate_blob_name, validate_container_name};
use crate::store::{BlobProperties, BlobStore, ContainerProperties, PublicAccess};

/// A container known to exist when the reference was taken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRef {
    name: String,
}

impl ContainerRef {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for ContainerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Container operations with cached properties.
#[derive(Clone)]
pub struct ContainerService {
    store: Arc<dyn BlobStore>,
    cache: Arc<MetadataCache>,
}

fn check_container(operation: &'static str, name: &str) -> Result<()> {
    validate_container_name(name).map_err(|reason| BlobFsError::InvalidName {
        ctx: OpContext::new(operation, name),
        reason: reason.to_string(),
    })
}

impl ContainerService {
    pub fn new(store: Arc<dyn BlobStore>, cache: Arc<MetadataCache>) -> Self {
        Self { store, cache }
    }

    /// All container names, sorted.
    pub async fn list(&self) -> Result<Vec<String>> {
        self.store
            .list_containers()
            .await
            .map_err(|e| BlobFsError::from_store(OpContext::new("list_containers", ""), e))
    }

    /// Reference to an existing container; `NotFound` if it is absent.
    pub async fn get_ref(&self, name: &str) -> Result<ContainerRef> {
        check_container("get_container", name)?;
        let ctx = || OpContext::new("get_container", name);
        let exists = self
            .store
            .container_exists(name)
            .await
            .map_err(|e| BlobFsError::from_store(ctx(), e))?;
        if !exists {
            return Err(BlobFsError::NotFound { ctx: ctx() });
        }
        Ok(ContainerRef {
            name: name.to_string(),
        })
    }

    /// Create `name` if needed and apply `access`.
    ///
    /// An existing container is not an error; its access level is still
    /// set to `access`.
    pub async fn create(&self, name: &str, access: PublicAccess) -> Result<ContainerRef> {
        check_container("create_container", name)?;
        let ctx = || OpContext::new("create_container", name);
        match self.store.create_container(name, access).await {
            Ok(()) => info!(container = name, ?access, "container created"),
            Err(e) => {
                let err = BlobFsError::from_store(ctx(), e);
                if err.kind() != ErrorKind::AlreadyExists {
                    return Err(err);
                }
                debug!(container = name, "container already exists");
            }
        }
        self.store
            .set_container_access(name, access)
            .await
            .map_err(|e| BlobFsError::from_store(ctx(), e))?;
        self.cache.invalidate(&CacheKey::container(name));
        Ok(ContainerRef {
            name: name.to_string(),
        })
    }

    /// Delete `name` and everything in it.  Deleting an absent container
    /// succeeds.
    pub async fn delete(&self, name: &str) -> Result<()> {
        check_container("delete_container", name)?;
        let result = self.store.delete_container(name).await;
        self.cache.invalidate_container(name);
        match result {
            Ok(()) => {
                info!(container = name, "container deleted");
                Ok(())
            }
            Err(e) => {
                let err = BlobFsError::from_store(OpContext::new("delete_container", name), e);
                if err.kind() == ErrorKind::NotFound {
                    Ok(())
                } else {
                    Err(err)
                }
            }
        }
    }

    /// Whether `name` exists.  Invalid names are reported as absent.
    ///
    /// With `use_cache` the answer may come from (and populates) the
    /// property cache; otherwise the store is asked directly.
    pub async fn exists(&self, name: &str, use_cache: bool) -> Result<bool> {
        if validate_container_name(name).is_err() {
            return Ok(false);
        }
        if use_cache {
            return match self.properties(name).await {
                Ok(_) => Ok(true),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
                Err(e) => Err(e),
            };
        }
        self.store
            .container_exists(name)
            .await
            .map_err(|e| BlobFsError::from_store(OpContext::new("container_exists", name), e))
    }

    /// Container properties, from the cache when fresh.
    pub async fn properties(&self, name: &str) -> Result<ContainerProperties> {
        check_container("container_properties", name)?;
        let key = CacheKey::container(name);
        if let Some(CachedValue::Container(props)) = self.cache.get(&key) {
            return Ok(props);
        }
        let generation = self.cache.generation();
        let attrs = self.store.container_attributes(name).await.map_err(|e| {
            BlobFsError::from_store(OpContext::new("container_properties", name), e)
        })?;
        self.cache.insert_if_current(
            key,
            CachedValue::Container(attrs.properties.clone()),
            generation,
        );
        Ok(attrs.properties)
    }

    /// Value of the first key in `keys` present in the container metadata.
    pub async fn metadata(&self, name: &str, keys: &[&str]) -> Result<Option<String>> {
        check_container("container_metadata", name)?;
        let attrs = self.store.container_attributes(name).await.map_err(|e| {
            let ctx = OpContext::new("container_metadata", name);
            let ctx = match keys.first() {
                Some(k) => ctx.with_key(*k),
                None => ctx,
            };
            BlobFsError::from_store(ctx, e)
        })?;
        Ok(keys.iter().find_map(|wanted| {
            attrs
                .metadata
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(wanted))
                .map(|(_, v)| v.clone())
        }))
    }

    /// Set one metadata entry.
    ///
    /// The upload is conditioned on the etag read just before it; if the
    /// container changed in between the call fails with
    /// `TransientStoreError` and nothing is written.
    pub async fn set_metadata(&self, name: &str, key: &str, value: &str) -> Result<()> {
        check_container("set_container_metadata", name)?;
        let ctx = || OpContext::new("set_container_metadata", name).with_key(key);
        let attrs = self
            .store
            .container_attributes(name)
            .await
            .map_err(|e| BlobFsError::from_store(ctx(), e))?;

        let mut metadata = attrs.metadata;
        metadata.retain(|k, _| !k.eq_ignore_ascii_case(key));
        metadata.insert(key.to_lowercase(), value.to_string());

        let result = self
            .store
            .set_container_metadata(name, metadata, Some(&attrs.etag))
            .await;
        self.cache.invalidate_container(name);
        result.map_err(|e| BlobFsError::from_store(ctx(), e))?;
        debug!(container = name, key, "container metadata set");
        Ok(())
    }

    /// Remove one metadata entry, returning its previous value.
    ///
    /// Removing an absent key returns `None` and makes no upload.
    pub async fn remove_metadata(&self, name: &str, key: &str) -> Result<Option<String>> {
        check_container("remove_container_metadata", name)?;
        let ctx = || OpContext::new("remove_container_metadata", name).with_key(key);
        let attrs = self
            .store
            .container_attributes(name)
            .await
            .map_err(|e| BlobFsError::from_store(ctx(), e))?;

        let mut metadata = attrs.metadata;
        let Some(stored_key) = metadata
            .keys()
            .find(|k| k.eq_ignore_ascii_case(key))
            .cloned()
        else {
            return Ok(None);
        };
        let previous = metadata.remove(&stored_key);

        let result = self
            .store
            .set_container_metadata(name, metadata, Some(&attrs.etag))
            .await;
        self.cache.invalidate_container(name);
        result.map_err(|e| BlobFsError::from_store(ctx(), e))?;
        debug!(container = name, key, "container metadata removed");
        Ok(previous)
    }

    /// Blob properties, from the cache when fresh.
    pub async fn blob_properties(&self, container: &str, blob: &str) -> Result<BlobProperties> {
        let ctx = || OpContext::new("blob_properties", container).with_blob(blob);
        validate_container_name(container)
            .and_then(|()| validate_blob_name(blob))
            .map_err(|reason| BlobFsError::InvalidName {
                ctx: ctx(),
                reason: reason.to_string(),
            })?;

        let key = CacheKey::blob(container, blob);
        if let Some(CachedValue::Blob(props)) = self.cache.get(&key) {
            return Ok(props);
        }
        let generation = self.cache.generation();
        let props = self
            .store
            .blob_properties(container, blob)
            .await
            .map_err(|e| BlobFsError::from_store(ctx(), e))?;
        self.cache
            .insert_if_current(key, CachedValue::Blob(props.clone()), generation);
        Ok(props)
    }
}
