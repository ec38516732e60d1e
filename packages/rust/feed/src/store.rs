//! [`ObjectStore`] backed by the `object_store` crate (S3, local filesystem
//! or in-memory).

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use gtfs_etl_shared::{GtfsEtlError, ObjectStoreConfig, Result, expand_home};
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore as _, PutPayload};
use tracing::{debug, info, instrument};

use crate::ObjectStore;

#[derive(Clone)]
pub struct CloudObjectStore {
    inner: Arc<dyn object_store::ObjectStore>,
    location: String,
}

impl fmt::Debug for CloudObjectStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloudObjectStore")
            .field("location", &self.location)
            .finish()
    }
}

impl CloudObjectStore {
    pub fn new(inner: Arc<dyn object_store::ObjectStore>, location: impl Into<String>) -> Self {
        Self {
            inner,
            location: location.into(),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemory::new()), "memory://")
    }

    /// A store rooted at `root`, created if missing.
    pub fn local(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root).map_err(|e| GtfsEtlError::io(root, e))?;
        let fs = LocalFileSystem::new_with_prefix(root).map_err(store_err)?;
        Ok(Self::new(Arc::new(fs), format!("file://{}", root.display())))
    }

    /// S3 bucket from an `s3://bucket` URL. Credentials come from the
    /// environment variables the config names.
    pub fn s3(config: &ObjectStoreConfig) -> Result<Self> {
        let (access_key_id, secret_access_key) = config.credentials()?;
        let mut builder = AmazonS3Builder::new()
            .with_url(config.url.as_str())
            .with_access_key_id(access_key_id)
            .with_secret_access_key(secret_access_key);
        if let Some(region) = &config.region {
            builder = builder.with_region(region.as_str());
        }
        if let Some(endpoint) = &config.endpoint {
            builder = builder.with_endpoint(endpoint.as_str());
        }
        let s3 = builder.build().map_err(store_err)?;
        Ok(Self::new(Arc::new(s3), config.url.clone()))
    }

    pub fn from_config(config: &ObjectStoreConfig) -> Result<Self> {
        if config.is_s3() {
            return Self::s3(config);
        }
        let path = config.url.strip_prefix("file://").unwrap_or(&config.url);
        Self::local(&expand_home(path))
    }

    pub fn location(&self) -> &str {
        &self.location
    }
}

impl ObjectStore for CloudObjectStore {
    #[instrument(skip_all, fields(%key, local = %local.display()))]
    async fn put(&self, local: &Path, key: &str) -> Result<()> {
        let bytes = tokio::fs::read(local)
            .await
            .map_err(|e| GtfsEtlError::io(local, e))?;
        let size = bytes.len();
        self.inner
            .put(&ObjectPath::from(key), PutPayload::from(bytes))
            .await
            .map_err(store_err)?;
        info!(size, location = %self.location, "uploaded object");
        Ok(())
    }

    async fn size(&self, key: &str) -> Result<Option<u64>> {
        match self.inner.head(&ObjectPath::from(key)).await {
            Ok(meta) => Ok(Some(meta.size)),
            Err(object_store::Error::NotFound { .. }) => {
                debug!(%key, "object not found");
                Ok(None)
            }
            Err(e) => Err(store_err(e)),
        }
    }
}

fn store_err(e: object_store::Error) -> GtfsEtlError {
    GtfsEtlError::Storage(format!("object store: {e}"))
}
