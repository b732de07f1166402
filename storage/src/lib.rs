//! # Storage backends
//!
//! Configuration and unification for the storage backends the registry writes
//! blobs, manifests and cache entries into.

use std::sync::Arc;

use bytes::Bytes;
use camino::Utf8Path;
#[cfg(feature = "local")]
use camino::Utf8PathBuf;
use serde::Deserialize;

#[cfg(feature = "local")]
pub(crate) mod local;

pub(crate) mod memory;
#[cfg(feature = "tmp")]
pub(crate) mod temp;

#[cfg(feature = "local")]
#[doc(inline)]
pub use local::LocalDriver;

#[doc(inline)]
pub use memory::MemoryStorage;

#[cfg(feature = "tmp")]
#[doc(inline)]
pub use temp::TempDriver;

#[doc(inline)]
pub use storage_driver::{Driver, Metadata, Reader, StorageError, StorageErrorKind, Writer};

/// Which backend to build, as written in the server configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "driver")]
pub enum StorageConfig {
    /// Process-local, lost on restart.
    #[default]
    Memory,

    /// A directory on the local filesystem.
    #[cfg(feature = "local")]
    Local {
        /// Root directory; buckets become subdirectories.
        path: Utf8PathBuf,
    },

    /// A temporary directory, removed when the storage is dropped.
    #[cfg(feature = "tmp")]
    Temp,
}

impl StorageConfig {
    /// Construct the configured backend.
    #[tracing::instrument]
    pub fn build(self) -> Result<Storage, StorageError> {
        let client: Storage = match self {
            StorageConfig::Memory => MemoryStorage::new().into(),
            #[cfg(feature = "local")]
            StorageConfig::Local { path } => LocalDriver::new(path).into(),
            #[cfg(feature = "tmp")]
            StorageConfig::Temp => TempDriver::new()
                .map_err(|err| StorageError::from_io("temp", err))?
                .into(),
        };
        Ok(client)
    }
}

use tokio::io;

pub(crate) type ArcDriver = Arc<dyn Driver + Send + Sync>;

/// A cheaply cloneable handle to a storage driver.
#[derive(Debug, Clone)]
pub struct Storage {
    driver: ArcDriver,
}

impl<D> From<D> for Storage
where
    D: Driver + Send + Sync + 'static,
{
    fn from(value: D) -> Self {
        Storage::new(value)
    }
}

impl Storage {
    /// Wrap a driver.
    pub fn new<D: Driver + Send + Sync + 'static>(driver: D) -> Self {
        Self {
            driver: Arc::new(driver),
        }
    }

    /// The driver's name.
    pub fn name(&self) -> &str {
        self.driver.name()
    }

    /// A handle scoped to a single bucket.
    pub fn bucket<S: Into<String>>(&self, bucket: S) -> StorageBucket {
        StorageBucket {
            driver: self.driver.clone(),
            bucket: bucket.into(),
        }
    }
}

/// A storage handle bound to one bucket.
///
/// Every registry component stores through one of these, so keys are always
/// relative paths inside the bucket.
#[derive(Debug, Clone)]
pub struct StorageBucket {
    bucket: String,
    driver: ArcDriver,
}

impl StorageBucket {
    /// The bucket name.
    pub fn name(&self) -> &str {
        &self.bucket
    }

    /// Store an in-memory object.
    #[tracing::instrument(
        skip(self, data),
        fields(driver=self.driver.name(), bucket=%self.bucket, size=data.len())
    )]
    pub async fn save(&self, key: &Utf8Path, data: Bytes) -> Result<(), StorageError> {
        self.driver.save(&self.bucket, key, data).await
    }

    /// Store an object from a stream.
    #[tracing::instrument(
        skip(self, reader),
        fields(driver=self.driver.name(), bucket=%self.bucket)
    )]
    pub async fn save_stream<'d, R>(
        &'d self,
        key: &Utf8Path,
        reader: &mut R,
    ) -> Result<(), StorageError>
    where
        R: io::AsyncBufRead + Unpin + Send + Sync + 'd,
    {
        tracing::trace!(%key, "Saving to: {}/{key}", self.bucket);
        self.driver.save_stream(&self.bucket, key, reader).await
    }

    /// Store an object from a local file.
    pub async fn save_file(&self, key: &Utf8Path, local: &Utf8Path) -> Result<(), StorageError> {
        self.driver.save_file(&self.bucket, key, local).await
    }

    /// Read a whole object.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), bucket=%self.bucket))]
    pub async fn get(&self, key: &Utf8Path) -> Result<Bytes, StorageError> {
        self.driver.get(&self.bucket, key).await
    }

    /// Write an object into a stream.
    #[tracing::instrument(
        skip(self, writer),
        fields(driver=self.driver.name(), bucket=%self.bucket)
    )]
    pub async fn get_stream<'d, W>(
        &'d self,
        key: &Utf8Path,
        writer: &mut W,
    ) -> Result<(), StorageError>
    where
        W: io::AsyncWrite + Unpin + Send + Sync + 'd,
    {
        self.driver.get_stream(&self.bucket, key, writer).await
    }

    /// Whether an object exists.
    pub async fn exists(&self, key: &Utf8Path) -> Result<bool, StorageError> {
        self.driver.exists(&self.bucket, key).await
    }

    /// Object metadata.
    pub async fn metadata(&self, key: &Utf8Path) -> Result<Metadata, StorageError> {
        self.driver.metadata(&self.bucket, key).await
    }

    /// Delete an object; missing objects are ignored.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), bucket=%self.bucket))]
    pub async fn delete(&self, key: &Utf8Path) -> Result<(), StorageError> {
        self.driver.delete(&self.bucket, key).await
    }

    /// A direct URL for the object, when the backend has one.
    pub fn get_url(&self, key: &Utf8Path) -> Option<String> {
        self.driver.get_url(&self.bucket, key)
    }

    /// List keys under a prefix.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), bucket=%self.bucket))]
    pub async fn list(&self, prefix: Option<&Utf8Path>) -> Result<Vec<String>, StorageError> {
        self.driver.list(&self.bucket, prefix).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bucket_handle_round_trips_through_driver() {
        let storage: Storage = MemoryStorage::new().into();
        let bucket = storage.bucket("registry");

        let key = Utf8Path::new("hosted/blobs/sha256/abc");
        assert!(!bucket.exists(key).await.unwrap());

        bucket.save(key, Bytes::from_static(b"layer")).await.unwrap();
        assert!(bucket.exists(key).await.unwrap());
        assert_eq!(bucket.get(key).await.unwrap(), Bytes::from_static(b"layer"));
        assert_eq!(bucket.metadata(key).await.unwrap().size, 5);

        bucket.delete(key).await.unwrap();
        assert!(!bucket.exists(key).await.unwrap());
    }

    #[test]
    fn config_parses_driver_tag() {
        let config: StorageConfig =
            serde_json::from_str(r#"{"driver": "local", "path": "/var/lib/registry"}"#).unwrap();
        assert!(matches!(config, StorageConfig::Local { .. }));

        let config: StorageConfig = serde_json::from_str(r#"{"driver": "memory"}"#).unwrap();
        assert!(matches!(config, StorageConfig::Memory));
    }
}
