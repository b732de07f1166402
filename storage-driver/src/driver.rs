use std::{fmt, ops::Deref, sync::Arc};

use bytes::Bytes;
use camino::Utf8Path;
use chrono::{DateTime, Utc};
use tokio::io;

use crate::error::{StorageError, StorageErrorKind};

/// A reader stream for object contents.
pub type Reader<'r> = dyn io::AsyncBufRead + Unpin + Send + Sync + 'r;

/// A writer stream for object contents.
pub type Writer<'w> = dyn io::AsyncWrite + Unpin + Send + Sync + 'w;

/// Object metadata, provided generically by every driver.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Metadata {
    /// The size of the object in bytes.
    pub size: u64,

    /// When the object was last written.
    pub created: DateTime<Utc>,
}

/// A storage driver, which provides key/value blob storage grouped into buckets.
///
/// Only the streaming primitives are required; the buffered helpers
/// (`save`, `get`, `exists`) are derived from them.
#[async_trait::async_trait]
pub trait Driver: fmt::Debug {
    /// The name of the driver, used in logs and errors.
    fn name(&self) -> &'static str;

    /// Store an object, reading its contents from a stream.
    async fn save_stream(
        &self,
        bucket: &str,
        key: &Utf8Path,
        reader: &mut Reader<'_>,
    ) -> Result<(), StorageError>;

    /// Write an object's contents into a stream.
    async fn get_stream(
        &self,
        bucket: &str,
        key: &Utf8Path,
        writer: &mut Writer<'_>,
    ) -> Result<(), StorageError>;

    /// Get the metadata for an object.
    async fn metadata(&self, bucket: &str, key: &Utf8Path) -> Result<Metadata, StorageError>;

    /// Delete an object. Deleting a missing object is not an error.
    async fn delete(&self, bucket: &str, key: &Utf8Path) -> Result<(), StorageError>;

    /// List object keys in a bucket, optionally filtered by a prefix.
    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError>;

    /// A URL which can be handed to a client to fetch the object directly, if the
    /// backend supports one.
    fn get_url(&self, bucket: &str, key: &Utf8Path) -> Option<String> {
        let _ = (bucket, key);
        None
    }

    /// Store an in-memory object.
    async fn save(&self, bucket: &str, key: &Utf8Path, data: Bytes) -> Result<(), StorageError> {
        let mut reader: &[u8] = &data;
        self.save_stream(bucket, key, &mut reader).await
    }

    /// Read a whole object into memory.
    async fn get(&self, bucket: &str, key: &Utf8Path) -> Result<Bytes, StorageError> {
        let mut buf: Vec<u8> = Vec::new();
        self.get_stream(bucket, key, &mut buf).await?;
        Ok(Bytes::from(buf))
    }

    /// Check whether an object exists.
    async fn exists(&self, bucket: &str, key: &Utf8Path) -> Result<bool, StorageError> {
        match self.metadata(bucket, key).await {
            Ok(_) => Ok(true),
            Err(error) if error.kind() == StorageErrorKind::NotFound => Ok(false),
            Err(error) => Err(error),
        }
    }

    /// Store an object from a local file.
    async fn save_file(
        &self,
        bucket: &str,
        key: &Utf8Path,
        local: &Utf8Path,
    ) -> Result<(), StorageError> {
        tracing::trace!(%key, %local, "Saving from file: {local}");
        let file = tokio::fs::File::open(local)
            .await
            .map_err(|err| StorageError::from_io(self.name(), err).with_path(local.as_str()))?;
        let mut reader = io::BufReader::new(file);
        self.save_stream(bucket, key, &mut reader).await
    }
}

#[async_trait::async_trait]
impl<D> Driver for Arc<D>
where
    D: ?Sized + Driver + Sync + Send + 'static,
{
    fn name(&self) -> &'static str {
        self.deref().name()
    }

    async fn save_stream(
        &self,
        bucket: &str,
        key: &Utf8Path,
        reader: &mut Reader<'_>,
    ) -> Result<(), StorageError> {
        self.deref().save_stream(bucket, key, reader).await
    }

    async fn get_stream(
        &self,
        bucket: &str,
        key: &Utf8Path,
        writer: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        self.deref().get_stream(bucket, key, writer).await
    }

    async fn metadata(&self, bucket: &str, key: &Utf8Path) -> Result<Metadata, StorageError> {
        self.deref().metadata(bucket, key).await
    }

    async fn delete(&self, bucket: &str, key: &Utf8Path) -> Result<(), StorageError> {
        self.deref().delete(bucket, key).await
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        self.deref().list(bucket, prefix).await
    }

    fn get_url(&self, bucket: &str, key: &Utf8Path) -> Option<String> {
        self.deref().get_url(bucket, key)
    }
}
