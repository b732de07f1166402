use std::collections::HashMap;

use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use tokio::{io::AsyncWriteExt, sync::RwLock};

use storage_driver::{Driver, Metadata, Reader, StorageError, Writer};

#[derive(Debug, Clone)]
struct MemoryObject {
    created: DateTime<Utc>,
    data: Bytes,
}

impl From<Vec<u8>> for MemoryObject {
    fn from(data: Vec<u8>) -> Self {
        Self {
            created: Utc::now(),
            data: data.into(),
        }
    }
}

impl From<&MemoryObject> for Metadata {
    fn from(value: &MemoryObject) -> Self {
        Self {
            created: value.created,
            size: value.data.len() as u64,
        }
    }
}

/// Storage driver that keeps objects in memory.
///
/// Buckets are created on first write. Reads from a bucket which was never
/// written report `NotFound`, matching a bucket with no such key.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    buckets: RwLock<HashMap<String, HashMap<Utf8PathBuf, MemoryObject>>>,
}

impl MemoryStorage {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    async fn object(&self, bucket: &str, key: &Utf8Path) -> Result<MemoryObject, StorageError> {
        let buckets = self.buckets.read().await;
        buckets
            .get(bucket)
            .and_then(|objects| objects.get(key))
            .cloned()
            .ok_or_else(|| StorageError::not_found(self.name(), bucket, key.as_str()))
    }
}

#[async_trait::async_trait]
impl Driver for MemoryStorage {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn metadata(&self, bucket: &str, key: &Utf8Path) -> Result<Metadata, StorageError> {
        Ok((&self.object(bucket, key).await?).into())
    }

    async fn delete(&self, bucket: &str, key: &Utf8Path) -> Result<(), StorageError> {
        let mut buckets = self.buckets.write().await;
        if let Some(objects) = buckets.get_mut(bucket) {
            objects.remove(key);
        }
        Ok(())
    }

    async fn save_stream(
        &self,
        bucket: &str,
        key: &Utf8Path,
        reader: &mut Reader<'_>,
    ) -> Result<(), StorageError> {
        let mut buf = Vec::new();

        tokio::io::copy(reader, &mut buf)
            .await
            .map_err(|err| StorageError::from_io(self.name(), err).with_path(key.as_str()))?;

        let mut buckets = self.buckets.write().await;
        buckets
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_owned(), buf.into());

        Ok(())
    }

    async fn save(&self, bucket: &str, key: &Utf8Path, data: Bytes) -> Result<(), StorageError> {
        let mut buckets = self.buckets.write().await;
        buckets.entry(bucket.to_string()).or_default().insert(
            key.to_owned(),
            MemoryObject {
                created: Utc::now(),
                data,
            },
        );
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &Utf8Path) -> Result<Bytes, StorageError> {
        Ok(self.object(bucket, key).await?.data)
    }

    async fn get_stream(
        &self,
        bucket: &str,
        key: &Utf8Path,
        writer: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        let object = self.object(bucket, key).await?;
        let mut data: &[u8] = &object.data;

        tokio::io::copy(&mut data, writer)
            .await
            .map_err(|err| StorageError::from_io(self.name(), err))?;

        writer
            .flush()
            .await
            .map_err(|err| StorageError::from_io(self.name(), err))?;

        Ok(())
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        tracing::trace!(%bucket, ?prefix, "list memory bucket");

        let buckets = self.buckets.read().await;
        let Some(objects) = buckets.get(bucket) else {
            return Ok(Vec::new());
        };

        let mut keys: Vec<String> = objects
            .keys()
            .filter(|key| prefix.is_none_or(|prefix| key.starts_with(prefix)))
            .map(|key| key.to_string())
            .collect();
        keys.sort();
        Ok(keys)
    }
}
