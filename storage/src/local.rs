use std::sync::atomic::{AtomicU64, Ordering};

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use eyre::WrapErr;
use tokio::io::AsyncWriteExt;
use tracing::Instrument;

use storage_driver::{Driver, Metadata, Reader, StorageError, StorageErrorKind, Writer};

static PARTIAL_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Storage driver backed by a directory tree: `<root>/<bucket>/<key>`.
#[derive(Debug)]
pub struct LocalDriver {
    root: Utf8PathBuf,
}

impl LocalDriver {
    /// Store objects under `root`.
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    fn path(&self, bucket: &str, key: &Utf8Path) -> Result<Utf8PathBuf, StorageError> {
        let escapes = key
            .components()
            .any(|c| !matches!(c, Utf8Component::Normal(_)));
        if escapes || bucket.contains('/') || bucket.is_empty() {
            return Err(StorageError::builder(
                self.name(),
                StorageErrorKind::InvalidRequest,
                eyre::eyre!("key must be a relative path inside the bucket"),
            )
            .bucket(bucket)
            .path(key.as_str())
            .build());
        }
        Ok(self.root.join(bucket).join(key))
    }

    fn io_error(&self, bucket: &str, key: &Utf8Path) -> impl Fn(std::io::Error) -> StorageError {
        let engine = self.name();
        let bucket = bucket.to_owned();
        let key = key.to_string();
        move |err| {
            StorageError::from_io(engine, err)
                .with_bucket(bucket.clone())
                .with_path(key.clone())
        }
    }
}

#[async_trait::async_trait]
impl Driver for LocalDriver {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn metadata(&self, bucket: &str, key: &Utf8Path) -> Result<Metadata, StorageError> {
        let path = self.path(bucket, key)?;
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(self.io_error(bucket, key))?;
        let created = metadata.modified().map_err(self.io_error(bucket, key))?;
        Ok(Metadata {
            size: metadata.len(),
            created: created.into(),
        })
    }

    async fn delete(&self, bucket: &str, key: &Utf8Path) -> Result<(), StorageError> {
        let path = self.path(bucket, key)?;
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(self.io_error(bucket, key)(err)),
        }
    }

    async fn save_stream(
        &self,
        bucket: &str,
        key: &Utf8Path,
        reader: &mut Reader<'_>,
    ) -> Result<(), StorageError> {
        let path = self.path(bucket, key)?;
        let parent = path.parent().unwrap_or(&self.root).to_owned();

        tokio::fs::create_dir_all(&parent)
            .await
            .map_err(self.io_error(bucket, key))?;

        // Write next to the destination and rename, so readers never observe a
        // partially written object.
        let partial = parent.join(format!(
            ".{}.partial-{}-{}",
            path.file_name().unwrap_or("object"),
            std::process::id(),
            PARTIAL_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));

        let result = async {
            let mut writer = tokio::io::BufWriter::new(tokio::fs::File::create(&partial).await?);
            tokio::io::copy(reader, &mut writer).await?;
            writer.shutdown().await?;
            tokio::fs::rename(&partial, &path).await
        }
        .await;

        if let Err(err) = result {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(self.io_error(bucket, key)(err));
        }
        Ok(())
    }

    async fn get_stream(
        &self,
        bucket: &str,
        key: &Utf8Path,
        writer: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        let path = self.path(bucket, key)?;

        let mut reader = tokio::io::BufReader::new(
            tokio::fs::File::open(&path)
                .await
                .map_err(self.io_error(bucket, key))?,
        );

        tokio::io::copy(&mut reader, writer)
            .await
            .map_err(self.io_error(bucket, key))?;

        writer.flush().await.map_err(self.io_error(bucket, key))?;

        Ok(())
    }

    fn get_url(&self, bucket: &str, key: &Utf8Path) -> Option<String> {
        self.path(bucket, key).ok().map(|path| format!("file://{path}"))
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        let root = self.root.join(bucket);
        let prefix = prefix.map(|p| p.to_owned());

        let items = tokio::task::spawn_blocking(move || collect_list(&root, prefix.as_deref()))
            .in_current_span()
            .await
            .wrap_err("local driver: list task")
            .map_err(|err| StorageError::new("local", StorageErrorKind::Other, err))?
            .map_err(|err| StorageError::new("local", StorageErrorKind::Io, err))?;

        tracing::debug!("Found {} entries", items.len());
        Ok(items)
    }
}

/// Walk `root` and return every file's key relative to it, filtered by prefix.
#[tracing::instrument]
fn collect_list(root: &Utf8Path, prefix: Option<&Utf8Path>) -> eyre::Result<Vec<String>> {
    let mut files = Vec::new();
    if root.is_dir() {
        visit(root, &mut files)?;
    }

    let mut keys: Vec<String> = files
        .into_iter()
        .filter_map(|p| p.strip_prefix(root).ok().map(|p| p.to_owned()))
        .filter(|p| !p.file_name().is_some_and(|name| name.starts_with('.')))
        .filter(|p| prefix.is_none_or(|prefix| p.starts_with(prefix)))
        .map(|p| p.to_string())
        .collect();
    keys.sort();
    Ok(keys)
}

fn visit(path: &Utf8Path, files: &mut Vec<Utf8PathBuf>) -> eyre::Result<()> {
    for entry in path.read_dir_utf8()? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            visit(entry.path(), files)?;
        } else {
            files.push(entry.path().to_owned())
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn driver() -> (tempfile::TempDir, LocalDriver) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_owned()).unwrap();
        (dir, LocalDriver::new(root))
    }

    #[tokio::test]
    async fn save_get_list_delete() {
        let (_dir, driver) = driver();

        driver
            .save("registry", Utf8Path::new("repo/blobs/sha256/aa"), Bytes::from_static(b"one"))
            .await
            .unwrap();
        driver
            .save("registry", Utf8Path::new("repo/tags/latest"), Bytes::from_static(b"two"))
            .await
            .unwrap();

        assert_eq!(
            driver
                .get("registry", Utf8Path::new("repo/blobs/sha256/aa"))
                .await
                .unwrap(),
            Bytes::from_static(b"one")
        );

        let keys = driver
            .list("registry", Some(Utf8Path::new("repo/tags")))
            .await
            .unwrap();
        assert_eq!(keys, vec!["repo/tags/latest"]);

        driver
            .delete("registry", Utf8Path::new("repo/tags/latest"))
            .await
            .unwrap();
        driver
            .delete("registry", Utf8Path::new("repo/tags/latest"))
            .await
            .unwrap();
        assert!(!driver
            .exists("registry", Utf8Path::new("repo/tags/latest"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn keys_cannot_escape_bucket() {
        let (_dir, driver) = driver();
        let err = driver
            .save("registry", Utf8Path::new("../outside"), Bytes::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::InvalidRequest);
    }

    #[tokio::test]
    async fn url_points_at_file() {
        let (_dir, driver) = driver();
        let url = driver
            .get_url("registry", Utf8Path::new("repo/blobs/x"))
            .unwrap();
        assert!(url.starts_with("file://"));
        assert!(url.ends_with("registry/repo/blobs/x"));
    }
}
