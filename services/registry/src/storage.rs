//! Storage layout for registry content.
//!
//! Everything lives in one bucket, scoped by repository id:
//!
//! ```text
//! <repo>/blobs/<algorithm>/<hex>
//! <repo>/manifests/<name>/tags/<tag>
//! <repo>/manifests/<name>/digests/<algorithm>/<hex>
//! <repo>/manifests/<name>/types/<algorithm>/<hex>
//! ```
//!
//! Manifests are written under both keys, so tag and digest lookups are each a
//! single read. The `types` entry records the media type the manifest was
//! pushed with.

use std::collections::{BTreeMap, BTreeSet};

use axum::body::Body;
use bytes::{Bytes, BytesMut};
use camino::{Utf8Path, Utf8PathBuf};
use storage::{Metadata, StorageBucket, StorageError};
use tokio::io::AsyncReadExt as _;

use crate::digest::{Digest, is_digest_reference};
use crate::error::{RegistryError, RegistryResult};
use crate::validate::ParsedManifest;

/// Media type used when a stored manifest does not declare one.
pub const DEFAULT_MANIFEST_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";

const STREAM_CHUNK: usize = 64 * 1024;

/// A manifest read back from storage.
#[derive(Debug, Clone)]
pub struct StoredManifest {
    /// Raw manifest bytes, exactly as pushed.
    pub bytes: Bytes,
    /// Digest of `bytes`.
    pub digest: Digest,
    /// Media type the manifest was pushed with.
    pub media_type: String,
}

impl StoredManifest {
    /// Wrap manifest bytes with their media type, computing the digest.
    pub fn new(bytes: Bytes, media_type: impl Into<String>) -> Self {
        Self {
            digest: Digest::sha256(&bytes),
            bytes,
            media_type: media_type.into(),
        }
    }

    /// Wrap manifest bytes whose media type was not recorded, reading it from
    /// the body.
    pub fn detect(bytes: Bytes) -> Self {
        let media_type = ParsedManifest::parse(&bytes, None)
            .map(|parsed| parsed.media_type)
            .unwrap_or_else(|_| DEFAULT_MANIFEST_TYPE.to_owned());
        Self::new(bytes, media_type)
    }
}

/// Content of a blob or manifest, either in memory or still in storage.
#[derive(Debug, Clone)]
pub enum Content {
    /// Bytes already read.
    Bytes(Bytes),
    /// An object in a bucket, read when the body is consumed.
    Stored {
        /// Bucket holding the object.
        bucket: StorageBucket,
        /// Object key.
        key: Utf8PathBuf,
        /// Object size in bytes.
        size: u64,
    },
}

impl Content {
    /// Size in bytes.
    pub fn size(&self) -> u64 {
        match self {
            Content::Bytes(bytes) => bytes.len() as u64,
            Content::Stored { size, .. } => *size,
        }
    }

    /// Read everything into memory.
    pub async fn bytes(&self) -> RegistryResult<Bytes> {
        match self {
            Content::Bytes(bytes) => Ok(bytes.clone()),
            Content::Stored { bucket, key, .. } => Ok(bucket.get(key).await?),
        }
    }

    /// A response body for the whole content, or for the inclusive byte range
    /// `start..=end`. Stored objects are streamed.
    pub fn into_body(self, range: Option<(u64, u64)>) -> Body {
        match (self, range) {
            (Content::Bytes(bytes), Some((start, end))) => {
                Body::from(bytes.slice(start as usize..=end as usize))
            }
            (Content::Bytes(bytes), None) => Body::from(bytes),
            (Content::Stored { bucket, key, size }, range) => {
                let (skip, take) = match range {
                    Some((start, end)) => (start, end + 1 - start),
                    None => (0, size),
                };
                stream_object(bucket, key, skip, take)
            }
        }
    }
}

/// Stream `take` bytes of an object, starting `skip` bytes in.
fn stream_object(bucket: StorageBucket, key: Utf8PathBuf, skip: u64, take: u64) -> Body {
    let (mut writer, reader) = tokio::io::duplex(STREAM_CHUNK);
    tokio::spawn(async move {
        // Fails with a broken pipe once a range is served or the client leaves.
        if let Err(err) = bucket.get_stream(&key, &mut writer).await {
            tracing::debug!(%key, error = %err, "stopped streaming stored object");
        }
    });

    let chunks = futures::stream::try_unfold(
        (reader.take(skip + take), skip),
        |(mut reader, skip)| async move {
            if skip > 0 {
                tokio::io::copy(&mut (&mut reader).take(skip), &mut tokio::io::sink()).await?;
            }
            let mut chunk = BytesMut::with_capacity(STREAM_CHUNK);
            if reader.read_buf(&mut chunk).await? == 0 {
                return Ok::<_, std::io::Error>(None);
            }
            Ok(Some((chunk.freeze(), (reader, 0))))
        },
    );
    Body::from_stream(chunks)
}

/// Registry content storage backed by a single bucket.
#[derive(Clone, Debug)]
pub struct RegistryStorage {
    bucket: StorageBucket,
}

impl RegistryStorage {
    /// Store registry content in `bucket`.
    pub fn new(bucket: StorageBucket) -> Self {
        Self { bucket }
    }

    /// The underlying bucket.
    pub(crate) fn bucket(&self) -> &StorageBucket {
        &self.bucket
    }

    fn blob_key(repo: &str, digest: &Digest) -> Utf8PathBuf {
        Utf8PathBuf::from(format!(
            "{repo}/blobs/{}/{}",
            digest.algorithm().as_str(),
            digest.hex()
        ))
    }

    fn tag_key(repo: &str, name: &str, tag: &str) -> Utf8PathBuf {
        Utf8PathBuf::from(format!("{repo}/manifests/{name}/tags/{tag}"))
    }

    fn manifest_digest_key(repo: &str, name: &str, digest: &Digest) -> Utf8PathBuf {
        Utf8PathBuf::from(format!(
            "{repo}/manifests/{name}/digests/{}/{}",
            digest.algorithm().as_str(),
            digest.hex()
        ))
    }

    fn media_type_key(repo: &str, name: &str, digest: &Digest) -> Utf8PathBuf {
        Utf8PathBuf::from(format!(
            "{repo}/manifests/{name}/types/{}/{}",
            digest.algorithm().as_str(),
            digest.hex()
        ))
    }

    fn reference_key(repo: &str, name: &str, reference: &str) -> RegistryResult<Utf8PathBuf> {
        if is_digest_reference(reference) {
            let digest: Digest = reference.parse()?;
            Ok(Self::manifest_digest_key(repo, name, &digest))
        } else {
            validate_tag(reference)?;
            Ok(Self::tag_key(repo, name, reference))
        }
    }

    /// Whether `repo` holds the blob.
    pub async fn blob_exists(&self, repo: &str, digest: &Digest) -> RegistryResult<bool> {
        Ok(self.bucket.exists(&Self::blob_key(repo, digest)).await?)
    }

    /// Size and creation time of a blob.
    pub async fn blob_metadata(&self, repo: &str, digest: &Digest) -> RegistryResult<Metadata> {
        self.bucket
            .metadata(&Self::blob_key(repo, digest))
            .await
            .map_err(|err| not_found(err, || RegistryError::BlobNotFound(digest.to_string())))
    }

    /// A blob's content, streamed from storage when consumed.
    pub async fn blob(&self, repo: &str, digest: &Digest) -> RegistryResult<Content> {
        let metadata = self.blob_metadata(repo, digest).await?;
        Ok(Content::Stored {
            bucket: self.bucket.clone(),
            key: Self::blob_key(repo, digest),
            size: metadata.size,
        })
    }

    /// Store a blob after checking its content against `digest`.
    pub async fn put_blob(&self, repo: &str, digest: &Digest, data: Bytes) -> RegistryResult<()> {
        digest.verify(&Digest::compute(digest.algorithm(), &data))?;
        self.bucket.save(&Self::blob_key(repo, digest), data).await?;
        Ok(())
    }

    /// Store a blob from a local file whose content is already verified.
    pub async fn put_blob_file(
        &self,
        repo: &str,
        digest: &Digest,
        local: &Utf8Path,
    ) -> RegistryResult<()> {
        self.bucket
            .save_file(&Self::blob_key(repo, digest), local)
            .await?;
        Ok(())
    }

    /// Delete a blob. Deleting a missing blob reports not found.
    pub async fn delete_blob(&self, repo: &str, digest: &Digest) -> RegistryResult<()> {
        let key = Self::blob_key(repo, digest);
        if !self.bucket.exists(&key).await? {
            return Err(RegistryError::BlobNotFound(digest.to_string()));
        }
        self.bucket.delete(&key).await?;
        Ok(())
    }

    /// Read a manifest by tag or digest.
    pub async fn get_manifest(
        &self,
        repo: &str,
        name: &str,
        reference: &str,
    ) -> RegistryResult<StoredManifest> {
        let key = Self::reference_key(repo, name, reference)?;
        let bytes = self.bucket.get(&key).await.map_err(|err| {
            not_found(err, || {
                RegistryError::ManifestNotFound(format!("{name}:{reference}"))
            })
        })?;
        let digest = Digest::sha256(&bytes);
        match self
            .bucket
            .get(&Self::media_type_key(repo, name, &digest))
            .await
        {
            Ok(media_type) => Ok(StoredManifest::new(
                bytes,
                String::from_utf8_lossy(&media_type).into_owned(),
            )),
            Err(err) if err.is_not_found() => Ok(StoredManifest::detect(bytes)),
            Err(err) => Err(err.into()),
        }
    }

    /// Whether a manifest exists for the tag or digest.
    pub async fn manifest_exists(
        &self,
        repo: &str,
        name: &str,
        reference: &str,
    ) -> RegistryResult<bool> {
        let key = Self::reference_key(repo, name, reference)?;
        Ok(self.bucket.exists(&key).await?)
    }

    /// Persist a manifest under its digest, and under `tag` when given.
    pub async fn put_manifest(
        &self,
        repo: &str,
        name: &str,
        tag: Option<&str>,
        manifest: &StoredManifest,
    ) -> RegistryResult<()> {
        validate_name(name)?;
        if let Some(tag) = tag {
            validate_tag(tag)?;
            self.bucket
                .save(&Self::tag_key(repo, name, tag), manifest.bytes.clone())
                .await?;
        }
        self.bucket
            .save(
                &Self::media_type_key(repo, name, &manifest.digest),
                Bytes::from(manifest.media_type.clone()),
            )
            .await?;
        self.bucket
            .save(
                &Self::manifest_digest_key(repo, name, &manifest.digest),
                manifest.bytes.clone(),
            )
            .await?;
        tracing::debug!(%repo, %name, ?tag, digest = %manifest.digest, "stored manifest");
        Ok(())
    }

    /// Delete a manifest.
    ///
    /// Deleting by digest also removes every tag pointing at it. Deleting by
    /// tag leaves the digest-addressed copy in place.
    pub async fn delete_manifest(
        &self,
        repo: &str,
        name: &str,
        reference: &str,
    ) -> RegistryResult<()> {
        let key = Self::reference_key(repo, name, reference)?;
        if !self.bucket.exists(&key).await? {
            return Err(RegistryError::ManifestNotFound(format!("{name}:{reference}")));
        }

        if is_digest_reference(reference) {
            for (tag, digest) in self.tag_digests(repo, name).await? {
                if digest.to_string() == reference {
                    self.bucket.delete(&Self::tag_key(repo, name, &tag)).await?;
                }
            }
            let digest: Digest = reference.parse()?;
            self.bucket
                .delete(&Self::media_type_key(repo, name, &digest))
                .await?;
        }

        self.bucket.delete(&key).await?;
        Ok(())
    }

    /// Tags of an image, sorted.
    pub async fn list_tags(&self, repo: &str, name: &str) -> RegistryResult<Vec<String>> {
        let prefix = Utf8PathBuf::from(format!("{repo}/manifests/{name}/tags/"));
        let mut tags: Vec<String> = self
            .bucket
            .list(Some(&prefix))
            .await?
            .into_iter()
            .filter_map(|key| {
                key.strip_prefix(prefix.as_str())
                    .filter(|tag| !tag.contains('/'))
                    .map(str::to_owned)
            })
            .collect();
        tags.sort();
        Ok(tags)
    }

    /// Every tag of an image with the digest of the manifest it names.
    pub async fn tag_digests(
        &self,
        repo: &str,
        name: &str,
    ) -> RegistryResult<BTreeMap<String, Digest>> {
        let mut tags = BTreeMap::new();
        for tag in self.list_tags(repo, name).await? {
            match self.bucket.get(&Self::tag_key(repo, name, &tag)).await {
                Ok(bytes) => {
                    tags.insert(tag, Digest::sha256(&bytes));
                }
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(tags)
    }

    /// Image names with at least one manifest in `repo`, sorted.
    pub async fn catalog(&self, repo: &str) -> RegistryResult<Vec<String>> {
        let prefix = Utf8PathBuf::from(format!("{repo}/manifests/"));
        let names: BTreeSet<String> = self
            .bucket
            .list(Some(&prefix))
            .await?
            .iter()
            .filter_map(|key| key.strip_prefix(prefix.as_str()))
            .filter_map(image_name_from_key)
            .collect();
        Ok(names.into_iter().collect())
    }
}

/// Recover the image name from `<name>/tags/<tag>` or `<name>/digests/<algo>/<hex>`.
fn image_name_from_key(key: &str) -> Option<String> {
    let (head, _tag) = key.rsplit_once('/')?;
    if let Some(name) = head.strip_suffix("/tags") {
        return Some(name.to_owned());
    }
    let (head, _algorithm) = head.rsplit_once('/')?;
    head.strip_suffix("/digests").map(str::to_owned)
}

fn not_found(err: StorageError, missing: impl FnOnce() -> RegistryError) -> RegistryError {
    if err.is_not_found() {
        missing()
    } else {
        err.into()
    }
}

/// Check an image name: `/`-separated lowercase components, each of
/// alphanumerics joined by single `.`, `_`, `__` or `-` runs.
pub fn validate_name(name: &str) -> RegistryResult<()> {
    let invalid = || RegistryError::InvalidName(name.to_owned());
    if name.is_empty() || name.len() > 255 {
        return Err(invalid());
    }

    for component in name.split('/') {
        let bytes = component.as_bytes();
        let alnum = |b: &u8| b.is_ascii_lowercase() || b.is_ascii_digit();
        if bytes.is_empty() || !alnum(&bytes[0]) || !alnum(&bytes[bytes.len() - 1]) {
            return Err(invalid());
        }
        if !bytes
            .iter()
            .all(|b| alnum(b) || matches!(b, b'.' | b'_' | b'-'))
        {
            return Err(invalid());
        }
        if component.contains("..") || component.contains("._") || component.contains("_.") {
            return Err(invalid());
        }
    }
    Ok(())
}

/// Check a tag: up to 128 word characters, dots and dashes, not starting with either.
pub fn validate_tag(tag: &str) -> RegistryResult<()> {
    let word = |b: u8| b.is_ascii_alphanumeric() || b == b'_';
    let valid = !tag.is_empty()
        && tag.len() <= 128
        && tag.bytes().next().is_some_and(word)
        && tag.bytes().all(|b| word(b) || b == b'.' || b == b'-');
    if valid {
        Ok(())
    } else {
        Err(RegistryError::InvalidTag(tag.to_owned()))
    }
}
