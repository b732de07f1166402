//! Chunked blob uploads, staged on local disk until finalized.
//!
//! Each session owns one staging file named after its id. Chunks are appended
//! by streaming request bodies into it; finalize hashes the file, verifies the
//! client digest and persists the bytes into content-addressed storage of every
//! target repository. Sessions started on a group carry one target per routed
//! hosted member but share a single staging file.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use http_body_util::BodyExt as _;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

use crate::digest::{Algorithm, Digest};
use crate::error::{RegistryError, RegistryResult};
use crate::group::{GroupRouter, TargetOutcome};
use crate::repository::Repository;
use crate::storage::{RegistryStorage, validate_name};

/// A member repository an upload lands in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTarget {
    /// Hosted repository id.
    pub repo_id: String,
    /// Session id as seen by that member.
    pub member_uuid: String,
}

/// State of an upload in progress.
#[derive(Debug, Clone)]
pub struct UploadSession {
    /// Session id.
    pub id: String,
    /// Repository the upload was started on.
    pub repo_id: String,
    /// Image name.
    pub name: String,
    /// Staging file.
    pub path: Utf8PathBuf,
    /// Bytes received so far.
    pub offset: u64,
    /// When the session was created.
    pub started: DateTime<Utc>,
    /// Where finalize persists the blob.
    pub targets: Vec<UploadTarget>,
    /// Persist to every target instead of the first that accepts.
    pub fan_out: bool,
}

/// A finalized upload.
#[derive(Debug, Clone)]
pub struct FinalizedUpload {
    /// Digest of the stored blob.
    pub digest: Digest,
    /// Blob size.
    pub size: u64,
    /// Per-target outcome.
    pub targets: Vec<TargetOutcome>,
}

#[derive(Debug, Clone)]
struct SessionEntry {
    repo_id: String,
    started: DateTime<Utc>,
    session: Arc<tokio::sync::Mutex<UploadSession>>,
}

type SessionMap = HashMap<String, SessionEntry>;

/// Manages upload sessions and their staging files.
#[derive(Clone)]
pub struct BlobUploadStager {
    dir: Utf8PathBuf,
    ttl: Duration,
    storage: RegistryStorage,
    groups: GroupRouter,
    sessions: Arc<Mutex<SessionMap>>,
}

impl fmt::Debug for BlobUploadStager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobUploadStager")
            .field("dir", &self.dir)
            .field("ttl", &self.ttl)
            .field("sessions", &self.sessions.lock().len())
            .finish()
    }
}

impl BlobUploadStager {
    /// Stage uploads in `dir`, expiring sessions older than `ttl`.
    pub fn new(
        dir: impl Into<Utf8PathBuf>,
        ttl: Duration,
        storage: RegistryStorage,
        groups: GroupRouter,
    ) -> Self {
        Self {
            dir: dir.into(),
            ttl,
            storage,
            groups,
            sessions: Default::default(),
        }
    }

    /// The staging directory.
    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Whether no session is live.
    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    fn session(
        &self,
        repo: &Repository,
        uuid: &str,
    ) -> RegistryResult<Arc<tokio::sync::Mutex<UploadSession>>> {
        // Sessions are only visible through the repository that opened them.
        self.sessions
            .lock()
            .get(uuid)
            .filter(|entry| entry.repo_id == repo.id)
            .map(|entry| entry.session.clone())
            .ok_or_else(|| RegistryError::UploadNotFound(uuid.to_owned()))
    }

    /// Open a session on `repo`.
    ///
    /// Proxy repositories refuse uploads. Group repositories route the session
    /// to hosted members according to their write policy.
    #[tracing::instrument(level = "debug", skip(self, repo), fields(repo = %repo.id))]
    pub async fn initiate(&self, repo: &Repository, name: &str) -> RegistryResult<UploadSession> {
        validate_name(name)?;
        let id = uuid::Uuid::new_v4().to_string();

        let (targets, fan_out) = if repo.is_proxy() {
            return Err(RegistryError::Unsupported(format!(
                "proxy repository {} does not accept uploads",
                repo.id
            )));
        } else if repo.is_group() {
            let route = self.groups.upload_route(repo)?;
            let targets = route
                .targets
                .iter()
                .map(|member| UploadTarget {
                    repo_id: member.id.clone(),
                    member_uuid: uuid::Uuid::new_v4().to_string(),
                })
                .collect();
            (targets, route.fan_out)
        } else {
            let target = UploadTarget {
                repo_id: repo.id.clone(),
                member_uuid: id.clone(),
            };
            (vec![target], false)
        };

        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(&id);
        tokio::fs::File::create(&path).await?;

        let session = UploadSession {
            id: id.clone(),
            repo_id: repo.id.clone(),
            name: name.to_owned(),
            path,
            offset: 0,
            started: Utc::now(),
            targets,
            fan_out,
        };
        tracing::debug!(uuid = %id, targets = session.targets.len(), "upload started");

        let entry = SessionEntry {
            repo_id: session.repo_id.clone(),
            started: session.started,
            session: Arc::new(tokio::sync::Mutex::new(session.clone())),
        };
        self.sessions.lock().insert(id, entry);
        Ok(session)
    }

    /// Stream `body` onto the end of the staging file, returning the new size.
    ///
    /// When `start` is given it must equal the bytes received so far.
    pub async fn append<B>(
        &self,
        repo: &Repository,
        uuid: &str,
        start: Option<u64>,
        mut body: B,
    ) -> RegistryResult<u64>
    where
        B: http_body::Body<Data = Bytes> + Unpin,
        B::Error: fmt::Display,
    {
        let session = self.session(repo, uuid)?;
        let mut session = session.lock().await;

        if let Some(start) = start {
            if start != session.offset {
                return Err(RegistryError::RangeNotSatisfiable {
                    size: Some(session.offset),
                });
            }
        }

        let file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&session.path)
            .await
            .map_err(|err| match err.kind() {
                std::io::ErrorKind::NotFound => RegistryError::UploadNotFound(uuid.to_owned()),
                _ => err.into(),
            })?;
        let mut file = tokio::io::BufWriter::new(file);

        let mut written = 0u64;
        while let Some(frame) = body.frame().await {
            let frame = frame.map_err(|err| RegistryError::BlobUploadInvalid(err.to_string()))?;
            if let Ok(data) = frame.into_data() {
                file.write_all(&data).await?;
                written += data.len() as u64;
            }
        }
        file.flush().await?;

        session.offset += written;
        tracing::trace!(%uuid, written, offset = session.offset, "appended chunk");
        Ok(session.offset)
    }

    /// Append an in-memory chunk.
    pub async fn append_bytes(
        &self,
        repo: &Repository,
        uuid: &str,
        chunk: Bytes,
    ) -> RegistryResult<u64> {
        self.append(repo, uuid, None, http_body_util::Full::new(chunk))
            .await
    }

    /// Bytes received so far.
    pub async fn status(&self, repo: &Repository, uuid: &str) -> RegistryResult<u64> {
        let session = self.session(repo, uuid)?;
        let offset = session.lock().await.offset;
        Ok(offset)
    }

    /// Finish the upload.
    ///
    /// The staged bytes are hashed; a supplied digest must match, otherwise
    /// the computed SHA-256 becomes the blob's id. On success the staging file
    /// and session are removed. A digest mismatch leaves the session open.
    #[tracing::instrument(level = "debug", skip(self, repo), fields(repo = %repo.id))]
    pub async fn finalize(
        &self,
        repo: &Repository,
        uuid: &str,
        digest: Option<Digest>,
    ) -> RegistryResult<FinalizedUpload> {
        let session = self.session(repo, uuid)?;
        let session = session.lock().await;

        let algorithm = digest
            .as_ref()
            .map(Digest::algorithm)
            .unwrap_or(Algorithm::Sha256);
        let (actual, size) = hash_file(&session.path, algorithm).await.map_err(|err| {
            match err.kind() {
                std::io::ErrorKind::NotFound => RegistryError::UploadNotFound(uuid.to_owned()),
                _ => err.into(),
            }
        })?;
        if let Some(expected) = &digest {
            expected.verify(&actual)?;
        }

        let mut targets = Vec::with_capacity(session.targets.len());
        let mut first_error = None;
        for target in &session.targets {
            match self
                .storage
                .put_blob_file(&target.repo_id, &actual, &session.path)
                .await
            {
                Ok(()) => {
                    targets.push(TargetOutcome {
                        repo_id: target.repo_id.clone(),
                        error: None,
                    });
                    if !session.fan_out {
                        break;
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        target = %target.repo_id,
                        error = %err,
                        "persisting blob failed",
                    );
                    targets.push(TargetOutcome {
                        repo_id: target.repo_id.clone(),
                        error: Some(err.to_string()),
                    });
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }

        if targets.iter().all(|t| t.error.is_some()) {
            return Err(first_error.unwrap_or_else(|| {
                RegistryError::BlobUploadInvalid(format!("upload {uuid} has no targets"))
            }));
        }

        remove_staging_file(&session.path).await;
        self.sessions.lock().remove(uuid);
        tracing::debug!(digest = %actual, size, "upload finalized");

        Ok(FinalizedUpload {
            digest: actual,
            size,
            targets,
        })
    }

    /// Cancel the upload, dropping everything staged.
    pub async fn abort(&self, repo: &Repository, uuid: &str) -> RegistryResult<()> {
        let session = self.session(repo, uuid)?;
        let session = session.lock().await;
        remove_staging_file(&session.path).await;
        self.sessions.lock().remove(uuid);
        tracing::debug!(%uuid, "upload aborted");
        Ok(())
    }

    /// Remove sessions started before `now - ttl`, and staging files that old
    /// with no session at all. Sessions busy with a request are left alone.
    /// Returns the number of sessions and files removed.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> RegistryResult<usize> {
        let Ok(ttl) = chrono::TimeDelta::from_std(self.ttl) else {
            return Ok(0);
        };
        let cutoff = now - ttl;

        let expired: Vec<(String, Utf8PathBuf)> = {
            let mut sessions = self.sessions.lock();
            let expired: Vec<_> = sessions
                .iter()
                .filter(|(_, entry)| entry.started < cutoff)
                .filter_map(|(id, entry)| {
                    let session = entry.session.try_lock().ok()?;
                    Some((id.clone(), session.path.clone()))
                })
                .collect();
            for (id, _) in &expired {
                sessions.remove(id);
            }
            expired
        };

        let mut removed = expired.len();
        for (id, path) in &expired {
            tracing::info!(uuid = %id, "sweeping abandoned upload");
            remove_staging_file(path).await;
        }

        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(removed),
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if self.sessions.lock().contains_key(&name) {
                continue;
            }
            let modified = entry.metadata().await?.modified()?;
            if DateTime::<Utc>::from(modified) < cutoff {
                tracing::info!(file = %name, "sweeping orphaned staging file");
                if tokio::fs::remove_file(entry.path()).await.is_ok() {
                    removed += 1;
                }
            }
        }

        Ok(removed)
    }
}

async fn hash_file(path: &Utf8Path, algorithm: Algorithm) -> std::io::Result<(Digest, u64)> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = algorithm.hasher();
    let mut buf = vec![0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((hasher.finish(), size))
}

async fn remove_staging_file(path: &Utf8Path) {
    if let Err(err) = tokio::fs::remove_file(path).await {
        if err.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(%path, error = %err, "could not remove staging file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{RepositoryCatalog, WritePolicy};
    use storage::{MemoryStorage, Storage};

    struct Fixture {
        _dir: tempfile::TempDir,
        storage: RegistryStorage,
        catalog: RepositoryCatalog,
        stager: BlobUploadStager,
    }

    fn fixture(ttl: Duration) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().to_owned()).unwrap();
        let backend: Storage = MemoryStorage::new().into();
        let storage = RegistryStorage::new(backend.bucket("registry"));
        let catalog = RepositoryCatalog::new();
        catalog.upsert(Repository::hosted("a", "a")).unwrap();
        catalog.upsert(Repository::hosted("b", "b")).unwrap();
        catalog
            .upsert(Repository::proxy(
                "hub",
                "hub",
                "http://upstream.test".parse().unwrap(),
            ))
            .unwrap();
        let stager = BlobUploadStager::new(
            path,
            ttl,
            storage.clone(),
            GroupRouter::new(catalog.clone()),
        );
        Fixture {
            _dir: dir,
            storage,
            catalog,
            stager,
        }
    }

    #[tokio::test]
    async fn chunks_accumulate_and_finalize_by_hash() {
        let f = fixture(Duration::from_secs(60));
        let repo = f.catalog.get("a").unwrap();

        let session = f.stager.initiate(&repo, "app").await.unwrap();
        assert_eq!(
            f.stager
                .append_bytes(&repo, &session.id, Bytes::from_static(b"hello-"))
                .await
                .unwrap(),
            6
        );
        assert_eq!(
            f.stager
                .append_bytes(&repo, &session.id, Bytes::from_static(b"world"))
                .await
                .unwrap(),
            11
        );
        assert_eq!(f.stager.status(&repo, &session.id).await.unwrap(), 11);

        let done = f.stager.finalize(&repo, &session.id, None).await.unwrap();
        assert_eq!(done.digest, Digest::sha256(b"hello-world"));
        assert_eq!(done.size, 11);
        assert!(f.storage.blob_exists("a", &done.digest).await.unwrap());
        assert!(!session.path.exists());
        assert!(f.stager.is_empty());
    }

    #[tokio::test]
    async fn wrong_digest_is_rejected() {
        let f = fixture(Duration::from_secs(60));
        let repo = f.catalog.get("a").unwrap();
        let session = f.stager.initiate(&repo, "app").await.unwrap();
        f.stager
            .append_bytes(&repo, &session.id, Bytes::from_static(b"payload"))
            .await
            .unwrap();

        let err = f
            .stager
            .finalize(&repo, &session.id, Some(Digest::sha256(b"other")))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::DigestMismatch { .. }));
        assert!(!f.storage.blob_exists("a", &Digest::sha256(b"payload")).await.unwrap());

        let done = f
            .stager
            .finalize(&repo, &session.id, Some(Digest::sha256(b"payload")))
            .await
            .unwrap();
        assert_eq!(done.digest, Digest::sha256(b"payload"));
    }

    #[tokio::test]
    async fn out_of_order_chunks_are_refused() {
        let f = fixture(Duration::from_secs(60));
        let repo = f.catalog.get("a").unwrap();
        let session = f.stager.initiate(&repo, "app").await.unwrap();

        let err = f
            .stager
            .append(
                &repo,
                &session.id,
                Some(4),
                http_body_util::Full::new(Bytes::from_static(b"late")),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::RangeNotSatisfiable { size: Some(0) }));
    }

    #[tokio::test]
    async fn proxy_uploads_are_refused() {
        let f = fixture(Duration::from_secs(60));
        let repo = f.catalog.get("hub").unwrap();
        let err = f.stager.initiate(&repo, "app").await.unwrap_err();
        assert!(matches!(err, RegistryError::Unsupported(_)));
    }

    #[tokio::test]
    async fn mirror_groups_persist_to_every_member() {
        let f = fixture(Duration::from_secs(60));
        let group = f
            .catalog
            .upsert(Repository::group("g", "g", ["hub", "a", "b"], WritePolicy::Mirror))
            .unwrap();

        let session = f.stager.initiate(&group, "app").await.unwrap();
        assert_eq!(session.targets.len(), 2);
        f.stager
            .append_bytes(&group, &session.id, Bytes::from_static(b"layer"))
            .await
            .unwrap();
        let done = f.stager.finalize(&group, &session.id, None).await.unwrap();

        assert_eq!(done.targets.len(), 2);
        assert!(f.storage.blob_exists("a", &done.digest).await.unwrap());
        assert!(f.storage.blob_exists("b", &done.digest).await.unwrap());
    }

    #[tokio::test]
    async fn sessions_belong_to_their_repository() {
        let f = fixture(Duration::from_secs(60));
        let a = f.catalog.get("a").unwrap();
        let b = f.catalog.get("b").unwrap();
        let session = f.stager.initiate(&a, "app").await.unwrap();

        let err = f.stager.status(&b, &session.id).await.unwrap_err();
        assert!(matches!(err, RegistryError::UploadNotFound(_)));
    }

    #[tokio::test]
    async fn abort_and_sweep_clean_up() {
        let f = fixture(Duration::from_secs(60));
        let repo = f.catalog.get("a").unwrap();

        let aborted = f.stager.initiate(&repo, "app").await.unwrap();
        f.stager.abort(&repo, &aborted.id).await.unwrap();
        assert!(!aborted.path.exists());
        assert!(f.stager.status(&repo, &aborted.id).await.is_err());

        let abandoned = f.stager.initiate(&repo, "app").await.unwrap();
        let orphan = f.stager.dir().join("orphan");
        tokio::fs::write(&orphan, b"x").await.unwrap();

        assert_eq!(f.stager.sweep_expired(Utc::now()).await.unwrap(), 0);

        let later = Utc::now() + chrono::Duration::minutes(5);
        assert_eq!(f.stager.sweep_expired(later).await.unwrap(), 2);
        assert!(!abandoned.path.exists());
        assert!(!orphan.exists());
        assert!(f.stager.is_empty());
    }
}
