//! Read-through cache in front of a proxy repository's upstream.
//!
//! Payloads are stored at `proxy/<repo>/<path>` with a JSON sidecar at
//! `proxy-meta/<repo>/<path>` recording when they were fetched. Cache misses
//! are fetched under a per-key lock, so concurrent misses for the same path
//! produce a single upstream request. Upstream bodies are streamed into
//! storage and hashed on the way.

use std::time::Duration;

use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use http::{HeaderValue, StatusCode, header};
use http_body_util::BodyExt as _;
use serde::{Deserialize, Serialize};
use storage::StorageBucket;
use tokio::io::AsyncWriteExt as _;
use upstream::uri::UriExtension as _;
use upstream::{FetchBody, FetchOptions, UpstreamFetcher};

use crate::digest::{Algorithm, Digest};
use crate::error::{RegistryError, RegistryResult};
use crate::repository::Repository;
use crate::storage::Content;

/// Manifest media types requested from upstreams.
pub const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.index.v1+json, \
application/vnd.oci.image.manifest.v1+json, \
application/vnd.docker.distribution.manifest.list.v2+json, \
application/vnd.docker.distribution.manifest.v2+json, \
application/vnd.docker.distribution.manifest.v1+prettyjws, \
application/json";

const UPSTREAM_DIGEST: &str = "docker-content-digest";

const STREAM_BUFFER: usize = 64 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheMeta {
    fetched_at: DateTime<Utc>,
    #[serde(default)]
    content_type: Option<String>,
    digest: String,
    #[serde(default)]
    upstream_digest: Option<String>,
}

/// A payload served from the proxy cache.
#[derive(Debug, Clone)]
pub struct CachedObject {
    /// The payload, still in storage.
    pub content: Content,
    /// Upstream `Content-Type`.
    pub content_type: Option<String>,
    /// Digest of the payload: with the requested algorithm when the request
    /// named a digest, SHA-256 otherwise.
    pub digest: Digest,
    /// `Docker-Content-Digest` reported by the upstream, if any.
    pub upstream_digest: Option<String>,
    /// When the payload was fetched.
    pub fetched_at: DateTime<Utc>,
    /// Served past its TTL because the upstream failed.
    pub stale: bool,
}

impl CachedObject {
    fn is_fresh(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        match chrono::TimeDelta::from_std(ttl) {
            Ok(ttl) => now - self.fetched_at < ttl,
            Err(_) => true,
        }
    }

    fn satisfies(&self, expected: Option<&Digest>) -> bool {
        expected.is_none_or(|expected| *expected == self.digest)
    }
}

/// Cache of upstream content for proxy repositories.
#[derive(Debug, Clone)]
pub struct ProxyCache {
    bucket: StorageBucket,
    fetcher: UpstreamFetcher,
    locks: keylock::Locks,
    lock_ttl: Duration,
}

impl ProxyCache {
    /// A cache storing into `bucket` and fetching through `fetcher`.
    pub fn new(bucket: StorageBucket, fetcher: UpstreamFetcher, locks: keylock::Locks) -> Self {
        Self {
            bucket,
            fetcher,
            locks,
            lock_ttl: keylock::DEFAULT_TTL,
        }
    }

    /// Bound lock waits and holds to `ttl`.
    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    fn keys(repo: &Repository, path: &str) -> (Utf8PathBuf, Utf8PathBuf) {
        let path = path.trim_start_matches('/');
        (
            Utf8PathBuf::from(format!("proxy/{}/{path}", repo.id)),
            Utf8PathBuf::from(format!("proxy-meta/{}/{path}", repo.id)),
        )
    }

    fn object(
        &self,
        payload: Utf8PathBuf,
        size: u64,
        meta: CacheMeta,
        digest: Digest,
    ) -> CachedObject {
        let content = Content::Stored {
            bucket: self.bucket.clone(),
            key: payload,
            size,
        };
        CachedObject {
            content,
            content_type: meta.content_type,
            digest,
            upstream_digest: meta.upstream_digest,
            fetched_at: meta.fetched_at,
            stale: false,
        }
    }

    async fn cached(&self, repo: &Repository, path: &str) -> RegistryResult<Option<CachedObject>> {
        let (payload, meta) = Self::keys(repo, path);

        let meta = match self.bucket.get(&meta).await {
            Ok(bytes) => bytes,
            Err(err) if err.is_not_found() => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let parsed = serde_json::from_slice::<CacheMeta>(&meta)
            .ok()
            .and_then(|meta| Some((meta.digest.parse::<Digest>().ok()?, meta)));
        let Some((digest, meta)) = parsed else {
            tracing::warn!(repo = %repo.id, %path, "discarding unreadable cache metadata");
            return Ok(None);
        };

        match self.bucket.metadata(&payload).await {
            Ok(metadata) => Ok(Some(self.object(payload, metadata.size, meta, digest))),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn store(
        &self,
        repo: &Repository,
        path: &str,
        body: FetchBody,
        content_type: Option<String>,
        upstream_digest: Option<String>,
        expected: Option<&Digest>,
    ) -> RegistryResult<CachedObject> {
        let (payload, meta_key) = Self::keys(repo, path);
        let algorithm = expected.map_or(Algorithm::Sha256, Digest::algorithm);
        let verify = |actual: &Digest| match expected {
            Some(expected) if expected != actual => Err(RegistryError::upstream(
                StatusCode::BAD_GATEWAY,
                format!("upstream sent {actual} for {path}, expected {expected}"),
            )),
            _ => Ok(()),
        };

        let (digest, size) = match body {
            FetchBody::Stream(body) => {
                let (digest, size) = self.save_streamed(&payload, body, algorithm).await?;
                if let Err(err) = verify(&digest) {
                    self.bucket.delete(&payload).await?;
                    self.bucket.delete(&meta_key).await?;
                    return Err(err);
                }
                (digest, size)
            }
            buffered => {
                let bytes = buffered.bytes().await?;
                let digest = Digest::compute(algorithm, &bytes);
                verify(&digest)?;
                let size = bytes.len() as u64;
                self.bucket.save(&payload, bytes).await?;
                (digest, size)
            }
        };

        let meta = CacheMeta {
            fetched_at: Utc::now(),
            content_type,
            digest: digest.to_string(),
            upstream_digest,
        };
        let encoded = serde_json::to_vec(&meta)
            .map_err(|err| RegistryError::Config(format!("encoding cache metadata: {err}")))?;
        self.bucket.save(&meta_key, Bytes::from(encoded)).await?;
        tracing::debug!(repo = %repo.id, %path, size, %digest, "cached upstream content");
        Ok(self.object(payload, size, meta, digest))
    }

    /// Copy an upstream body into storage at `key`, hashing it on the way.
    /// A body that fails midway leaves nothing behind.
    async fn save_streamed<B>(
        &self,
        key: &Utf8Path,
        body: B,
        algorithm: Algorithm,
    ) -> RegistryResult<(Digest, u64)>
    where
        B: http_body::Body<Data = Bytes>,
        B::Error: std::fmt::Display,
    {
        let (mut writer, reader) = tokio::io::duplex(STREAM_BUFFER);

        let pump = async move {
            let mut body = std::pin::pin!(body);
            let mut hasher = algorithm.hasher();
            let mut size = 0u64;
            while let Some(frame) = body.frame().await {
                let frame = frame.map_err(|err| {
                    RegistryError::upstream(StatusCode::BAD_GATEWAY, err.to_string())
                })?;
                if let Ok(data) = frame.into_data() {
                    hasher.update(&data);
                    size += data.len() as u64;
                    writer.write_all(&data).await?;
                }
            }
            writer.shutdown().await?;
            Ok::<_, RegistryError>((hasher.finish(), size))
        };
        let save = async move {
            let mut reader = tokio::io::BufReader::new(reader);
            self.bucket.save_stream(key, &mut reader).await
        };

        let (pumped, saved) = tokio::join!(pump, save);
        let result = match (pumped, saved) {
            (Ok(done), Ok(())) => Ok(done),
            (_, Err(err)) => Err(err.into()),
            (Err(err), Ok(())) => Err(err),
        };
        if result.is_err() {
            if let Err(err) = self.bucket.delete(key).await {
                tracing::debug!(%key, error = %err, "removing partial cache entry");
            }
        }
        result
    }

    /// Serve `path` from the cache, fetching it from the upstream when missing
    /// or older than the repository's cache TTL.
    ///
    /// When `expected` is given the payload must hash to it: a cached copy
    /// that does not is refetched, and an upstream answer that does not is
    /// rejected without being cached. If the upstream fails and a stale copy
    /// exists, the stale copy is served.
    #[tracing::instrument(level = "debug", skip(self, repo, expected), fields(repo = %repo.id))]
    pub async fn proxy_fetch(
        &self,
        repo: &Repository,
        path: &str,
        expected: Option<&Digest>,
    ) -> RegistryResult<CachedObject> {
        let ttl = repo.config.cache_ttl;
        let usable = |hit: &CachedObject| hit.is_fresh(ttl, Utc::now()) && hit.satisfies(expected);

        if let Some(hit) = self.cached(repo, path).await? {
            if usable(&hit) {
                tracing::trace!("cache hit");
                return Ok(hit);
            }
        }

        let key = format!("proxy:{}:{}", repo.id, path.trim_start_matches('/'));
        self.locks
            .run_with_lock(&key, self.lock_ttl, async {
                // A caller queued behind the leader finds its result here.
                let cached = self.cached(repo, path).await?;
                if let Some(hit) = &cached {
                    if usable(hit) {
                        return Ok(hit.clone());
                    }
                }
                let stale = cached.filter(|hit| hit.satisfies(expected));
                self.refresh(repo, path, stale, expected).await
            })
            .await?
    }

    async fn refresh(
        &self,
        repo: &Repository,
        path: &str,
        stale: Option<CachedObject>,
        expected: Option<&Digest>,
    ) -> RegistryResult<CachedObject> {
        let base = repo.config.upstream.clone().ok_or_else(|| {
            RegistryError::Config(format!("proxy repository {} has no upstream", repo.id))
        })?;
        let url = base.join(path.trim_start_matches('/')).to_string();

        let options = FetchOptions::new()
            .header(header::ACCEPT, HeaderValue::from_static(MANIFEST_ACCEPT))
            .stream();

        let failure = match self.fetcher.fetch(&url, &repo.auth_sources(), &options).await {
            Ok(response) if response.ok => {
                let content_type = response.content_type().map(str::to_owned);
                let upstream_digest = response
                    .headers
                    .get(UPSTREAM_DIGEST)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_owned);
                return self
                    .store(repo, path, response.body, content_type, upstream_digest, expected)
                    .await;
            }
            Ok(response) => {
                let status = response.status;
                let message = match response.bytes().await {
                    Ok(body) => String::from_utf8_lossy(&body).into_owned(),
                    Err(_) => String::new(),
                };
                RegistryError::upstream(status, message)
            }
            Err(err) => err.into(),
        };

        match stale {
            Some(mut stale) => {
                tracing::warn!(%url, error = %failure, "upstream failed, serving stale entry");
                stale.stale = true;
                Ok(stale)
            }
            None => Err(failure),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use keylock::LockStore as _;
    use storage::{MemoryStorage, Storage};
    use upstream::mock::{MockResponse, MockService};

    use super::*;

    const BLOB: &str = "/v2/library/alpine/blobs/sha256:aaaa";

    fn cache_with(mock: &MockService, locks: keylock::Locks) -> ProxyCache {
        let storage: Storage = MemoryStorage::new().into();
        let fetcher = UpstreamFetcher::with_service(upstream::FetchConfig::default(), mock.clone());
        ProxyCache::new(storage.bucket("registry"), fetcher, locks)
    }

    fn cache(mock: &MockService) -> ProxyCache {
        cache_with(mock, keylock::Locks::local())
    }

    fn repo(ttl: Duration) -> Repository {
        Repository::proxy("hub", "hub", "http://upstream.test".parse().unwrap()).with_cache_ttl(ttl)
    }

    async fn read(object: &CachedObject) -> Bytes {
        object.content.bytes().await.unwrap()
    }

    #[tokio::test]
    async fn hits_within_ttl_skip_upstream() {
        let mock = MockService::new();
        mock.add(BLOB, MockResponse::ok("layer"));
        let cache = cache(&mock);
        let repo = repo(Duration::from_secs(60));

        let first = cache.proxy_fetch(&repo, BLOB, None).await.unwrap();
        let second = cache.proxy_fetch(&repo, BLOB, None).await.unwrap();
        assert_eq!(read(&first).await, read(&second).await);
        assert_eq!(second.content.size(), 5);
        assert_eq!(second.digest, Digest::sha256(b"layer"));
        assert_eq!(mock.hits(BLOB), 1);
    }

    #[tokio::test]
    async fn expired_entries_are_refetched() {
        let mock = MockService::new();
        mock.add(BLOB, MockResponse::ok("layer"));
        let cache = cache(&mock);
        let repo = repo(Duration::from_millis(50));

        cache.proxy_fetch(&repo, BLOB, None).await.unwrap();
        cache.proxy_fetch(&repo, BLOB, None).await.unwrap();
        assert_eq!(mock.hits(BLOB), 1);

        tokio::time::sleep(Duration::from_millis(80)).await;
        cache.proxy_fetch(&repo, BLOB, None).await.unwrap();
        assert_eq!(mock.hits(BLOB), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_misses_fetch_once() {
        let mock = MockService::new();
        mock.add(BLOB, MockResponse::ok("layer"));
        mock.delay(BLOB, Duration::from_millis(50));
        let cache = Arc::new(cache(&mock));
        let repo = Arc::new(repo(Duration::from_secs(60)));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let repo = repo.clone();
                tokio::spawn(async move {
                    let object = cache.proxy_fetch(&repo, BLOB, None).await.unwrap();
                    read(&object).await
                })
            })
            .collect();

        for task in tasks {
            assert_eq!(task.await.unwrap(), Bytes::from_static(b"layer"));
        }
        assert_eq!(mock.hits(BLOB), 1);
    }

    #[tokio::test]
    async fn upstream_errors_keep_their_status() {
        let mock = MockService::new();
        mock.add(BLOB, MockResponse::new(StatusCode::NOT_FOUND).body("missing"));
        let cache = cache(&mock);

        let err = cache
            .proxy_fetch(&repo(Duration::from_secs(60)), BLOB, None)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn stale_entries_survive_upstream_outages() {
        let mock = MockService::new();
        mock.add(BLOB, MockResponse::ok("layer"));
        let cache = cache(&mock);
        let repo = repo(Duration::from_millis(10));

        cache.proxy_fetch(&repo, BLOB, None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        mock.add(BLOB, MockResponse::new(StatusCode::BAD_GATEWAY));
        let served = cache.proxy_fetch(&repo, BLOB, None).await.unwrap();
        assert!(served.stale);
        assert_eq!(read(&served).await, Bytes::from_static(b"layer"));
    }

    #[tokio::test]
    async fn content_must_match_the_requested_digest() {
        let good = Digest::sha256(b"layer");
        let path = format!("/v2/library/alpine/blobs/{good}");
        let mock = MockService::new();
        mock.add(&path, MockResponse::ok("evil"));
        let cache = cache(&mock);
        let repo = repo(Duration::from_secs(60));

        let err = cache.proxy_fetch(&repo, &path, Some(&good)).await.unwrap_err();
        assert!(matches!(err, RegistryError::Upstream { .. }));
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
        assert!(cache.cached(&repo, &path).await.unwrap().is_none());
        let (payload, _) = ProxyCache::keys(&repo, &path);
        assert!(!cache.bucket.exists(&payload).await.unwrap());

        mock.add(&path, MockResponse::ok("layer"));
        let object = cache.proxy_fetch(&repo, &path, Some(&good)).await.unwrap();
        assert_eq!(object.digest, good);
        assert_eq!(read(&object).await, Bytes::from_static(b"layer"));
        assert_eq!(mock.hits(&path), 2);
    }

    #[tokio::test]
    async fn sha512_digests_are_checked_with_sha512() {
        let expected = Digest::compute(Algorithm::Sha512, b"layer");
        let path = format!("/v2/app/blobs/{expected}");
        let mock = MockService::new();
        mock.add(&path, MockResponse::ok("layer"));
        let cache = cache(&mock);
        let repo = repo(Duration::from_secs(60));

        let object = cache
            .proxy_fetch(&repo, &path, Some(&expected))
            .await
            .unwrap();
        assert_eq!(object.digest, expected);

        cache
            .proxy_fetch(&repo, &path, Some(&expected))
            .await
            .unwrap();
        assert_eq!(mock.hits(&path), 1);
    }

    #[tokio::test]
    async fn held_locks_time_out_as_server_errors() {
        let store = keylock::MemoryLockStore::new();
        let locks = keylock::Locks::new(keylock::DistributedLocks::new(
            store.clone(),
            Duration::from_millis(5),
        ));
        let mock = MockService::new();
        mock.add(BLOB, MockResponse::ok("layer"));
        let cache = cache_with(&mock, locks).with_lock_ttl(Duration::from_millis(40));
        let repo = repo(Duration::from_secs(60));

        let key = format!("proxy:hub:{}", BLOB.trim_start_matches('/'));
        assert!(
            store
                .set_if_absent(&key, "another-replica", Duration::from_secs(60))
                .await
                .unwrap()
        );

        let err = cache.proxy_fetch(&repo, BLOB, None).await.unwrap_err();
        assert!(matches!(err, RegistryError::Lock(_)));
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(mock.hits(BLOB), 0);

        store.delete_if_equals(&key, "another-replica").await.unwrap();
        cache.proxy_fetch(&repo, BLOB, None).await.unwrap();
        assert_eq!(mock.hits(BLOB), 1);
    }

    #[tokio::test]
    async fn credentials_and_accept_are_forwarded() {
        let mock = MockService::new();
        mock.add(BLOB, MockResponse::ok("layer"));
        let cache = cache(&mock);
        let repo = repo(Duration::from_secs(60)).with_auth(upstream::Credentials::bearer("tok"));

        cache.proxy_fetch(&repo, BLOB, None).await.unwrap();
        let request = &mock.requests()[0];
        assert_eq!(request.headers[header::AUTHORIZATION], "Bearer tok");
        assert!(
            request.headers[header::ACCEPT]
                .to_str()
                .unwrap()
                .contains("manifest.v2+json")
        );
    }
}
