//! Per-ecosystem capabilities.
//!
//! Each repository names an ecosystem. The protocol server asks the matching
//! [`Plugin`] to read content, list versions, accept uploads and check
//! credentials. Operations an ecosystem has no notion of keep the default
//! implementation, which reports them as unsupported.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use http::{HeaderMap, header};

use crate::api::Endpoint;
use crate::auth::{AuthChecker, Principal};
use crate::digest::{Digest, is_digest_reference};
use crate::error::{RegistryError, RegistryResult};
use crate::group::GroupRouter;
use crate::proxy::{CachedObject, ProxyCache};
use crate::repository::Repository;
use crate::storage::{Content, DEFAULT_MANIFEST_TYPE, RegistryStorage};
use crate::upload::{BlobUploadStager, FinalizedUpload};
use crate::validate::ParsedManifest;

/// Content type served for blobs.
pub const BLOB_CONTENT_TYPE: &str = "application/octet-stream";

/// A piece of content read from a repository.
#[derive(Debug, Clone)]
pub struct Artifact {
    /// The content. Blobs stay in storage until the response body is read.
    pub content: Content,
    /// Content digest as reported to clients.
    pub digest: String,
    /// Media type.
    pub content_type: String,
}

/// What an ecosystem can do.
#[async_trait]
pub trait Plugin: fmt::Debug + Send + Sync {
    /// Ecosystem tag this plugin serves, e.g. `docker`.
    fn ecosystem(&self) -> &'static str;

    /// Store `content` in `repo` under `name`, verifying `digest` when given.
    async fn upload(
        &self,
        repo: &Repository,
        name: &str,
        content: Body,
        digest: Option<Digest>,
    ) -> RegistryResult<FinalizedUpload> {
        let _ = (repo, name, content, digest);
        Err(unsupported(self.ecosystem(), "upload"))
    }

    /// Read the artifact at `path`, relative to the repository root.
    async fn download(&self, repo: &Repository, path: &str) -> RegistryResult<Artifact> {
        let _ = (repo, path);
        Err(unsupported(self.ecosystem(), "download"))
    }

    /// Versions published for `name`.
    async fn list_versions(&self, repo: &Repository, name: &str) -> RegistryResult<Vec<String>> {
        let _ = (repo, name);
        Err(unsupported(self.ecosystem(), "listing versions"))
    }

    /// Fetch `path` from the upstream of a proxy repository, through the cache.
    async fn proxy_fetch(&self, repo: &Repository, path: &str) -> RegistryResult<CachedObject> {
        let _ = (repo, path);
        Err(unsupported(self.ecosystem(), "proxying"))
    }

    /// Check that the request may perform `action` on `name`.
    async fn authenticate(
        &self,
        headers: &HeaderMap,
        name: &str,
        action: &str,
    ) -> RegistryResult<Principal> {
        let _ = (headers, name, action);
        Err(unsupported(self.ecosystem(), "authentication"))
    }
}

/// The digest a blob or digest-addressed manifest path names.
fn addressed_digest(path: &str) -> Option<Digest> {
    let reference = match Endpoint::parse(path)? {
        Endpoint::Blob { digest, .. } => digest,
        Endpoint::Manifest { reference, .. } if is_digest_reference(&reference) => reference,
        _ => return None,
    };
    reference.parse().ok()
}

fn unsupported(ecosystem: &str, operation: &str) -> RegistryError {
    RegistryError::Unsupported(format!("{ecosystem} repositories do not support {operation}"))
}

/// Plugins by ecosystem tag. Built once at startup.
#[derive(Debug, Clone, Default)]
pub struct PluginSet {
    plugins: HashMap<&'static str, Arc<dyn Plugin>>,
}

impl PluginSet {
    /// An empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `plugin` for its ecosystem, replacing any earlier one.
    pub fn with<P: Plugin + 'static>(mut self, plugin: P) -> Self {
        self.plugins.insert(plugin.ecosystem(), Arc::new(plugin));
        self
    }

    /// The plugin for an ecosystem tag.
    pub fn get(&self, ecosystem: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins.get(ecosystem).cloned()
    }

    /// The plugin serving `repo`.
    pub fn for_repository(&self, repo: &Repository) -> RegistryResult<Arc<dyn Plugin>> {
        self.get(&repo.ecosystem).ok_or_else(|| {
            RegistryError::Unsupported(format!(
                "no plugin for ecosystem {} of repository {}",
                repo.ecosystem, repo.id
            ))
        })
    }
}

/// Container images.
#[derive(Debug, Clone)]
pub struct DockerPlugin {
    storage: RegistryStorage,
    stager: BlobUploadStager,
    proxy: ProxyCache,
    groups: GroupRouter,
    auth: AuthChecker,
}

impl DockerPlugin {
    /// A plugin over the registry's components.
    pub fn new(
        storage: RegistryStorage,
        stager: BlobUploadStager,
        proxy: ProxyCache,
        groups: GroupRouter,
        auth: AuthChecker,
    ) -> Self {
        Self {
            storage,
            stager,
            proxy,
            groups,
            auth,
        }
    }

    async fn member_blob(
        &self,
        repo: &Repository,
        name: &str,
        digest: &str,
    ) -> RegistryResult<Artifact> {
        let parsed: Digest = digest.parse()?;
        let content = if repo.is_proxy() {
            self.proxy
                .proxy_fetch(repo, &format!("v2/{name}/blobs/{digest}"), Some(&parsed))
                .await?
                .content
        } else {
            self.storage.blob(&repo.id, &parsed).await?
        };
        Ok(Artifact {
            content,
            digest: parsed.to_string(),
            content_type: BLOB_CONTENT_TYPE.to_owned(),
        })
    }

    async fn member_manifest(
        &self,
        repo: &Repository,
        name: &str,
        reference: &str,
    ) -> RegistryResult<Artifact> {
        if !repo.is_proxy() {
            let manifest = self.storage.get_manifest(&repo.id, name, reference).await?;
            return Ok(Artifact {
                content: Content::Bytes(manifest.bytes),
                digest: manifest.digest.to_string(),
                content_type: manifest.media_type,
            });
        }

        let addressed = if is_digest_reference(reference) {
            Some(reference.parse::<Digest>()?)
        } else {
            None
        };
        let cached = self
            .proxy
            .proxy_fetch(
                repo,
                &format!("v2/{name}/manifests/{reference}"),
                addressed.as_ref(),
            )
            .await?;
        let bytes = cached.content.bytes().await?;
        let digest = if addressed.is_some() {
            reference.to_owned()
        } else {
            cached
                .upstream_digest
                .clone()
                .unwrap_or_else(|| cached.digest.to_string())
        };
        let content_type = match cached.content_type {
            Some(content_type) if content_type != BLOB_CONTENT_TYPE => content_type,
            _ => ParsedManifest::parse(&bytes, None)
                .map(|manifest| manifest.media_type)
                .unwrap_or_else(|_| DEFAULT_MANIFEST_TYPE.to_owned()),
        };
        Ok(Artifact {
            content: Content::Bytes(bytes),
            digest,
            content_type,
        })
    }

    async fn member_tags(&self, repo: &Repository, name: &str) -> RegistryResult<Vec<String>> {
        if !repo.is_proxy() {
            return self.storage.list_tags(&repo.id, name).await;
        }

        #[derive(serde::Deserialize)]
        struct TagList {
            #[serde(default)]
            tags: Option<Vec<String>>,
        }

        let cached = self
            .proxy
            .proxy_fetch(repo, &format!("v2/{name}/tags/list"), None)
            .await?;
        let list: TagList = serde_json::from_slice(&cached.content.bytes().await?)
            .map_err(|err| {
                RegistryError::upstream(http::StatusCode::BAD_GATEWAY, err.to_string())
            })?;
        let mut tags = list.tags.unwrap_or_default();
        tags.sort();
        Ok(tags)
    }
}

#[async_trait]
impl Plugin for DockerPlugin {
    fn ecosystem(&self) -> &'static str {
        "docker"
    }

    async fn upload(
        &self,
        repo: &Repository,
        name: &str,
        content: Body,
        digest: Option<Digest>,
    ) -> RegistryResult<FinalizedUpload> {
        let session = self.stager.initiate(repo, name).await?;
        let result = async {
            self.stager.append(repo, &session.id, None, content).await?;
            self.stager.finalize(repo, &session.id, digest).await
        }
        .await;

        if result.is_err() {
            if let Err(err) = self.stager.abort(repo, &session.id).await {
                tracing::debug!(uuid = %session.id, error = %err, "discarding monolithic upload");
            }
        }
        result
    }

    async fn download(&self, repo: &Repository, path: &str) -> RegistryResult<Artifact> {
        match Endpoint::parse(path) {
            Some(Endpoint::Blob { name, digest }) => {
                if repo.is_group() {
                    self.groups
                        .read_first(repo, |member| {
                            let (name, digest) = (name.clone(), digest.clone());
                            async move { self.member_blob(&member, &name, &digest).await }
                        })
                        .await
                } else {
                    self.member_blob(repo, &name, &digest).await
                }
            }
            Some(Endpoint::Manifest { name, reference }) => {
                if repo.is_group() {
                    self.groups
                        .read_first(repo, |member| {
                            let (name, reference) = (name.clone(), reference.clone());
                            async move { self.member_manifest(&member, &name, &reference).await }
                        })
                        .await
                } else {
                    self.member_manifest(repo, &name, &reference).await
                }
            }
            _ => Err(RegistryError::RepositoryNotFound(path.to_owned())),
        }
    }

    async fn list_versions(&self, repo: &Repository, name: &str) -> RegistryResult<Vec<String>> {
        if repo.is_group() {
            self.groups
                .read_first(repo, |member| async move { self.member_tags(&member, name).await })
                .await
        } else {
            self.member_tags(repo, name).await
        }
    }

    async fn proxy_fetch(&self, repo: &Repository, path: &str) -> RegistryResult<CachedObject> {
        self.proxy
            .proxy_fetch(repo, path, addressed_digest(path).as_ref())
            .await
    }

    async fn authenticate(
        &self,
        headers: &HeaderMap,
        name: &str,
        action: &str,
    ) -> RegistryResult<Principal> {
        self.auth
            .authorize(headers, name, action)
            .map_err(|error| {
                let challenge = error.wants_challenge().then(|| {
                    let host = headers
                        .get(header::HOST)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("localhost");
                    self.auth.challenge(host, name, action)
                });
                RegistryError::Auth { error, challenge }
            })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use storage::{MemoryStorage, Storage};
    use upstream::mock::{MockResponse, MockService};
    use upstream::{FetchConfig, UpstreamFetcher};

    use super::*;
    use crate::config::{AuthConfig, ChallengeConfig};
    use crate::repository::{RepositoryCatalog, WritePolicy};

    #[derive(Debug)]
    struct Bare;

    #[async_trait]
    impl Plugin for Bare {
        fn ecosystem(&self) -> &'static str {
            "bare"
        }
    }

    fn docker(
        mock: MockService,
        catalog: RepositoryCatalog,
        dir: &camino::Utf8Path,
    ) -> DockerPlugin {
        let backend: Storage = MemoryStorage::new().into();
        let bucket = backend.bucket("registry");
        let storage = RegistryStorage::new(bucket.clone());
        let groups = GroupRouter::new(catalog);
        let fetcher = UpstreamFetcher::with_service(FetchConfig::default(), mock);
        let proxy = ProxyCache::new(bucket, fetcher, keylock::Locks::local());
        let stager =
            BlobUploadStager::new(dir, Duration::from_secs(60), storage.clone(), groups.clone());
        let auth = AuthChecker::new(None, &AuthConfig::default(), &ChallengeConfig::default());
        DockerPlugin::new(storage, stager, proxy, groups, auth)
    }

    #[tokio::test]
    async fn default_methods_are_unsupported() {
        let plugins = PluginSet::new().with(Bare);
        let mut repo = Repository::hosted("r", "r");
        repo.ecosystem = "bare".into();

        let plugin = plugins.for_repository(&repo).unwrap();
        let err = plugin.list_versions(&repo, "app").await.unwrap_err();
        assert_eq!(err.status_code(), http::StatusCode::METHOD_NOT_ALLOWED);

        repo.ecosystem = "npm".into();
        assert!(plugins.for_repository(&repo).is_err());
    }

    #[tokio::test]
    async fn group_downloads_fall_through_to_proxy_members() {
        let dir = tempfile::tempdir().unwrap();
        let dir = camino::Utf8Path::from_path(dir.path()).unwrap();

        let layer = Bytes::from_static(b"layer");
        let digest = Digest::sha256(&layer);
        let mock = MockService::new();
        mock.add(
            &format!("/v2/app/blobs/{digest}"),
            MockResponse::ok(layer.clone()),
        );

        let catalog = RepositoryCatalog::new();
        catalog.upsert(Repository::hosted("local", "local")).unwrap();
        catalog
            .upsert(Repository::proxy("hub", "hub", "http://hub.test".parse().unwrap()))
            .unwrap();
        let group = catalog
            .upsert(Repository::group("all", "all", ["local", "hub"], WritePolicy::First))
            .unwrap();

        let plugin = docker(mock.clone(), catalog, dir);
        let artifact = plugin
            .download(&group, &format!("app/blobs/{digest}"))
            .await
            .unwrap();
        assert_eq!(artifact.content.bytes().await.unwrap(), layer);
        assert_eq!(artifact.digest, digest.to_string());
        assert_eq!(mock.hits(&format!("/v2/app/blobs/{digest}")), 1);
    }

    #[test]
    fn proxied_paths_name_their_digest() {
        let digest = Digest::sha256(b"layer");
        assert_eq!(
            addressed_digest(&format!("v2/library/alpine/blobs/{digest}")),
            Some(digest.clone())
        );
        assert_eq!(
            addressed_digest(&format!("v2/app/manifests/{digest}")),
            Some(digest)
        );
        assert_eq!(addressed_digest("v2/app/manifests/latest"), None);
        assert_eq!(addressed_digest("v2/app/tags/list"), None);
    }

    #[tokio::test]
    async fn monolithic_upload_discards_session_on_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let dir = camino::Utf8Path::from_path(dir.path()).unwrap();

        let catalog = RepositoryCatalog::new();
        let repo = catalog.upsert(Repository::hosted("local", "local")).unwrap();
        let plugin = docker(MockService::new(), catalog, dir);

        let wrong = Digest::sha256(b"other");
        let err = plugin
            .upload(&repo, "app", Body::from("content"), Some(wrong))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::DigestMismatch { .. }));
        assert!(plugin.stager.is_empty());

        let uploaded = plugin
            .upload(&repo, "app", Body::from("content"), None)
            .await
            .unwrap();
        assert_eq!(uploaded.digest, Digest::sha256(b"content"));
    }

    #[tokio::test]
    async fn authenticate_attaches_challenge() {
        let dir = tempfile::tempdir().unwrap();
        let dir = camino::Utf8Path::from_path(dir.path()).unwrap();
        let plugin = docker(MockService::new(), RepositoryCatalog::new(), dir);

        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, "registry.test:5000".parse().unwrap());
        let err = plugin.authenticate(&headers, "app", "push").await.unwrap_err();
        let RegistryError::Auth { challenge, .. } = err else {
            panic!("expected auth error");
        };
        let challenge = challenge.unwrap();
        assert!(challenge.contains(r#"realm="http://registry.test:5000/v2/token""#));
        assert!(challenge.contains(r#"scope="repository:app:push""#));
    }
}
