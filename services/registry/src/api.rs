//! Registry assembly and the per-repository router.

use std::collections::HashMap;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::{Path, Query, Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{any, get};
use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use serde_json::json;
use upstream::{Secret, UpstreamFetcher};

use crate::auth::{AuthChecker, Principal};
use crate::config::{ConfigError, RegistryConfig};
use crate::error::{RegistryError, RegistryResult};
use crate::group::GroupRouter;
use crate::plugin::{DockerPlugin, PluginSet};
use crate::proxy::ProxyCache;
use crate::repository::{Repository, RepositoryCatalog};
use crate::storage::RegistryStorage;
use crate::upload::BlobUploadStager;
use crate::validate::ManifestValidator;

pub(crate) const DOCKER_CONTENT_DIGEST: HeaderName =
    HeaderName::from_static("docker-content-digest");
pub(crate) const DOCKER_UPLOAD_UUID: HeaderName = HeaderName::from_static("docker-upload-uuid");
const API_VERSION: HeaderName = HeaderName::from_static("docker-distribution-api-version");

/// Registry builder for configuring and creating the registry.
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    config: RegistryConfig,
    storage: Option<storage::Storage>,
    bucket: Option<String>,
    fetcher: Option<UpstreamFetcher>,
    locks: Option<keylock::Locks>,
    secret: Option<Secret>,
    staging_dir: Option<Utf8PathBuf>,
}

impl RegistryBuilder {
    /// Create a new registry builder with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the configuration.
    pub fn config(mut self, config: RegistryConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the storage backend, overriding `config.storage`.
    pub fn storage(mut self, storage: storage::Storage) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Set the bucket name for storage.
    pub fn bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = Some(bucket.into());
        self
    }

    /// Use `fetcher` for upstream requests instead of a real HTTP client.
    pub fn fetcher(mut self, fetcher: UpstreamFetcher) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Set the lock provider, overriding `config.locks`.
    pub fn locks(mut self, locks: keylock::Locks) -> Self {
        self.locks = Some(locks);
        self
    }

    /// Set the token signing secret. Read from `auth.secret_env` when unset.
    pub fn secret(mut self, secret: impl Into<Secret>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    /// Stage uploads in `dir`, overriding `staging.dir`.
    pub fn staging_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.staging_dir = Some(dir.into());
        self
    }

    /// Add a repository definition.
    pub fn repository(mut self, repository: Repository) -> Self {
        self.config.repositories.push(repository);
        self
    }

    /// Build the registry.
    pub fn build(self) -> Result<Registry, ConfigError> {
        let config = self.config;
        let backend = match self.storage {
            Some(storage) => storage,
            None => config.storage.clone().build()?,
        };
        let bucket = backend.bucket(self.bucket.unwrap_or_else(|| config.bucket.0.clone()));
        let locks = self
            .locks
            .unwrap_or_else(|| keylock::Locks::from_config(&config.locks));
        let fetcher = self
            .fetcher
            .unwrap_or_else(|| UpstreamFetcher::new(config.fetch.clone()));
        let secret = self
            .secret
            .or_else(|| Secret::from_env(&config.auth.secret_env).ok());

        // Groups reference their members, so they go in last.
        let catalog = RepositoryCatalog::new();
        let (groups, others): (Vec<_>, Vec<_>) = config
            .repositories
            .iter()
            .cloned()
            .partition(Repository::is_group);
        for repository in others.into_iter().chain(groups) {
            catalog.upsert(repository)?;
        }

        let storage = RegistryStorage::new(bucket.clone());
        let groups = GroupRouter::new(catalog.clone());
        let proxy = ProxyCache::new(bucket, fetcher.clone(), locks.clone());
        let stager = BlobUploadStager::new(
            self.staging_dir.unwrap_or_else(|| config.staging.dir()),
            config.staging.ttl,
            storage.clone(),
            groups.clone(),
        );
        let validator =
            ManifestValidator::new(storage.clone(), proxy.clone(), groups.clone(), locks);
        let auth = AuthChecker::new(secret, &config.auth, &config.challenge);
        let plugins = PluginSet::new().with(DockerPlugin::new(
            storage.clone(),
            stager.clone(),
            proxy,
            groups.clone(),
            auth,
        ));

        Ok(Registry {
            inner: Arc::new(Inner {
                config,
                catalog,
                storage,
                stager,
                validator,
                groups,
                plugins,
                fetcher,
            }),
        })
    }
}

#[derive(Debug)]
struct Inner {
    config: RegistryConfig,
    catalog: RepositoryCatalog,
    storage: RegistryStorage,
    stager: BlobUploadStager,
    validator: ManifestValidator,
    groups: GroupRouter,
    plugins: PluginSet,
    fetcher: UpstreamFetcher,
}

/// A registry: repositories and the components serving them.
///
/// Cheap to clone. Each repository gets its own router from [`Registry::router`].
#[derive(Debug, Clone)]
pub struct Registry {
    inner: Arc<Inner>,
}

impl Registry {
    /// Start building a registry.
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// Active configuration.
    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    /// Repository definitions.
    pub fn catalog(&self) -> &RepositoryCatalog {
        &self.inner.catalog
    }

    /// Content storage.
    pub fn storage(&self) -> &RegistryStorage {
        &self.inner.storage
    }

    /// Upload sessions.
    pub fn stager(&self) -> &BlobUploadStager {
        &self.inner.stager
    }

    /// Manifest writes.
    pub fn validator(&self) -> &ManifestValidator {
        &self.inner.validator
    }

    /// Group routing.
    pub fn groups(&self) -> &GroupRouter {
        &self.inner.groups
    }

    /// Ecosystem plugins.
    pub fn plugins(&self) -> &PluginSet {
        &self.inner.plugins
    }

    pub(crate) fn fetcher(&self) -> &UpstreamFetcher {
        &self.inner.fetcher
    }

    /// Drop upload sessions older than the staging TTL.
    pub async fn sweep(&self, now: DateTime<Utc>) -> RegistryResult<usize> {
        self.inner.stager.sweep_expired(now).await
    }

    /// The HTTP API of one repository.
    ///
    /// The repository is looked up on every request, so catalog changes apply
    /// to a running router.
    pub fn router(&self, repo_id: &str) -> Router {
        let state = RepoState {
            registry: self.clone(),
            repo_id: Arc::from(repo_id),
        };

        Router::new()
            .route("/v2/", get(api_version_check))
            .route("/v2", get(api_version_check))
            .route("/v2/_catalog", get(crate::manifest::catalog))
            .route("/v2/token", get(crate::token::token))
            .route("/v2/{*path}", any(dispatch))
            .route("/v1/_ping", get(crate::manifest::v1_ping))
            .route(
                "/v1/repositories/{*path}",
                get(crate::manifest::v1_tags).put(crate::manifest::v1_put_tag),
            )
            .layer(middleware::from_fn_with_state(
                self.inner.config.debug,
                log_headers,
            ))
            .layer(middleware::map_response(api_version_header))
            .with_state(state)
    }
}

/// Router state: the registry and the repository a listener serves.
#[derive(Debug, Clone)]
pub(crate) struct RepoState {
    pub(crate) registry: Registry,
    repo_id: Arc<str>,
}

impl RepoState {
    pub(crate) fn repository(&self) -> RegistryResult<Arc<Repository>> {
        self.registry
            .catalog()
            .get(&self.repo_id)
            .ok_or_else(|| RegistryError::RepositoryNotFound(self.repo_id.to_string()))
    }

    /// Gate a push-class request.
    pub(crate) async fn authorize(
        &self,
        repo: &Repository,
        headers: &HeaderMap,
        name: &str,
    ) -> RegistryResult<Principal> {
        let plugin = self.registry.plugins().for_repository(repo)?;
        let principal = plugin.authenticate(headers, name, "push").await?;
        tracing::debug!(repo = %repo.id, %name, ?principal, "push authorized");
        Ok(principal)
    }
}

/// A `/v2/` path below the root, split into its parts.
///
/// Image names may contain slashes, so the route is a catch-all and the
/// operation is recognised by its trailing segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Endpoint {
    Blob { name: String, digest: String },
    Uploads { name: String },
    Upload { name: String, uuid: String },
    Manifest { name: String, reference: String },
    Tags { name: String },
}

impl Endpoint {
    pub(crate) fn parse(path: &str) -> Option<Self> {
        let path = path.trim_start_matches('/');
        let single = |s: &str| !s.is_empty() && !s.contains('/');

        if let Some(name) = path.strip_suffix("/tags/list") {
            return (!name.is_empty()).then(|| Endpoint::Tags { name: name.into() });
        }

        if let Some((name, rest)) = path.rsplit_once("/blobs/uploads") {
            let uuid = match rest {
                "" | "/" => None,
                rest => Some(rest.strip_prefix('/').filter(|uuid| single(uuid))?),
            };
            if name.is_empty() {
                return None;
            }
            return Some(match uuid {
                None => Endpoint::Uploads { name: name.into() },
                Some(uuid) => Endpoint::Upload {
                    name: name.into(),
                    uuid: uuid.into(),
                },
            });
        }

        if let Some((name, digest)) = path.rsplit_once("/blobs/") {
            return (!name.is_empty() && single(digest)).then(|| Endpoint::Blob {
                name: name.into(),
                digest: digest.into(),
            });
        }

        if let Some((name, reference)) = path.rsplit_once("/manifests/") {
            return (!name.is_empty() && single(reference)).then(|| Endpoint::Manifest {
                name: name.into(),
                reference: reference.into(),
            });
        }

        None
    }

    fn name(&self) -> &str {
        match self {
            Endpoint::Blob { name, .. }
            | Endpoint::Uploads { name }
            | Endpoint::Upload { name, .. }
            | Endpoint::Manifest { name, .. }
            | Endpoint::Tags { name } => name,
        }
    }
}

fn is_push(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}

async fn dispatch(
    State(state): State<RepoState>,
    Path(path): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    method: Method,
    headers: HeaderMap,
    body: Body,
) -> RegistryResult<Response> {
    let repo = state.repository()?;
    let endpoint = Endpoint::parse(&path)
        .ok_or_else(|| RegistryError::RepositoryNotFound(format!("/v2/{path}")))?;

    if is_push(&method) {
        state.authorize(&repo, &headers, endpoint.name()).await?;
    }

    let registry = &state.registry;
    match (&endpoint, &method) {
        (Endpoint::Blob { .. }, &Method::GET) => {
            crate::blob::get(registry, &repo, &path, &headers, false).await
        }
        (Endpoint::Blob { .. }, &Method::HEAD) => {
            crate::blob::get(registry, &repo, &path, &headers, true).await
        }
        (Endpoint::Blob { digest, .. }, &Method::DELETE) => {
            crate::blob::delete(registry, &repo, digest).await
        }
        (Endpoint::Uploads { name }, &Method::POST) => {
            crate::blob::start_upload(registry, &repo, name, &query, body).await
        }
        (Endpoint::Upload { name, uuid }, &Method::PATCH) => {
            crate::blob::patch_upload(registry, &repo, name, uuid, &headers, body).await
        }
        (Endpoint::Upload { name, uuid }, &Method::PUT) => {
            crate::blob::finish_upload(registry, &repo, name, uuid, &query, body).await
        }
        (Endpoint::Upload { name, uuid }, &Method::GET) => {
            crate::blob::upload_status(registry, &repo, name, uuid).await
        }
        (Endpoint::Upload { uuid, .. }, &Method::DELETE) => {
            crate::blob::cancel_upload(registry, &repo, uuid).await
        }
        (Endpoint::Manifest { .. }, &Method::GET) => {
            crate::manifest::get(registry, &repo, &path, false).await
        }
        (Endpoint::Manifest { .. }, &Method::HEAD) => {
            crate::manifest::get(registry, &repo, &path, true).await
        }
        (Endpoint::Manifest { name, reference }, &Method::PUT) => {
            crate::manifest::put(registry, &repo, name, reference, &headers, body).await
        }
        (Endpoint::Manifest { name, reference }, &Method::DELETE) => {
            crate::manifest::delete(registry, &repo, name, reference).await
        }
        (Endpoint::Tags { name }, &Method::GET) => {
            crate::manifest::list_tags(registry, &repo, name, &query).await
        }
        _ => Err(RegistryError::Unsupported(format!(
            "{method} is not allowed on /v2/{path}"
        ))),
    }
}

/// API version check endpoint
///
/// Returns 200 OK to indicate the registry is available
async fn api_version_check() -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::OK, Json(json!({})))
}

async fn api_version_header(mut response: Response) -> Response {
    response
        .headers_mut()
        .insert(API_VERSION, HeaderValue::from_static("registry/2.0"));
    response
}

async fn log_headers(State(debug): State<bool>, request: Request, next: Next) -> Response {
    if !debug {
        return next.run(request).await;
    }

    let method = request.method().clone();
    let uri = request.uri().clone();
    tracing::debug!(%method, %uri, headers = ?redacted(request.headers()), "request");
    let response = next.run(request).await;
    tracing::debug!(
        %method,
        %uri,
        status = %response.status(),
        headers = ?redacted(response.headers()),
        "response",
    );
    response
}

fn redacted(headers: &HeaderMap) -> HeaderMap {
    let mut headers = headers.clone();
    if let Some(value) = headers.get_mut(axum::http::header::AUTHORIZATION) {
        value.set_sensitive(true);
    }
    headers
}

/// Response shorthand used by the handlers.
pub(crate) fn empty(
    status: StatusCode,
    headers: Vec<(HeaderName, String)>,
) -> RegistryResult<Response> {
    let mut response = status.into_response();
    for (name, value) in headers {
        let value = HeaderValue::try_from(value)
            .map_err(|err| RegistryError::Config(format!("invalid {name} header: {err}")))?;
        response.headers_mut().insert(name, value);
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let storage = storage::MemoryStorage::new();
        let registry = RegistryBuilder::new()
            .storage(storage.into())
            .bucket("test")
            .repository(Repository::hosted("local", "local"))
            .build()
            .unwrap();
        assert!(registry.catalog().get("local").is_some());
        let _router = registry.router("local");
    }

    #[test]
    fn groups_may_precede_members_in_configuration() {
        let registry = RegistryBuilder::new()
            .storage(storage::MemoryStorage::new().into())
            .repository(Repository::group(
                "all",
                "all",
                ["local"],
                crate::repository::WritePolicy::First,
            ))
            .repository(Repository::hosted("local", "local"))
            .build()
            .unwrap();
        assert_eq!(registry.catalog().list().len(), 2);
    }

    #[test]
    fn endpoints() {
        assert_eq!(
            Endpoint::parse("library/alpine/blobs/sha256:abc"),
            Some(Endpoint::Blob {
                name: "library/alpine".into(),
                digest: "sha256:abc".into()
            })
        );
        assert_eq!(
            Endpoint::parse("app/blobs/uploads/"),
            Some(Endpoint::Uploads { name: "app".into() })
        );
        assert_eq!(
            Endpoint::parse("app/blobs/uploads"),
            Some(Endpoint::Uploads { name: "app".into() })
        );
        assert_eq!(
            Endpoint::parse("a/b/blobs/uploads/1234"),
            Some(Endpoint::Upload {
                name: "a/b".into(),
                uuid: "1234".into()
            })
        );
        assert_eq!(
            Endpoint::parse("a/b/manifests/latest"),
            Some(Endpoint::Manifest {
                name: "a/b".into(),
                reference: "latest".into()
            })
        );
        assert_eq!(
            Endpoint::parse("a/b/tags/list"),
            Some(Endpoint::Tags { name: "a/b".into() })
        );
        assert_eq!(Endpoint::parse("a/blobs/uploadsX"), None);
        assert_eq!(Endpoint::parse("/blobs/sha256:abc"), None);
        assert_eq!(Endpoint::parse("a/b/c"), None);
    }
}
