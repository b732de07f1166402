//! Manifest pushes: parsing, reference checks, redeploy policy and persistence.

use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;

use crate::digest::{Digest, is_digest_reference};
use crate::error::{RegistryError, RegistryResult};
use crate::group::{GroupRouter, TargetOutcome};
use crate::proxy::ProxyCache;
use crate::repository::Repository;
use crate::storage::{RegistryStorage, StoredManifest, validate_name, validate_tag};

/// OCI image manifest.
pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
/// OCI image index.
pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
/// Docker image manifest, schema 2.
pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
/// Docker manifest list.
pub const DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
/// Docker schema 1 manifest.
pub const DOCKER_MANIFEST_V1: &str = "application/vnd.docker.distribution.manifest.v1+json";
/// Signed Docker schema 1 manifest.
pub const DOCKER_MANIFEST_V1_SIGNED: &str =
    "application/vnd.docker.distribution.manifest.v1+prettyjws";

/// A digest a manifest points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    /// Target digest.
    pub digest: Digest,
    /// Declared size, zero when not declared.
    pub size: u64,
    /// Whether the target is a child manifest rather than a blob.
    pub manifest: bool,
}

/// The parts of a manifest the registry cares about.
#[derive(Debug, Clone)]
pub struct ParsedManifest {
    /// Media type.
    pub media_type: String,
    /// Referenced blobs or child manifests.
    pub references: Vec<Reference>,
}

impl ParsedManifest {
    /// Parse a manifest body, using `content_type` when the body has no `mediaType`.
    pub fn parse(bytes: &[u8], content_type: Option<&str>) -> RegistryResult<Self> {
        let value: serde_json::Value = serde_json::from_slice(bytes)
            .map_err(|err| RegistryError::InvalidManifest(err.to_string()))?;
        let object = value
            .as_object()
            .ok_or_else(|| RegistryError::InvalidManifest("manifest is not an object".into()))?;

        let declared = object.get("mediaType").and_then(|v| v.as_str());
        let header = content_type
            .map(|ct| ct.split(';').next().unwrap_or(ct).trim())
            .filter(|ct| !ct.is_empty() && *ct != "application/json");
        let media_type = match (declared, header) {
            (Some(declared), _) => declared.to_owned(),
            (None, Some(header)) => header.to_owned(),
            (None, None) if object.get("schemaVersion").and_then(|v| v.as_u64()) == Some(1) => {
                DOCKER_MANIFEST_V1.to_owned()
            }
            (None, None) if object.contains_key("manifests") => OCI_INDEX.to_owned(),
            (None, None) => OCI_MANIFEST.to_owned(),
        };

        let references = match media_type.as_str() {
            OCI_INDEX | DOCKER_MANIFEST_LIST => {
                let manifests = object
                    .get("manifests")
                    .and_then(|v| v.as_array())
                    .ok_or_else(|| {
                        RegistryError::InvalidManifest("index without manifests".into())
                    })?;
                manifests
                    .iter()
                    .map(|entry| descriptor(entry, true))
                    .collect::<RegistryResult<Vec<_>>>()?
            }
            OCI_MANIFEST | DOCKER_MANIFEST => {
                let config = object.get("config").ok_or_else(|| {
                    RegistryError::InvalidManifest("manifest without config".into())
                })?;
                let mut references = vec![descriptor(config, false)?];
                if let Some(layers) = object.get("layers").and_then(|v| v.as_array()) {
                    for layer in layers {
                        references.push(descriptor(layer, false)?);
                    }
                }
                references
            }
            DOCKER_MANIFEST_V1 | DOCKER_MANIFEST_V1_SIGNED => object
                .get("fsLayers")
                .and_then(|v| v.as_array())
                .map(|layers| {
                    layers
                        .iter()
                        .filter_map(|layer| layer.get("blobSum")?.as_str())
                        .map(|sum| {
                            sum.parse::<Digest>().map(|digest| Reference {
                                digest,
                                size: 0,
                                manifest: false,
                            })
                        })
                        .collect::<RegistryResult<Vec<_>>>()
                })
                .transpose()?
                .unwrap_or_default(),
            other => return Err(RegistryError::UnsupportedManifestType(other.to_owned())),
        };

        Ok(Self {
            media_type,
            references,
        })
    }

    /// Sum of the declared sizes of everything referenced.
    pub fn referenced_size(&self) -> u64 {
        self.references.iter().map(|r| r.size).sum()
    }
}

fn descriptor(value: &serde_json::Value, manifest: bool) -> RegistryResult<Reference> {
    let digest = value
        .get("digest")
        .and_then(|v| v.as_str())
        .ok_or_else(|| RegistryError::InvalidManifest("descriptor without digest".into()))?
        .parse::<Digest>()?;
    let size = value.get("size").and_then(|v| v.as_u64()).unwrap_or(0);
    Ok(Reference {
        digest,
        size,
        manifest,
    })
}

/// Where a group push landed.
#[derive(Debug, Clone, Serialize)]
pub struct GroupPlacement {
    /// Group repository id.
    pub group_id: String,
    /// Policy that routed the push.
    pub write_policy: &'static str,
    /// Member that accepted it first.
    pub target_repo_id: String,
    /// Every member tried.
    pub targets: Vec<TargetOutcome>,
}

/// A stored manifest push.
#[derive(Debug, Clone, Serialize)]
pub struct ManifestPut {
    /// Digest of the manifest bytes.
    pub digest: String,
    /// Manifest media type.
    pub media_type: String,
    /// Manifest size plus every declared referenced size, for indexing.
    pub total_size: u64,
    /// Hosted repository holding the manifest.
    pub repo_id: String,
    /// References which could not be found anywhere.
    pub missing: Vec<String>,
    /// Group routing, for pushes to a group.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<GroupPlacement>,
}

/// Validates and stores pushed manifests.
///
/// Writes to a tag run under the `manifest:<repo>:<name>:<tag>` lock, so the
/// redeploy check and the write cannot interleave with another push.
#[derive(Debug, Clone)]
pub struct ManifestValidator {
    storage: RegistryStorage,
    proxy: ProxyCache,
    groups: GroupRouter,
    locks: keylock::Locks,
    lock_ttl: Duration,
}

impl ManifestValidator {
    /// A validator checking references in `storage` and through `proxy`.
    pub fn new(
        storage: RegistryStorage,
        proxy: ProxyCache,
        groups: GroupRouter,
        locks: keylock::Locks,
    ) -> Self {
        Self {
            storage,
            proxy,
            groups,
            locks,
            lock_ttl: keylock::DEFAULT_TTL,
        }
    }

    /// Push a manifest to `repo` under `reference` (a tag or its own digest).
    #[tracing::instrument(level = "debug", skip(self, repo, bytes), fields(repo = %repo.id))]
    pub async fn put(
        &self,
        repo: &Repository,
        name: &str,
        reference: &str,
        bytes: Bytes,
        content_type: Option<&str>,
    ) -> RegistryResult<ManifestPut> {
        validate_name(name)?;

        if repo.is_proxy() {
            return Err(RegistryError::Unsupported(format!(
                "proxy repository {} does not accept manifests",
                repo.id
            )));
        }

        if !repo.is_group() {
            return self
                .put_hosted(repo, None, name, reference, bytes, content_type)
                .await;
        }

        let written = self
            .groups
            .write(repo, |member| {
                let bytes = bytes.clone();
                async move {
                    self.put_hosted(&member, Some(repo), name, reference, bytes, content_type)
                        .await
                }
            })
            .await?;

        let mut put = written.value;
        put.group = Some(GroupPlacement {
            group_id: written.group_id,
            write_policy: written.write_policy,
            target_repo_id: written.target_repo_id,
            targets: written.targets,
        });
        Ok(put)
    }

    async fn put_hosted(
        &self,
        repo: &Repository,
        group: Option<&Repository>,
        name: &str,
        reference: &str,
        bytes: Bytes,
        content_type: Option<&str>,
    ) -> RegistryResult<ManifestPut> {
        let parsed = ParsedManifest::parse(&bytes, content_type)?;
        let manifest = StoredManifest::new(bytes, parsed.media_type.clone());

        let tag = if is_digest_reference(reference) {
            let expected: Digest = reference.parse()?;
            expected.verify(&manifest.digest)?;
            None
        } else {
            validate_tag(reference)?;
            Some(reference)
        };

        let mut missing = Vec::new();
        for reference in &parsed.references {
            if !self.resolve_reference(repo, group, name, reference).await? {
                tracing::warn!(
                    repo = %repo.id,
                    %name,
                    digest = %reference.digest,
                    "manifest references content not present; accepting"
                );
                missing.push(reference.digest.to_string());
            }
        }

        self.persist(repo, name, tag, &manifest).await?;

        Ok(ManifestPut {
            digest: manifest.digest.to_string(),
            media_type: parsed.media_type.clone(),
            total_size: manifest.bytes.len() as u64 + parsed.referenced_size(),
            repo_id: repo.id.clone(),
            missing,
            group: None,
        })
    }

    /// Point `tag` at a manifest already stored in hosted `repo` under `digest`.
    pub async fn tag(
        &self,
        repo: &Repository,
        name: &str,
        tag: &str,
        digest: &Digest,
    ) -> RegistryResult<()> {
        validate_tag(tag)?;
        let manifest = self
            .storage
            .get_manifest(&repo.id, name, &digest.to_string())
            .await?;
        self.persist(repo, name, Some(tag), &manifest).await
    }

    /// Store `manifest`, holding the tag's lock across the redeploy check and
    /// the write.
    async fn persist(
        &self,
        repo: &Repository,
        name: &str,
        tag: Option<&str>,
        manifest: &StoredManifest,
    ) -> RegistryResult<()> {
        let Some(tag) = tag else {
            return self.storage.put_manifest(&repo.id, name, None, manifest).await;
        };

        let key = format!("manifest:{}:{name}:{tag}", repo.id);
        self.locks
            .run_with_lock(&key, self.lock_ttl, async {
                if !repo.config.allow_redeploy
                    && self.storage.manifest_exists(&repo.id, name, tag).await?
                {
                    return Err(RegistryError::Conflict(format!(
                        "{name}:{tag} already exists in {} and redeploy is disabled",
                        repo.id
                    )));
                }
                self.storage
                    .put_manifest(&repo.id, name, Some(tag), manifest)
                    .await
            })
            .await?
    }

    /// Whether a reference exists: in `repo`, then in the group's other hosted
    /// members, then upstream through the group's proxy members.
    async fn resolve_reference(
        &self,
        repo: &Repository,
        group: Option<&Repository>,
        name: &str,
        reference: &Reference,
    ) -> RegistryResult<bool> {
        if self.present(&repo.id, name, reference).await? {
            return Ok(true);
        }

        let Some(group) = group else {
            return Ok(false);
        };

        for member in self.groups.members(group) {
            if member.id == repo.id {
                continue;
            }
            if member.is_hosted() {
                if self.present(&member.id, name, reference).await? {
                    return Ok(true);
                }
            } else if member.is_proxy() {
                let kind = if reference.manifest { "manifests" } else { "blobs" };
                let path = format!("v2/{name}/{kind}/{}", reference.digest);
                let fetched = self
                    .proxy
                    .proxy_fetch(&member, &path, Some(&reference.digest))
                    .await;
                match fetched {
                    Ok(_) => return Ok(true),
                    Err(err) => {
                        tracing::debug!(
                            proxy = %member.id,
                            %path,
                            error = %err,
                            "reference not available upstream"
                        );
                    }
                }
            }
        }
        Ok(false)
    }

    async fn present(&self, repo: &str, name: &str, reference: &Reference) -> RegistryResult<bool> {
        if reference.manifest {
            self.storage
                .manifest_exists(repo, name, &reference.digest.to_string())
                .await
        } else {
            self.storage.blob_exists(repo, &reference.digest).await
        }
    }

    /// Delete a manifest from a hosted repository, or through a group's write policy.
    pub async fn delete(
        &self,
        repo: &Repository,
        name: &str,
        reference: &str,
    ) -> RegistryResult<()> {
        if repo.is_proxy() {
            return Err(RegistryError::Unsupported(format!(
                "proxy repository {} is read-only",
                repo.id
            )));
        }
        if repo.is_group() {
            self.groups
                .write(repo, |member| async move {
                    self.storage.delete_manifest(&member.id, name, reference).await
                })
                .await?;
            return Ok(());
        }
        self.storage.delete_manifest(&repo.id, name, reference).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::repository::{RepositoryCatalog, WritePolicy};
    use storage::{MemoryStorage, Storage};
    use upstream::mock::{MockResponse, MockService};

    struct Fixture {
        storage: RegistryStorage,
        catalog: RepositoryCatalog,
        mock: MockService,
        validator: ManifestValidator,
    }

    fn fixture() -> Fixture {
        let backend: Storage = MemoryStorage::new().into();
        let storage = RegistryStorage::new(backend.bucket("registry"));
        let catalog = RepositoryCatalog::new();
        catalog.upsert(Repository::hosted("a", "a")).unwrap();
        catalog.upsert(Repository::hosted("b", "b")).unwrap();
        catalog
            .upsert(Repository::hosted("locked", "locked").without_redeploy())
            .unwrap();
        catalog
            .upsert(Repository::proxy(
                "hub",
                "hub",
                "http://upstream.test".parse().unwrap(),
            ))
            .unwrap();

        let mock = MockService::new();
        let fetcher =
            upstream::UpstreamFetcher::with_service(upstream::FetchConfig::default(), mock.clone());
        let locks = keylock::Locks::local();
        let proxy = ProxyCache::new(backend.bucket("registry"), fetcher, locks.clone());
        let groups = GroupRouter::new(catalog.clone());
        let validator = ManifestValidator::new(storage.clone(), proxy, groups, locks);
        Fixture {
            storage,
            catalog,
            mock,
            validator,
        }
    }

    fn image(config: &Digest) -> Bytes {
        Bytes::from(
            serde_json::to_vec(&serde_json::json!({
                "schemaVersion": 2,
                "mediaType": DOCKER_MANIFEST,
                "config": {
                    "mediaType": "application/vnd.docker.container.image.v1+json",
                    "digest": config.to_string(),
                    "size": 7,
                },
                "layers": [{
                    "mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip",
                    "digest": Digest::sha256(b"layer").to_string(),
                    "size": 5,
                }],
            }))
            .unwrap(),
        )
    }

    #[test]
    fn parses_indexes_and_images() {
        let config = Digest::sha256(b"config");
        let parsed = ParsedManifest::parse(&image(&config), None).unwrap();
        assert_eq!(parsed.media_type, DOCKER_MANIFEST);
        assert_eq!(parsed.references.len(), 2);
        assert_eq!(parsed.referenced_size(), 12);

        let index = serde_json::json!({
            "schemaVersion": 2,
            "manifests": [{"digest": config.to_string(), "size": 10}],
        });
        let parsed =
            ParsedManifest::parse(&serde_json::to_vec(&index).unwrap(), Some(OCI_INDEX)).unwrap();
        assert!(parsed.references[0].manifest);

        let err = ParsedManifest::parse(br#"{"mediaType":"text/plain"}"#, None).unwrap_err();
        assert!(matches!(err, RegistryError::UnsupportedManifestType(_)));
        assert!(ParsedManifest::parse(b"nope", None).is_err());
    }

    #[tokio::test]
    async fn hosted_push_stores_tag_and_digest() {
        let f = fixture();
        let repo = f.catalog.get("a").unwrap();
        let config = Digest::sha256(b"config");
        f.storage
            .put_blob("a", &config, Bytes::from_static(b"config"))
            .await
            .unwrap();

        let bytes = image(&config);
        let put = f
            .validator
            .put(&repo, "app", "v1", bytes.clone(), None)
            .await
            .unwrap();

        assert_eq!(put.digest, Digest::sha256(&bytes).to_string());
        assert_eq!(put.total_size, bytes.len() as u64 + 12);
        assert_eq!(put.missing, vec![Digest::sha256(b"layer").to_string()]);
        assert!(f.storage.manifest_exists("a", "app", "v1").await.unwrap());
        assert!(f.storage.manifest_exists("a", "app", &put.digest).await.unwrap());
    }

    #[tokio::test]
    async fn digest_reference_must_match_body() {
        let f = fixture();
        let repo = f.catalog.get("a").unwrap();
        let bytes = image(&Digest::sha256(b"config"));

        let err = f
            .validator
            .put(&repo, "app", &Digest::sha256(b"x").to_string(), bytes.clone(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::DigestMismatch { .. }));

        let digest = Digest::sha256(&bytes).to_string();
        f.validator
            .put(&repo, "app", &digest, bytes, None)
            .await
            .unwrap();
        assert!(f.storage.list_tags("a", "app").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn redeploy_policy() {
        let f = fixture();
        let repo = f.catalog.get("locked").unwrap();
        let bytes = image(&Digest::sha256(b"config"));

        f.validator
            .put(&repo, "app", "v1", bytes.clone(), None)
            .await
            .unwrap();
        let err = f
            .validator
            .put(&repo, "app", "v1", bytes, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Conflict(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_pushes_to_a_locked_tag_admit_one() {
        let f = Arc::new(fixture());
        let repo = f.catalog.get("locked").unwrap();

        let tasks: Vec<_> = (0..8u8)
            .map(|i| {
                let f = f.clone();
                let repo = repo.clone();
                tokio::spawn(async move {
                    let bytes = image(&Digest::sha256(&[i]));
                    f.validator.put(&repo, "app", "v1", bytes, None).await
                })
            })
            .collect();

        let mut stored = Vec::new();
        let mut conflicts = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(put) => stored.push(put.digest),
                Err(RegistryError::Conflict(_)) => conflicts += 1,
                Err(err) => panic!("unexpected error: {err}"),
            }
        }
        assert_eq!(stored.len(), 1);
        assert_eq!(conflicts, 7);

        let tagged = f.storage.get_manifest("locked", "app", "v1").await.unwrap();
        assert_eq!(tagged.digest.to_string(), stored[0]);
    }

    #[tokio::test]
    async fn tagging_follows_the_redeploy_policy() {
        let f = fixture();
        let bytes = image(&Digest::sha256(b"config"));
        let digest = Digest::sha256(&bytes);

        let open = f.catalog.get("a").unwrap();
        f.validator
            .put(&open, "app", &digest.to_string(), bytes.clone(), None)
            .await
            .unwrap();
        f.validator.tag(&open, "app", "v1", &digest).await.unwrap();
        f.validator.tag(&open, "app", "v1", &digest).await.unwrap();
        assert_eq!(f.storage.list_tags("a", "app").await.unwrap(), vec!["v1"]);

        let locked = f.catalog.get("locked").unwrap();
        f.validator
            .put(&locked, "app", &digest.to_string(), bytes, None)
            .await
            .unwrap();
        f.validator.tag(&locked, "app", "v1", &digest).await.unwrap();
        let err = f
            .validator
            .tag(&locked, "app", "v1", &digest)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Conflict(_)));

        let missing = Digest::sha256(b"nothing");
        let err = f
            .validator
            .tag(&open, "app", "v2", &missing)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn pushed_media_type_is_served_back() {
        let f = fixture();
        let repo = f.catalog.get("a").unwrap();
        let child = Digest::sha256(b"child");
        let index = Bytes::from(
            serde_json::to_vec(&serde_json::json!({
                "schemaVersion": 2,
                "manifests": [{"digest": child.to_string(), "size": 5}],
            }))
            .unwrap(),
        );

        let put = f
            .validator
            .put(&repo, "app", "multi", index, Some(DOCKER_MANIFEST_LIST))
            .await
            .unwrap();
        assert_eq!(put.media_type, DOCKER_MANIFEST_LIST);

        let stored = f.storage.get_manifest("a", "app", "multi").await.unwrap();
        assert_eq!(stored.media_type, DOCKER_MANIFEST_LIST);
    }

    #[tokio::test]
    async fn proxied_references_must_match_their_digest() {
        let f = fixture();
        let config = Digest::sha256(b"config");
        f.mock.add(
            &format!("/v2/app/blobs/{config}"),
            MockResponse::ok("tampered"),
        );

        let group = f
            .catalog
            .upsert(Repository::group("g", "g", ["a", "hub"], WritePolicy::First))
            .unwrap();
        let put = f
            .validator
            .put(&group, "app", "v1", image(&config), None)
            .await
            .unwrap();
        assert!(put.missing.contains(&config.to_string()));
    }

    #[tokio::test]
    async fn proxy_pushes_are_refused() {
        let f = fixture();
        let repo = f.catalog.get("hub").unwrap();
        let err = f
            .validator
            .put(&repo, "app", "v1", image(&Digest::sha256(b"c")), None)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Unsupported(_)));
    }

    #[tokio::test]
    async fn group_policies_place_manifests() {
        let f = fixture();
        let bytes = image(&Digest::sha256(b"config"));

        let mirror = f
            .catalog
            .upsert(Repository::group("m", "m", ["a", "b"], WritePolicy::Mirror))
            .unwrap();
        let put = f
            .validator
            .put(&mirror, "app", "v1", bytes.clone(), None)
            .await
            .unwrap();
        assert_eq!(put.group.as_ref().unwrap().write_policy, "mirror");
        assert!(f.storage.manifest_exists("a", "app", "v1").await.unwrap());
        assert!(f.storage.manifest_exists("b", "app", "v1").await.unwrap());

        let first = f
            .catalog
            .upsert(Repository::group("f", "f", ["hub", "b", "a"], WritePolicy::First))
            .unwrap();
        let put = f
            .validator
            .put(&first, "app", "v2", bytes.clone(), None)
            .await
            .unwrap();
        assert_eq!(put.group.unwrap().target_repo_id, "b");
        assert!(f.storage.manifest_exists("b", "app", "v2").await.unwrap());
        assert!(!f.storage.manifest_exists("a", "app", "v2").await.unwrap());

        let none = f
            .catalog
            .upsert(Repository::group("n", "n", ["a", "b"], WritePolicy::None))
            .unwrap();
        assert!(
            f.validator
                .put(&none, "app", "v3", bytes, None)
                .await
                .is_err()
        );
        assert!(!f.storage.manifest_exists("a", "app", "v3").await.unwrap());
        assert!(!f.storage.manifest_exists("b", "app", "v3").await.unwrap());
    }

    #[tokio::test]
    async fn group_pushes_resolve_references_through_proxies() {
        let f = fixture();
        let config = Digest::sha256(b"config");
        let layer = Digest::sha256(b"layer");
        f.mock.add(
            &format!("/v2/app/blobs/{config}"),
            MockResponse::ok("config"),
        );
        f.mock
            .add(&format!("/v2/app/blobs/{layer}"), MockResponse::ok("layer"));

        let group = f
            .catalog
            .upsert(Repository::group("g", "g", ["a", "hub"], WritePolicy::First))
            .unwrap();
        let put = f
            .validator
            .put(&group, "app", "v1", image(&config), None)
            .await
            .unwrap();
        assert!(put.missing.is_empty());
        assert_eq!(f.mock.hits(&format!("/v2/app/blobs/{config}")), 1);
    }
}
