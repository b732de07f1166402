//! Repository records and the catalog that validates them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use http::Uri;
use parking_lot::RwLock;
use serde::Deserialize;
use upstream::{AuthSources, Credentials};

/// The role a repository plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepositoryKind {
    /// Locally stored, writable.
    Hosted,
    /// Read-only cached mirror of an upstream.
    Proxy,
    /// Virtual aggregate over member repositories.
    Group,
}

/// How a group routes writes to its members.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WritePolicy {
    /// The group is read-only.
    #[default]
    None,
    /// Try hosted members in order; the first to accept wins.
    First,
    /// Route to the preferred writer.
    Preferred,
    /// Route manifests to the preferred writer; uploads to every hosted member.
    Broadcast,
    /// Write to every hosted member.
    Mirror,
}

impl WritePolicy {
    /// Lowercase name, as configured.
    pub fn as_str(&self) -> &'static str {
        match self {
            WritePolicy::None => "none",
            WritePolicy::First => "first",
            WritePolicy::Preferred => "preferred",
            WritePolicy::Broadcast => "broadcast",
            WritePolicy::Mirror => "mirror",
        }
    }
}

/// Ecosystem-specific settings for container repositories.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    /// Upstream credentials, taking priority over all others.
    pub auth: Option<Credentials>,
}

/// Per-repository settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Upstream base URL (proxy repositories).
    #[serde(with = "upstream::uri::serde::option")]
    pub upstream: Option<Uri>,
    /// Upstream credentials.
    pub auth: Option<Credentials>,
    /// Container-specific settings.
    pub docker: DockerConfig,
    /// How long proxied content is served from cache, in seconds.
    #[serde(with = "crate::config::seconds")]
    pub cache_ttl: Duration,
    /// Member repository ids, in resolution order (group repositories).
    pub members: Vec<String>,
    /// Group write routing.
    pub write_policy: WritePolicy,
    /// Hosted member receiving `preferred`/`broadcast` writes.
    pub preferred_writer: Option<String>,
    /// Whether an existing tag may be overwritten (hosted repositories).
    pub allow_redeploy: bool,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            upstream: None,
            auth: None,
            docker: DockerConfig::default(),
            cache_ttl: Duration::from_secs(60 * 60),
            members: Vec::new(),
            write_policy: WritePolicy::None,
            preferred_writer: None,
            allow_redeploy: true,
        }
    }
}

/// A repository definition.
#[derive(Debug, Clone, Deserialize)]
pub struct Repository {
    /// Stable identifier; storage keys are scoped by it.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Role.
    #[serde(rename = "type")]
    pub kind: RepositoryKind,
    /// Ecosystem tag selecting the plugin.
    #[serde(default = "default_ecosystem")]
    pub ecosystem: String,
    /// Role-specific settings.
    #[serde(default)]
    pub config: RepositoryConfig,
    /// Credentials stored on the record itself.
    #[serde(default)]
    pub auth: Option<Credentials>,
    /// Listener port; 0 picks one from the configured range.
    #[serde(default)]
    pub port: u16,
}

fn default_ecosystem() -> String {
    "docker".into()
}

impl Repository {
    fn new(id: impl Into<String>, name: impl Into<String>, kind: RepositoryKind) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind,
            ecosystem: default_ecosystem(),
            config: RepositoryConfig::default(),
            auth: None,
            port: 0,
        }
    }

    /// A hosted repository.
    pub fn hosted(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(id, name, RepositoryKind::Hosted)
    }

    /// A proxy repository mirroring `upstream`.
    pub fn proxy(id: impl Into<String>, name: impl Into<String>, upstream: Uri) -> Self {
        let mut repo = Self::new(id, name, RepositoryKind::Proxy);
        repo.config.upstream = Some(upstream);
        repo
    }

    /// A group over `members`, writing per `policy`.
    pub fn group<I, S>(
        id: impl Into<String>,
        name: impl Into<String>,
        members: I,
        policy: WritePolicy,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut repo = Self::new(id, name, RepositoryKind::Group);
        repo.config.members = members.into_iter().map(Into::into).collect();
        repo.config.write_policy = policy;
        repo
    }

    /// Set the preferred writer.
    pub fn with_preferred_writer(mut self, writer: impl Into<String>) -> Self {
        self.config.preferred_writer = Some(writer.into());
        self
    }

    /// Set the proxy cache TTL.
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.config.cache_ttl = ttl;
        self
    }

    /// Set repository-level credentials.
    pub fn with_auth(mut self, credentials: Credentials) -> Self {
        self.auth = Some(credentials);
        self
    }

    /// Forbid overwriting tags.
    pub fn without_redeploy(mut self) -> Self {
        self.config.allow_redeploy = false;
        self
    }

    /// Whether this is a hosted repository.
    pub fn is_hosted(&self) -> bool {
        self.kind == RepositoryKind::Hosted
    }

    /// Whether this is a proxy repository.
    pub fn is_proxy(&self) -> bool {
        self.kind == RepositoryKind::Proxy
    }

    /// Whether this is a group repository.
    pub fn is_group(&self) -> bool {
        self.kind == RepositoryKind::Group
    }

    /// Every place this repository carries upstream credentials.
    pub fn auth_sources(&self) -> AuthSources {
        AuthSources {
            docker: self.config.docker.auth.clone(),
            config: self.config.auth.clone(),
            repository: self.auth.clone(),
        }
    }
}

/// A repository definition was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CatalogError {
    /// Id or name is empty.
    #[error("repository id and name must not be empty")]
    EmptyName,

    /// Another repository already uses the name.
    #[error("repository name {name} is already used by {existing}")]
    DuplicateName {
        /// Conflicting name.
        name: String,
        /// Id of the repository holding it.
        existing: String,
    },

    /// Proxy without an upstream URL.
    #[error("proxy repository {0} has no upstream URL")]
    MissingUpstream(String),

    /// Group lists an unknown member.
    #[error("group {group} lists unknown member {member}")]
    UnknownMember {
        /// Group id.
        group: String,
        /// Missing member id.
        member: String,
    },

    /// Group lists another group.
    #[error("group {group} cannot contain group {member}")]
    NestedGroup {
        /// Group id.
        group: String,
        /// Nested group id.
        member: String,
    },

    /// Preferred writer is not a hosted member.
    #[error("preferred writer {writer} of group {group} must be a hosted member")]
    PreferredWriter {
        /// Group id.
        group: String,
        /// Configured writer.
        writer: String,
    },

    /// The repository is still a member of a group.
    #[error("repository {member} is a member of group {group}")]
    InUse {
        /// Member id.
        member: String,
        /// Group id.
        group: String,
    },
}

/// All repository definitions, validated on write.
#[derive(Debug, Clone, Default)]
pub struct RepositoryCatalog {
    repositories: Arc<RwLock<HashMap<String, Arc<Repository>>>>,
}

impl RepositoryCatalog {
    /// An empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a repository after validating it.
    ///
    /// Group membership is checked here and nowhere else: members must exist and
    /// must not be groups, and a preferred writer must be a hosted member. A
    /// repository cannot be turned into a group while it is itself a member.
    pub fn upsert(&self, repository: Repository) -> Result<Arc<Repository>, CatalogError> {
        let mut repositories = self.repositories.write();

        if repository.id.is_empty() || repository.name.is_empty() {
            return Err(CatalogError::EmptyName);
        }

        if let Some(existing) = repositories
            .values()
            .find(|r| r.name == repository.name && r.id != repository.id)
        {
            return Err(CatalogError::DuplicateName {
                name: repository.name.clone(),
                existing: existing.id.clone(),
            });
        }

        match repository.kind {
            RepositoryKind::Proxy if repository.config.upstream.is_none() => {
                return Err(CatalogError::MissingUpstream(repository.id.clone()));
            }
            RepositoryKind::Group => {
                for member in &repository.config.members {
                    let Some(found) = repositories.get(member) else {
                        return Err(CatalogError::UnknownMember {
                            group: repository.id.clone(),
                            member: member.clone(),
                        });
                    };
                    if found.is_group() || member == &repository.id {
                        return Err(CatalogError::NestedGroup {
                            group: repository.id.clone(),
                            member: member.clone(),
                        });
                    }
                }

                if let Some(writer) = &repository.config.preferred_writer {
                    let hosted_member = repository.config.members.contains(writer)
                        && repositories.get(writer).is_some_and(|r| r.is_hosted());
                    if !hosted_member {
                        return Err(CatalogError::PreferredWriter {
                            group: repository.id.clone(),
                            writer: writer.clone(),
                        });
                    }
                }
            }
            _ => {}
        }

        if !repository.is_hosted() {
            let blocking = Self::groups_containing(&repositories, &repository.id).find(|group| {
                repository.is_group()
                    || group.config.preferred_writer.as_deref() == Some(&repository.id)
            });
            if let Some(group) = blocking {
                return Err(CatalogError::InUse {
                    member: repository.id.clone(),
                    group: group.id.clone(),
                });
            }
        }

        tracing::debug!(id = %repository.id, kind = ?repository.kind, "upserting repository");
        let repository = Arc::new(repository);
        repositories.insert(repository.id.clone(), repository.clone());
        Ok(repository)
    }

    /// Remove a repository which no group refers to.
    pub fn remove(&self, id: &str) -> Result<Option<Arc<Repository>>, CatalogError> {
        let mut repositories = self.repositories.write();
        if let Some(group) = Self::groups_containing(&repositories, id).next() {
            return Err(CatalogError::InUse {
                member: id.to_owned(),
                group: group.id.clone(),
            });
        }
        Ok(repositories.remove(id))
    }

    fn groups_containing<'r>(
        repositories: &'r HashMap<String, Arc<Repository>>,
        id: &'r str,
    ) -> impl Iterator<Item = &'r Arc<Repository>> + 'r {
        repositories
            .values()
            .filter(move |r| r.is_group() && r.config.members.iter().any(|m| m == id))
    }

    /// Look up by id.
    pub fn get(&self, id: &str) -> Option<Arc<Repository>> {
        self.repositories.read().get(id).cloned()
    }

    /// Look up by name.
    pub fn by_name(&self, name: &str) -> Option<Arc<Repository>> {
        self.repositories
            .read()
            .values()
            .find(|r| r.name == name)
            .cloned()
    }

    /// Members of a group, in declared order. Unknown ids and nested groups are skipped.
    pub fn members(&self, group: &Repository) -> Vec<Arc<Repository>> {
        let repositories = self.repositories.read();
        group
            .config
            .members
            .iter()
            .filter_map(|id| repositories.get(id))
            .filter(|r| !r.is_group())
            .cloned()
            .collect()
    }

    /// Every repository, sorted by id.
    pub fn list(&self) -> Vec<Arc<Repository>> {
        let mut all: Vec<_> = self.repositories.read().values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }
}
