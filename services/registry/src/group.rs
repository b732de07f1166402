//! Read and write fan-out across the members of a group repository.

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;

use crate::error::{RegistryError, RegistryResult};
use crate::repository::{Repository, RepositoryCatalog, WritePolicy};

/// The outcome of a write on one member.
#[derive(Debug, Clone, Serialize)]
pub struct TargetOutcome {
    /// Member repository id.
    pub repo_id: String,
    /// Error message, when the write failed there.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A successful group write, annotated with where it landed.
#[derive(Debug, Clone, Serialize)]
pub struct GroupWrite<T> {
    /// Group repository id.
    pub group_id: String,
    /// Policy that routed the write.
    pub write_policy: &'static str,
    /// First member that accepted the write.
    pub target_repo_id: String,
    /// What that member returned.
    pub value: T,
    /// Every member that was tried.
    pub targets: Vec<TargetOutcome>,
}

/// Members an upload session is persisted to.
#[derive(Debug, Clone)]
pub struct UploadRoute {
    /// Hosted members, in the order they are tried.
    pub targets: Vec<Arc<Repository>>,
    /// Persist to every target rather than stopping at the first success.
    pub fan_out: bool,
}

/// Resolves group membership and applies write policies.
#[derive(Debug, Clone)]
pub struct GroupRouter {
    catalog: RepositoryCatalog,
}

impl GroupRouter {
    /// Route over the repositories in `catalog`.
    pub fn new(catalog: RepositoryCatalog) -> Self {
        Self { catalog }
    }

    /// Members in declared order.
    pub fn members(&self, group: &Repository) -> Vec<Arc<Repository>> {
        self.catalog.members(group)
    }

    /// Hosted members in declared order.
    pub fn hosted_members(&self, group: &Repository) -> Vec<Arc<Repository>> {
        self.members(group)
            .into_iter()
            .filter(|member| member.is_hosted())
            .collect()
    }

    fn preferred_writer(&self, group: &Repository) -> RegistryResult<Arc<Repository>> {
        let writer = group.config.preferred_writer.as_deref().ok_or_else(|| {
            RegistryError::Config(format!(
                "group {} uses {} writes without a preferred writer",
                group.id,
                group.config.write_policy.as_str()
            ))
        })?;
        self.hosted_members(group)
            .into_iter()
            .find(|member| member.id == writer)
            .ok_or_else(|| {
                RegistryError::Config(format!(
                    "preferred writer {writer} is not a hosted member of {}",
                    group.id
                ))
            })
    }

    fn read_only(group: &Repository) -> RegistryError {
        RegistryError::Unsupported(format!("group {} is read-only", group.id))
    }

    /// Which members receive a blob upload started on the group.
    pub fn upload_route(&self, group: &Repository) -> RegistryResult<UploadRoute> {
        let route = match group.config.write_policy {
            WritePolicy::None => return Err(Self::read_only(group)),
            WritePolicy::First => UploadRoute {
                targets: self.hosted_members(group),
                fan_out: false,
            },
            WritePolicy::Preferred => UploadRoute {
                targets: vec![self.preferred_writer(group)?],
                fan_out: false,
            },
            WritePolicy::Broadcast => {
                let preferred = self.preferred_writer(group)?;
                let mut targets = vec![preferred.clone()];
                targets.extend(
                    self.hosted_members(group)
                        .into_iter()
                        .filter(|member| member.id != preferred.id),
                );
                UploadRoute {
                    targets,
                    fan_out: true,
                }
            }
            WritePolicy::Mirror => UploadRoute {
                targets: self.hosted_members(group),
                fan_out: true,
            },
        };

        if route.targets.is_empty() {
            return Err(RegistryError::Unsupported(format!(
                "group {} has no hosted members",
                group.id
            )));
        }
        Ok(route)
    }

    /// Try each member in order and return the first success.
    ///
    /// A member answering "not found" is skipped silently. When every member
    /// fails, the first error which is not a "not found" is returned, otherwise
    /// the last "not found".
    pub async fn read_first<T, F, Fut>(&self, group: &Repository, read: F) -> RegistryResult<T>
    where
        F: Fn(Arc<Repository>) -> Fut,
        Fut: Future<Output = RegistryResult<T>>,
    {
        let mut missing = None;
        let mut failure = None;

        for member in self.members(group) {
            let id = member.id.clone();
            match read(member).await {
                Ok(value) => {
                    tracing::trace!(group = %group.id, member = %id, "group read hit");
                    return Ok(value);
                }
                Err(err) if err.is_not_found() => missing = Some(err),
                Err(err) => {
                    tracing::warn!(
                        group = %group.id,
                        member = %id,
                        error = %err,
                        "group member read failed",
                    );
                    if failure.is_none() {
                        failure = Some(err);
                    }
                }
            }
        }

        Err(failure
            .or(missing)
            .unwrap_or_else(|| RegistryError::RepositoryNotFound(group.name.clone())))
    }

    /// Apply the group's write policy to `write`.
    ///
    /// `none` rejects. `first` tries hosted members in order and stops at the
    /// first success. `preferred` and `broadcast` write to the preferred writer
    /// only. `mirror` writes to every hosted member concurrently and succeeds if
    /// any member does.
    pub async fn write<T, F, Fut>(
        &self,
        group: &Repository,
        write: F,
    ) -> RegistryResult<GroupWrite<T>>
    where
        F: Fn(Arc<Repository>) -> Fut,
        Fut: Future<Output = RegistryResult<T>>,
    {
        let policy = group.config.write_policy;
        let annotate = |target: &str, value: T, targets: Vec<TargetOutcome>| GroupWrite {
            group_id: group.id.clone(),
            write_policy: policy.as_str(),
            target_repo_id: target.to_owned(),
            value,
            targets,
        };

        match policy {
            WritePolicy::None => Err(Self::read_only(group)),
            WritePolicy::First => {
                let mut targets = Vec::new();
                let mut last = None;
                for member in self.hosted_members(group) {
                    let id = member.id.clone();
                    match write(member).await {
                        Ok(value) => {
                            targets.push(TargetOutcome {
                                repo_id: id.clone(),
                                error: None,
                            });
                            return Ok(annotate(&id, value, targets));
                        }
                        Err(err) => {
                            tracing::debug!(
                                group = %group.id,
                                member = %id,
                                error = %err,
                                "member declined write",
                            );
                            targets.push(TargetOutcome {
                                repo_id: id,
                                error: Some(err.to_string()),
                            });
                            last = Some(err);
                        }
                    }
                }
                Err(last.unwrap_or_else(|| {
                    RegistryError::Unsupported(format!("group {} has no hosted members", group.id))
                }))
            }
            WritePolicy::Preferred | WritePolicy::Broadcast => {
                let writer = self.preferred_writer(group)?;
                let id = writer.id.clone();
                let value = write(writer).await?;
                let targets = vec![TargetOutcome {
                    repo_id: id.clone(),
                    error: None,
                }];
                Ok(annotate(&id, value, targets))
            }
            WritePolicy::Mirror => {
                let members = self.hosted_members(group);
                let ids: Vec<String> = members.iter().map(|m| m.id.clone()).collect();
                let results = futures::future::join_all(members.into_iter().map(&write)).await;

                let mut targets = Vec::with_capacity(ids.len());
                let mut accepted = None;
                let mut first_error = None;
                for (id, result) in ids.into_iter().zip(results) {
                    match result {
                        Ok(value) => {
                            targets.push(TargetOutcome {
                                repo_id: id.clone(),
                                error: None,
                            });
                            if accepted.is_none() {
                                accepted = Some((id, value));
                            }
                        }
                        Err(err) => {
                            tracing::warn!(
                                group = %group.id,
                                member = %id,
                                error = %err,
                                "mirror write failed",
                            );
                            targets.push(TargetOutcome {
                                repo_id: id,
                                error: Some(err.to_string()),
                            });
                            if first_error.is_none() {
                                first_error = Some(err);
                            }
                        }
                    }
                }

                match accepted {
                    Some((id, value)) => Ok(annotate(&id, value, targets)),
                    None => Err(first_error.unwrap_or_else(|| {
                        RegistryError::Unsupported(format!(
                            "group {} has no hosted members",
                            group.id
                        ))
                    })),
                }
            }
        }
    }
}
