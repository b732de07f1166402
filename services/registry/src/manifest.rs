//! Manifest operations for the registry

use std::collections::{BTreeMap, BTreeSet, HashMap};

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use bytes::Bytes;

use crate::api::{DOCKER_CONTENT_DIGEST, Registry, RepoState, empty};
use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::repository::Repository;
use crate::storage::validate_tag;

/// Largest manifest body accepted.
const MAX_MANIFEST_SIZE: usize = 4 * 1024 * 1024;

/// Get a manifest, or just its headers for `HEAD`.
pub(crate) async fn get(
    registry: &Registry,
    repo: &Repository,
    path: &str,
    head: bool,
) -> RegistryResult<Response> {
    let plugin = registry.plugins().for_repository(repo)?;
    let artifact = plugin.download(repo, path).await?;

    let mut response = empty(
        StatusCode::OK,
        vec![
            (header::CONTENT_TYPE, artifact.content_type),
            (header::CONTENT_LENGTH, artifact.content.size().to_string()),
            (DOCKER_CONTENT_DIGEST, artifact.digest),
        ],
    )?;
    if !head {
        *response.body_mut() = artifact.content.into_body(None);
    }
    Ok(response)
}

/// Put a manifest
pub(crate) async fn put(
    registry: &Registry,
    repo: &Repository,
    name: &str,
    reference: &str,
    headers: &HeaderMap,
    body: Body,
) -> RegistryResult<Response> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());
    let bytes = axum::body::to_bytes(body, MAX_MANIFEST_SIZE)
        .await
        .map_err(|err| RegistryError::InvalidManifest(format!("reading manifest: {err}")))?;

    let put = registry
        .validator()
        .put(repo, name, reference, bytes, content_type)
        .await?;

    let mut response = Json(&put).into_response();
    *response.status_mut() = StatusCode::CREATED;
    let headers = response.headers_mut();
    let location = HeaderValue::try_from(format!("/v2/{name}/manifests/{}", put.digest))
        .map_err(|_| RegistryError::InvalidName(name.to_owned()))?;
    let digest = HeaderValue::try_from(put.digest.as_str())
        .map_err(|_| RegistryError::InvalidDigest(put.digest.clone()))?;
    headers.insert(header::LOCATION, location);
    headers.insert(DOCKER_CONTENT_DIGEST, digest);
    Ok(response)
}

/// Delete a manifest
pub(crate) async fn delete(
    registry: &Registry,
    repo: &Repository,
    name: &str,
    reference: &str,
) -> RegistryResult<Response> {
    registry.validator().delete(repo, name, reference).await?;
    empty(StatusCode::ACCEPTED, Vec::new())
}

/// Tag list response
#[derive(Debug, serde::Serialize)]
struct TagList<'a> {
    name: &'a str,
    tags: Vec<String>,
}

/// List tags for an image, honouring `n` and `last`.
pub(crate) async fn list_tags(
    registry: &Registry,
    repo: &Repository,
    name: &str,
    query: &HashMap<String, String>,
) -> RegistryResult<Response> {
    let plugin = registry.plugins().for_repository(repo)?;
    let tags = plugin.list_versions(repo, name).await?;
    let (tags, next) = paginate(tags, query)?;

    let mut response = Json(TagList { name, tags }).into_response();
    if let Some((n, last)) = next {
        link_next(&mut response, &format!("/v2/{name}/tags/list?n={n}&last={last}"));
    }
    Ok(response)
}

#[derive(Debug, serde::Serialize)]
struct Catalog {
    repositories: Vec<String>,
}

/// Image names stored in the repository, honouring `n` and `last`.
///
/// Groups list the union of their hosted members.
pub(crate) async fn catalog(
    State(state): State<RepoState>,
    Query(query): Query<HashMap<String, String>>,
) -> RegistryResult<Response> {
    let repo = state.repository()?;
    let registry = &state.registry;

    let sources = if repo.is_group() {
        registry.groups().hosted_members(&repo)
    } else {
        vec![repo]
    };
    let mut names = BTreeSet::new();
    for source in sources {
        names.extend(registry.storage().catalog(&source.id).await?);
    }

    let (repositories, next) = paginate(names.into_iter().collect(), &query)?;
    let mut response = Json(Catalog { repositories }).into_response();
    if let Some((n, last)) = next {
        link_next(&mut response, &format!("/v2/_catalog?n={n}&last={last}"));
    }
    Ok(response)
}

/// Keep entries after `last`, at most `n` of them. Returns the page and,
/// when entries remain, the parameters of the next page.
fn paginate(
    mut entries: Vec<String>,
    query: &HashMap<String, String>,
) -> RegistryResult<(Vec<String>, Option<(usize, String)>)> {
    entries.sort();
    if let Some(last) = query.get("last") {
        entries.retain(|entry| entry.as_str() > last.as_str());
    }

    let Some(n) = query.get("n") else {
        return Ok((entries, None));
    };
    let n: usize = n
        .parse()
        .map_err(|_| RegistryError::PaginationInvalid(n.clone()))?;
    if entries.len() <= n {
        return Ok((entries, None));
    }
    entries.truncate(n);
    let next = entries.last().map(|last| (n, last.clone()));
    Ok((entries, next))
}

fn link_next(response: &mut Response, target: &str) {
    if let Ok(value) = HeaderValue::try_from(format!(r#"<{target}>; rel="next""#)) {
        response.headers_mut().insert(header::LINK, value);
    }
}

/// `GET /v1/_ping`
pub(crate) async fn v1_ping() -> Json<bool> {
    Json(true)
}

fn v1_tags_name(path: &str) -> RegistryResult<&str> {
    path.trim_start_matches('/')
        .strip_suffix("/tags")
        .filter(|name| !name.is_empty())
        .ok_or_else(|| RegistryError::RepositoryNotFound(format!("/v1/repositories/{path}")))
}

fn v1_unsupported(repo: &Repository) -> RegistryError {
    RegistryError::Unsupported(format!(
        "legacy tag operations are not available on proxy repository {}",
        repo.id
    ))
}

/// `GET /v1/repositories/<name>/tags`: tag to digest map.
///
/// Groups merge their hosted members; the first member holding a tag wins.
pub(crate) async fn v1_tags(
    State(state): State<RepoState>,
    Path(path): Path<String>,
) -> RegistryResult<Json<BTreeMap<String, Digest>>> {
    let repo = state.repository()?;
    let name = v1_tags_name(&path)?;
    let registry = &state.registry;

    let sources = if repo.is_proxy() {
        return Err(v1_unsupported(&repo));
    } else if repo.is_group() {
        registry.groups().hosted_members(&repo)
    } else {
        vec![repo]
    };

    let mut tags = BTreeMap::new();
    for source in sources {
        for (tag, digest) in registry.storage().tag_digests(&source.id, name).await? {
            tags.entry(tag).or_insert(digest);
        }
    }
    Ok(Json(tags))
}

/// `PUT /v1/repositories/<name>/tags/<tag>` with a JSON digest string body.
pub(crate) async fn v1_put_tag(
    State(state): State<RepoState>,
    Path(path): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> RegistryResult<Response> {
    let repo = state.repository()?;
    let (name, tag) = path
        .trim_start_matches('/')
        .rsplit_once("/tags/")
        .filter(|(name, tag)| !name.is_empty() && !tag.is_empty())
        .ok_or_else(|| RegistryError::RepositoryNotFound(format!("/v1/repositories/{path}")))?;

    state.authorize(&repo, &headers, name).await?;
    validate_tag(tag)?;

    let digest: String = serde_json::from_slice(&body)
        .map_err(|err| RegistryError::InvalidDigest(format!("tag body: {err}")))?;
    let digest: Digest = digest.parse()?;

    let registry = &state.registry;
    if repo.is_proxy() {
        return Err(v1_unsupported(&repo));
    } else if repo.is_group() {
        let write = registry
            .groups()
            .write(&repo, |member| {
                let digest = digest.clone();
                async move { registry.validator().tag(&member, name, tag, &digest).await }
            })
            .await?;
        tracing::debug!(group = %write.group_id, target = %write.target_repo_id, %tag, "tagged");
    } else {
        registry.validator().tag(&repo, name, tag, &digest).await?;
    }

    Ok(Json(true).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn tags(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn pagination() {
        let all = tags(&["c", "a", "b", "d"]);

        let (page, next) = paginate(all.clone(), &query(&[])).unwrap();
        assert_eq!(page, tags(&["a", "b", "c", "d"]));
        assert!(next.is_none());

        let (page, next) = paginate(all.clone(), &query(&[("n", "2")])).unwrap();
        assert_eq!(page, tags(&["a", "b"]));
        assert_eq!(next, Some((2, "b".to_owned())));

        let (page, next) = paginate(all.clone(), &query(&[("n", "2"), ("last", "b")])).unwrap();
        assert_eq!(page, tags(&["c", "d"]));
        assert!(next.is_none());

        assert!(paginate(all, &query(&[("n", "many")])).is_err());
    }

    #[test]
    fn v1_paths() {
        assert_eq!(v1_tags_name("library/app/tags").unwrap(), "library/app");
        assert!(v1_tags_name("/tags").is_err());
        assert!(v1_tags_name("library/app").is_err());
    }
}
