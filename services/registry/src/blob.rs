//! Blob operations for the registry

use std::collections::HashMap;

use axum::body::Body;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;

use crate::api::{DOCKER_CONTENT_DIGEST, DOCKER_UPLOAD_UUID, Registry, empty};
use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::repository::Repository;
use crate::upload::FinalizedUpload;

/// Get a blob, or just its headers for `HEAD`.
///
/// Stored blobs are streamed; `HEAD` reads only their metadata.
pub(crate) async fn get(
    registry: &Registry,
    repo: &Repository,
    path: &str,
    headers: &HeaderMap,
    head: bool,
) -> RegistryResult<Response> {
    let plugin = registry.plugins().for_repository(repo)?;
    let artifact = plugin.download(repo, path).await?;
    let len = artifact.content.size();

    let range = headers
        .get(header::RANGE)
        .map(|value| {
            value
                .to_str()
                .map_err(|_| RegistryError::RangeNotSatisfiable { size: Some(len) })
                .and_then(|value| parse_range(value, len))
        })
        .transpose()?;

    let (status, length, mut fields) = match range {
        Some((start, end)) => (
            StatusCode::PARTIAL_CONTENT,
            end - start + 1,
            vec![(header::CONTENT_RANGE, format!("bytes {start}-{end}/{len}"))],
        ),
        None => (StatusCode::OK, len, Vec::new()),
    };
    fields.extend([
        (header::CONTENT_TYPE, artifact.content_type),
        (header::CONTENT_LENGTH, length.to_string()),
        (header::ACCEPT_RANGES, "bytes".to_owned()),
        (DOCKER_CONTENT_DIGEST, artifact.digest),
    ]);

    let mut response = empty(status, fields)?;
    if !head {
        *response.body_mut() = artifact.content.into_body(range);
    }
    Ok(response)
}

/// Parse a single `bytes=` range against a blob of `len` bytes.
fn parse_range(value: &str, len: u64) -> RegistryResult<(u64, u64)> {
    let unsatisfiable = || RegistryError::RangeNotSatisfiable { size: Some(len) };

    let range = value.trim().strip_prefix("bytes=").ok_or_else(unsatisfiable)?;
    if range.contains(',') || len == 0 {
        return Err(unsatisfiable());
    }
    let (start, end) = range.split_once('-').ok_or_else(unsatisfiable)?;
    let number = |s: &str| s.trim().parse::<u64>().map_err(|_| unsatisfiable());

    match (start.trim(), end.trim()) {
        ("", suffix) => {
            let suffix = number(suffix)?;
            if suffix == 0 {
                return Err(unsatisfiable());
            }
            Ok((len.saturating_sub(suffix), len - 1))
        }
        (start, "") => {
            let start = number(start)?;
            if start >= len {
                return Err(unsatisfiable());
            }
            Ok((start, len - 1))
        }
        (start, end) => {
            let (start, end) = (number(start)?, number(end)?);
            if start > end || start >= len {
                return Err(unsatisfiable());
            }
            Ok((start, end.min(len - 1)))
        }
    }
}

/// Delete a blob from a hosted repository.
pub(crate) async fn delete(
    registry: &Registry,
    repo: &Repository,
    digest: &str,
) -> RegistryResult<Response> {
    if !repo.is_hosted() {
        return Err(RegistryError::Unsupported(format!(
            "blobs can only be deleted from hosted repositories, {} is not one",
            repo.id
        )));
    }
    let digest: Digest = digest.parse()?;
    registry.storage().delete_blob(&repo.id, &digest).await?;
    tracing::debug!(repo = %repo.id, %digest, "deleted blob");
    empty(StatusCode::ACCEPTED, Vec::new())
}

/// Start a blob upload session, or store a whole blob when `digest` is given.
///
/// Cross-repository mounts are not supported; a `mount` request starts an
/// ordinary session instead.
pub(crate) async fn start_upload(
    registry: &Registry,
    repo: &Repository,
    name: &str,
    query: &HashMap<String, String>,
    body: Body,
) -> RegistryResult<Response> {
    if let Some(digest) = query.get("digest") {
        let digest: Digest = digest.parse()?;
        let plugin = registry.plugins().for_repository(repo)?;
        let finalized = plugin.upload(repo, name, body, Some(digest)).await?;
        return created(repo, name, finalized);
    }

    if let Some(mount) = query.get("mount") {
        tracing::debug!(
            %mount,
            from = ?query.get("from"),
            "blob mount not supported, starting upload",
        );
    }

    let session = registry.stager().initiate(repo, name).await?;
    empty(
        StatusCode::ACCEPTED,
        vec![
            (header::LOCATION, upload_location(name, &session.id)),
            (header::RANGE, upload_range(0)),
            (DOCKER_UPLOAD_UUID, session.id),
            (header::CONTENT_LENGTH, "0".to_owned()),
        ],
    )
}

/// Append a chunk. A `Content-Range` start must match the bytes received so far.
pub(crate) async fn patch_upload(
    registry: &Registry,
    repo: &Repository,
    name: &str,
    uuid: &str,
    headers: &HeaderMap,
    body: Body,
) -> RegistryResult<Response> {
    let start = headers
        .get(header::CONTENT_RANGE)
        .map(|value| {
            value
                .to_str()
                .ok()
                .and_then(content_range_start)
                .ok_or_else(|| RegistryError::BlobUploadInvalid("malformed Content-Range".into()))
        })
        .transpose()?;

    let offset = registry.stager().append(repo, uuid, start, body).await?;
    empty(
        StatusCode::ACCEPTED,
        vec![
            (header::LOCATION, upload_location(name, uuid)),
            (header::RANGE, upload_range(offset)),
            (DOCKER_UPLOAD_UUID, uuid.to_owned()),
            (header::CONTENT_LENGTH, "0".to_owned()),
        ],
    )
}

/// `<start>-<end>`, optionally written as `bytes <start>-<end>/<total>`.
fn content_range_start(value: &str) -> Option<u64> {
    let value = value.trim();
    let value = value
        .strip_prefix("bytes")
        .map(|rest| rest.trim_start_matches([' ', '=']))
        .unwrap_or(value);
    let (start, _) = value.split_once('-')?;
    start.trim().parse().ok()
}

/// Append the final chunk, if any, and complete the upload.
pub(crate) async fn finish_upload(
    registry: &Registry,
    repo: &Repository,
    name: &str,
    uuid: &str,
    query: &HashMap<String, String>,
    body: Body,
) -> RegistryResult<Response> {
    let digest = query
        .get("digest")
        .map(|digest| digest.parse::<Digest>())
        .transpose()?;

    let stager = registry.stager();
    stager.append(repo, uuid, None, body).await?;
    let finalized = stager.finalize(repo, uuid, digest).await?;
    created(repo, name, finalized)
}

/// Report how many bytes an upload has received.
pub(crate) async fn upload_status(
    registry: &Registry,
    repo: &Repository,
    name: &str,
    uuid: &str,
) -> RegistryResult<Response> {
    let offset = registry.stager().status(repo, uuid).await?;
    empty(
        StatusCode::NO_CONTENT,
        vec![
            (header::LOCATION, upload_location(name, uuid)),
            (header::RANGE, upload_range(offset)),
            (DOCKER_UPLOAD_UUID, uuid.to_owned()),
        ],
    )
}

/// Cancel a blob upload
pub(crate) async fn cancel_upload(
    registry: &Registry,
    repo: &Repository,
    uuid: &str,
) -> RegistryResult<Response> {
    registry.stager().abort(repo, uuid).await?;
    empty(StatusCode::NO_CONTENT, Vec::new())
}

fn created(repo: &Repository, name: &str, finalized: FinalizedUpload) -> RegistryResult<Response> {
    let digest = finalized.digest.to_string();
    let mut response = empty(
        StatusCode::CREATED,
        vec![
            (header::LOCATION, format!("/v2/{name}/blobs/{digest}")),
            (DOCKER_CONTENT_DIGEST, digest.clone()),
        ],
    )?;

    // Group uploads report where the blob landed.
    if repo.is_group() {
        let summary = Json(json!({
            "digest": digest,
            "size": finalized.size,
            "targets": finalized.targets,
        }))
        .into_response();
        let (parts, body) = summary.into_parts();
        response.headers_mut().extend(parts.headers);
        *response.body_mut() = body;
    } else {
        response
            .headers_mut()
            .insert(header::CONTENT_LENGTH, header::HeaderValue::from_static("0"));
    }
    Ok(response)
}

fn upload_location(name: &str, uuid: &str) -> String {
    format!("/v2/{name}/blobs/uploads/{uuid}")
}

/// The `Range` header for an upload holding `offset` bytes.
fn upload_range(offset: u64) -> String {
    format!("0-{}", offset.saturating_sub(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges() {
        assert_eq!(parse_range("bytes=0-4", 10).unwrap(), (0, 4));
        assert_eq!(parse_range("bytes=5-", 10).unwrap(), (5, 9));
        assert_eq!(parse_range("bytes=-3", 10).unwrap(), (7, 9));
        assert_eq!(parse_range("bytes=8-100", 10).unwrap(), (8, 9));

        for bad in ["bytes=10-", "bytes=5-2", "items=0-1", "bytes=0-1,3-4", "bytes=-0"] {
            let err = parse_range(bad, 10).unwrap_err();
            assert!(
                matches!(err, RegistryError::RangeNotSatisfiable { size: Some(10) }),
                "{bad}"
            );
        }
    }

    #[test]
    fn content_ranges() {
        assert_eq!(content_range_start("0-5"), Some(0));
        assert_eq!(content_range_start("6-10"), Some(6));
        assert_eq!(content_range_start("bytes 6-10/*"), Some(6));
        assert_eq!(content_range_start("bytes=6-10"), Some(6));
        assert_eq!(content_range_start("garbage"), None);
    }

    #[test]
    fn upload_ranges() {
        assert_eq!(upload_range(0), "0-0");
        assert_eq!(upload_range(11), "0-10");
    }
}
