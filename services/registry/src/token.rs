//! Token endpoint, relayed to the central auth service.

use axum::extract::{RawQuery, State};
use axum::http::{HeaderMap, header};
use axum::response::{IntoResponse, Response};
use upstream::{AuthSources, FetchOptions};

use crate::api::RepoState;
use crate::error::{RegistryError, RegistryResult};

/// `GET /v2/token`: forward the query string and `Authorization` to
/// `auth.token_endpoint` and relay its answer.
pub(crate) async fn token(
    State(state): State<RepoState>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> RegistryResult<Response> {
    let registry = &state.registry;
    let endpoint = registry
        .config()
        .auth
        .token_endpoint
        .as_ref()
        .ok_or_else(|| RegistryError::Config("no token endpoint configured".into()))?;

    let mut url = endpoint.to_string();
    if let Some(query) = query.filter(|q| !q.is_empty()) {
        url.push(if endpoint.query().is_some() { '&' } else { '?' });
        url.push_str(&query);
    }

    let mut options = FetchOptions::new();
    if let Some(authorization) = headers.get(header::AUTHORIZATION) {
        options = options.header(header::AUTHORIZATION, authorization.clone());
    }

    let response = registry
        .fetcher()
        .fetch(&url, &AuthSources::none(), &options)
        .await?;
    let status = response.status;
    let content_type = response
        .content_type()
        .unwrap_or("application/json")
        .to_owned();
    tracing::debug!(%status, "token endpoint answered");

    let body = response.bytes().await?;
    Ok((status, [(header::CONTENT_TYPE, content_type)], body).into_response())
}
