//! Registry bearer challenges.
//!
//! A registry answers an unauthenticated request with
//! `401` and `WWW-Authenticate: Bearer realm="...",service="...",scope="..."`.
//! The client fetches a token from `realm` and repeats the request with it.

use http::{HeaderMap, Uri};
use serde::Deserialize;

/// The parameters of a `WWW-Authenticate: Bearer` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerChallenge {
    /// Token endpoint.
    pub realm: String,
    /// Service name the token is for.
    pub service: Option<String>,
    /// Requested scope, e.g. `repository:library/alpine:pull`.
    pub scope: Option<String>,
}

impl BearerChallenge {
    /// Find a bearer challenge among response headers.
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        headers
            .get_all(http::header::WWW_AUTHENTICATE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .find_map(Self::parse)
    }

    /// Parse a single `WWW-Authenticate` value.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        let (scheme, params) = value.split_once(char::is_whitespace)?;
        if !scheme.eq_ignore_ascii_case("bearer") {
            return None;
        }

        let mut realm = None;
        let mut service = None;
        let mut scope = None;
        for (key, value) in parse_params(params) {
            match key.to_ascii_lowercase().as_str() {
                "realm" => realm = Some(value),
                "service" => service = Some(value),
                "scope" => scope = Some(value),
                _ => {}
            }
        }

        Some(Self {
            realm: realm?,
            service,
            scope,
        })
    }

    /// The token request URI: `realm?service=...&scope=...`.
    pub fn token_uri(&self) -> Result<Uri, crate::FetchError> {
        let mut url = url::Url::parse(&self.realm)
            .map_err(|err| crate::FetchError::InvalidUrl(format!("{}: {err}", self.realm)))?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(service) = &self.service {
                query.append_pair("service", service);
            }
            if let Some(scope) = &self.scope {
                query.append_pair("scope", scope);
            }
        }
        url.as_str()
            .parse()
            .map_err(|err| crate::FetchError::InvalidUrl(format!("{url}: {err}")))
    }
}

/// `key="value"` pairs separated by commas. Quoted values may contain commas.
fn parse_params(input: &str) -> Vec<(String, String)> {
    let mut params = Vec::new();
    let mut rest = input.trim();

    while !rest.is_empty() {
        let Some((key, after)) = rest.split_once('=') else {
            break;
        };
        let key = key.trim().trim_start_matches(',').trim().to_owned();
        let after = after.trim_start();

        let (value, remainder) = if let Some(quoted) = after.strip_prefix('"') {
            match quoted.find('"') {
                Some(end) => (&quoted[..end], &quoted[end + 1..]),
                None => (quoted, ""),
            }
        } else {
            match after.find(',') {
                Some(end) => (&after[..end], &after[end..]),
                None => (after, ""),
            }
        };

        params.push((key, value.trim().to_owned()));
        rest = remainder.trim_start().trim_start_matches(',').trim_start();
    }

    params
}

/// Token endpoint response. Registries use either field name.
#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

impl TokenResponse {
    pub(crate) fn into_token(self) -> Option<String> {
        self.token
            .or(self.access_token)
            .filter(|token| !token.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_docker_hub_challenge() {
        let challenge = BearerChallenge::parse(
            r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/alpine:pull""#,
        )
        .unwrap();
        assert_eq!(challenge.realm, "https://auth.docker.io/token");
        assert_eq!(challenge.service.as_deref(), Some("registry.docker.io"));
        assert_eq!(
            challenge.scope.as_deref(),
            Some("repository:library/alpine:pull")
        );
    }

    #[test]
    fn quoted_values_keep_commas() {
        let challenge = BearerChallenge::parse(
            r#"bearer realm="http://auth/token", scope="repository:a:pull,push""#,
        )
        .unwrap();
        assert_eq!(challenge.scope.as_deref(), Some("repository:a:pull,push"));
        assert_eq!(challenge.service, None);
    }

    #[test]
    fn rejects_basic_and_missing_realm() {
        assert!(BearerChallenge::parse(r#"Basic realm="x""#).is_none());
        assert!(BearerChallenge::parse(r#"Bearer service="x""#).is_none());
    }

    #[test]
    fn token_uri_carries_service_and_scope() {
        let challenge = BearerChallenge {
            realm: "http://auth.example/token".into(),
            service: Some("registry".into()),
            scope: Some("repository:lib/a:pull".into()),
        };
        assert_eq!(
            challenge.token_uri().unwrap().to_string(),
            "http://auth.example/token?service=registry&scope=repository%3Alib%2Fa%3Apull"
        );
    }

    #[test]
    fn token_field_names() {
        let response: TokenResponse = serde_json::from_str(r#"{"access_token":"abc"}"#).unwrap();
        assert_eq!(response.into_token().as_deref(), Some("abc"));
        let response: TokenResponse = serde_json::from_str(r#"{"token":""}"#).unwrap();
        assert_eq!(response.into_token(), None);
    }
}
