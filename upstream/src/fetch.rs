use std::time::Duration;

use http::{header, HeaderMap, HeaderName, HeaderValue, Method, Request, Response, StatusCode, Uri};
use hyperdriver::client::SharedClientService;
use hyperdriver::service::SharedService;
use hyperdriver::Body;
use serde::Deserialize;
use tower::ServiceExt as _;

use crate::challenge::{BearerChallenge, TokenResponse};
use crate::credentials::{AuthSources, Credentials, Secret};
use crate::response::{collect, FetchResponse};
use crate::retry::NetworkRetry;
use crate::timeout::AttemptTimeoutLayer;
use crate::uri::{resolve_location, UriExtension as _};
use crate::FetchError;

/// Tuning for upstream requests.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Budget for a single attempt, in seconds.
    #[serde(with = "seconds")]
    pub timeout: Duration,

    /// Retries after a network failure. Responses are never retried.
    pub retries: usize,

    /// Bodies larger than this many bytes are handed over as streams.
    pub stream_threshold: u64,

    /// First backoff delay, in seconds. Doubles per retry.
    #[serde(with = "seconds")]
    pub backoff: Duration,

    /// Upper bound on the backoff delay, in seconds.
    #[serde(with = "seconds")]
    pub max_backoff: Duration,

    /// Redirects followed before the redirect response is returned as-is.
    pub max_redirects: usize,

    /// Log request and response headers.
    pub debug: bool,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            retries: 2,
            stream_threshold: 1024 * 1024,
            backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(5),
            max_redirects: 5,
            debug: false,
        }
    }
}

mod seconds {
    use std::time::Duration;

    use serde::{Deserialize as _, Deserializer};

    pub(super) fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

/// Per-request options.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    /// Request method, `GET` unless set.
    pub method: Method,
    /// Extra request headers, e.g. `Accept`.
    pub headers: HeaderMap,
    /// Hand the body over unread, whatever its size.
    pub stream: bool,
}

impl FetchOptions {
    /// A plain `GET`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `method` instead of `GET`.
    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Add a request header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Ask for the body as a stream.
    pub fn stream(mut self) -> Self {
        self.stream = true;
        self
    }
}

/// Authenticated HTTP client for upstream servers.
///
/// Each attempt is bounded by [`FetchConfig::timeout`]; attempts which produce no
/// response are retried with backoff. Redirects are followed by hand so that
/// credentials never travel to a different host, and a registry bearer challenge
/// is answered once.
#[derive(Debug, Clone)]
pub struct UpstreamFetcher {
    service: SharedClientService<Body, Body>,
    config: FetchConfig,
}

impl UpstreamFetcher {
    /// A fetcher over a real HTTP/HTTPS client.
    pub fn new(config: FetchConfig) -> Self {
        let client = hyperdriver::Client::build_tcp_http()
            .with_default_tls()
            .build_service();
        Self::with_service(config, client)
    }

    /// A fetcher over any client service, e.g. [`MockService`](crate::mock::MockService).
    pub fn with_service<S>(config: FetchConfig, inner: S) -> Self
    where
        S: tower::Service<
                Request<Body>,
                Response = Response<Body>,
                Error = hyperdriver::client::Error,
            > + Clone
            + Send
            + Sync
            + 'static,
        S::Future: Send + 'static,
    {
        let service = tower::ServiceBuilder::new()
            .layer(SharedService::layer())
            .layer(tower::retry::RetryLayer::new(NetworkRetry::new(
                config.retries,
                config.backoff,
                config.max_backoff,
            )))
            .layer(AttemptTimeoutLayer::new(config.timeout))
            .service(inner);

        Self { service, config }
    }

    /// The active configuration.
    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// Fetch `url` with the first credentials found in `auth`.
    ///
    /// Never fails because of the network: an upstream that could not be reached
    /// produces a response with `ok == false` and status 500. Non-2xx upstream
    /// answers are returned unchanged.
    #[tracing::instrument(
        level = "debug",
        skip(self, auth, options),
        fields(method = %options.method)
    )]
    pub async fn fetch(
        &self,
        url: &str,
        auth: &AuthSources,
        options: &FetchOptions,
    ) -> Result<FetchResponse, FetchError> {
        let mut uri: Uri = url
            .parse()
            .map_err(|err| FetchError::InvalidUrl(format!("{url}: {err}")))?;
        let credentials = auth.resolve();
        let mut authorization = credentials.map(Credentials::authorization).transpose()?;
        let mut challenged = false;
        let mut redirects = 0;

        loop {
            let request = self.request(
                &options.method,
                &uri,
                &options.headers,
                authorization.as_ref(),
            )?;
            let response = match self.service.clone().oneshot(request).await {
                Ok(response) => response,
                Err(error) => {
                    tracing::warn!(%uri, %error, "upstream unreachable");
                    return Ok(FetchResponse::network_failure(uri, &error));
                }
            };

            let status = response.status();
            if self.config.debug {
                tracing::debug!(%uri, %status, headers = ?response.headers(), "upstream response");
            }

            if status.is_redirection() && redirects < self.config.max_redirects {
                if let Some(location) = response
                    .headers()
                    .get(header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                {
                    let next = resolve_location(&uri, location)?;
                    if authorization.is_some() && !next.same_host(&uri) {
                        tracing::debug!(
                            from = ?uri.host(),
                            to = ?next.host(),
                            "dropping authorization on cross-host redirect"
                        );
                        authorization = None;
                    }
                    redirects += 1;
                    uri = next;
                    continue;
                }
            }

            if status == StatusCode::UNAUTHORIZED && !challenged {
                if let Some(challenge) = BearerChallenge::from_headers(response.headers()) {
                    challenged = true;
                    match self.token(&challenge, credentials).await {
                        Ok(token) => {
                            authorization = Some(token);
                            continue;
                        }
                        Err(error) => {
                            tracing::warn!(
                                realm = %challenge.realm,
                                %error,
                                "bearer challenge failed",
                            );
                        }
                    }
                }
            }

            return FetchResponse::materialize(
                uri,
                response,
                options.stream,
                self.config.stream_threshold,
            )
            .await;
        }
    }

    fn request(
        &self,
        method: &Method,
        uri: &Uri,
        headers: &HeaderMap,
        authorization: Option<&HeaderValue>,
    ) -> Result<Request<Body>, FetchError> {
        let mut request = Request::builder()
            .method(method.clone())
            .uri(uri.clone())
            .body(Body::empty())?;

        *request.headers_mut() = headers.clone();
        if let Some(authorization) = authorization {
            request
                .headers_mut()
                .insert(header::AUTHORIZATION, authorization.clone());
        }

        if self.config.debug {
            tracing::debug!(%uri, headers = ?request.headers(), "upstream request");
        }
        Ok(request)
    }

    /// Obtain a token from the challenge realm, presenting basic credentials if any.
    async fn token(
        &self,
        challenge: &BearerChallenge,
        credentials: Option<&Credentials>,
    ) -> Result<HeaderValue, FetchError> {
        let uri = challenge.token_uri()?;
        let basic = match credentials {
            Some(creds @ Credentials::Basic { .. }) => Some(creds.authorization()?),
            _ => None,
        };

        let request = self.request(&Method::GET, &uri, &HeaderMap::new(), basic.as_ref())?;
        let rejected = |status| FetchError::Token {
            realm: challenge.realm.clone(),
            status,
        };

        let response = self
            .service
            .clone()
            .oneshot(request)
            .await
            .map_err(|_| rejected(StatusCode::INTERNAL_SERVER_ERROR))?;
        let status = response.status();
        if !status.is_success() {
            return Err(rejected(status));
        }

        let body = collect(response.into_body()).await?;
        let token = serde_json::from_slice::<TokenResponse>(&body)
            .ok()
            .and_then(TokenResponse::into_token)
            .ok_or_else(|| rejected(status))?;

        tracing::debug!(realm = %challenge.realm, "obtained bearer token");
        Ok(Secret::from(token).bearer()?)
    }
}
