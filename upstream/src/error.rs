//! Errors raised by the upstream fetcher.
//!
//! Network failures are not errors here: they come back as a failed
//! [`FetchResponse`](crate::FetchResponse) with status 500. These variants cover
//! requests that could not be built and responses that could not be read.

use thiserror::Error;

pub(crate) type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// An upstream request could not be made or its response could not be read.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The URL could not be parsed, or a redirect pointed somewhere unusable.
    #[error("invalid upstream URL: {0}")]
    InvalidUrl(String),

    /// Credentials could not be turned into a header.
    #[error("invalid authorization header")]
    Authorization(#[from] http::header::InvalidHeaderValue),

    /// The request could not be assembled.
    #[error("building request: {0}")]
    Request(#[from] http::Error),

    /// The response body failed while being read.
    #[error("reading response body: {0}")]
    Body(#[source] BoxError),

    /// The token endpoint did not hand out a token.
    #[error("token endpoint {realm} answered {status}")]
    Token {
        /// Token endpoint.
        realm: String,
        /// Status returned by the endpoint.
        status: http::StatusCode,
    },
}
