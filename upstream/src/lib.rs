//! Authenticated fetches from upstream package servers.
//!
//! [`UpstreamFetcher`] wraps an HTTP client service with a per-attempt timeout and
//! a retry policy for network failures, injects the repository's basic or bearer
//! credentials, follows redirects without leaking credentials across hosts, and
//! answers registry bearer challenges. Bodies are buffered and decoded by content
//! type, or handed over as streams when large.

use std::future::Future;

mod challenge;
mod credentials;
mod error;
mod fetch;
pub mod mock;
mod response;
mod retry;
mod timeout;
pub mod uri;

pub use self::challenge::BearerChallenge;
pub use self::credentials::{basic_auth, AuthSources, Credentials, Secret};
pub use self::error::FetchError;
pub use self::fetch::{FetchConfig, FetchOptions, UpstreamFetcher};
pub use self::response::{FetchBody, FetchResponse};
pub use self::retry::NetworkRetry;
pub use self::timeout::{AttemptTimeout, AttemptTimeoutLayer};

/// A boxed, sendable future.
pub type BoxFuture<'a, T> = std::pin::Pin<Box<dyn Future<Output = T> + Send + 'a>>;
