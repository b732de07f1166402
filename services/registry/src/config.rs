//! Server configuration, loaded from TOML.
//!
//! ```toml
//! debug = false
//!
//! [fetch]
//! timeout = 30
//! retries = 2
//!
//! [ports]
//! start = 5000
//! end = 5100
//!
//! [challenge]
//! host = "registry.example.com"
//! protocol = "https"
//!
//! [auth]
//! secret_env = "REGISTRY_JWT_SECRET"
//!
//! [[repositories]]
//! id = "hub"
//! name = "docker-hub"
//! type = "proxy"
//! config.upstream = "https://registry-1.docker.io"
//! ```

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use http::Uri;
use serde::Deserialize;

use crate::repository::{CatalogError, Repository};

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("reading {path}: {source}")]
    Io {
        /// Configuration file.
        path: Utf8PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML for [`RegistryConfig`].
    #[error("parsing configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// A repository definition is invalid.
    #[error(transparent)]
    Repository(#[from] CatalogError),

    /// Storage could not be initialised.
    #[error("storage: {0}")]
    Storage(#[from] storage::StorageError),
}

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Upstream client tuning.
    pub fetch: upstream::FetchConfig,
    /// Listener port search.
    pub ports: PortsConfig,
    /// Bearer challenge parameters.
    pub challenge: ChallengeConfig,
    /// Token verification.
    pub auth: AuthConfig,
    /// Upload staging.
    pub staging: StagingConfig,
    /// Lock provider.
    pub locks: keylock::LockConfig,
    /// Storage backend.
    pub storage: storage::StorageConfig,
    /// Storage bucket holding all registry content.
    pub bucket: Bucket,
    /// Log request and response headers.
    pub debug: bool,
    /// Repository definitions.
    pub repositories: Vec<Repository>,
}

impl RegistryConfig {
    /// Parse configuration from a TOML document.
    pub fn from_toml(document: &str) -> Result<Self, ConfigError> {
        let mut config: RegistryConfig = toml::from_str(document)?;
        config.fetch.debug |= config.debug;
        Ok(config)
    }

    /// Read and parse a configuration file.
    pub async fn load(path: &Utf8Path) -> Result<Self, ConfigError> {
        let document = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_owned(),
                source,
            })?;
        Self::from_toml(&document)
    }
}

/// Bucket name, `registry` unless configured.
#[derive(Debug, Clone, Deserialize)]
#[serde(transparent)]
pub struct Bucket(pub String);

impl Default for Bucket {
    fn default() -> Self {
        Bucket("registry".into())
    }
}

/// Where per-repository listeners look for a free port.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PortsConfig {
    /// Address listeners bind to.
    pub host: IpAddr,
    /// First port of the search range.
    pub start: u16,
    /// Last port of the search range, inclusive.
    pub end: u16,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            start: 5000,
            end: 5100,
        }
    }
}

/// Parameters of the `WWW-Authenticate` challenge sent to clients.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChallengeConfig {
    /// Host advertised in the realm. The request's `Host` header when unset.
    pub host: Option<String>,
    /// `http` or `https`.
    pub protocol: String,
    /// Service name.
    pub service: String,
}

impl Default for ChallengeConfig {
    fn default() -> Self {
        Self {
            host: None,
            protocol: "http".into(),
            service: "registry".into(),
        }
    }
}

/// Token verification settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Environment variable holding the HS256 signing secret.
    pub secret_env: String,
    /// Central token endpoint that `GET /v2/token` forwards to.
    #[serde(with = "upstream::uri::serde::option")]
    pub token_endpoint: Option<Uri>,
    /// Header carrying a trusted operator role for requests without credentials.
    pub operator_header: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret_env: "REGISTRY_JWT_SECRET".into(),
            token_endpoint: None,
            operator_header: "x-registry-role".into(),
        }
    }
}

/// Upload staging settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StagingConfig {
    /// Directory for staging files. A directory under the system temp dir when unset.
    pub dir: Option<Utf8PathBuf>,
    /// Age after which abandoned sessions are swept, in seconds.
    #[serde(with = "seconds")]
    pub ttl: Duration,
    /// How often the sweep runs, in seconds.
    #[serde(with = "seconds")]
    pub sweep_interval: Duration,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            dir: None,
            ttl: Duration::from_secs(24 * 60 * 60),
            sweep_interval: Duration::from_secs(60 * 60),
        }
    }
}

impl StagingConfig {
    /// The staging directory to use.
    pub fn dir(&self) -> Utf8PathBuf {
        self.dir.clone().unwrap_or_else(|| {
            let tmp = std::env::temp_dir().join("registry-staging");
            Utf8PathBuf::from_path_buf(tmp)
                .unwrap_or_else(|_| Utf8PathBuf::from("/tmp/registry-staging"))
        })
    }
}

/// Durations written as (possibly fractional) seconds.
pub(crate) mod seconds {
    use std::time::Duration;

    use serde::{Deserialize as _, Deserializer};

    pub(crate) fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{RepositoryKind, WritePolicy};

    #[test]
    fn defaults() {
        let config = RegistryConfig::from_toml("").unwrap();
        assert_eq!(config.ports.start, 5000);
        assert_eq!(config.ports.end, 5100);
        assert_eq!(config.fetch.retries, 2);
        assert_eq!(config.fetch.timeout, Duration::from_secs(30));
        assert_eq!(config.fetch.stream_threshold, 1024 * 1024);
        assert_eq!(config.auth.secret_env, "REGISTRY_JWT_SECRET");
        assert_eq!(config.staging.ttl, Duration::from_secs(86400));
        assert_eq!(config.bucket.0, "registry");
        assert!(matches!(config.locks, keylock::LockConfig::Local));
    }

    #[test]
    fn full_document() {
        let config = RegistryConfig::from_toml(
            r#"
            debug = true
            bucket = "artifacts"

            [fetch]
            timeout = 5
            retries = 4

            [ports]
            host = "127.0.0.1"
            start = 6000
            end = 6010

            [challenge]
            host = "registry.test"
            protocol = "https"

            [auth]
            token_endpoint = "http://auth.test/token"

            [staging]
            ttl = 0.5

            [locks]
            mode = "distributed"

            [[repositories]]
            id = "hub"
            name = "hub"
            type = "proxy"
            [repositories.config]
            upstream = "https://registry-1.docker.io"
            cache_ttl = 60
            auth = { type = "basic", username = "u", password = "p" }

            [[repositories]]
            id = "local"
            name = "local"
            type = "hosted"

            [[repositories]]
            id = "all"
            name = "all"
            type = "group"
            [repositories.config]
            members = ["local", "hub"]
            write_policy = "preferred"
            preferred_writer = "local"
            "#,
        )
        .unwrap();

        assert!(config.debug);
        assert!(config.fetch.debug);
        assert_eq!(config.fetch.timeout, Duration::from_secs(5));
        assert_eq!(config.ports.host, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(config.challenge.protocol, "https");
        assert_eq!(
            config.auth.token_endpoint.unwrap().to_string(),
            "http://auth.test/token"
        );
        assert_eq!(config.staging.ttl, Duration::from_millis(500));
        assert!(matches!(
            config.locks,
            keylock::LockConfig::Distributed {
                poll_interval_ms: 100
            }
        ));

        assert_eq!(config.repositories.len(), 3);
        assert_eq!(config.repositories[0].kind, RepositoryKind::Proxy);
        assert_eq!(
            config.repositories[0].config.cache_ttl,
            Duration::from_secs(60)
        );
        assert_eq!(config.repositories[2].config.write_policy, WritePolicy::Preferred);
        assert_eq!(config.repositories[2].config.members, vec!["local", "hub"]);
    }
}
