//! Upstream credentials.
//!
//! A repository can carry credentials in three places. [`AuthSources::resolve`]
//! picks the first one set, in the order `docker.auth`, `auth`, then the
//! repository-level record.

use std::{borrow::Cow, env::VarError, fmt, ops::Deref};

use http::{header::InvalidHeaderValue, HeaderValue};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

/// A password, token or other semi-secret value.
///
/// The wrapper keeps the value out of `Debug` output and zeroes owned memory on drop.
/// Use [`Secret::revealed`] to get the underlying value.
#[derive(Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(from = "String", into = "String")]
pub struct Secret(Cow<'static, str>);

impl Secret {
    /// Read a secret from an environment variable.
    pub fn from_env(var: &str) -> Result<Self, VarError> {
        let value = std::env::var(var)?;
        Ok(Secret(value.into()))
    }

    /// Expose the underlying value.
    pub fn revealed(&self) -> &str {
        self.0.deref()
    }

    /// Whether the secret holds no characters.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// A sensitive `Bearer <secret>` header value.
    pub fn bearer(&self) -> Result<HeaderValue, InvalidHeaderValue> {
        let mut header = HeaderValue::try_from(format!("Bearer {}", self.revealed()))?;
        header.set_sensitive(true);
        Ok(header)
    }
}

impl Drop for Secret {
    fn drop(&mut self) {
        if let Cow::Owned(ref mut s) = self.0 {
            s.zeroize()
        }
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(****)")
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Secret(value.into())
    }
}

impl From<&'static str> for Secret {
    fn from(value: &'static str) -> Self {
        Secret(value.into())
    }
}

impl From<Secret> for String {
    fn from(secret: Secret) -> Self {
        secret.revealed().to_owned()
    }
}

/// Build a sensitive `Basic` authorization header. The password is optional.
///
/// ```rust
/// let header = upstream::basic_auth("username", Some("password"));
/// assert_eq!(header.to_str().unwrap(), "Basic dXNlcm5hbWU6cGFzc3dvcmQ=");
/// ```
pub fn basic_auth<U, P>(username: U, password: Option<P>) -> HeaderValue
where
    U: fmt::Display,
    P: fmt::Display,
{
    use base64::prelude::BASE64_STANDARD;
    use base64::write::EncoderWriter;
    use std::io::Write;

    let mut buf = b"Basic ".to_vec();
    {
        let mut encoder = EncoderWriter::new(&mut buf, &BASE64_STANDARD);
        let _ = write!(encoder, "{}:", username);
        if let Some(password) = password {
            let _ = write!(encoder, "{}", password);
        }
    }
    let mut header = HeaderValue::from_bytes(&buf).expect("base64 is always valid HeaderValue");
    header.set_sensitive(true);
    header
}

/// Credentials for an upstream server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Credentials {
    /// `Authorization: Basic base64(username:password)`.
    Basic {
        /// User name.
        username: String,
        /// Optional password.
        #[serde(default)]
        password: Option<Secret>,
    },

    /// `Authorization: Bearer <token>`.
    Bearer {
        /// Raw token.
        token: Secret,
    },
}

impl Credentials {
    /// Basic credentials.
    pub fn basic(username: impl Into<String>, password: impl Into<Secret>) -> Self {
        Credentials::Basic {
            username: username.into(),
            password: Some(password.into()),
        }
    }

    /// Bearer credentials.
    pub fn bearer(token: impl Into<Secret>) -> Self {
        Credentials::Bearer {
            token: token.into(),
        }
    }

    /// The `Authorization` header value for these credentials.
    pub fn authorization(&self) -> Result<HeaderValue, InvalidHeaderValue> {
        match self {
            Credentials::Basic { username, password } => Ok(basic_auth(
                username,
                password.as_ref().map(Secret::revealed),
            )),
            Credentials::Bearer { token } => token.bearer(),
        }
    }
}

/// The places a repository may carry upstream credentials.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct AuthSources {
    /// Ecosystem-specific credentials (`config.docker.auth`).
    #[serde(default)]
    pub docker: Option<Credentials>,

    /// Repository configuration credentials (`config.auth`).
    #[serde(default)]
    pub config: Option<Credentials>,

    /// Credentials stored on the repository record itself.
    #[serde(default)]
    pub repository: Option<Credentials>,
}

impl AuthSources {
    /// No credentials anywhere.
    pub fn none() -> Self {
        Self::default()
    }

    /// Only repository-level credentials.
    pub fn repository(credentials: Credentials) -> Self {
        Self {
            repository: Some(credentials),
            ..Default::default()
        }
    }

    /// The credentials that apply, in priority order.
    pub fn resolve(&self) -> Option<&Credentials> {
        self.docker
            .as_ref()
            .or(self.config.as_ref())
            .or(self.repository.as_ref())
    }
}
