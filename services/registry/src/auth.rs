//! Push authorization: HS256 bearer tokens and trusted operator roles.

use axum::http::{HeaderMap, HeaderName, StatusCode, header};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use jaws::algorithms::hmac::{Hmac, HmacKey};
use jaws::crypto::sha2::Sha256;
use jaws::token::{Compact, Token, Unverified};
use jaws::SignatureBytes;
use serde::{Deserialize, Serialize};
use upstream::Secret;

use crate::config::{AuthConfig, ChallengeConfig};

type Hs256 = Hmac<Sha256>;

const OPERATOR_ROLES: &[&str] = &["admin", "writer", "manager"];

/// Why a request was not authorized.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// No usable credentials were presented.
    #[error("authentication required")]
    Missing,

    /// The token could not be decoded or its signature is wrong.
    #[error("invalid token: {0}")]
    Invalid(String),

    /// The token is past its `exp`.
    #[error("token expired")]
    Expired,

    /// The token does not grant the action on this repository.
    #[error("insufficient scope for {action} on {name}")]
    InsufficientScope {
        /// Repository name.
        name: String,
        /// Required action.
        action: String,
    },

    /// No signing secret is configured.
    #[error("token signing secret is not configured")]
    MissingSecret,
}

impl AuthError {
    /// HTTP status for this failure.
    pub fn status_code(&self) -> StatusCode {
        match self {
            AuthError::Missing | AuthError::Invalid(_) | AuthError::Expired => {
                StatusCode::UNAUTHORIZED
            }
            AuthError::InsufficientScope { .. } => StatusCode::FORBIDDEN,
            AuthError::MissingSecret => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Registry error code for this failure.
    pub fn error_code(&self) -> &'static str {
        match self {
            AuthError::Missing | AuthError::Invalid(_) | AuthError::Expired => "UNAUTHORIZED",
            AuthError::InsufficientScope { .. } => "DENIED",
            AuthError::MissingSecret => "UNKNOWN",
        }
    }

    /// Whether a `WWW-Authenticate` challenge should accompany the error.
    pub fn wants_challenge(&self) -> bool {
        !matches!(self, AuthError::MissingSecret)
    }
}

/// One grant in a token's `access` claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Access {
    /// Resource type, `repository` for registry grants.
    #[serde(rename = "type")]
    pub kind: String,
    /// Repository name.
    pub name: String,
    /// Granted actions.
    #[serde(default)]
    pub actions: Vec<String>,
}

impl Access {
    fn allows(&self, name: &str, action: &str) -> bool {
        self.kind == "repository"
            && self.name == name
            && self.actions.iter().any(|a| a == action || a == "*")
    }

    /// Parse `repository:<name>:<action>[,<action>...]`.
    fn parse_scope(scope: &str) -> Option<Self> {
        let (kind, rest) = scope.split_once(':')?;
        let (name, actions) = rest.rsplit_once(':')?;
        Some(Access {
            kind: kind.to_owned(),
            name: name.to_owned(),
            actions: actions.split(',').map(str::to_owned).collect(),
        })
    }
}

/// Token claims.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Claims {
    /// Issuer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    /// Subject.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    /// Audience.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
    /// Expiry, seconds since the epoch.
    pub exp: i64,
    /// Grants.
    #[serde(default)]
    pub access: Vec<Access>,
    /// Legacy grants as `repository:<name>:<actions>` strings.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
    /// Legacy space-separated grants.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl Claims {
    /// Claims for `subject`, valid until `expires`.
    pub fn new(subject: impl Into<String>, expires: DateTime<Utc>) -> Self {
        Self {
            sub: Some(subject.into()),
            exp: expires.timestamp(),
            ..Default::default()
        }
    }

    /// Add a repository grant.
    pub fn grant<I, S>(mut self, name: impl Into<String>, actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.access.push(Access {
            kind: "repository".into(),
            name: name.into(),
            actions: actions.into_iter().map(Into::into).collect(),
        });
        self
    }

    /// Whether any grant, current or legacy, covers `action` on `name`.
    pub fn allows(&self, name: &str, action: &str) -> bool {
        let legacy = self
            .scopes
            .iter()
            .map(String::as_str)
            .chain(self.scope.iter().flat_map(|s| s.split_whitespace()))
            .filter_map(Access::parse_scope);

        self.access.iter().any(|a| a.allows(name, action))
            || legacy.into_iter().any(|a| a.allows(name, action))
    }
}

/// Who was let through.
#[derive(Debug, Clone)]
pub enum Principal {
    /// A verified token.
    Token(Claims),
    /// A trusted operator role header.
    Operator(String),
}

/// Verifies credentials on push-class requests and builds challenges.
#[derive(Debug, Clone)]
pub struct AuthChecker {
    secret: Option<Secret>,
    operator_header: HeaderName,
    challenge: ChallengeConfig,
}

impl AuthChecker {
    /// A checker signing with `secret`. Token verification fails with
    /// [`AuthError::MissingSecret`] when it is `None`.
    pub fn new(secret: Option<Secret>, auth: &AuthConfig, challenge: &ChallengeConfig) -> Self {
        let operator_header = HeaderName::try_from(auth.operator_header.as_str())
            .unwrap_or_else(|_| HeaderName::from_static("x-registry-role"));
        Self {
            secret: secret.filter(|s| !s.is_empty()),
            operator_header,
            challenge: challenge.clone(),
        }
    }

    fn key(&self) -> Result<Hs256, AuthError> {
        let secret = self.secret.as_ref().ok_or(AuthError::MissingSecret)?;
        Ok(Hmac::new(HmacKey::from(secret.revealed().as_bytes())))
    }

    /// Sign claims into a compact HS256 token.
    pub fn sign(&self, claims: &Claims) -> Result<String, AuthError> {
        let key = self.key()?;
        let mut token = Token::compact((), claims.clone());
        *token.header_mut().r#type() = Some("JWT".into());

        token
            .sign::<Hs256, SignatureBytes>(&key)
            .map_err(|err| AuthError::Invalid(err.to_string()))?
            .rendered()
            .map_err(|err| AuthError::Invalid(err.to_string()))
    }

    /// Check signature and expiry, returning the claims.
    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let key = self.key()?;
        let token: Token<Claims, Unverified<()>, Compact> = token
            .trim()
            .parse()
            .map_err(|err: jaws::token::formats::TokenParseError| {
                AuthError::Invalid(err.to_string())
            })?;

        let verified = token
            .verify::<Hs256, SignatureBytes>(&key)
            .map_err(|err| AuthError::Invalid(err.to_string()))?;
        let claims = verified
            .payload()
            .cloned()
            .ok_or_else(|| AuthError::Invalid("empty claims".into()))?;

        if claims.exp <= Utc::now().timestamp() {
            return Err(AuthError::Expired);
        }
        Ok(claims)
    }

    /// Decide whether the request may perform `action` on `name`.
    ///
    /// A bearer token, or a basic credential whose password is a token, must
    /// verify and grant the action. Without an `Authorization` header a trusted
    /// operator role is accepted. Plain passwords are never accepted.
    pub fn authorize(
        &self,
        headers: &HeaderMap,
        name: &str,
        action: &str,
    ) -> Result<Principal, AuthError> {
        let Some(authorization) = headers.get(header::AUTHORIZATION) else {
            return self.operator(headers).ok_or(AuthError::Missing);
        };
        let authorization = authorization
            .to_str()
            .map_err(|_| AuthError::Invalid("authorization is not ascii".into()))?;

        let token = match scheme(authorization) {
            Some(("bearer", token)) => token.to_owned(),
            Some(("basic", encoded)) => basic_password(encoded)?,
            _ => return Err(AuthError::Missing),
        };

        let claims = self.verify(&token)?;
        if claims.allows(name, action) {
            Ok(Principal::Token(claims))
        } else {
            Err(AuthError::InsufficientScope {
                name: name.to_owned(),
                action: action.to_owned(),
            })
        }
    }

    fn operator(&self, headers: &HeaderMap) -> Option<Principal> {
        let role = headers.get(&self.operator_header)?.to_str().ok()?.trim();
        OPERATOR_ROLES
            .iter()
            .any(|r| r.eq_ignore_ascii_case(role))
            .then(|| Principal::Operator(role.to_ascii_lowercase()))
    }

    /// The `WWW-Authenticate` value sent with 401/403 responses.
    ///
    /// `host` is used for the realm unless a challenge host is configured.
    pub fn challenge(&self, host: &str, name: &str, action: &str) -> String {
        let host = self.challenge.host.as_deref().unwrap_or(host);
        format!(
            r#"Bearer realm="{}://{}/v2/token",service="{}",scope="repository:{}:{}""#,
            self.challenge.protocol, host, self.challenge.service, name, action
        )
    }
}

fn scheme(value: &str) -> Option<(&'static str, &str)> {
    let (scheme, rest) = value.split_once(' ')?;
    if scheme.eq_ignore_ascii_case("bearer") {
        Some(("bearer", rest.trim()))
    } else if scheme.eq_ignore_ascii_case("basic") {
        Some(("basic", rest.trim()))
    } else {
        None
    }
}

fn basic_password(encoded: &str) -> Result<String, AuthError> {
    let decoded = STANDARD
        .decode(encoded)
        .map_err(|_| AuthError::Invalid("bad basic credentials".into()))?;
    let decoded = String::from_utf8(decoded)
        .map_err(|_| AuthError::Invalid("bad basic credentials".into()))?;
    let (_user, password) = decoded
        .split_once(':')
        .ok_or_else(|| AuthError::Invalid("bad basic credentials".into()))?;
    Ok(password.to_owned())
}
