//! Error types for the registry

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};

use crate::auth::AuthError;

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Error types for registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Blob not found
    #[error("blob not found: {0}")]
    BlobNotFound(String),

    /// Upload session not found
    #[error("upload session not found: {0}")]
    UploadNotFound(String),

    /// Manifest not found
    #[error("manifest not found: {0}")]
    ManifestNotFound(String),

    /// Repository not found
    #[error("repository not found: {0}")]
    RepositoryNotFound(String),

    /// Invalid digest format
    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    /// Invalid manifest
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    /// Unsupported manifest media type
    #[error("unsupported manifest type: {0}")]
    UnsupportedManifestType(String),

    /// Digest mismatch
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        /// Expected digest
        expected: String,
        /// Actual digest
        actual: String,
    },

    /// Invalid repository or image name
    #[error("invalid name: {0}")]
    InvalidName(String),

    /// Invalid tag
    #[error("invalid tag: {0}")]
    InvalidTag(String),

    /// Range not satisfiable
    #[error("range not satisfiable")]
    RangeNotSatisfiable {
        /// Size of the object, for `Content-Range: bytes */<size>`.
        size: Option<u64>,
    },

    /// Page size is not a number
    #[error("invalid page size: {0}")]
    PaginationInvalid(String),

    /// Blob upload invalid
    #[error("blob upload invalid: {0}")]
    BlobUploadInvalid(String),

    /// The operation is not allowed on this repository
    #[error("{0}")]
    Unsupported(String),

    /// The write conflicts with existing content
    #[error("{0}")]
    Conflict(String),

    /// Credentials were missing, invalid, or insufficient
    #[error("{error}")]
    Auth {
        /// What went wrong.
        error: AuthError,
        /// `WWW-Authenticate` challenge to send back.
        challenge: Option<String>,
    },

    /// Upstream answered with an error
    #[error("upstream returned {status}: {message}")]
    Upstream {
        /// Upstream status, or 500 when unreachable.
        status: StatusCode,
        /// Upstream message.
        message: String,
    },

    /// Upstream request could not be made
    #[error("upstream: {0}")]
    Fetch(#[from] upstream::FetchError),

    /// Lock acquisition failed
    #[error("lock: {0}")]
    Lock(#[from] keylock::LockError),

    /// Misconfiguration
    #[error("configuration: {0}")]
    Config(String),

    /// Storage error
    #[error("storage error: {0}")]
    Storage(#[from] storage::StorageError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RegistryError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            RegistryError::BlobNotFound(_)
            | RegistryError::UploadNotFound(_)
            | RegistryError::ManifestNotFound(_)
            | RegistryError::RepositoryNotFound(_) => StatusCode::NOT_FOUND,
            RegistryError::InvalidDigest(_)
            | RegistryError::InvalidManifest(_)
            | RegistryError::InvalidName(_)
            | RegistryError::InvalidTag(_)
            | RegistryError::DigestMismatch { .. }
            | RegistryError::PaginationInvalid(_)
            | RegistryError::BlobUploadInvalid(_) => StatusCode::BAD_REQUEST,
            RegistryError::UnsupportedManifestType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            RegistryError::RangeNotSatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            RegistryError::Unsupported(_) => StatusCode::METHOD_NOT_ALLOWED,
            RegistryError::Conflict(_) => StatusCode::CONFLICT,
            RegistryError::Auth { error, .. } => error.status_code(),
            RegistryError::Upstream { status, .. } => *status,
            RegistryError::Fetch(_)
            | RegistryError::Lock(_)
            | RegistryError::Config(_)
            | RegistryError::Storage(_)
            | RegistryError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code for registry error responses
    pub fn error_code(&self) -> &'static str {
        match self {
            RegistryError::BlobNotFound(_) => "BLOB_UNKNOWN",
            RegistryError::UploadNotFound(_) => "BLOB_UPLOAD_UNKNOWN",
            RegistryError::ManifestNotFound(_) => "MANIFEST_UNKNOWN",
            RegistryError::RepositoryNotFound(_) => "NAME_UNKNOWN",
            RegistryError::InvalidDigest(_) => "DIGEST_INVALID",
            RegistryError::InvalidManifest(_) => "MANIFEST_INVALID",
            RegistryError::UnsupportedManifestType(_) => "MANIFEST_INVALID",
            RegistryError::DigestMismatch { .. } => "DIGEST_INVALID",
            RegistryError::InvalidName(_) => "NAME_INVALID",
            RegistryError::InvalidTag(_) => "TAG_INVALID",
            RegistryError::RangeNotSatisfiable { .. } => "BLOB_UPLOAD_INVALID",
            RegistryError::BlobUploadInvalid(_) => "BLOB_UPLOAD_INVALID",
            RegistryError::PaginationInvalid(_) => "PAGINATION_NUMBER_INVALID",
            RegistryError::Unsupported(_) => "UNSUPPORTED",
            RegistryError::Conflict(_) => "DENIED",
            RegistryError::Auth { error, .. } => error.error_code(),
            RegistryError::Upstream { .. } | RegistryError::Fetch(_) => "UNKNOWN",
            RegistryError::Lock(_)
            | RegistryError::Config(_)
            | RegistryError::Storage(_)
            | RegistryError::Io(_) => "UNKNOWN",
        }
    }

    /// An upstream answer which was not a success.
    pub(crate) fn upstream(status: StatusCode, message: impl Into<String>) -> Self {
        RegistryError::Upstream {
            status,
            message: message.into(),
        }
    }

    /// Whether this error means "not here" rather than "broken". Group reads move
    /// on to the next member on these.
    pub(crate) fn is_not_found(&self) -> bool {
        match self {
            RegistryError::BlobNotFound(_)
            | RegistryError::ManifestNotFound(_)
            | RegistryError::UploadNotFound(_)
            | RegistryError::RepositoryNotFound(_) => true,
            RegistryError::Upstream { status, .. } => *status == StatusCode::NOT_FOUND,
            RegistryError::Storage(err) => err.is_not_found(),
            _ => false,
        }
    }
}

/// Registry error response format
#[derive(Debug, serde::Serialize)]
struct ErrorResponse {
    errors: Vec<ErrorDetail>,
}

#[derive(Debug, serde::Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code();
        let message = self.to_string();

        if status.is_server_error() {
            tracing::error!(%status, error = %message, "request failed");
        } else {
            tracing::debug!(%status, error = %message, "request rejected");
        }

        let body = ErrorResponse {
            errors: vec![ErrorDetail { code, message }],
        };
        let mut response = (status, axum::Json(body)).into_response();

        match &self {
            RegistryError::Auth {
                challenge: Some(challenge),
                ..
            } => {
                if let Ok(value) = HeaderValue::from_str(challenge) {
                    response
                        .headers_mut()
                        .insert(header::WWW_AUTHENTICATE, value);
                }
            }
            RegistryError::RangeNotSatisfiable { size: Some(size) } => {
                if let Ok(value) = HeaderValue::from_str(&format!("bytes */{size}")) {
                    response.headers_mut().insert(header::CONTENT_RANGE, value);
                }
            }
            _ => {}
        }

        response
    }
}
