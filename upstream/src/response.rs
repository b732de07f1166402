//! Upstream responses and body materialization.

use std::fmt;

use bytes::Bytes;
use http::{HeaderMap, StatusCode, Uri};
use http_body_util::BodyExt as _;

use crate::error::{BoxError, FetchError};

/// A response body, decoded according to its content type.
pub enum FetchBody {
    /// A JSON document. `raw` holds the bytes exactly as received.
    Json {
        /// Parsed document.
        value: serde_json::Value,
        /// Original bytes.
        raw: Bytes,
    },

    /// A `text/*` body.
    Text(String),

    /// Any other body, fully buffered.
    Binary(Bytes),

    /// An unread body, handed over because the caller asked for a stream or the
    /// body is larger than the buffering threshold.
    Stream(hyperdriver::Body),
}

impl fmt::Debug for FetchBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchBody::Json { raw, .. } => write!(f, "Json({} bytes)", raw.len()),
            FetchBody::Text(text) => write!(f, "Text({} bytes)", text.len()),
            FetchBody::Binary(bytes) => write!(f, "Binary({} bytes)", bytes.len()),
            FetchBody::Stream(_) => f.write_str("Stream"),
        }
    }
}

impl FetchBody {
    /// Decode buffered bytes by content type. Undecodable JSON or text falls back
    /// to binary.
    pub fn decode(content_type: Option<&str>, bytes: Bytes) -> Self {
        let essence = content_type
            .and_then(|ct| ct.split(';').next())
            .map(|ct| ct.trim().to_ascii_lowercase())
            .unwrap_or_default();

        if essence == "application/json" || essence.ends_with("+json") {
            match serde_json::from_slice(&bytes) {
                Ok(value) => FetchBody::Json { value, raw: bytes },
                Err(_) => FetchBody::Binary(bytes),
            }
        } else if essence.starts_with("text/") {
            match String::from_utf8(bytes.to_vec()) {
                Ok(text) => FetchBody::Text(text),
                Err(_) => FetchBody::Binary(bytes),
            }
        } else {
            FetchBody::Binary(bytes)
        }
    }

    /// Whether the body is still unread.
    pub fn is_stream(&self) -> bool {
        matches!(self, FetchBody::Stream(_))
    }

    /// The parsed JSON document, if the body was JSON.
    pub fn json(&self) -> Option<&serde_json::Value> {
        match self {
            FetchBody::Json { value, .. } => Some(value),
            _ => None,
        }
    }

    /// The raw bytes, reading a stream to the end if necessary.
    pub async fn bytes(self) -> Result<Bytes, FetchError> {
        match self {
            FetchBody::Json { raw, .. } => Ok(raw),
            FetchBody::Text(text) => Ok(Bytes::from(text)),
            FetchBody::Binary(bytes) => Ok(bytes),
            FetchBody::Stream(body) => collect(body).await,
        }
    }
}

/// The outcome of an upstream fetch.
#[derive(Debug)]
pub struct FetchResponse {
    /// Whether the status is 2xx.
    pub ok: bool,
    /// Upstream status, or 500 when no response was received.
    pub status: StatusCode,
    /// Upstream response headers.
    pub headers: HeaderMap,
    /// The URI that produced this response, after redirects.
    pub uri: Uri,
    /// The body.
    pub body: FetchBody,
}

impl FetchResponse {
    /// A response standing in for a request which never got an answer.
    pub(crate) fn network_failure(uri: Uri, error: &dyn fmt::Display) -> Self {
        Self {
            ok: false,
            status: StatusCode::INTERNAL_SERVER_ERROR,
            headers: HeaderMap::new(),
            uri,
            body: FetchBody::Text(format!("upstream request failed: {error}")),
        }
    }

    /// Buffer or hand over the body of an upstream response.
    pub(crate) async fn materialize(
        uri: Uri,
        response: http::Response<hyperdriver::Body>,
        stream: bool,
        threshold: u64,
    ) -> Result<Self, FetchError> {
        let (parts, body) = response.into_parts();

        let length = parts
            .headers
            .get(http::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());

        let body = if stream || length.is_some_and(|len| len > threshold) {
            FetchBody::Stream(body)
        } else {
            let content_type = parts
                .headers
                .get(http::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok());
            FetchBody::decode(content_type, collect(body).await?)
        };

        Ok(Self {
            ok: parts.status.is_success(),
            status: parts.status,
            headers: parts.headers,
            uri,
            body,
        })
    }

    /// The `Content-Type` header, if present and readable.
    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
    }

    /// Read the whole body.
    pub async fn bytes(self) -> Result<Bytes, FetchError> {
        self.body.bytes().await
    }
}

pub(crate) async fn collect<B>(body: B) -> Result<Bytes, FetchError>
where
    B: http_body::Body,
    B::Error: Into<BoxError>,
{
    let collected = body
        .collect()
        .await
        .map_err(|err| FetchError::Body(err.into()))?;
    Ok(collected.to_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_by_content_type() {
        let body = FetchBody::decode(
            Some("application/vnd.docker.distribution.manifest.v2+json"),
            Bytes::from_static(br#"{"schemaVersion":2}"#),
        );
        assert_eq!(body.json().unwrap()["schemaVersion"], 2);

        let body = FetchBody::decode(Some("text/plain; charset=utf-8"), Bytes::from_static(b"hi"));
        assert!(matches!(body, FetchBody::Text(ref t) if t == "hi"));

        let body = FetchBody::decode(Some("application/json"), Bytes::from_static(b"not json"));
        assert!(matches!(body, FetchBody::Binary(_)));

        let body = FetchBody::decode(None, Bytes::from_static(b"\x00\x01"));
        assert!(matches!(body, FetchBody::Binary(_)));
    }

    #[tokio::test]
    async fn json_keeps_original_bytes() {
        let raw = Bytes::from_static(b"{ \"b\": 1,  \"a\": 2 }");
        let body = FetchBody::decode(Some("application/json"), raw.clone());
        assert_eq!(body.bytes().await.unwrap(), raw);
    }
}
