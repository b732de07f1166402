//! URI utilities.

use camino::Utf8Path;
use http::Uri;

use crate::FetchError;

/// Extension trait for URIs.
pub trait UriExtension {
    /// Join a path onto the URI's path. An absolute `path` replaces it. Any
    /// query on the base is dropped.
    fn join<P: AsRef<str>>(self, path: P) -> Uri;

    /// Whether two URIs point at the same host.
    fn same_host(&self, other: &Uri) -> bool;
}

impl UriExtension for Uri {
    fn join<P: AsRef<str>>(self, path: P) -> Uri {
        let base = self.path();
        let joined = Utf8Path::new(if base.is_empty() { "/" } else { base }).join(path.as_ref());

        let mut parts = self.into_parts();
        parts.path_and_query = http::uri::PathAndQuery::from_maybe_shared(joined.to_string())
            .ok()
            .or(parts.path_and_query);
        Uri::from_parts(parts).unwrap_or_default()
    }

    fn same_host(&self, other: &Uri) -> bool {
        match (self.host(), other.host()) {
            (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
            _ => false,
        }
    }
}

/// Resolve a `Location` header against the URI that returned it.
pub fn resolve_location(base: &Uri, location: &str) -> Result<Uri, FetchError> {
    let base = url::Url::parse(&base.to_string())
        .map_err(|err| FetchError::InvalidUrl(format!("{base}: {err}")))?;
    let next = base
        .join(location)
        .map_err(|err| FetchError::InvalidUrl(format!("{location}: {err}")))?;
    next.as_str()
        .parse()
        .map_err(|err| FetchError::InvalidUrl(format!("{next}: {err}")))
}

/// Serialize and deserialize a URI as a string.
pub mod serde {
    use http::Uri;
    use serde::{Deserialize as _, Deserializer};

    /// Deserialize a URI from a string.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Uri, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }

    /// Serialize a URI as a string.
    pub fn serialize<S>(uri: &Uri, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(uri)
    }

    /// The same, for optional URIs.
    pub mod option {
        use http::Uri;
        use serde::{Deserialize as _, Deserializer};

        /// Deserialize an optional URI from a string.
        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Uri>, D::Error>
        where
            D: Deserializer<'de>,
        {
            Option::<String>::deserialize(deserializer)?
                .map(|s| s.parse().map_err(serde::de::Error::custom))
                .transpose()
        }

        /// Serialize an optional URI as a string.
        pub fn serialize<S>(uri: &Option<Uri>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: serde::Serializer,
        {
            match uri {
                Some(uri) => serializer.collect_str(uri),
                None => serializer.serialize_none(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_paths() {
        let uri = "http://example.com".parse::<Uri>().unwrap();
        assert_eq!(uri.join("v2/").to_string(), "http://example.com/v2/");

        let uri = "https://registry.example/mirror".parse::<Uri>().unwrap();
        assert_eq!(
            uri.join("v2/library/alpine/manifests/3.19").to_string(),
            "https://registry.example/mirror/v2/library/alpine/manifests/3.19"
        );

        let uri = "http://example.com/bar/".parse::<Uri>().unwrap();
        assert_eq!(uri.join("/foo").to_string(), "http://example.com/foo");
    }

    #[test]
    fn resolves_relative_and_absolute_locations() {
        let base: Uri = "http://a.example/v2/x/blobs/sha256:1".parse().unwrap();

        let next = resolve_location(&base, "/storage/1").unwrap();
        assert_eq!(next.to_string(), "http://a.example/storage/1");
        assert!(next.same_host(&base));

        let next = resolve_location(&base, "https://cdn.example/blob?sig=1").unwrap();
        assert_eq!(next.host(), Some("cdn.example"));
        assert!(!next.same_host(&base));
    }
}
