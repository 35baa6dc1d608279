//! Normalized relay identity.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use url::Url;
use url::form_urlencoded;

use crate::error::{ClientError, Result};

/// Normalized `ws`/`wss` relay URL.
///
/// Two URLs that differ only in query parameter order, a trailing `?`, or an
/// explicit default port are the same relay.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelayUrl(String);

impl RelayUrl {
    pub fn parse(input: &str) -> Result<Self> {
        let parsed =
            Url::parse(input).map_err(|error| ClientError::InvalidUrl(format!("{input}: {error}")))?;
        if parsed.scheme() != "ws" && parsed.scheme() != "wss" {
            return Err(ClientError::InvalidUrl(format!(
                "URL must use ws:// or wss:// scheme, got: {}",
                parsed.scheme()
            )));
        }

        let mut normalized = parsed.origin().ascii_serialization();
        if parsed.path() != "/" {
            normalized.push_str(parsed.path());
        }

        let mut pairs: Vec<(String, String)> = parsed.query_pairs().into_owned().collect();
        if !pairs.is_empty() {
            pairs.sort_by(|left, right| left.0.cmp(&right.0));
            let query = form_urlencoded::Serializer::new(String::new())
                .extend_pairs(pairs)
                .finish();
            normalized.push('?');
            normalized.push_str(&query);
        }

        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RelayUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RelayUrl {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for RelayUrl {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for RelayUrl {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for RelayUrl {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_equivalent_urls() -> Result<()> {
        let cases = [
            ("ws://host", "ws://host"),
            ("wss://host", "wss://host"),
            ("wss://host/?", "wss://host"),
            ("wss://host:443", "wss://host"),
            ("ws://host:8080/", "ws://host:8080"),
            ("wss://host/foo/", "wss://host/foo/"),
            ("wss://host/foo/bar?c=d&a=b", "wss://host/foo/bar?a=b&c=d"),
            ("wss://HOST/path", "wss://host/path"),
        ];

        for (input, expected) in cases {
            assert_eq!(RelayUrl::parse(input)?.as_str(), expected, "{input}");
        }
        Ok(())
    }

    #[test]
    fn query_sort_is_stable_for_repeated_keys() -> Result<()> {
        let url = RelayUrl::parse("wss://host/?b=2&a=z&a=y")?;
        assert_eq!(url.as_str(), "wss://host?a=z&a=y&b=2");
        Ok(())
    }

    #[test]
    fn rejects_non_websocket_urls() {
        for input in ["?", "http://host", "https://host/ws", "not a url"] {
            let result = RelayUrl::parse(input);
            assert!(
                matches!(result, Err(ClientError::InvalidUrl(_))),
                "{input}: {result:?}"
            );
        }
    }

    #[test]
    fn equal_identity_after_normalization() -> Result<()> {
        assert_eq!(
            RelayUrl::parse("wss://relay.example/?x=1&y=2")?,
            "wss://relay.example?y=2&x=1".parse::<RelayUrl>()?
        );
        Ok(())
    }
}
