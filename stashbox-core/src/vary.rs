//! Vary header resolution and varied key encoding.
//!
//! A varied key is the base key followed by [`VARY_SEPARATOR`] and the
//! `name:value` pairs of every header listed in the response `Vary` header,
//! joined with [`PAIR_DELIMITER`]:
//!
//! ```text
//! GET-example.com-/{-VARY-}accept-encoding:gzip;accept-language:fr
//! ```
//!
//! Values that contain a reserved character are form-encoded before being
//! embedded and decoded when read back, so [`VariedKey::decode`] always
//! returns exactly what [`VariedKey::encode`] received. Plain values are kept
//! verbatim, which keeps keys readable and compatible with existing stores.

use std::fmt;

use http::HeaderMap;
use http::header::{HeaderName, VARY};
use url::form_urlencoded;

use crate::CacheKey;

/// Separator between the base key and the varied headers.
pub const VARY_SEPARATOR: &str = "{-VARY-}";

/// Delimiter between two `name:value` pairs.
pub const PAIR_DELIMITER: char = ';';

/// Delimiter between a header name and its value.
pub const NAME_VALUE_DELIMITER: char = ':';

const RESERVED: &[char] = &[PAIR_DELIMITER, NAME_VALUE_DELIMITER, '%', '+', '&', '=', '{'];

/// Ordered `(header name, header value)` pairs a variant was stored for.
pub type VariedHeaders = Vec<(String, String)>;

/// Parsed response `Vary` header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Vary {
    names: Vec<HeaderName>,
    star: bool,
}

impl Vary {
    /// Collects every header name listed in the `Vary` header lines of `headers`.
    ///
    /// Names are de-duplicated and kept in first-seen order. Unparsable names
    /// are skipped.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let mut vary = Vary::default();
        for line in headers.get_all(VARY) {
            let Ok(line) = line.to_str() else { continue };
            for name in line.split(',').map(str::trim).filter(|n| !n.is_empty()) {
                if name == "*" {
                    vary.star = true;
                    continue;
                }
                if let Ok(name) = HeaderName::from_bytes(name.as_bytes()) {
                    if !vary.names.contains(&name) {
                        vary.names.push(name);
                    }
                }
            }
        }
        vary
    }

    /// `Vary: *` was declared, the response must not be cached.
    #[inline]
    pub fn is_star(&self) -> bool {
        self.star
    }

    /// Header names the representation varies on.
    #[inline]
    pub fn names(&self) -> &[HeaderName] {
        &self.names
    }

    /// Whether `name` is one of the varied headers.
    pub fn contains(&self, name: &HeaderName) -> bool {
        self.names.contains(name)
    }

    /// Reads the current value of every varied header from a request.
    ///
    /// A missing header contributes an empty value and repeated headers are
    /// joined with `", "`.
    pub fn resolve(&self, request: &HeaderMap) -> VariedHeaders {
        self.names
            .iter()
            .map(|name| (name.as_str().to_owned(), header_value(request, name.as_str())))
            .collect()
    }
}

/// All values of a header joined the way a single comma-separated line would be.
pub fn header_value(headers: &HeaderMap, name: &str) -> String {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .map(str::trim)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Key under which one variant of a resource is stored.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct VariedKey(String);

impl VariedKey {
    /// Computes the varied key of a request for the given `Vary` header names.
    ///
    /// Returns the base key unchanged together with an empty header list when
    /// `vary` names nothing.
    pub fn compute(base: &CacheKey, vary: &Vary, request: &HeaderMap) -> (Self, VariedHeaders) {
        let headers = vary.resolve(request);
        (Self::encode(base, &headers), headers)
    }

    /// Encodes `headers` after `base`.
    pub fn encode(base: &CacheKey, headers: &[(String, String)]) -> Self {
        if headers.is_empty() {
            return Self(base.as_str().to_owned());
        }
        let pairs = headers
            .iter()
            .map(|(name, value)| format!("{name}{NAME_VALUE_DELIMITER}{}", encode_value(value)))
            .collect::<Vec<_>>()
            .join(&PAIR_DELIMITER.to_string());
        Self(format!("{}{VARY_SEPARATOR}{pairs}", base.as_str()))
    }

    /// Splits a varied key back into its base key and decoded headers.
    pub fn decode(key: &str) -> (CacheKey, VariedHeaders) {
        let Some((base, pairs)) = key.rsplit_once(VARY_SEPARATOR) else {
            return (CacheKey::new(key), Vec::new());
        };
        let headers = pairs
            .split(PAIR_DELIMITER)
            .filter(|pair| !pair.is_empty())
            .map(|pair| match pair.split_once(NAME_VALUE_DELIMITER) {
                Some((name, value)) => (name.to_owned(), decode_value(value)),
                None => (pair.to_owned(), String::new()),
            })
            .collect();
        (CacheKey::new(base), headers)
    }

    /// Returns the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consumes the key, returning the underlying string.
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for VariedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<VariedKey> for String {
    fn from(key: VariedKey) -> Self {
        key.0
    }
}

/// Escapes a header value so it can be embedded in a varied key.
pub fn encode_value(value: &str) -> String {
    if value.contains(RESERVED) {
        form_urlencoded::byte_serialize(value.as_bytes()).collect()
    } else {
        value.to_owned()
    }
}

/// Reverses [`encode_value`].
pub fn decode_value(value: &str) -> String {
    if value.is_empty() {
        return String::new();
    }
    form_urlencoded::parse(value.as_bytes())
        .next()
        .map(|(decoded, _)| decoded.into_owned())
        .unwrap_or_default()
}

/// Whether the varied headers of a stored variant match the request.
///
/// Stored values are compared after decoding, against all values of the
/// request header joined with `", "`.
pub fn matches(stored: &[(String, String)], request: &HeaderMap) -> bool {
    stored
        .iter()
        .all(|(name, value)| header_value(request, name) == *value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                value.parse().unwrap(),
            );
        }
        map
    }

    #[test]
    fn empty_vary_keeps_base_key() {
        let base = CacheKey::new("GET-example.com-/");
        let (key, varied) = VariedKey::compute(&base, &Vary::default(), &HeaderMap::new());
        assert_eq!(key.as_str(), base.as_str());
        assert!(varied.is_empty());
    }

    #[test]
    fn vary_star_is_reported() {
        let vary = Vary::from_headers(&headers(&[("vary", "Accept, *")]));
        assert!(vary.is_star());
        assert_eq!(vary.names(), &[HeaderName::from_static("accept")]);
    }

    #[test]
    fn vary_lines_are_merged_and_deduplicated() {
        let vary = Vary::from_headers(&headers(&[
            ("vary", "Accept-Encoding"),
            ("vary", "accept-encoding, Accept-Language"),
        ]));
        assert_eq!(
            vary.names(),
            &[
                HeaderName::from_static("accept-encoding"),
                HeaderName::from_static("accept-language")
            ]
        );
    }

    #[test]
    fn plain_values_are_embedded_verbatim() {
        let base = CacheKey::new("GET-example.com-/");
        let vary = Vary::from_headers(&headers(&[("vary", "accept-encoding")]));
        let (key, _) = VariedKey::compute(&base, &vary, &headers(&[("accept-encoding", "gzip")]));
        assert_eq!(key.as_str(), "GET-example.com-/{-VARY-}accept-encoding:gzip");
    }

    #[test]
    fn reserved_characters_are_escaped() {
        let base = CacheKey::new("base");
        let key = VariedKey::encode(&base, &[("cookie".into(), "a=1; b:2".into())]);
        assert!(!key.as_str()["base{-VARY-}cookie:".len()..].contains([';', ':']));
    }

    #[test]
    fn varied_key_round_trips() {
        let base = CacheKey::new("GET-example.com-/path?q=1");
        let samples: Vec<VariedHeaders> = vec![
            vec![],
            vec![("accept".into(), "text/html".into())],
            vec![("accept".into(), String::new())],
            vec![
                ("cookie".into(), "session=a;b:c".into()),
                ("x-weird".into(), "100% + & = {-VARY-} ;;::".into()),
            ],
            vec![
                ("accept-language".into(), "fr-CH, fr;q=0.9, en;q=0.8".into()),
                ("x-unicode".into(), "déjà vu".into()),
                ("x-space".into(), "  padded  ".into()),
            ],
        ];

        for headers in samples {
            let encoded = VariedKey::encode(&base, &headers);
            let (decoded_base, decoded_headers) = VariedKey::decode(encoded.as_str());
            assert_eq!(decoded_base, base, "base key must survive {encoded}");
            assert_eq!(decoded_headers, headers, "headers must survive {encoded}");
        }
    }

    #[test]
    fn stored_headers_match_joined_request_values() {
        let stored = vec![("accept".to_owned(), "a, b".to_owned())];
        assert!(matches(&stored, &headers(&[("accept", "a"), ("accept", "b")])));
        assert!(!matches(&stored, &headers(&[("accept", "a")])));
    }
}
