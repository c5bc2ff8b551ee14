//! `Cache-Control` directive parsing.
//!
//! Request and response directives are parsed into separate structures since
//! they carry different vocabularies. Unknown directives are ignored, a known
//! directive with an unparsable value is an error.

use http::HeaderMap;
use http::header::CACHE_CONTROL;
use thiserror::Error;

/// Errors produced while parsing `Cache-Control` headers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DirectiveError {
    /// The header value is not visible ASCII.
    #[error("cache-control header is not valid ascii")]
    NotAscii,
    /// A directive that requires a delta-seconds value has none.
    #[error("directive `{0}` requires a value")]
    MissingValue(String),
    /// A delta-seconds value could not be parsed.
    #[error("directive `{directive}` has invalid value `{value}`")]
    InvalidValue {
        /// Directive name.
        directive: String,
        /// Raw value.
        value: String,
    },
}

/// `max-stale` request directive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MaxStale {
    /// Not sent, the client does not accept stale responses.
    #[default]
    Absent,
    /// Sent without a value, any staleness is acceptable.
    Unbounded,
    /// Staleness up to the given number of seconds is acceptable.
    Limited(u64),
}

impl MaxStale {
    /// Whether a response stale for `staleness` seconds is acceptable.
    pub fn allows(&self, staleness: u64) -> bool {
        match self {
            MaxStale::Absent => false,
            MaxStale::Unbounded => true,
            MaxStale::Limited(limit) => staleness <= *limit,
        }
    }
}

/// Directives of a request `Cache-Control` header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestCacheControl {
    pub no_cache: bool,
    pub no_store: bool,
    pub no_transform: bool,
    pub only_if_cached: bool,
    pub max_age: Option<u64>,
    pub min_fresh: Option<u64>,
    pub max_stale: MaxStale,
    pub stale_if_error: Option<u64>,
}

impl RequestCacheControl {
    /// Parses every `Cache-Control` line of a request.
    pub fn parse(headers: &HeaderMap) -> Result<Self, DirectiveError> {
        let mut cc = RequestCacheControl::default();
        for directive in directives(headers)? {
            match directive.name.as_str() {
                "no-cache" => cc.no_cache = true,
                "no-store" => cc.no_store = true,
                "no-transform" => cc.no_transform = true,
                "only-if-cached" => cc.only_if_cached = true,
                "max-age" => cc.max_age = Some(directive.seconds()?),
                "min-fresh" => cc.min_fresh = Some(directive.seconds()?),
                "max-stale" => {
                    cc.max_stale = match directive.value {
                        None => MaxStale::Unbounded,
                        Some(_) => MaxStale::Limited(directive.seconds()?),
                    }
                }
                "stale-if-error" => cc.stale_if_error = Some(directive.seconds()?),
                _ => {}
            }
        }
        Ok(cc)
    }
}

/// Directives of a response `Cache-Control` header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseCacheControl {
    /// `no-cache` without a field list.
    pub no_cache: bool,
    /// Header names listed by `no-cache="..."`, to be removed before storage.
    pub no_cache_fields: Vec<String>,
    pub no_store: bool,
    pub must_revalidate: bool,
    pub proxy_revalidate: bool,
    pub public: bool,
    /// `private` without a field list.
    pub private: bool,
    /// Header names listed by `private="..."`.
    pub private_fields: Vec<String>,
    pub max_age: Option<u64>,
    pub s_maxage: Option<u64>,
    pub stale_while_revalidate: Option<u64>,
    pub stale_if_error: Option<u64>,
}

impl ResponseCacheControl {
    /// Parses every `Cache-Control` line of a response.
    pub fn parse(headers: &HeaderMap) -> Result<Self, DirectiveError> {
        let mut cc = ResponseCacheControl::default();
        for directive in directives(headers)? {
            match directive.name.as_str() {
                "no-cache" => match directive.value.as_deref() {
                    Some(fields) if !fields.trim().is_empty() => {
                        cc.no_cache_fields.extend(field_names(fields))
                    }
                    _ => cc.no_cache = true,
                },
                "private" => match directive.value.as_deref() {
                    Some(fields) if !fields.trim().is_empty() => {
                        cc.private_fields.extend(field_names(fields))
                    }
                    _ => cc.private = true,
                },
                "no-store" => cc.no_store = true,
                "must-revalidate" => cc.must_revalidate = true,
                "proxy-revalidate" => cc.proxy_revalidate = true,
                "public" => cc.public = true,
                "max-age" => cc.max_age = Some(directive.seconds()?),
                "s-maxage" => cc.s_maxage = Some(directive.seconds()?),
                "stale-while-revalidate" => {
                    cc.stale_while_revalidate = Some(directive.seconds()?)
                }
                "stale-if-error" => cc.stale_if_error = Some(directive.seconds()?),
                _ => {}
            }
        }
        Ok(cc)
    }

    /// Stale responses may not be served without a successful revalidation.
    pub fn forbids_stale(&self) -> bool {
        self.must_revalidate || self.proxy_revalidate
    }

    /// Declared shared-cache lifetime, `s-maxage` wins over `max-age`.
    pub fn declared_max_age(&self) -> Option<u64> {
        self.s_maxage.or(self.max_age)
    }
}

#[derive(Debug)]
struct Directive {
    name: String,
    value: Option<String>,
}

impl Directive {
    fn seconds(&self) -> Result<u64, DirectiveError> {
        let value = self
            .value
            .as_deref()
            .ok_or_else(|| DirectiveError::MissingValue(self.name.clone()))?;
        // Delta-seconds beyond u64 saturate instead of failing.
        if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) {
            return Ok(value.parse().unwrap_or(u64::MAX));
        }
        Err(DirectiveError::InvalidValue {
            directive: self.name.clone(),
            value: value.to_owned(),
        })
    }
}

fn directives(headers: &HeaderMap) -> Result<Vec<Directive>, DirectiveError> {
    let mut parsed = Vec::new();
    for line in headers.get_all(CACHE_CONTROL) {
        let line = line.to_str().map_err(|_| DirectiveError::NotAscii)?;
        for token in split_quoted(line) {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            let (name, value) = match token.split_once('=') {
                Some((name, value)) => (name.trim(), Some(unquote(value.trim()))),
                None => (token, None),
            };
            parsed.push(Directive {
                name: name.to_ascii_lowercase(),
                value,
            });
        }
    }
    Ok(parsed)
}

/// Splits on commas that are not inside a quoted string.
fn split_quoted(line: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    let mut quoted = false;
    let mut start = 0;
    for (idx, ch) in line.char_indices() {
        match ch {
            '"' => quoted = !quoted,
            ',' if !quoted => {
                tokens.push(&line[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    tokens.push(&line[start..]);
    tokens
}

fn unquote(value: &str) -> String {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
        .to_owned()
}

fn field_names(fields: &str) -> impl Iterator<Item = String> + '_ {
    fields
        .split(',')
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .map(str::to_ascii_lowercase)
}
