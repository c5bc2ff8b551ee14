//! Conditional request evaluation against stored validators.

use chrono::{DateTime, Utc};
use http::HeaderMap;
use http::header::{IF_MATCH, IF_MODIFIED_SINCE, IF_NONE_MATCH, IF_UNMODIFIED_SINCE};

use crate::age::parse_http_date;

/// Conditional headers of a request and the outcome of validating them
/// against one stored representation.
///
/// Built once per request with [`Revalidator::from_request`], then updated by
/// [`validate_etag`](Self::validate_etag) and
/// [`validate_last_modified`](Self::validate_last_modified) when a variant is
/// elected.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Revalidator {
    /// Entity tags listed in `If-None-Match`.
    pub if_none_match: Vec<String>,
    /// Entity tags listed in `If-Match`.
    pub if_match: Vec<String>,
    pub if_modified_since: Option<DateTime<Utc>>,
    pub if_unmodified_since: Option<DateTime<Utc>>,
    /// ETag of the elected stored representation.
    pub response_etag: Option<String>,
    /// The stored representation satisfies the request conditions.
    pub matched: bool,
    /// The origin has to evaluate the request conditions.
    pub need_revalidation: bool,
    /// A bare `304 Not Modified` answers the request.
    pub not_modified: bool,
}

impl Revalidator {
    /// Reads the conditional headers of a request.
    ///
    /// Unparsable dates are ignored, as if the header were absent.
    pub fn from_request(headers: &HeaderMap) -> Self {
        let if_modified_since = date_header(headers, IF_MODIFIED_SINCE.as_str());
        let if_unmodified_since = date_header(headers, IF_UNMODIFIED_SINCE.as_str());
        Self {
            if_none_match: entity_tags(headers, IF_NONE_MATCH.as_str()),
            if_match: entity_tags(headers, IF_MATCH.as_str()),
            need_revalidation: if_unmodified_since.is_some(),
            if_modified_since,
            if_unmodified_since,
            matched: true,
            ..Default::default()
        }
    }

    /// The request carries at least one conditional header.
    pub fn is_conditional(&self) -> bool {
        !self.if_none_match.is_empty()
            || !self.if_match.is_empty()
            || self.if_modified_since.is_some()
            || self.if_unmodified_since.is_some()
    }

    /// Validates `If-None-Match` and `If-Match` against a stored ETag.
    pub fn validate_etag(&mut self, etag: Option<&str>) {
        self.response_etag = etag.map(str::to_owned);

        if !self.if_none_match.is_empty() {
            self.matched = self
                .if_none_match
                .iter()
                .any(|tag| tag == "*" || etag.is_some_and(|etag| weak_eq(tag, etag)));
            self.not_modified = self.matched;
            self.need_revalidation |= !self.matched;
            return;
        }

        if !self.if_match.is_empty() {
            self.matched = etag.is_some_and(|etag| {
                self.if_match
                    .iter()
                    .any(|tag| tag == "*" || strong_eq(tag, etag))
            });
            self.not_modified = false;
            self.need_revalidation |= !self.matched;
            return;
        }

        self.matched = true;
        self.not_modified = false;
    }

    /// Validates `If-Modified-Since` against a stored `Last-Modified` date.
    ///
    /// Ignored when `If-None-Match` is present, which takes precedence.
    pub fn validate_last_modified(&mut self, last_modified: Option<DateTime<Utc>>) {
        if !self.if_none_match.is_empty() {
            return;
        }
        let Some(since) = self.if_modified_since else {
            return;
        };
        match last_modified {
            Some(modified) if modified <= since => {
                self.matched = true;
                self.not_modified = true;
            }
            _ => {
                self.matched = false;
                self.not_modified = false;
                self.need_revalidation = true;
            }
        }
    }
}

fn entity_tags(headers: &HeaderMap, name: &str) -> Vec<String> {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .map(str::to_owned)
        .collect()
}

fn date_header(headers: &HeaderMap, name: &str) -> Option<DateTime<Utc>> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| parse_http_date(value).ok())
}

fn opaque(tag: &str) -> &str {
    tag.strip_prefix("W/").unwrap_or(tag)
}

fn weak_eq(left: &str, right: &str) -> bool {
    opaque(left) == opaque(right)
}

fn strong_eq(left: &str, right: &str) -> bool {
    !left.starts_with("W/") && !right.starts_with("W/") && left == right
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::age::format_http_date;
    use http::HeaderValue;

    fn request(name: http::header::HeaderName, value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(name, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn unconditional_request_matches_anything() {
        let mut revalidator = Revalidator::from_request(&HeaderMap::new());
        revalidator.validate_etag(Some("\"abc\""));
        assert!(revalidator.matched);
        assert!(!revalidator.not_modified);
        assert!(!revalidator.need_revalidation);
    }

    #[test]
    fn if_none_match_hit_is_not_modified() {
        let mut revalidator = Revalidator::from_request(&request(IF_NONE_MATCH, "\"x\", W/\"abc\""));
        revalidator.validate_etag(Some("\"abc\""));
        assert!(revalidator.matched);
        assert!(revalidator.not_modified);
    }

    #[test]
    fn if_none_match_star_matches() {
        let mut revalidator = Revalidator::from_request(&request(IF_NONE_MATCH, "*"));
        revalidator.validate_etag(None);
        assert!(revalidator.not_modified);
    }

    #[test]
    fn if_none_match_miss_needs_revalidation() {
        let mut revalidator = Revalidator::from_request(&request(IF_NONE_MATCH, "\"old\""));
        revalidator.validate_etag(Some("\"new\""));
        assert!(!revalidator.matched);
        assert!(revalidator.need_revalidation);
        assert_eq!(revalidator.response_etag.as_deref(), Some("\"new\""));
    }

    #[test]
    fn if_match_requires_strong_comparison() {
        let mut revalidator = Revalidator::from_request(&request(IF_MATCH, "W/\"abc\""));
        revalidator.validate_etag(Some("W/\"abc\""));
        assert!(!revalidator.matched);
        assert!(revalidator.need_revalidation);
    }

    #[test]
    fn if_modified_since_compares_dates() {
        let since = Utc::now() - chrono::Duration::hours(1);
        let headers = request(IF_MODIFIED_SINCE, &format_http_date(since));

        let mut revalidator = Revalidator::from_request(&headers);
        revalidator.validate_last_modified(Some(since - chrono::Duration::hours(1)));
        assert!(revalidator.not_modified);

        let mut revalidator = Revalidator::from_request(&headers);
        revalidator.validate_last_modified(Some(Utc::now()));
        assert!(!revalidator.not_modified);
        assert!(revalidator.need_revalidation);
    }

    #[test]
    fn if_unmodified_since_always_goes_to_origin() {
        let headers = request(IF_UNMODIFIED_SINCE, &format_http_date(Utc::now()));
        let revalidator = Revalidator::from_request(&headers);
        assert!(revalidator.need_revalidation);
        assert!(revalidator.is_conditional());
    }
}
