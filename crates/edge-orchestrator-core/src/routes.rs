//! Route patterns and the compiled route table.
//!
//! A route pattern has the shape `[scheme://]host[/path]`:
//! - the host may be `*` (any host) or start with `*` (suffix match)
//! - the path may end with `*` (prefix match); a missing path means `/`
//!
//! Patterns are ordered by specificity, most specific first. Ties keep
//! declaration order.

use std::cmp::Reverse;

use serde::{Deserialize, Serialize};
use url::Url;

/// A parsed route pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutePattern {
    /// The pattern as written.
    pub raw: String,
    /// Required scheme (without `://`), if any.
    pub scheme: Option<String>,
    /// Host to match, without a leading wildcard.
    pub host: String,
    /// The host began with `*`: match any hostname ending with `host`.
    pub host_wildcard: bool,
    /// Path to match, without a trailing wildcard.
    pub path: String,
    /// The path ended with `*`: match any path starting with `path`.
    pub path_wildcard: bool,
    /// The pattern spelled out a path.
    pub has_path: bool,
}

/// Why a pattern could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteParseError {
    /// The pattern.
    pub pattern: String,
    /// What is wrong with it.
    pub reason: &'static str,
}

impl RoutePattern {
    /// Parse a route pattern.
    pub fn parse(pattern: &str) -> Result<Self, RouteParseError> {
        let fail = |reason| RouteParseError {
            pattern: pattern.to_string(),
            reason,
        };

        let trimmed = pattern.trim();
        if trimmed.is_empty() {
            return Err(fail("route must not be empty"));
        }
        if trimmed.contains('?') {
            return Err(fail("route must not contain search parameters"));
        }

        let (scheme, rest) = match trimmed.split_once("://") {
            Some((scheme, rest)) => {
                if scheme.is_empty() || scheme.contains('*') {
                    return Err(fail("route scheme must be literal"));
                }
                (Some(scheme.to_ascii_lowercase()), rest)
            }
            None => (None, trimmed),
        };

        let (host, path, has_path) = match rest.find('/') {
            Some(index) => (&rest[..index], &rest[index..], true),
            None => (rest, "/", false),
        };
        if host.is_empty() {
            return Err(fail("route must specify a host"));
        }

        let host = host.to_ascii_lowercase();
        let (host, host_wildcard) = match host.strip_prefix('*') {
            Some(suffix) => (suffix.to_string(), true),
            None => (host, false),
        };
        if host.contains('*') {
            return Err(fail("host wildcards are only allowed at the start"));
        }

        let (path, path_wildcard) = match path.strip_suffix('*') {
            Some(prefix) => (prefix.to_string(), true),
            None => (path.to_string(), false),
        };
        if path.contains('*') {
            return Err(fail("path wildcards are only allowed at the end"));
        }

        Ok(Self {
            raw: pattern.to_string(),
            scheme,
            host,
            host_wildcard,
            path,
            path_wildcard,
            has_path,
        })
    }

    /// Returns `true` if the URL matches this pattern.
    pub fn matches(&self, url: &Url) -> bool {
        if let Some(scheme) = &self.scheme {
            if scheme != url.scheme() {
                return false;
            }
        }

        let hostname = url.host_str().unwrap_or("").to_ascii_lowercase();
        let host_ok = if self.host_wildcard {
            hostname.ends_with(&self.host)
        } else {
            hostname == self.host
        };
        if !host_ok {
            return false;
        }

        let mut path = url.path().to_string();
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }
        if self.path_wildcard {
            path.starts_with(&self.path)
        } else {
            path == self.path
        }
    }

    /// Sort key; larger is more specific.
    pub fn specificity(&self) -> (bool, bool, usize, Reverse<usize>) {
        let literal = self.host.len() + self.path.len();
        let wildcards = usize::from(self.host_wildcard) + usize::from(self.path_wildcard);
        (self.scheme.is_some(), self.has_path, literal, Reverse(wildcards))
    }
}

/// A pattern routed to a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteEntry {
    /// The parsed pattern.
    pub pattern: RoutePattern,
    /// Worker receiving matching requests.
    pub worker: String,
}

/// Order entries by descending specificity, keeping declaration order on ties.
pub fn sort_by_specificity(entries: &mut [RouteEntry]) {
    // sort_by_key is stable
    entries.sort_by_key(|entry| Reverse(entry.pattern.specificity()));
}

/// Find the worker for a URL, if any route matches.
pub fn match_route<'a>(entries: &'a [RouteEntry], url: &Url) -> Option<&'a str> {
    entries
        .iter()
        .find(|entry| entry.pattern.matches(url))
        .map(|entry| entry.worker.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(pattern: &str, worker: &str) -> RouteEntry {
        RouteEntry {
            pattern: RoutePattern::parse(pattern).unwrap(),
            worker: worker.to_string(),
        }
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_parse_full_pattern() {
        let pattern = RoutePattern::parse("https://*.example.com/api/*").unwrap();
        assert_eq!(pattern.scheme.as_deref(), Some("https"));
        assert_eq!(pattern.host, ".example.com");
        assert!(pattern.host_wildcard);
        assert_eq!(pattern.path, "/api/");
        assert!(pattern.path_wildcard);
        assert!(pattern.has_path);
    }

    #[test]
    fn test_parse_host_only() {
        let pattern = RoutePattern::parse("example.com").unwrap();
        assert_eq!(pattern.path, "/");
        assert!(!pattern.has_path);
        assert!(pattern.matches(&url("http://example.com/")));
        assert!(!pattern.matches(&url("http://example.com/a")));
    }

    #[test]
    fn test_parse_errors() {
        assert!(RoutePattern::parse("").is_err());
        assert!(RoutePattern::parse("example.com/?a=1").is_err());
        assert!(RoutePattern::parse("ex*ample.com").is_err());
        assert!(RoutePattern::parse("example.com/a*/b").is_err());
        assert!(RoutePattern::parse("/path").is_err());
    }

    #[test]
    fn test_scheme_must_match() {
        let pattern = RoutePattern::parse("https://example.com/*").unwrap();
        assert!(pattern.matches(&url("https://example.com/a")));
        assert!(!pattern.matches(&url("http://example.com/a")));
    }

    #[test]
    fn test_host_wildcard() {
        let pattern = RoutePattern::parse("*.example.com/*").unwrap();
        assert!(pattern.matches(&url("http://api.example.com/")));
        assert!(!pattern.matches(&url("http://example.org/")));

        let any = RoutePattern::parse("*/*").unwrap();
        assert!(any.matches(&url("http://localhost:8787/anything")));
    }

    #[test]
    fn test_most_specific_wins() {
        let mut entries = vec![entry("*/api", "a"), entry("*/api/*", "b")];
        sort_by_specificity(&mut entries);

        assert_eq!(match_route(&entries, &url("http://localhost/api")), Some("a"));
        assert_eq!(match_route(&entries, &url("http://localhost/api/2")), Some("b"));
        assert_eq!(match_route(&entries, &url("http://localhost/notapi")), None);
    }

    #[test]
    fn test_scheme_outranks_longer_literal() {
        let mut entries = vec![
            entry("*.example.com/very/long/path/*", "long"),
            entry("https://*.example.com/*", "scheme"),
        ];
        sort_by_specificity(&mut entries);
        assert_eq!(entries[0].worker, "scheme");
    }

    #[test]
    fn test_ties_keep_declaration_order() {
        let mut entries = vec![entry("*/a/*", "first"), entry("*/b/*", "second")];
        sort_by_specificity(&mut entries);
        assert_eq!(entries[0].worker, "first");
        assert_eq!(entries[1].worker, "second");

        let mut same = vec![entry("*/x/*", "one"), entry("*/x/*", "two")];
        sort_by_specificity(&mut same);
        assert_eq!(match_route(&same, &url("http://h/x/1")), Some("one"));
    }

    #[test]
    fn test_query_is_part_of_path() {
        let exact = RoutePattern::parse("*/search").unwrap();
        assert!(!exact.matches(&url("http://h/search?q=1")));

        let prefix = RoutePattern::parse("*/search*").unwrap();
        assert!(prefix.matches(&url("http://h/search?q=1")));
    }
}
