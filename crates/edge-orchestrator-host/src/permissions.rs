//! Host permissions for outbound network access.
//!
//! This module provides [`NetworkPermissions`], which decides whether a
//! worker's outbound request may leave the machine.

use std::collections::BTreeSet;

/// Which hosts a network service may reach.
///
/// Patterns can be:
/// - Exact match: `api.example.com`
/// - Wildcard subdomain: `*.example.com` (matches `api.example.com` and `example.com`)
/// - All hosts: `*`
///
/// Private and loopback addresses are only reachable through `*` or an
/// exact pattern naming them; a wildcard subdomain never matches them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkPermissions {
    allowed_hosts: BTreeSet<String>,
}

impl NetworkPermissions {
    /// Permissions allowing exactly `hosts`.
    pub fn new<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed_hosts: hosts
                .into_iter()
                .map(|host| host.into().to_lowercase())
                .collect(),
        }
    }

    /// Permissions allowing every host, private addresses included.
    pub fn unrestricted() -> Self {
        Self::new(["*"])
    }

    /// Returns `true` if `*` is allowed.
    pub fn is_unrestricted(&self) -> bool {
        self.allowed_hosts.contains("*")
    }

    /// The allowed patterns.
    pub fn allowed_hosts(&self) -> impl Iterator<Item = &str> {
        self.allowed_hosts.iter().map(String::as_str)
    }

    /// Check if a request to `url` is allowed.
    pub fn is_allowed(&self, url: &url::Url) -> bool {
        if self.is_unrestricted() {
            return true;
        }
        let Some(host) = url.host_str() else {
            return false;
        };
        let host = host.to_lowercase();

        if self.allowed_hosts.contains(&host) {
            return true;
        }
        if is_private_address(url) {
            return false;
        }
        self.allowed_hosts
            .iter()
            .any(|pattern| matches_pattern(pattern, &host))
    }
}

fn matches_pattern(pattern: &str, host: &str) -> bool {
    match pattern.strip_prefix("*.") {
        Some(domain) => host == domain || host.ends_with(&format!(".{domain}")),
        None => pattern == host,
    }
}

/// Check if `url` points at a private or internal address.
///
/// Covers localhost and 127.0.0.0/8, the private IPv4 ranges, link-local
/// addresses and the cloud metadata endpoints.
pub fn is_private_address(url: &url::Url) -> bool {
    match url.host() {
        Some(url::Host::Ipv4(v4)) => {
            v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_documentation()
                || v4.is_unspecified()
        }
        Some(url::Host::Ipv6(v6)) => v6.is_loopback() || v6.is_unspecified(),
        Some(url::Host::Domain(domain)) => {
            let domain = domain.to_lowercase();
            domain == "localhost"
                || domain.ends_with(".localhost")
                || domain == "metadata.google.internal"
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> url::Url {
        url::Url::parse(s).unwrap()
    }

    #[test]
    fn test_exact_match() {
        let perms = NetworkPermissions::new(["api.example.com"]);

        assert!(perms.is_allowed(&url("https://api.example.com/path")));
        assert!(perms.is_allowed(&url("https://API.example.com/path")));
        assert!(!perms.is_allowed(&url("https://other.example.com/path")));
        assert!(!perms.is_allowed(&url("https://evil.com/path")));
    }

    #[test]
    fn test_wildcard_subdomain() {
        let perms = NetworkPermissions::new(["*.example.com"]);

        assert!(perms.is_allowed(&url("https://api.example.com/path")));
        assert!(perms.is_allowed(&url("https://example.com/path")));
        assert!(!perms.is_allowed(&url("https://notexample.com/path")));
        assert!(!perms.is_allowed(&url("https://evil.com/path")));
    }

    #[test]
    fn test_unrestricted_reaches_private_addresses() {
        let perms = NetworkPermissions::unrestricted();
        assert!(perms.is_allowed(&url("https://evil.com/path")));
        assert!(perms.is_allowed(&url("http://127.0.0.1:8080/")));
    }

    #[test]
    fn test_private_requires_exact_pattern() {
        let perms = NetworkPermissions::new(["*.localhost", "127.0.0.1"]);
        assert!(!perms.is_allowed(&url("http://app.localhost/")));
        assert!(perms.is_allowed(&url("http://127.0.0.1:9000/")));
        assert!(!perms.is_allowed(&url("http://10.0.0.1/")));
    }

    #[test]
    fn test_empty_denies_everything() {
        let perms = NetworkPermissions::default();
        assert!(!perms.is_allowed(&url("https://api.example.com/")));
    }

    #[test]
    fn test_private_address() {
        assert!(is_private_address(&url("http://localhost:8080/")));
        assert!(is_private_address(&url("http://127.0.0.1:8080/")));
        assert!(is_private_address(&url("http://[::1]:8080/")));
        assert!(is_private_address(&url("http://10.0.0.1/")));
        assert!(is_private_address(&url("http://172.16.0.1/")));
        assert!(is_private_address(&url("http://192.168.1.1/")));
        assert!(is_private_address(&url("http://169.254.169.254/")));
        assert!(is_private_address(&url("http://metadata.google.internal/")));

        assert!(!is_private_address(&url("https://api.example.com/")));
        assert!(!is_private_address(&url("https://8.8.8.8/")));
    }
}
