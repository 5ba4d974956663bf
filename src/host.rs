// ============================================================================
// URL / HOST CLASSIFIER
// ============================================================================

use std::fmt;

use url::Url;

use crate::constants::INTERNAL_URL_PREFIXES;

const CONNECT_DEFAULT_PORT: u16 = 443;
const HTTP_DEFAULT_PORT: u16 = 80;

/// Destination of a proxied request
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Target {
    pub host: String,
    pub port: u16,
}

impl Target {
    /// `host` is stored as given; callers normalize case first.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Derive the destination host and port of a request.
///
/// Returns `None` for proxy-internal pseudo-URLs, for unusable hosts
/// (`""`, `-`, `localhost`) and for ports that do not fit in a `u16`.
pub fn classify_target(method: &str, raw_url: &str) -> Option<Target> {
    let raw = raw_url.trim();
    if raw.is_empty() || raw == "-" || is_internal(raw) {
        return None;
    }

    let target = if method.eq_ignore_ascii_case("CONNECT") {
        split_host_port(raw, CONNECT_DEFAULT_PORT)?
    } else if raw.contains("://") {
        from_absolute_url(raw)?
    } else {
        split_host_port(raw, HTTP_DEFAULT_PORT)?
    };

    if target.host.is_empty() || target.host == "-" || target.host == "localhost" {
        return None;
    }
    Some(target)
}

/// Proxy-internal pseudo-URLs such as `cache_object://` and `internal://`
fn is_internal(raw: &str) -> bool {
    INTERNAL_URL_PREFIXES.iter().any(|prefix| {
        raw.get(..prefix.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
    })
}

/// Scheme-relative default port when the URL names none
fn from_absolute_url(raw: &str) -> Option<Target> {
    let url = Url::parse(raw).ok()?;
    let host = url.host_str()?;
    let port = url.port_or_known_default().unwrap_or(HTTP_DEFAULT_PORT);
    Some(Target::new(normalize_host(host), port))
}

/// `host`, `host:port`, `[v6]`, `[v6]:port`, optionally followed by a path.
fn split_host_port(raw: &str, default_port: u16) -> Option<Target> {
    let authority = raw.split('/').next().unwrap_or(raw);

    if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest.split_once(']')?;
        let port = match after.strip_prefix(':') {
            Some(p) => parse_port(p, default_port)?,
            None if after.is_empty() => default_port,
            None => return None,
        };
        return Some(Target::new(host.to_ascii_lowercase(), port));
    }

    match authority.matches(':').count() {
        0 => Some(Target::new(normalize_host(authority), default_port)),
        1 => {
            let (host, port) = authority.rsplit_once(':')?;
            Some(Target::new(normalize_host(host), parse_port(port, default_port)?))
        }
        // Bare IPv6 literal without brackets
        _ => Some(Target::new(authority.to_ascii_lowercase(), default_port)),
    }
}

/// An empty port after `:` falls back to the default
fn parse_port(raw: &str, default_port: u16) -> Option<u16> {
    if raw.is_empty() {
        Some(default_port)
    } else {
        raw.parse().ok()
    }
}

fn normalize_host(host: &str) -> String {
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("CONNECT", "secure.example.com:8443", "secure.example.com", 8443)]
    #[case("CONNECT", "secure.example.com", "secure.example.com", 443)]
    #[case("CONNECT", "[2001:db8::1]:443", "2001:db8::1", 443)]
    #[case("GET", "http://example.com/index.html", "example.com", 80)]
    #[case("GET", "https://Example.COM/", "example.com", 443)]
    #[case("GET", "http://example.com:8080/a?b=c", "example.com", 8080)]
    #[case("GET", "http://[2001:db8::2]/", "2001:db8::2", 80)]
    #[case("GET", "ftp://files.example.com/pub/", "files.example.com", 21)]
    #[case("GET", "example.com:8000", "example.com", 8000)]
    #[case("GET", "example.com", "example.com", 80)]
    fn test_classify_target(
        #[case] method: &str,
        #[case] raw: &str,
        #[case] host: &str,
        #[case] port: u16,
    ) {
        assert_eq!(classify_target(method, raw), Some(Target::new(host, port)));
    }

    #[rstest]
    #[case("GET", "cache_object://localhost/info")]
    #[case("GET", "mgr://squid/menu")]
    #[case("GET", "INTERNAL://squid/squid-internal-static/icons/")]
    #[case("GET", "urn:uuid:6e8bc430")]
    #[case("GET", "-")]
    #[case("GET", "")]
    #[case("GET", "http://localhost/")]
    #[case("CONNECT", "localhost:443")]
    #[case("CONNECT", "example.com:99999")]
    #[case("CONNECT", "example.com:https")]
    fn test_excluded_targets(#[case] method: &str, #[case] raw: &str) {
        assert_eq!(classify_target(method, raw), None);
    }

    #[test]
    fn test_target_display() {
        assert_eq!(Target::new("api.example.com", 443).to_string(), "api.example.com:443");
    }
}
