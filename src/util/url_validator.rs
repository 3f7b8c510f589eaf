use std::net::IpAddr;
use thiserror::Error;
use url::Url;

/// Errors that can occur during URL validation.
#[derive(Error, Debug)]
pub enum UrlValidationError {
    /// The URL string could not be parsed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    /// The URL uses a scheme other than http or https.
    #[error("Unsupported scheme: {0} (only http/https allowed)")]
    UnsupportedScheme(String),
    /// The URL points to a private/internal IP address.
    #[error("Private IP address not allowed: {0}")]
    PrivateIp(String),
    /// The URL points to localhost.
    #[error("Localhost not allowed")]
    Localhost,
    /// The URL has no host component.
    #[error("URL has no host")]
    MissingHost,
}

/// Validates a feed URL before it is registered or fetched.
///
/// Rejects non-HTTP(S) schemes and URLs without a host. Unless
/// `allow_private_networks` is set, also rejects localhost and private,
/// link-local or unspecified IP literals to prevent SSRF through submitted
/// work items.
///
/// ```
/// use feedsync::util::validate_url;
///
/// let url = validate_url("https://example.com/feed.xml", false).unwrap();
/// assert_eq!(url.host_str(), Some("example.com"));
///
/// assert!(validate_url("http://192.168.1.1/feed", false).is_err());
/// assert!(validate_url("http://192.168.1.1/feed", true).is_ok());
/// assert!(validate_url("file:///etc/passwd", true).is_err());
/// ```
pub fn validate_url(url_str: &str, allow_private_networks: bool) -> Result<Url, UrlValidationError> {
    let url = Url::parse(url_str.trim())?;

    match url.scheme() {
        "http" | "https" => {}
        scheme => return Err(UrlValidationError::UnsupportedScheme(scheme.to_owned())),
    }

    let Some(host) = url.host_str() else {
        return Err(UrlValidationError::MissingHost);
    };

    if allow_private_networks {
        return Ok(url);
    }

    if host.eq_ignore_ascii_case("localhost") {
        return Err(UrlValidationError::Localhost);
    }

    // Strip brackets from IPv6 addresses for parsing
    let host_for_parse = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);

    if let Ok(ip) = host_for_parse.parse::<IpAddr>() {
        if ip.is_loopback() {
            return Err(UrlValidationError::Localhost);
        }
        if is_private_ip(&ip) {
            return Err(UrlValidationError::PrivateIp(ip.to_string()));
        }
    }

    Ok(url)
}

fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ipv4) => {
            ipv4.is_private() || ipv4.is_loopback() || ipv4.is_link_local() || ipv4.is_unspecified()
        }
        IpAddr::V6(ipv6) => {
            if ipv6.is_loopback() || ipv6.is_unspecified() {
                return true;
            }
            let segments = ipv6.segments();
            // Unique Local (fc00::/7)
            let is_unique_local = (segments[0] & 0xfe00) == 0xfc00;
            // Link-Local (fe80::/10)
            let is_link_local = (segments[0] & 0xffc0) == 0xfe80;
            is_unique_local || is_link_local
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_urls() {
        assert!(validate_url("https://example.com/feed.xml", false).is_ok());
        assert!(validate_url("http://news.example.org", false).is_ok());
        assert!(validate_url("https://example.com:443/feed.xml", false).is_ok());
    }

    #[test]
    fn test_invalid_schemes() {
        assert!(matches!(
            validate_url("file:///etc/passwd", false),
            Err(UrlValidationError::UnsupportedScheme(_))
        ));
        assert!(validate_url("ftp://example.com", true).is_err());
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(matches!(
            validate_url("not a url", false),
            Err(UrlValidationError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_localhost_rejected() {
        assert!(validate_url("http://localhost/feed", false).is_err());
        assert!(validate_url("http://LOCALHOST/feed", false).is_err());
        assert!(validate_url("http://127.0.0.1/feed", false).is_err());
        assert!(validate_url("http://[::1]/feed", false).is_err());
    }

    #[test]
    fn test_private_ips_rejected() {
        assert!(validate_url("http://192.168.1.1/feed", false).is_err());
        assert!(validate_url("http://10.0.0.1:3000/feed", false).is_err());
        assert!(validate_url("http://172.16.0.1/feed", false).is_err());
        assert!(validate_url("http://169.254.1.1/feed", false).is_err());
        assert!(validate_url("http://[fe80::1]/feed", false).is_err());
        assert!(validate_url("http://0.0.0.0/feed", false).is_err());
    }

    #[test]
    fn test_private_allowed_when_configured() {
        assert!(validate_url("http://127.0.0.1:8080/feed", true).is_ok());
        assert!(validate_url("http://localhost/feed", true).is_ok());
    }
}
