use url::Url;

/// Normalized `host[:port]` of a URL.
///
/// The host is lower-cased by the `url` crate during parsing and default
/// ports are dropped, so `http://Example.com:80/` and `http://example.com/`
/// share an authority while `example.com:8080` does not.
pub fn authority(url: &Url) -> Option<String> {
    let host = url.host_str()?.to_ascii_lowercase();
    Some(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host,
    })
}

/// True when `candidate` lives on the same authority as `origin`.
///
/// Schemes are not compared: `http://site` and `https://site` are the same
/// domain for crawling purposes.
pub fn is_same_domain(candidate: &Url, origin: &Url) -> bool {
    match (authority(candidate), authority(origin)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// True for http(s) URLs. Inline `data:` payloads, `javascript:` handlers,
/// `mailto:` and every other scheme are never fetched.
pub fn is_fetchable(url: &str) -> bool {
    let trimmed = url.trim_start();
    if has_inert_scheme(trimmed) {
        return false;
    }
    match Url::parse(trimmed) {
        Ok(parsed) => matches!(parsed.scheme(), "http" | "https") && parsed.host_str().is_some(),
        Err(_) => false,
    }
}

/// Attribute values that must never be resolved or rewritten.
pub(crate) fn is_inert_reference(raw: &str) -> bool {
    let value = raw.trim();
    if value.is_empty() {
        return true;
    }
    has_inert_scheme(value)
}

fn has_inert_scheme(value: &str) -> bool {
    let lower = value.to_ascii_lowercase();
    lower.starts_with("data:") || lower.starts_with("javascript:")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_same_domain_ignores_scheme_and_case() {
        let origin = url("https://Example.com/start");
        assert!(is_same_domain(&url("http://example.com/other"), &origin));
        assert!(is_same_domain(&url("https://EXAMPLE.COM/a?b=c"), &origin));
    }

    #[test]
    fn test_same_domain_is_port_aware() {
        let origin = url("http://localhost:8080/");
        assert!(is_same_domain(&url("http://localhost:8080/page"), &origin));
        assert!(!is_same_domain(&url("http://localhost:9090/page"), &origin));
        assert!(!is_same_domain(&url("http://localhost/page"), &origin));
    }

    #[test]
    fn test_default_port_is_normalized_away() {
        assert_eq!(authority(&url("http://example.com:80/")).unwrap(), "example.com");
        assert_eq!(authority(&url("http://example.com:81/")).unwrap(), "example.com:81");
    }

    #[test]
    fn test_subdomains_are_external() {
        let origin = url("https://example.com/");
        assert!(!is_same_domain(&url("https://cdn.example.com/lib.js"), &origin));
    }

    #[test]
    fn test_fetchable_schemes() {
        assert!(is_fetchable("http://example.com/a.css"));
        assert!(is_fetchable("https://example.com/"));
        assert!(!is_fetchable("data:image/png;base64,AAAA"));
        assert!(!is_fetchable("javascript:void(0)"));
        assert!(!is_fetchable("JavaScript:alert(1)"));
        assert!(!is_fetchable("mailto:someone@example.com"));
        assert!(!is_fetchable("ftp://example.com/file"));
        assert!(!is_fetchable("not a url"));
    }

    #[test]
    fn test_inert_references() {
        assert!(is_inert_reference(""));
        assert!(is_inert_reference("   "));
        assert!(is_inert_reference("data:text/css,body{}"));
        assert!(is_inert_reference("javascript:;"));
        assert!(!is_inert_reference("/style.css"));
    }
}
