//! Domain patterns used to exclude items of a source

use url::Url;

/// Lower-cased host of `url`, without port
pub fn extract_domain(url: &Url) -> Option<String> {
    url.host_str().map(|h| h.to_lowercase())
}

/// Checks a domain against an exclusion pattern
///
/// `example.com` matches only itself. `*.example.com` matches the bare domain and
/// every subdomain at any depth. Comparison ignores ASCII case.
///
/// ```
/// use tidemark::url::matches_wildcard;
///
/// assert!(matches_wildcard("*.example.com", "example.com"));
/// assert!(matches_wildcard("*.example.com", "api.v2.example.com"));
/// assert!(!matches_wildcard("*.example.com", "notexample.com"));
/// ```
pub fn matches_wildcard(pattern: &str, candidate: &str) -> bool {
    let pattern = pattern.to_ascii_lowercase();
    let candidate = candidate.to_ascii_lowercase();
    match pattern.strip_prefix("*.") {
        Some(base) => {
            candidate == base
                || candidate
                    .strip_suffix(base)
                    .is_some_and(|prefix| prefix.ends_with('.'))
        }
        None => candidate == pattern,
    }
}

/// The first pattern excluding the URL-shaped `key`; `None` for non-URL keys
pub fn excluding_pattern<'a>(patterns: &'a [String], key: &str) -> Option<&'a str> {
    if patterns.is_empty() {
        return None;
    }
    let url = Url::parse(key).ok()?;
    let domain = extract_domain(&url)?;
    patterns
        .iter()
        .find(|pattern| matches_wildcard(pattern, &domain))
        .map(String::as_str)
}
