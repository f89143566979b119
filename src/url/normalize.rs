use crate::{UrlError, UrlResult};
use url::Url;

/// Query parameters that never change what a page shows
const TRACKING_PARAMS: &[&str] = &[
    "fbclid", "gclid", "dclid", "msclkid", "mc_eid", "mc_cid", "igshid", "ref", "ref_src",
];

/// Canonical form of an HTTP(S) item key
///
/// # Rules
///
/// 1. Only `http` and `https` keys are accepted; the scheme is kept as given
/// 2. The host is lower-cased and a leading `www.` removed; ports are kept
/// 3. Empty and `.` path segments are dropped and `..` resolved
/// 4. A trailing slash is removed, except for the root path
/// 5. The fragment is removed
/// 6. Tracking parameters (`utm_*`, click identifiers) are removed and the rest
///    sorted by name; an empty query is removed
///
/// ```
/// use tidemark::url::normalize_url;
///
/// let url = normalize_url("https://WWW.BBC.co.uk/news/../sport/?utm_source=rss#top").unwrap();
/// assert_eq!(url.as_str(), "https://bbc.co.uk/sport");
/// ```
pub fn normalize_url(key: &str) -> UrlResult<Url> {
    let mut url = Url::parse(key).map_err(|e| UrlError::Parse(e.to_string()))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(UrlError::InvalidScheme(url.scheme().to_string()));
    }

    let host = url
        .host_str()
        .map(|h| h.to_lowercase())
        .ok_or(UrlError::MissingDomain)?;
    let host = host.strip_prefix("www.").unwrap_or(&host).to_string();
    url.set_host(Some(&host))
        .map_err(|e| UrlError::Malformed(format!("cannot set host '{}': {}", host, e)))?;

    let path = canonical_path(url.path());
    url.set_path(&path);
    url.set_fragment(None);

    if url.query().is_some() {
        let mut params: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(name, _)| !is_tracking_param(name))
            .map(|(name, value)| (name.into_owned(), value.into_owned()))
            .collect();
        params.sort();

        if params.is_empty() {
            url.set_query(None);
        } else {
            url.query_pairs_mut().clear().extend_pairs(params);
        }
    }

    Ok(url)
}

fn canonical_path(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    format!("/{}", segments.join("/"))
}

fn is_tracking_param(name: &str) -> bool {
    name.starts_with("utm_") || TRACKING_PARAMS.contains(&name)
}
