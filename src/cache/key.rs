use sha2::{Digest, Sha256};

use crate::proxy::request::ParsedRequest;

/// Canonical cache fingerprint for a GET request.
///
/// The query is re-encoded with its pairs sorted lexicographically by key;
/// repeated keys keep their original relative order. Fragments never reach
/// the proxy, but a stray one is dropped. The authority is kept exactly as
/// the client sent it, so an explicit port yields a distinct key.
pub fn get_fingerprint(request: &ParsedRequest) -> String {
    let (path, query) = split_target(&request.path);
    let mut fingerprint = format!(
        "{}://{}{}",
        request.scheme.as_str(),
        request.authority(),
        path
    );
    if let Some(query) = query {
        let canonical = canonical_query(query);
        if !canonical.is_empty() {
            fingerprint.push('?');
            fingerprint.push_str(&canonical);
        }
    }
    fingerprint
}

/// Cache fingerprint for a POST request: the URL joined with a SHA-256 digest
/// of the request body. The raw query is appended only when configured.
pub fn post_fingerprint(
    request: &ParsedRequest,
    include_query_string: bool,
    body: &[u8],
) -> String {
    let (path, query) = split_target(&request.path);
    let mut fingerprint = format!(
        "{}://{}{}",
        request.scheme.as_str(),
        request.authority(),
        path
    );
    if include_query_string && let Some(query) = query.filter(|query| !query.is_empty()) {
        fingerprint.push('?');
        fingerprint.push_str(query);
    }

    let mut hasher = Sha256::new();
    hasher.update(body);
    fingerprint.push(':');
    fingerprint.push_str(&format!("{:x}", hasher.finalize()));
    fingerprint
}

fn split_target(target: &str) -> (&str, Option<&str>) {
    let target = target.split('#').next().unwrap_or(target);
    match target.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (target, None),
    }
}

fn canonical_query(query: &str) -> String {
    let mut pairs: Vec<(String, String)> = form_urlencoded::parse(query.as_bytes())
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    // Stable sort: values of a repeated key keep their original order.
    pairs.sort_by(|a, b| a.0.cmp(&b.0));

    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for (key, value) in &pairs {
        serializer.append_pair(key, value);
    }
    serializer.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::request::{ParsedRequest, Scheme};
    use http::Method;

    fn request(scheme: Scheme, host: &str, port: Option<u16>, path: &str) -> ParsedRequest {
        ParsedRequest {
            method: Method::GET,
            scheme,
            host: host.to_string(),
            port,
            path: path.to_string(),
        }
    }

    #[test]
    fn query_order_does_not_change_fingerprint() {
        let first = request(Scheme::Http, "x", None, "/p?b=2&a=1");
        let second = request(Scheme::Http, "x", None, "/p?a=1&b=2");
        assert_eq!(get_fingerprint(&first), get_fingerprint(&second));
        assert_eq!(get_fingerprint(&first), "http://x/p?a=1&b=2");
    }

    #[test]
    fn repeated_keys_keep_value_order() {
        let parsed = request(Scheme::Http, "x", None, "/p?b=1&a=2&b=0");
        assert_eq!(get_fingerprint(&parsed), "http://x/p?a=2&b=1&b=0");
    }

    #[test]
    fn fragment_is_dropped() {
        let with_fragment = request(Scheme::Http, "x", None, "/p#frag");
        let without = request(Scheme::Http, "x", None, "/p");
        assert_eq!(get_fingerprint(&with_fragment), get_fingerprint(&without));
    }

    #[test]
    fn explicit_port_changes_fingerprint() {
        let with_port = request(Scheme::Http, "x", Some(8080), "/p");
        let without = request(Scheme::Http, "x", None, "/p");
        assert_ne!(get_fingerprint(&with_port), get_fingerprint(&without));
        assert_eq!(get_fingerprint(&with_port), "http://x:8080/p");
    }

    #[test]
    fn empty_query_has_no_separator() {
        let parsed = request(Scheme::Https, "x", None, "/p?");
        assert_eq!(get_fingerprint(&parsed), "https://x/p");
    }

    #[test]
    fn post_fingerprints_share_key_for_equal_bodies() {
        let parsed = request(Scheme::Http, "x", None, "/submit");
        let first = post_fingerprint(&parsed, false, b"payload");
        let second = post_fingerprint(&parsed, false, b"payload");
        let third = post_fingerprint(&parsed, false, b"different");
        assert_eq!(first, second);
        assert_ne!(first, third);
    }

    #[test]
    fn post_query_ignored_unless_configured() {
        let with_query = request(Scheme::Http, "x", None, "/submit?v=1");
        let other_query = request(Scheme::Http, "x", None, "/submit?v=2");
        assert_eq!(
            post_fingerprint(&with_query, false, b"x"),
            post_fingerprint(&other_query, false, b"x")
        );
        assert_ne!(
            post_fingerprint(&with_query, true, b"x"),
            post_fingerprint(&other_query, true, b"x")
        );
    }

    #[test]
    fn post_fingerprint_embeds_sha256() {
        let parsed = request(Scheme::Http, "x", None, "/submit");
        let fingerprint = post_fingerprint(&parsed, false, b"x");
        // sha256("x")
        assert!(fingerprint.ends_with(
            ":2d711642b726b04401627ca9fbac32f5c8530fb1903cc4db02258717921a4881"
        ));
    }
}
