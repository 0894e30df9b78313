//! Scrape endpoint resolution
//!
//! Turns a pod's address and `prometheus.io/*` annotations into the URI a
//! collector should pull from. The declared path is kept as written: dot
//! segments survive, and only bytes that cannot appear in a request target
//! are percent-encoded.

use crate::error::ResolveError;
use crate::filter::pod_key;
use http::uri::{Authority, Uri};
use k8s_openapi::api::core::v1::Pod;
use kubescrape_common::{annotations, defaults};

/// Maps a resolved URI and a bare address to the URI that is actually scraped
///
/// The surrounding agent owns this policy, e.g. to route through a proxy or
/// substitute a DNS name for the pod IP.
pub trait AddressRewriter: Send + Sync {
    fn rewrite(&self, uri: &Uri, address: &str) -> Uri;
}

/// Points the URI's host at the address and keeps everything else
#[derive(Debug, Clone, Copy, Default)]
pub struct HostAddressRewriter;

impl AddressRewriter for HostAddressRewriter {
    fn rewrite(&self, uri: &Uri, address: &str) -> Uri {
        let authority = match uri.port_u16() {
            Some(port) => join_host_port(address, &port.to_string()),
            None => bracket_ipv6(address),
        };

        let Ok(authority) = authority.parse::<Authority>() else {
            return uri.clone();
        };

        let mut parts = uri.clone().into_parts();
        parts.authority = Some(authority);
        Uri::from_parts(parts).unwrap_or_else(|_| uri.clone())
    }
}

fn bracket_ipv6(host: &str) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]", host)
    } else {
        host.to_string()
    }
}

fn join_host_port(host: &str, port: &str) -> String {
    format!("{}:{}", bracket_ipv6(host), port)
}

/// Characters left as-is in the path; `?` starts the query
fn is_path_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"-._~!$&'()*+,;=:@/".contains(&b)
}

fn is_query_char(b: u8) -> bool {
    is_path_char(b) || b == b'?' || b == b'%'
}

/// Validate a declared path and query and turn it into a request target
///
/// Control characters anywhere and malformed `%` escapes in the path are
/// rejected. A fragment is dropped since it is never sent.
fn request_target(raw: &str) -> Result<String, &'static str> {
    if raw.bytes().any(|b| b < 0x20 || b == 0x7f) {
        return Err("invalid control character");
    }

    let raw = raw.split_once('#').map_or(raw, |(target, _)| target);
    let (path, query) = match raw.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (raw, None),
    };

    let mut out = String::with_capacity(raw.len() + 1);
    if !path.starts_with('/') {
        out.push('/');
    }

    let bytes = path.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        if b == b'%' {
            let escape = bytes.get(i + 1..i + 3);
            if !escape.is_some_and(|hex| hex.iter().all(u8::is_ascii_hexdigit)) {
                return Err("invalid percent escape");
            }
            out.push('%');
        } else if is_path_char(b) {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }

    if let Some(query) = query {
        out.push('?');
        for b in query.bytes() {
            if is_query_char(b) {
                out.push(b as char);
            } else {
                out.push_str(&format!("%{:02X}", b));
            }
        }
    }

    Ok(out)
}

/// Build the scrape URI for a pod
///
/// Returns `Ok(None)` while the pod has no IP yet; a later event will carry it.
pub fn resolve(pod: &Pod) -> Result<Option<Uri>, ResolveError> {
    let Some(ip) = pod
        .status
        .as_ref()
        .and_then(|s| s.pod_ip.as_deref())
        .filter(|ip| !ip.is_empty())
    else {
        return Ok(None);
    };

    let declared = |key: &str| {
        pod.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    };

    let scheme = declared(annotations::SCHEME).unwrap_or(defaults::SCHEME);
    let port = declared(annotations::PORT).unwrap_or(defaults::PORT);
    let path_and_query = declared(annotations::PATH).unwrap_or(defaults::PATH);

    if port.parse::<u16>().is_err() {
        return Err(ResolveError::InvalidPort {
            key: pod_key(pod),
            port: port.to_string(),
        });
    }

    let target = request_target(path_and_query).map_err(|reason| ResolveError::InvalidPath {
        key: pod_key(pod),
        path: path_and_query.to_string(),
        reason,
    })?;

    let uri = Uri::builder()
        .scheme(scheme)
        .authority(join_host_port(ip, port))
        .path_and_query(target)
        .build()
        .map_err(|source| ResolveError::InvalidUrl {
            key: pod_key(pod),
            source,
        })?;

    Ok(Some(uri))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::tests::scrape_pod;

    fn annotate(pod: &mut Pod, key: &str, value: &str) {
        pod.metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(key.to_string(), value.to_string());
    }

    #[test]
    fn test_defaults() {
        let pod = scrape_pod("ns", "a", "10.0.0.5");
        let url = resolve(&pod).unwrap().unwrap();
        assert_eq!(url.to_string(), "http://10.0.0.5:9102/metrics");
    }

    #[test]
    fn test_declared_scheme_port_and_path() {
        let mut pod = scrape_pod("ns", "a", "10.0.0.5");
        annotate(&mut pod, annotations::SCHEME, "https");
        annotate(&mut pod, annotations::PORT, "8443");
        annotate(&mut pod, annotations::PATH, "/stats/prometheus?format=text");

        let url = resolve(&pod).unwrap().unwrap();
        assert_eq!(
            url.to_string(),
            "https://10.0.0.5:8443/stats/prometheus?format=text"
        );
    }

    #[test]
    fn test_relative_path_without_leading_slash() {
        let mut pod = scrape_pod("ns", "a", "10.0.0.5");
        annotate(&mut pod, annotations::PATH, "custom/metrics");

        let url = resolve(&pod).unwrap().unwrap();
        assert_eq!(url.path(), "/custom/metrics");
    }

    #[test]
    fn test_no_address_is_not_an_error() {
        let pod = scrape_pod("ns", "a", "");
        assert!(resolve(&pod).unwrap().is_none());

        let mut pod = scrape_pod("ns", "a", "10.0.0.5");
        pod.status = None;
        assert!(resolve(&pod).unwrap().is_none());
    }

    #[test]
    fn test_ipv6_address() {
        let pod = scrape_pod("ns", "a", "fd00::5");
        let url = resolve(&pod).unwrap().unwrap();
        assert_eq!(url.to_string(), "http://[fd00::5]:9102/metrics");
    }

    #[test]
    fn test_invalid_port_is_an_error() {
        let mut pod = scrape_pod("ns", "broken", "10.0.0.5");
        annotate(&mut pod, annotations::PORT, "metrics");

        let err = resolve(&pod).unwrap_err();
        assert!(err.to_string().contains("ns/broken"));
    }

    #[test]
    fn test_host_rewriter_keeps_port_and_path() {
        let url: Uri = "http://10.0.0.5:9102/metrics?x=1".parse().unwrap();

        let rewritten = HostAddressRewriter.rewrite(&url, "pod.example.internal");
        assert_eq!(
            rewritten.to_string(),
            "http://pod.example.internal:9102/metrics?x=1"
        );

        let rewritten = HostAddressRewriter.rewrite(&url, "fd00::7");
        assert_eq!(rewritten.to_string(), "http://[fd00::7]:9102/metrics?x=1");
    }

    #[test]
    fn test_malformed_escape_in_path_is_an_error() {
        for path in ["/%zz", "/metrics%", "/a%4"] {
            let mut pod = scrape_pod("ns", "broken", "10.0.0.5");
            annotate(&mut pod, annotations::PATH, path);

            let err = resolve(&pod).unwrap_err();
            assert!(
                matches!(err, ResolveError::InvalidPath { .. }),
                "path {:?} gave {:?}",
                path,
                err
            );
            assert!(err.to_string().contains("ns/broken"));
        }
    }

    #[test]
    fn test_control_character_in_path_is_an_error() {
        let mut pod = scrape_pod("ns", "a", "10.0.0.5");
        annotate(&mut pod, annotations::PATH, "/metrics\n");

        assert!(matches!(
            resolve(&pod),
            Err(ResolveError::InvalidPath { .. })
        ));
    }

    #[test]
    fn test_declared_path_is_kept_as_written() {
        let mut pod = scrape_pod("ns", "a", "10.0.0.5");
        annotate(&mut pod, annotations::PATH, "/a/../b/%41?q=%zz#frag");

        let url = resolve(&pod).unwrap().unwrap();
        assert_eq!(url.to_string(), "http://10.0.0.5:9102/a/../b/%41?q=%zz");
    }

    #[test]
    fn test_unsafe_bytes_are_escaped() {
        let mut pod = scrape_pod("ns", "a", "10.0.0.5");
        annotate(&mut pod, annotations::PATH, "/my metrics?name=a b");

        let url = resolve(&pod).unwrap().unwrap();
        assert_eq!(url.to_string(), "http://10.0.0.5:9102/my%20metrics?name=a%20b");
    }
}
