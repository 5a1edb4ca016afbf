//! Plugin registry
//!
//! Holds the ordered plugin list. Insertion order is the evaluation order;
//! plugins may be added concurrently with matching, and matchers operate on
//! a consistent snapshot taken at entry.

use std::sync::Arc;

use http::header::HOST;
use parking_lot::RwLock;

use crate::matcher;
use crate::plugin::rule::Plugin;

#[derive(Debug, Default)]
pub struct PluginRegistry {
    plugins: RwLock<Vec<Arc<Plugin>>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a plugin. Existing matchers keep their snapshot; the new
    /// plugin applies to subsequent exchanges.
    pub fn add(&self, plugin: Plugin) {
        self.plugins.write().push(Arc::new(plugin));
    }

    pub fn len(&self) -> usize {
        self.plugins.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.read().is_empty()
    }

    fn snapshot(&self) -> Vec<Arc<Plugin>> {
        self.plugins.read().clone()
    }

    /// First plugin whose pattern matches `hostname`, in insertion order.
    pub fn match_first(&self, hostname: &str) -> Option<Arc<Plugin>> {
        self.snapshot()
            .into_iter()
            .find(|p| matcher::is_match(hostname, &p.pattern))
    }

    /// All plugins whose pattern matches `hostname`, in insertion order.
    pub fn match_for_host(&self, hostname: &str) -> Vec<Arc<Plugin>> {
        self.snapshot()
            .into_iter()
            .filter(|p| matcher::is_match(hostname, &p.pattern))
            .collect()
    }

    /// All plugins matching a request, in insertion order.
    ///
    /// URL-shaped patterns are tested against the full request URL
    /// (`scheme://host/path[?query]`, scheme defaulting to `http` and host
    /// falling back to the `Host` header); host-shaped patterns are tested
    /// against the port-stripped hostname.
    pub fn match_for_request(&self, parts: &http::request::Parts) -> Vec<Arc<Plugin>> {
        let (full_url, hostname) = request_match_inputs(parts);

        self.snapshot()
            .into_iter()
            .filter(|p| {
                if matcher::is_url_pattern(&p.pattern) {
                    matcher::is_match(&full_url, &p.pattern)
                } else {
                    matcher::is_match(&hostname, &p.pattern)
                }
            })
            .collect()
    }
}

/// Derive the (full URL, bare hostname) pair a request is matched on.
fn request_match_inputs(parts: &http::request::Parts) -> (String, String) {
    let uri = &parts.uri;
    let scheme = uri.scheme_str().unwrap_or("http");

    let host_header = parts
        .headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let authority = uri
        .authority()
        .map(|a| a.as_str())
        .filter(|a| !a.is_empty())
        .unwrap_or(host_header);

    let path = uri.path();
    let mut full_url = format!("{scheme}://{authority}{path}");
    if let Some(query) = uri.query() {
        full_url.push('?');
        full_url.push_str(query);
    }

    let hostname = uri
        .host()
        .map(str::to_owned)
        .unwrap_or_else(|| strip_port(host_header).to_owned());

    (full_url, hostname)
}

/// Drop a trailing `:port` from a `host[:port]` string, keeping IPv6
/// forms intact.
pub(crate) fn strip_port(host: &str) -> &str {
    if let Some(stripped) = host.strip_prefix('[') {
        return stripped.split(']').next().unwrap_or(host);
    }
    match host.rsplit_once(':') {
        Some((name, port))
            if !name.contains(':') && !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) =>
        {
            name
        }
        _ => host,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn parts(uri: &str, host_header: Option<&str>) -> http::request::Parts {
        let mut builder = http::Request::builder().uri(uri);
        if let Some(host) = host_header {
            builder = builder.header(HOST, host);
        }
        let (parts, _) = builder.body(()).unwrap().into_parts();
        parts
    }

    #[test]
    fn strip_port_variants() {
        assert_eq!(strip_port("example.com:443"), "example.com");
        assert_eq!(strip_port("example.com"), "example.com");
        assert_eq!(strip_port("[::1]:443"), "::1");
        assert_eq!(strip_port("::1"), "::1");
    }

    #[test]
    fn match_for_host_preserves_insertion_order() {
        let registry = PluginRegistry::new();
        registry.add(Plugin::new("*.example.com"));
        registry.add(Plugin::new("other.com"));
        registry.add(Plugin::new("example"));

        let matches = registry.match_for_host("api.example.com");
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].pattern, "*.example.com");
        assert_eq!(matches[1].pattern, "example");

        let first = registry.match_first("api.example.com").unwrap();
        assert_eq!(first.pattern, "*.example.com");
    }

    #[test]
    fn url_patterns_match_full_url_and_host_patterns_match_hostname() {
        let registry = PluginRegistry::new();
        registry.add(Plugin::new("https://api.example.com/index.html"));
        registry.add(Plugin::new("api.example.com"));
        registry.add(Plugin::new("https://*.example.com/*"));

        let req_parts = parts("https://api.example.com/index.html", None);
        let matches = registry.match_for_request(&req_parts);
        assert_eq!(matches.len(), 3);

        let req_parts = parts("https://api.example.com/other", None);
        let matches = registry.match_for_request(&req_parts);
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].pattern, "api.example.com");
    }

    #[test]
    fn relative_uri_falls_back_to_host_header() {
        let registry = PluginRegistry::new();
        registry.add(Plugin::new("http://site.local/*"));
        registry.add(Plugin::new("site.local"));

        let parts = parts("/index.html?q=1", Some("site.local"));
        let matches = registry.match_for_request(&parts);
        assert_eq!(matches.len(), 2, "url pattern should see host header authority");
    }

    #[test]
    fn query_is_part_of_the_full_url() {
        let registry = PluginRegistry::new();
        registry.add(Plugin::new("https://api.example.com/search?q=*"));

        let hit = parts("https://api.example.com/search?q=cats", None);
        assert_eq!(registry.match_for_request(&hit).len(), 1);

        let miss = parts("https://api.example.com/search", None);
        assert!(registry.match_for_request(&miss).is_empty());
    }

    #[test]
    fn concurrent_adds_and_matches() {
        let registry = Arc::new(PluginRegistry::new());
        let matched = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..8 {
            let registry = Arc::clone(&registry);
            handles.push(std::thread::spawn(move || {
                registry.add(Plugin::new(format!("host-{i}.example.com")));
            }));
        }
        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            let matched = Arc::clone(&matched);
            handles.push(std::thread::spawn(move || {
                matched.fetch_add(
                    registry.match_for_host("host-0.example.com").len(),
                    Ordering::SeqCst,
                );
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.len(), 8);
        assert_eq!(registry.match_for_host("host-3.example.com").len(), 1);
    }
}
