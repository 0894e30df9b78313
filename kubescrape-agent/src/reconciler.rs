//! Registry mutation
//!
//! `register_pod` and `unregister_pod` are the only writers of the
//! [`TargetRegistry`]. Both run entirely under the registry lock and are
//! idempotent, so any backend may replay the same pod state as often as it
//! likes.

use crate::filter::{has_scrape_annotation, pod_key};
use crate::registry::{ScrapeTarget, TargetRegistry};
use crate::resolver::{resolve, AddressRewriter, HostAddressRewriter};
use k8s_openapi::api::core::v1::Pod;
use kubescrape_common::tags;
use log::{debug, error};
use std::sync::Arc;
use http::Uri;

#[derive(Clone)]
pub struct Reconciler {
    registry: TargetRegistry,
    rewriter: Arc<dyn AddressRewriter>,
}

impl Reconciler {
    pub fn new(registry: TargetRegistry) -> Self {
        Self::with_rewriter(registry, Arc::new(HostAddressRewriter))
    }

    pub fn with_rewriter(registry: TargetRegistry, rewriter: Arc<dyn AddressRewriter>) -> Self {
        Self { registry, rewriter }
    }

    /// Read access for the scraping side
    pub fn registry(&self) -> &TargetRegistry {
        &self.registry
    }

    /// Insert or fully replace the target for a pod
    ///
    /// Returns whether an entry was written. Pods without the scrape
    /// annotation or without an IP are skipped.
    pub fn register_pod(&self, pod: &Pod) -> bool {
        let key = pod_key(pod);

        if !has_scrape_annotation(pod) {
            debug!("{} has no scrape annotation, not registering", key);
            return false;
        }

        self.registry.with_targets(|targets| {
            debug!("Registering {}", key);

            let url = match resolve(pod) {
                Ok(Some(url)) => url,
                Ok(None) => {
                    debug!("{} has no address yet, skipping", key);
                    return false;
                }
                Err(e) => {
                    error!("{}", e);
                    return false;
                }
            };

            debug!("{} resolved to {}", key, url);

            let address = bare_host(&url);
            let target = ScrapeTarget {
                url: self.rewriter.rewrite(&url, &address),
                address,
                original_url: url,
                tags: pod_tags(pod),
            };

            targets.insert(key, target);
            true
        })
    }

    /// Remove the target for a pod, if any
    ///
    /// Returns whether an entry was removed. A pod without the scrape
    /// annotation was never registered and is ignored.
    pub fn unregister_pod(&self, pod: &Pod) -> bool {
        let key = pod_key(pod);

        if !has_scrape_annotation(pod) {
            debug!("{} has no scrape annotation, nothing to unregister", key);
            return false;
        }

        debug!("Unregistering {}", key);

        self.registry.with_targets(|targets| match targets.remove(&key) {
            Some(target) => {
                debug!("Removed target {}", target.url);
                true
            }
            None => false,
        })
    }
}

/// Host of the URI without IPv6 brackets
fn bare_host(uri: &Uri) -> String {
    uri.host()
        .unwrap_or_default()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string()
}

/// Annotations, then `pod_name`/`pod_namespace`, then labels
///
/// Labels are applied last and may overwrite the synthesized pod tags.
fn pod_tags(pod: &Pod) -> std::collections::BTreeMap<String, String> {
    let mut tags = pod.metadata.annotations.clone().unwrap_or_default();

    tags.insert(
        tags::POD_NAME.to_string(),
        pod.metadata.name.clone().unwrap_or_default(),
    );
    tags.insert(
        tags::POD_NAMESPACE.to_string(),
        pod.metadata.namespace.clone().unwrap_or_default(),
    );

    if let Some(labels) = &pod.metadata.labels {
        tags.extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));
    }

    tags
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::tests::scrape_pod;
    use kubescrape_common::annotations;

    fn reconciler() -> Reconciler {
        Reconciler::new(TargetRegistry::new())
    }

    #[test]
    fn test_register_with_defaults() {
        let reconciler = reconciler();
        let pod = scrape_pod("ns", "a", "10.0.0.5");

        assert!(reconciler.register_pod(&pod));

        let target = reconciler.registry().get("ns/a").expect("registered");
        assert_eq!(target.url.to_string(), "http://10.0.0.5:9102/metrics");
        assert_eq!(target.original_url, target.url);
        assert_eq!(target.address, "10.0.0.5");
        assert_eq!(target.tags["pod_name"], "a");
        assert_eq!(target.tags["pod_namespace"], "ns");
        assert_eq!(target.tags[annotations::SCRAPE], "true");
    }

    #[test]
    fn test_register_is_idempotent() {
        let reconciler = reconciler();
        let pod = scrape_pod("ns", "a", "10.0.0.5");

        reconciler.register_pod(&pod);
        let first = reconciler.registry().get("ns/a");
        reconciler.register_pod(&pod);
        let second = reconciler.registry().get("ns/a");

        assert_eq!(first, second);
        assert_eq!(reconciler.registry().len(), 1);
    }

    #[test]
    fn test_update_replaces_entry() {
        let reconciler = reconciler();
        let mut pod = scrape_pod("ns", "a", "10.0.0.5");
        pod.metadata
            .annotations
            .as_mut()
            .unwrap()
            .insert("team".to_string(), "infra".to_string());
        reconciler.register_pod(&pod);

        let mut updated = scrape_pod("ns", "a", "10.0.0.9");
        updated
            .metadata
            .annotations
            .as_mut()
            .unwrap()
            .insert(annotations::PORT.to_string(), "8080".to_string());
        reconciler.register_pod(&updated);

        let target = reconciler.registry().get("ns/a").unwrap();
        assert_eq!(target.url.to_string(), "http://10.0.0.9:8080/metrics");
        assert!(!target.tags.contains_key("team"));
    }

    #[test]
    fn test_pod_without_address_is_skipped() {
        let reconciler = reconciler();
        assert!(!reconciler.register_pod(&scrape_pod("ns", "a", "")));
        assert!(reconciler.registry().is_empty());
    }

    #[test]
    fn test_pod_without_annotation_is_skipped() {
        let reconciler = reconciler();
        let mut pod = scrape_pod("ns", "a", "10.0.0.5");
        pod.metadata.annotations = None;

        assert!(!reconciler.register_pod(&pod));
        assert!(reconciler.registry().is_empty());
        assert!(!reconciler.unregister_pod(&pod));
    }

    #[test]
    fn test_unparsable_endpoint_is_skipped() {
        let reconciler = reconciler();
        let mut pod = scrape_pod("ns", "a", "10.0.0.5");
        pod.metadata
            .annotations
            .as_mut()
            .unwrap()
            .insert(annotations::PORT.to_string(), "not-a-port".to_string());

        assert!(!reconciler.register_pod(&pod));
        assert!(reconciler.registry().is_empty());
    }

    #[test]
    fn test_unregister_removes_only_that_key() {
        let reconciler = reconciler();
        let a = scrape_pod("ns", "a", "10.0.0.5");
        let b = scrape_pod("ns", "b", "10.0.0.6");
        reconciler.register_pod(&a);
        reconciler.register_pod(&b);

        assert!(reconciler.unregister_pod(&a));
        assert!(reconciler.registry().get("ns/a").is_none());
        assert!(reconciler.registry().get("ns/b").is_some());

        // Already gone
        assert!(!reconciler.unregister_pod(&a));
        assert_eq!(reconciler.registry().len(), 1);
    }

    #[test]
    fn test_labels_overwrite_synthesized_tags() {
        let reconciler = reconciler();
        let mut pod = scrape_pod("ns", "a", "10.0.0.5");
        let labels = pod.metadata.labels.as_mut().unwrap();
        labels.insert("pod_name".to_string(), "from-label".to_string());
        labels.insert("app".to_string(), "web".to_string());

        reconciler.register_pod(&pod);

        let target = reconciler.registry().get("ns/a").unwrap();
        assert_eq!(target.tags["pod_name"], "from-label");
        assert_eq!(target.tags["pod_namespace"], "ns");
        assert_eq!(target.tags["app"], "web");
    }

    #[test]
    fn test_custom_rewriter() {
        struct ProxyRewriter;

        impl AddressRewriter for ProxyRewriter {
            fn rewrite(&self, uri: &Uri, address: &str) -> Uri {
                format!(
                    "http://proxy.local:3128/?target={}&path={}",
                    address,
                    uri.path()
                )
                .parse()
                .unwrap()
            }
        }

        let reconciler = Reconciler::with_rewriter(TargetRegistry::new(), Arc::new(ProxyRewriter));
        reconciler.register_pod(&scrape_pod("ns", "a", "10.0.0.5"));

        let target = reconciler.registry().get("ns/a").unwrap();
        assert_eq!(
            target.url.to_string(),
            "http://proxy.local:3128/?target=10.0.0.5&path=/metrics"
        );
        assert_eq!(
            target.original_url.to_string(),
            "http://10.0.0.5:9102/metrics"
        );
    }

    #[test]
    fn test_ipv6_address_is_bare() {
        let reconciler = reconciler();
        reconciler.register_pod(&scrape_pod("ns", "a", "fd00::5"));

        let target = reconciler.registry().get("ns/a").unwrap();
        assert_eq!(target.address, "fd00::5");
        assert_eq!(target.url.to_string(), "http://[fd00::5]:9102/metrics");
    }
}
