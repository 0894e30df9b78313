//! Pod eligibility checks
//!
//! A pod is registered only when it opts in through the scrape annotation, all
//! of its containers are ready and it falls inside the configured scope.

use k8s_openapi::api::core::v1::Pod;
use kubescrape_common::{annotations, FieldSelector, LabelSelector};
use std::collections::BTreeMap;

/// Registry key of a pod, `<namespace>/<name>`
pub fn pod_key(pod: &Pod) -> String {
    format!(
        "{}/{}",
        pod.metadata.namespace.as_deref().unwrap_or_default(),
        pod.metadata.name.as_deref().unwrap_or_default()
    )
}

/// The scrape annotation must be exactly `"true"`
pub fn has_scrape_annotation(pod: &Pod) -> bool {
    pod.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(annotations::SCRAPE))
        .is_some_and(|v| v == "true")
}

/// Ready means at least one container status and every one of them ready
pub fn is_ready(pod: &Pod) -> bool {
    let statuses = pod
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.as_deref())
        .unwrap_or_default();

    !statuses.is_empty() && statuses.iter().all(|cs| cs.ready)
}

/// Guards against kubelet responses that decoded with holes in them
pub fn has_required_fields(pod: &Pod) -> bool {
    pod.metadata.annotations.is_some()
        && pod.metadata.labels.is_some()
        && pod
            .status
            .as_ref()
            .is_some_and(|s| s.container_statuses.is_some())
}

/// Field set a field selector is evaluated against
///
/// Covers every pod field the API server accepts in a field selector, so a
/// selector that filtered the watch also matches the cached objects.
pub fn pod_fields(pod: &Pod) -> BTreeMap<String, String> {
    let spec = pod.spec.as_ref();
    let status = pod.status.as_ref();

    let host_network = spec.and_then(|s| s.host_network).unwrap_or(false);

    let pairs = [
        ("metadata.name", pod.metadata.name.clone()),
        ("metadata.namespace", pod.metadata.namespace.clone()),
        ("spec.hostNetwork", Some(host_network.to_string())),
        ("spec.nodeName", spec.and_then(|s| s.node_name.clone())),
        ("spec.restartPolicy", spec.and_then(|s| s.restart_policy.clone())),
        ("spec.schedulerName", spec.and_then(|s| s.scheduler_name.clone())),
        (
            "spec.serviceAccountName",
            spec.and_then(|s| s.service_account_name.clone()),
        ),
        ("status.phase", status.and_then(|s| s.phase.clone())),
        ("status.podIP", status.and_then(|s| s.pod_ip.clone())),
        (
            "status.nominatedNodeName",
            status.and_then(|s| s.nominated_node_name.clone()),
        ),
    ];

    pairs
        .into_iter()
        .map(|(field, value)| (field.to_string(), value.unwrap_or_default()))
        .collect()
}

/// Namespace and selector scope of a discovery run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeFilter {
    namespace: Option<String>,
    labels: Option<LabelSelector>,
    fields: Option<FieldSelector>,
}

impl ScopeFilter {
    pub fn new(
        namespace: Option<String>,
        labels: Option<LabelSelector>,
        fields: Option<FieldSelector>,
    ) -> Self {
        Self {
            namespace,
            labels,
            fields,
        }
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn label_selector(&self) -> Option<&LabelSelector> {
        self.labels.as_ref()
    }

    pub fn field_selector(&self) -> Option<&FieldSelector> {
        self.fields.as_ref()
    }

    pub fn matches_namespace(&self, pod: &Pod) -> bool {
        match &self.namespace {
            Some(ns) => pod.metadata.namespace.as_deref() == Some(ns.as_str()),
            None => true,
        }
    }

    pub fn matches_labels(&self, pod: &Pod) -> bool {
        let Some(selector) = &self.labels else {
            return true;
        };
        let empty = BTreeMap::new();
        selector.matches(pod.metadata.labels.as_ref().unwrap_or(&empty))
    }

    pub fn matches_fields(&self, pod: &Pod) -> bool {
        match &self.fields {
            Some(selector) => selector.matches(&pod_fields(pod)),
            None => true,
        }
    }

    pub fn matches(&self, pod: &Pod) -> bool {
        self.matches_namespace(pod) && self.matches_labels(pod) && self.matches_fields(pod)
    }

    /// Opt-in, readiness and scope all hold
    pub fn is_eligible(&self, pod: &Pod) -> bool {
        has_scrape_annotation(pod) && is_ready(pod) && self.matches(pod)
    }
}
