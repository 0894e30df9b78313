//! Node-local discovery through the kubelet
//!
//! Used when the agent only sees its own node. Lists pods from the kubelet's
//! authenticated HTTPS port with a bearer token on a fixed interval and
//! registers the eligible ones.
//!
//! Pods that drop out of the list are not removed here; an entry stays until
//! another backend or a later registration replaces it.

use crate::error::{DiscoveryError, Result};
use crate::filter::{has_required_fields, pod_key, ScopeFilter};
use crate::reconciler::Reconciler;
use k8s_openapi::api::core::v1::Pod;
use log::{debug, error, info, warn};
use reqwest::header::ACCEPT;
use reqwest::{Client, Request, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use url::Url;

pub const KUBELET_PORT: u16 = 10250;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListMeta {
    #[serde(default)]
    resource_version: Option<String>,
    #[serde(default)]
    self_link: Option<String>,
}

/// Body of `GET /pods`
///
/// Items stay raw so a single pod that fails to decode does not sink the list.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodListResponse {
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    api_version: Option<String>,
    #[serde(default)]
    metadata: ListMeta,
    #[serde(default)]
    items: Vec<serde_json::Value>,
}

pub struct KubeletPoller {
    client: Client,
    request: Request,
    interval: Duration,
    filter: ScopeFilter,
    reconciler: Reconciler,
}

impl KubeletPoller {
    /// Poller for the kubelet on `node_ip`
    pub fn new(
        node_ip: &str,
        token: &str,
        interval: Duration,
        filter: ScopeFilter,
        reconciler: Reconciler,
    ) -> Result<Self> {
        Self::with_url(kubelet_url(node_ip)?, token, interval, filter, reconciler)
    }

    /// Poller against an explicit pod list URL
    pub fn with_url(
        url: Url,
        token: &str,
        interval: Duration,
        filter: ScopeFilter,
        reconciler: Reconciler,
    ) -> Result<Self> {
        // Kubelets serve self-signed certificates
        let client = Client::builder()
            .danger_accept_invalid_certs(true)
            .build()?;

        let request = client
            .get(url)
            .bearer_auth(token)
            .header(ACCEPT, "application/json")
            .build()?;

        Ok(Self {
            client,
            request,
            interval,
            filter,
            reconciler,
        })
    }

    pub fn url(&self) -> &Url {
        self.request.url()
    }

    /// List pods once and register every eligible one
    ///
    /// Returns the number of pods registered.
    pub async fn poll_once(&self) -> Result<usize> {
        let request = self
            .request
            .try_clone()
            .ok_or_else(|| DiscoveryError::Config("kubelet request is not reusable".to_string()))?;

        let response = self.client.execute(request).await?;
        if response.status() != StatusCode::OK {
            return Err(DiscoveryError::Status(response.status()));
        }

        let body = response.bytes().await?;
        let list: PodListResponse = serde_json::from_slice(&body)?;
        debug!(
            "kubelet returned {} items (kind={:?}, apiVersion={:?}, resourceVersion={:?}, selfLink={:?})",
            list.items.len(),
            list.kind,
            list.api_version,
            list.metadata.resource_version,
            list.metadata.self_link
        );

        let mut registered = 0;
        for item in list.items {
            let pod: Pod = match serde_json::from_value(item) {
                Ok(pod) => pod,
                Err(e) => {
                    warn!("Skipping pod that failed to decode: {}", e);
                    continue;
                }
            };

            if !has_required_fields(&pod) {
                debug!("{} decoded without required fields, skipping", pod_key(&pod));
                continue;
            }

            if self.filter.is_eligible(&pod) && self.reconciler.register_pod(&pod) {
                registered += 1;
            }
        }

        Ok(registered)
    }

    /// Poll immediately, then every interval, until cancelled
    ///
    /// A failed poll is logged and the next tick tries again.
    pub async fn run(&self, token: &CancellationToken) -> Result<()> {
        info!(
            "Polling kubelet at {} every {:?}",
            self.request.url(),
            self.interval
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("Kubelet polling cancelled");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    match self.poll_once().await {
                        Ok(count) => debug!("Registered {} pods from kubelet", count),
                        Err(e) => error!("Failed to poll kubelet: {}", e),
                    }
                }
            }
        }
    }
}

fn kubelet_url(node_ip: &str) -> Result<Url> {
    let host = if node_ip.contains(':') && !node_ip.starts_with('[') {
        format!("[{}]", node_ip)
    } else {
        node_ip.to_string()
    };

    Url::parse(&format!("https://{}:{}/pods", host, KUBELET_PORT))
        .map_err(|e| DiscoveryError::Config(format!("invalid node ip {:?}: {}", node_ip, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::tests::scrape_pod;
    use crate::registry::TargetRegistry;
    use kubescrape_common::LabelSelector;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TOKEN: &str = "t0k3n";

    fn pod_list(items: Vec<serde_json::Value>) -> serde_json::Value {
        json!({
            "kind": "PodList",
            "apiVersion": "v1",
            "metadata": {"resourceVersion": "", "selfLink": "/api/v1/pods"},
            "items": items,
        })
    }

    fn item(pod: Pod) -> serde_json::Value {
        serde_json::to_value(pod).unwrap()
    }

    fn poller(server: &MockServer, filter: ScopeFilter) -> KubeletPoller {
        let url = Url::parse(&format!("{}/pods", server.uri())).unwrap();
        KubeletPoller::with_url(
            url,
            TOKEN,
            Duration::from_millis(50),
            filter,
            Reconciler::new(TargetRegistry::new()),
        )
        .unwrap()
    }

    #[test]
    fn test_kubelet_url() {
        assert_eq!(
            kubelet_url("10.0.0.7").unwrap().as_str(),
            "https://10.0.0.7:10250/pods"
        );
        assert_eq!(
            kubelet_url("fd00::7").unwrap().as_str(),
            "https://[fd00::7]:10250/pods"
        );
        assert!(kubelet_url("not a host").is_err());
    }

    #[tokio::test]
    async fn test_poll_registers_eligible_pods() {
        let server = MockServer::start().await;

        let mut unready = scrape_pod("ns", "starting", "10.0.0.2");
        unready.status.as_mut().unwrap().container_statuses =
            Some(vec![crate::filter::tests::container_status("main", false)]);

        let body = pod_list(vec![
            item(scrape_pod("ns", "ready", "10.0.0.1")),
            item(unready),
        ]);

        Mock::given(method("GET"))
            .and(path("/pods"))
            .and(header("Authorization", "Bearer t0k3n"))
            .and(header("Accept", "application/json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .expect(1)
            .mount(&server)
            .await;

        let poller = poller(&server, ScopeFilter::default());
        assert_eq!(poller.poll_once().await.unwrap(), 1);

        let keys: Vec<_> = poller.reconciler.registry().snapshot().into_keys().collect();
        assert_eq!(keys, vec!["ns/ready"]);
    }

    #[tokio::test]
    async fn test_poll_applies_selectors() {
        let server = MockServer::start().await;

        let mut web = scrape_pod("ns", "web", "10.0.0.1");
        web.metadata
            .labels
            .as_mut()
            .unwrap()
            .insert("app".to_string(), "web".to_string());
        let other = scrape_pod("ns", "db", "10.0.0.2");
        let elsewhere = scrape_pod("kube-system", "web-2", "10.0.0.3");

        Mock::given(method("GET"))
            .and(path("/pods"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(pod_list(vec![item(web), item(other), item(elsewhere)])),
            )
            .mount(&server)
            .await;

        let filter = ScopeFilter::new(
            Some("ns".to_string()),
            Some(LabelSelector::parse("app=web").unwrap()),
            None,
        );
        let poller = poller(&server, filter);
        poller.poll_once().await.unwrap();

        let keys: Vec<_> = poller.reconciler.registry().snapshot().into_keys().collect();
        assert_eq!(keys, vec!["ns/web"]);
    }

    #[tokio::test]
    async fn test_undecodable_item_is_skipped() {
        let server = MockServer::start().await;

        let mut with_extras = item(scrape_pod("ns", "b", "10.0.0.2"));
        with_extras["unknownField"] = json!({"nested": true});

        let body = pod_list(vec![
            json!({"metadata": "not an object"}),
            with_extras,
        ]);

        Mock::given(method("GET"))
            .and(path("/pods"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&server)
            .await;

        let poller = poller(&server, ScopeFilter::default());
        assert_eq!(poller.poll_once().await.unwrap(), 1);
        assert!(poller.reconciler.registry().contains("ns/b"));
    }

    #[tokio::test]
    async fn test_pod_missing_required_fields_is_skipped() {
        let server = MockServer::start().await;

        let mut pod = scrape_pod("ns", "a", "10.0.0.1");
        pod.metadata.labels = None;

        Mock::given(method("GET"))
            .and(path("/pods"))
            .respond_with(ResponseTemplate::new(200).set_body_json(pod_list(vec![item(pod)])))
            .mount(&server)
            .await;

        let poller = poller(&server, ScopeFilter::default());
        assert_eq!(poller.poll_once().await.unwrap(), 0);
        assert!(poller.reconciler.registry().is_empty());
    }

    #[tokio::test]
    async fn test_non_200_is_an_error() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/pods"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let poller = poller(&server, ScopeFilter::default());
        let err = poller.poll_once().await.unwrap_err();
        assert!(matches!(
            err,
            DiscoveryError::Status(StatusCode::INTERNAL_SERVER_ERROR)
        ));
    }

    #[tokio::test]
    async fn test_failed_poll_does_not_stop_loop() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/pods"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/pods"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(pod_list(vec![item(scrape_pod("ns", "a", "10.0.0.1"))])),
            )
            .mount(&server)
            .await;

        let poller = std::sync::Arc::new(poller(&server, ScopeFilter::default()));
        let token = CancellationToken::new();

        let handle = {
            let poller = poller.clone();
            let token = token.clone();
            tokio::spawn(async move { poller.run(&token).await })
        };

        let registered = tokio::time::timeout(Duration::from_secs(5), async {
            while !poller.reconciler.registry().contains("ns/a") {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(registered.is_ok(), "second poll should register the pod");

        token.cancel();
        handle.await.unwrap().unwrap();
    }
}
