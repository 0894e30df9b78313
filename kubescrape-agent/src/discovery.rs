//! Discovery mode selection and lifecycle
//!
//! Picks one backend from the configuration and keeps it running until
//! cancelled, starting it again after any failure.

use crate::config::{DiscoveryConfig, WatchMode};
use crate::error::{DiscoveryError, Result};
use crate::filter::ScopeFilter;
use crate::informer::InformerDiscovery;
use crate::kube_client::{bearer_token, init_client, load_config};
use crate::kubelet::KubeletPoller;
use crate::reconciler::Reconciler;
use crate::registry::TargetRegistry;
use crate::watch::WatchDiscovery;
use log::{error, info, warn};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Delay before the next backend start
///
/// Failures double the delay up to the cap. A clean stop waits the initial
/// delay and starts the sequence over.
#[derive(Debug)]
struct RestartBackoff {
    next: Duration,
}

impl RestartBackoff {
    fn new() -> Self {
        Self {
            next: INITIAL_BACKOFF,
        }
    }

    fn after_stop(&mut self) -> Duration {
        self.next = INITIAL_BACKOFF;
        INITIAL_BACKOFF
    }

    fn after_failure(&mut self) -> Duration {
        let delay = self.next;
        self.next = std::cmp::min(delay * 2, MAX_BACKOFF);
        delay
    }
}

/// A started backend
pub enum DiscoveryStrategy {
    Informer(InformerDiscovery),
    Watch(WatchDiscovery),
    NodePoll(KubeletPoller),
}

impl DiscoveryStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            DiscoveryStrategy::Informer(_) => "informer",
            DiscoveryStrategy::Watch(_) => "watch",
            DiscoveryStrategy::NodePoll(_) => "kubelet",
        }
    }

    pub async fn run(&self, token: &CancellationToken) -> Result<()> {
        match self {
            DiscoveryStrategy::Informer(informer) => informer.run(token).await,
            DiscoveryStrategy::Watch(watch) => watch.run(token).await,
            DiscoveryStrategy::NodePoll(poller) => poller.run(token).await,
        }
    }
}

pub struct Discovery {
    config: DiscoveryConfig,
    filter: ScopeFilter,
    reconciler: Reconciler,
}

impl Discovery {
    /// Validate the configuration
    ///
    /// Selector and node address problems are reported here, before anything
    /// talks to the cluster.
    pub fn new(config: DiscoveryConfig, reconciler: Reconciler) -> Result<Self> {
        config.validate()?;
        let filter = config.scope_filter()?;

        Ok(Self {
            config,
            filter,
            reconciler,
        })
    }

    pub fn registry(&self) -> &TargetRegistry {
        self.reconciler.registry()
    }

    /// Build the configured backend
    ///
    /// Credentials are loaded on every start so a rotated token or a fixed
    /// kubeconfig is picked up on restart.
    pub async fn start_strategy(&self) -> Result<DiscoveryStrategy> {
        let client_config = load_config(self.config.kube_config.as_deref()).await?;

        if self.config.node_scrape_scope {
            let node_ip = self.config.node_ip().ok_or_else(|| {
                DiscoveryError::Config("node scrape scope requires a node ip".to_string())
            })?;
            let token =
                bearer_token(&client_config, self.config.bearer_token_file.as_deref()).await?;

            let poller = KubeletPoller::new(
                &node_ip,
                &token,
                self.config.poll_interval(),
                self.filter.clone(),
                self.reconciler.clone(),
            )?;
            return Ok(DiscoveryStrategy::NodePoll(poller));
        }

        let client = init_client(client_config).await?;
        let strategy = match self.config.watch_mode {
            WatchMode::Informer => DiscoveryStrategy::Informer(InformerDiscovery::new(
                client,
                self.filter.clone(),
                self.reconciler.clone(),
            )),
            WatchMode::Direct => DiscoveryStrategy::Watch(WatchDiscovery::new(
                client,
                self.filter.clone(),
                self.reconciler.clone(),
            )),
        };

        Ok(strategy)
    }

    /// Run discovery until `token` is cancelled
    pub async fn run(&self, token: CancellationToken) {
        let mut backoff = RestartBackoff::new();

        while !token.is_cancelled() {
            let outcome = match self.start_strategy().await {
                Ok(strategy) => {
                    info!("Starting {} discovery", strategy.name());
                    strategy.run(&token).await
                }
                Err(e) => Err(e),
            };

            if token.is_cancelled() {
                break;
            }

            let delay = match outcome {
                Ok(()) => {
                    warn!("Discovery stopped, restarting...");
                    backoff.after_stop()
                }
                Err(e) => {
                    let delay = backoff.after_failure();
                    error!("Discovery failed: {}, restarting in {:?}", e, delay);
                    delay
                }
            };

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!("Discovery shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reconciler() -> Reconciler {
        Reconciler::new(TargetRegistry::new())
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let mut backoff = RestartBackoff::new();
        let delays: Vec<u64> = (0..7).map(|_| backoff.after_failure().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn test_failure_after_clean_stop_waits_initial_delay() {
        let mut backoff = RestartBackoff::new();
        backoff.after_failure();
        backoff.after_failure();
        backoff.after_failure();

        assert_eq!(backoff.after_stop(), INITIAL_BACKOFF);
        assert_eq!(backoff.after_failure(), INITIAL_BACKOFF);
        assert_eq!(backoff.after_failure(), Duration::from_secs(2));
    }

    #[test]
    fn test_bad_selector_is_rejected_up_front() {
        let config = DiscoveryConfig {
            label_selector: Some("app in ()".to_string()),
            ..Default::default()
        };

        let err = Discovery::new(config, reconciler()).err().unwrap();
        assert!(matches!(err, DiscoveryError::Selector(_)));
    }

    #[test]
    fn test_node_scope_requires_address() {
        let config = DiscoveryConfig {
            node_scrape_scope: true,
            node_ip: Some("10.1.2.3".to_string()),
            ..Default::default()
        };
        assert!(Discovery::new(config, reconciler()).is_ok());
    }

    #[tokio::test]
    async fn test_start_strategy_surfaces_config_errors() {
        let dir = tempfile::tempdir().unwrap();
        let kubeconfig = dir.path().join("kubeconfig");
        std::fs::write(&kubeconfig, "this: [is not a kubeconfig").unwrap();

        let config = DiscoveryConfig {
            kube_config: Some(kubeconfig),
            ..Default::default()
        };
        let discovery = Discovery::new(config, reconciler()).unwrap();

        assert!(discovery.start_strategy().await.is_err());
    }

    #[tokio::test]
    async fn test_node_scope_selects_kubelet_poller() {
        let dir = tempfile::tempdir().unwrap();
        let kubeconfig = dir.path().join("kubeconfig");
        let token = dir.path().join("token");
        std::fs::write(&token, "abc\n").unwrap();
        std::fs::write(
            &kubeconfig,
            r#"
apiVersion: v1
kind: Config
clusters:
- name: test
  cluster:
    server: https://127.0.0.1:6443
contexts:
- name: test
  context:
    cluster: test
    user: test
current-context: test
users:
- name: test
  user: {}
"#,
        )
        .unwrap();

        let config = DiscoveryConfig {
            kube_config: Some(kubeconfig),
            node_scrape_scope: true,
            node_ip: Some("10.1.2.3".to_string()),
            bearer_token_file: Some(token),
            ..Default::default()
        };
        let discovery = Discovery::new(config, reconciler()).unwrap();

        match discovery.start_strategy().await.unwrap() {
            DiscoveryStrategy::NodePoll(poller) => {
                assert_eq!(poller.url().as_str(), "https://10.1.2.3:10250/pods")
            }
            other => panic!("expected kubelet poller, got {}", other.name()),
        }
    }

    #[tokio::test]
    async fn test_run_returns_once_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let kubeconfig = dir.path().join("missing");

        let config = DiscoveryConfig {
            kube_config: Some(kubeconfig),
            ..Default::default()
        };
        let discovery = Discovery::new(config, reconciler()).unwrap();
        let token = CancellationToken::new();

        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        tokio::time::timeout(Duration::from_secs(5), discovery.run(token))
            .await
            .expect("discovery stopped after cancellation");
    }
}
