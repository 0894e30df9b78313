//! Discovery configuration
//!
//! The same struct is read from YAML by the agent binary and assembled from
//! flags by the `kubescrape` CLI.

use crate::error::{DiscoveryError, Result};
use crate::filter::ScopeFilter;
use kubescrape_common::{FieldSelector, LabelSelector};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Interval between kubelet pod list requests when none is configured
pub const DEFAULT_POD_SCRAPE_INTERVAL: Duration = Duration::from_secs(60);

/// Environment variable consulted for the node address in node scrape scope
pub const NODE_IP_ENV: &str = "NODE_IP";

/// Which cluster-wide strategy drives the reconciler
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchMode {
    /// Cached reflector feeding a deduplicating work queue
    #[default]
    Informer,
    /// A single raw watch request
    Direct,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Path to a kubeconfig file. Unset uses in-cluster credentials,
    /// falling back to the default kubeconfig location.
    pub kube_config: Option<PathBuf>,
    /// Only discover pods in this namespace
    pub namespace: Option<String>,
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
    /// Poll the local kubelet instead of watching the API server
    pub node_scrape_scope: bool,
    pub node_ip: Option<String>,
    /// Seconds between kubelet polls, 0 means the default
    pub pod_scrape_interval: u64,
    pub watch_mode: WatchMode,
    /// Token presented to the kubelet
    pub bearer_token_file: Option<PathBuf>,
}

impl DiscoveryConfig {
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&raw)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        serde_yaml::from_str(raw)
            .map_err(|e| DiscoveryError::Config(format!("invalid discovery config: {}", e)))
    }

    pub fn namespace(&self) -> Option<&str> {
        non_empty(self.namespace.as_deref())
    }

    pub fn label_selector(&self) -> Option<&str> {
        non_empty(self.label_selector.as_deref())
    }

    pub fn field_selector(&self) -> Option<&str> {
        non_empty(self.field_selector.as_deref())
    }

    pub fn poll_interval(&self) -> Duration {
        if self.pod_scrape_interval == 0 {
            DEFAULT_POD_SCRAPE_INTERVAL
        } else {
            Duration::from_secs(self.pod_scrape_interval)
        }
    }

    /// Node address used in node scrape scope, taken from the environment
    /// when not configured
    pub fn node_ip(&self) -> Option<String> {
        non_empty(self.node_ip.as_deref())
            .map(str::to_string)
            .or_else(|| {
                std::env::var(NODE_IP_ENV)
                    .ok()
                    .filter(|ip| !ip.trim().is_empty())
            })
    }

    /// Parse the configured selectors into a filter
    pub fn scope_filter(&self) -> Result<ScopeFilter> {
        let labels = self.label_selector().map(LabelSelector::parse).transpose()?;
        let fields = self.field_selector().map(FieldSelector::parse).transpose()?;

        Ok(ScopeFilter::new(
            self.namespace().map(str::to_string),
            labels,
            fields,
        ))
    }

    /// Check everything that can be checked without talking to the cluster
    pub fn validate(&self) -> Result<()> {
        self.scope_filter()?;

        if self.node_scrape_scope && self.node_ip().is_none() {
            return Err(DiscoveryError::Config(format!(
                "node scrape scope requires node_ip or the {} environment variable",
                NODE_IP_ENV
            )));
        }

        Ok(())
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
