//! Scrape target discovery for kubescrape
//!
//! Keeps a [`TargetRegistry`] of pod metrics endpoints in sync with the
//! cluster. One of three backends drives it:
//! - an informer with a deduplicating work queue (default)
//! - a direct watch on the pod API
//! - polling the local kubelet (node scrape scope)

pub mod config;
pub mod discovery;
pub mod error;
pub mod filter;
pub mod informer;
pub mod kube_client;
pub mod kubelet;
pub mod queue;
pub mod reconciler;
pub mod registry;
pub mod resolver;
pub mod watch;

pub use config::{DiscoveryConfig, WatchMode};
pub use discovery::{Discovery, DiscoveryStrategy};
pub use error::{DiscoveryError, ResolveError, Result};
pub use filter::ScopeFilter;
pub use reconciler::Reconciler;
pub use registry::{ScrapeTarget, TargetRegistry};
pub use resolver::{resolve, AddressRewriter, HostAddressRewriter};
