//! Direct watch discovery
//!
//! Opens one watch request for the configured scope and reconciles every
//! event as it arrives. Simpler than the informer but processes each event in
//! turn instead of collapsing bursts.

use crate::error::{DiscoveryError, Result};
use crate::filter::{has_scrape_annotation, pod_key, ScopeFilter};
use crate::kube_client::pod_api;
use crate::reconciler::Reconciler;
use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{WatchEvent, WatchParams};
use kube::{Api, Client};
use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;

pub struct WatchDiscovery {
    api: Api<Pod>,
    filter: ScopeFilter,
    reconciler: Reconciler,
}

impl WatchDiscovery {
    pub fn new(client: Client, filter: ScopeFilter, reconciler: Reconciler) -> Self {
        Self {
            api: pod_api(client, filter.namespace()),
            filter,
            reconciler,
        }
    }

    fn watch_params(&self) -> WatchParams {
        let mut params = WatchParams::default();
        if let Some(labels) = self.filter.label_selector() {
            params = params.labels(labels.as_str());
        }
        if let Some(fields) = self.filter.field_selector() {
            params = params.fields(fields.as_str());
        }
        params
    }

    /// Watch until cancelled or the server closes the stream
    pub async fn run(&self, token: &CancellationToken) -> Result<()> {
        info!("Starting pod watch");

        let stream = self.api.watch(&self.watch_params(), "0").await.map_err(|e| {
            debug!("Pod watch request failed: {}", e);
            DiscoveryError::Kube(e)
        })?;

        consume_events(stream, &self.reconciler, token).await
    }
}

/// Apply one watch event to the registry
///
/// Pods are unregistered on the first event of their delete sequence, while
/// their containers may still report ready.
pub fn handle_event(event: WatchEvent<Pod>, reconciler: &Reconciler) -> Result<()> {
    let (pod, deleted) = match event {
        WatchEvent::Added(pod) => (pod, false),
        WatchEvent::Modified(pod) => {
            let terminating = pod.metadata.deletion_timestamp.is_some();
            (pod, terminating)
        }
        WatchEvent::Deleted(pod) => (pod, true),
        WatchEvent::Bookmark(_) => return Ok(()),
        WatchEvent::Error(e) => {
            return Err(DiscoveryError::Watch(format!(
                "watch returned error {}: {}",
                e.code, e.message
            )))
        }
    };

    if !has_scrape_annotation(&pod) {
        debug!(
            "{} has no scrape annotation, skipping",
            pod_key(&pod)
        );
        return Ok(());
    }

    if deleted {
        reconciler.unregister_pod(&pod);
    } else {
        reconciler.register_pod(&pod);
    }

    Ok(())
}

/// Drain a watch stream into the reconciler
///
/// Returns `Ok` when cancelled or when the stream runs dry; the caller opens a
/// new watch in the latter case.
pub async fn consume_events<S>(
    stream: S,
    reconciler: &Reconciler,
    token: &CancellationToken,
) -> Result<()>
where
    S: Stream<Item = kube::Result<WatchEvent<Pod>>>,
{
    let mut stream = std::pin::pin!(stream);

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!("Pod watch cancelled");
                return Ok(());
            }
            event = stream.next() => match event {
                Some(Ok(event)) => handle_event(event, reconciler)?,
                Some(Err(e)) => return Err(DiscoveryError::Kube(e)),
                None => {
                    warn!("Pod watch stream ended");
                    return Ok(());
                }
            }
        }
    }
}
