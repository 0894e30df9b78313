//! Cache-backed pod discovery
//!
//! A reflector keeps a local mirror of the pods matching the configured scope.
//! Its events only enqueue pod keys; a single consumer task pulls keys off the
//! [`WorkQueue`] and reconciles against the cached object, so the registry
//! always sees the latest known state of a pod rather than every intermediate
//! one.
//!
//! Pod IPs are reused. If the delete for an old pod arrives after its IP went
//! to a new pod without the scrape annotation, the old target points at the
//! new pod until the next event for either of them.

use crate::error::{DiscoveryError, Result};
use crate::filter::{has_scrape_annotation, is_ready, pod_key, ScopeFilter};
use crate::kube_client::pod_api;
use crate::queue::WorkQueue;
use crate::reconciler::Reconciler;
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::watcher::{self, watcher, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;

/// How often every cached pod is replayed through the event handlers
pub const RESYNC_PERIOD: Duration = Duration::from_secs(15 * 60);

pub type PodEventStream = BoxStream<'static, watcher::Result<Event<Pod>>>;

/// Reacts to reflector events
///
/// Applies are enqueued only for pods that already opt in and are ready, which
/// keeps churn from not-yet-ready pods out of the queue. Deletes bypass the
/// queue.
#[derive(Clone)]
pub struct EventHandlers {
    queue: Arc<WorkQueue>,
    reconciler: Reconciler,
}

impl EventHandlers {
    pub fn new(queue: Arc<WorkQueue>, reconciler: Reconciler) -> Self {
        Self { queue, reconciler }
    }

    pub fn handle(&self, event: &Event<Pod>) {
        match event {
            Event::Apply(pod) | Event::InitApply(pod) => {
                self.on_apply(pod);
            }
            Event::Delete(pod) => {
                self.on_delete(pod);
            }
            Event::Init => {
                debug!("Pod informer listing started");
            }
            Event::InitDone => {
                debug!("Pod informer listing complete");
            }
        }
    }

    /// Returns whether the pod's key was newly queued
    pub fn on_apply(&self, pod: &Pod) -> bool {
        let key = pod_key(pod);

        if !has_scrape_annotation(pod) {
            debug!("{} has no scrape annotation, skipping", key);
            return false;
        }

        if !is_ready(pod) {
            debug!("{} not ready yet, skipping", key);
            return false;
        }

        self.queue.add(key)
    }

    pub fn on_delete(&self, pod: &Pod) {
        if !has_scrape_annotation(pod) {
            debug!(
                "{} has no scrape annotation, ignoring delete",
                pod_key(pod)
            );
            return;
        }

        self.reconciler.unregister_pod(pod);
    }

    /// Replay every cached pod, returns how many keys were queued
    pub fn resync(&self, store: &Store<Pod>) -> usize {
        store
            .state()
            .iter()
            .filter(|pod| self.on_apply(pod))
            .count()
    }
}

/// Drains the work queue, reconciling each key against the cache
pub struct QueueConsumer {
    queue: Arc<WorkQueue>,
    store: Store<Pod>,
    reconciler: Reconciler,
    filter: ScopeFilter,
}

impl QueueConsumer {
    pub fn new(
        queue: Arc<WorkQueue>,
        store: Store<Pod>,
        reconciler: Reconciler,
        filter: ScopeFilter,
    ) -> Self {
        Self {
            queue,
            store,
            reconciler,
            filter,
        }
    }

    /// Run until the queue is shut down, returns the number of keys processed
    pub async fn run(self) -> usize {
        let mut processed = 0;

        while let Some(key) = self.queue.get().await {
            self.process(&key);
            processed += 1;
        }

        info!("Pod informer queue shut down after {} keys", processed);
        processed
    }

    fn process(&self, key: &str) {
        let Some((namespace, name)) = key.split_once('/') else {
            error!("malformed pod key {:?}", key);
            return;
        };

        let object_ref = ObjectRef::<Pod>::new(name).within(namespace);
        let Some(pod) = self.store.get(&object_ref) else {
            // Deleted before we got to it
            warn!("{} is gone from the cache", key);
            return;
        };

        if self.filter.is_eligible(&pod) {
            self.reconciler.register_pod(&pod);
        } else {
            debug!("{} no longer eligible", key);
            self.reconciler.unregister_pod(&pod);
        }
    }
}

/// Pump reflector events into the handlers until cancelled or the stream ends
pub async fn run_event_loop(
    mut stream: PodEventStream,
    handlers: EventHandlers,
    store: Store<Pod>,
    resync_period: Duration,
    token: CancellationToken,
) {
    let mut resync = interval_at(Instant::now() + resync_period, resync_period);

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!("Pod informer event loop cancelled");
                break;
            }
            _ = resync.tick() => {
                let queued = handlers.resync(&store);
                debug!("Resync queued {} pods", queued);
            }
            event = stream.next() => match event {
                Some(Ok(event)) => handlers.handle(&event),
                Some(Err(e)) => {
                    warn!("Pod informer watch error: {}", e);
                }
                None => {
                    warn!("Pod informer stream ended");
                    break;
                }
            }
        }
    }
}

/// Informer plus work queue discovery over the Kubernetes API
pub struct InformerDiscovery {
    api: Api<Pod>,
    filter: ScopeFilter,
    reconciler: Reconciler,
    resync_period: Duration,
}

impl InformerDiscovery {
    pub fn new(client: Client, filter: ScopeFilter, reconciler: Reconciler) -> Self {
        Self {
            api: pod_api(client, filter.namespace()),
            filter,
            reconciler,
            resync_period: RESYNC_PERIOD,
        }
    }

    fn watcher_config(&self) -> watcher::Config {
        let mut config = watcher::Config::default();
        if let Some(labels) = self.filter.label_selector() {
            config = config.labels(labels.as_str());
        }
        if let Some(fields) = self.filter.field_selector() {
            config = config.fields(fields.as_str());
        }
        config
    }

    /// Run until cancelled
    ///
    /// Returns an error if the cache never syncs or the event loop stops on
    /// its own; the caller is expected to start over.
    pub async fn run(&self, token: &CancellationToken) -> Result<()> {
        info!("Starting pod informer");

        let (store, writer) = reflector::store::<Pod>();
        let stream = reflector::reflector(
            writer,
            watcher(self.api.clone(), self.watcher_config()).default_backoff(),
        )
        .boxed();

        self.drive(stream, store, token).await
    }

    /// Pump `stream` into `store`, wait for the initial sync, then reconcile
    /// queued keys until cancelled or the stream ends
    pub async fn drive(
        &self,
        stream: PodEventStream,
        store: Store<Pod>,
        token: &CancellationToken,
    ) -> Result<()> {
        let queue = Arc::new(WorkQueue::new());
        let handlers = EventHandlers::new(queue.clone(), self.reconciler.clone());

        let loop_token = token.child_token();
        let event_loop = tokio::spawn(run_event_loop(
            stream,
            handlers,
            store.clone(),
            self.resync_period,
            loop_token.clone(),
        ));

        tokio::select! {
            _ = token.cancelled() => {
                queue.shut_down();
                loop_token.cancel();
                return Ok(());
            }
            synced = store.wait_until_ready() => {
                if synced.is_err() {
                    queue.shut_down();
                    loop_token.cancel();
                    return Err(DiscoveryError::Watch(
                        "failed to sync informer cache".to_string(),
                    ));
                }
            }
        }

        info!("Pod informer cache synced with {} pods", store.len());

        let consumer = tokio::spawn(
            QueueConsumer::new(
                queue.clone(),
                store,
                self.reconciler.clone(),
                self.filter.clone(),
            )
            .run(),
        );

        let result = tokio::select! {
            _ = token.cancelled() => {
                info!("Pod informer cancelled, shutting down queue");
                Ok(())
            }
            finished = event_loop => match finished {
                Ok(()) => Err(DiscoveryError::Watch("pod informer stream ended".to_string())),
                Err(e) => Err(DiscoveryError::Watch(format!("pod informer task failed: {}", e))),
            },
        };

        queue.shut_down();
        loop_token.cancel();
        if let Err(e) = consumer.await {
            error!("Pod informer queue consumer failed: {}", e);
        }

        result
    }
}
