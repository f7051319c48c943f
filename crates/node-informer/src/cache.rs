//! Watch-backed cache of a single cluster-scoped object.
//!
//! The cache lists then watches its object through a [`WatchSource`], keeping
//! the latest applied version as an owned snapshot. The watch is re-established
//! every resync period so a missed or silently stalled stream is repaired by a
//! full relist.

use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use kube::runtime::watcher;
use kube::runtime::WatchStreamExt;
use kube::Api;
use kube::Client;
use kube::Resource;
use kube::ResourceExt;
use serde::de::DeserializeOwned;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::callback::ObjectKind;
use crate::runner::UpdateNotifier;

/// Interval between full relists of a watched object.
pub const DEFAULT_RESYNC_PERIOD: Duration = Duration::from_secs(12 * 60 * 60);

/// Delay before re-establishing a watch stream that ended.
const REWATCH_DELAY: Duration = Duration::from_secs(5);

/// A stream of list/watch events for one object kind.
pub type WatchStream<K> = BoxStream<'static, Result<watcher::Event<K>, watcher::Error>>;

/// Source of list/watch events, scoped to the local node.
pub trait WatchSource<K>: Send + Sync {
    /// Start a new watch. The stream begins with a full list.
    fn watch(&self) -> WatchStream<K>;
}

/// [`WatchSource`] backed by the Kubernetes API, filtered to one object by name.
pub struct KubeWatchSource<K> {
    api: Api<K>,
    field_selector: String,
}

impl<K> KubeWatchSource<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + 'static,
{
    pub fn for_node(client: Client, node_name: &str) -> Self {
        Self {
            api: Api::all(client),
            field_selector: format!("metadata.name={node_name}"),
        }
    }
}

impl<K> WatchSource<K> for KubeWatchSource<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    fn watch(&self) -> WatchStream<K> {
        let config = watcher::Config::default().fields(&self.field_selector);
        watcher::watcher(self.api.clone(), config)
            .default_backoff()
            .boxed()
    }
}

/// Cache of the latest version of one object.
pub struct ObjectCache<K> {
    kind: ObjectKind,
    object: RwLock<Option<K>>,
    synced: AtomicBool,
    notifier: Arc<UpdateNotifier>,
    resync_period: Duration,
    _marker: PhantomData<fn() -> K>,
}

impl<K> ObjectCache<K>
where
    K: Resource + Clone + Debug + Send + Sync + 'static,
{
    pub fn new(kind: ObjectKind, notifier: Arc<UpdateNotifier>) -> Self {
        Self {
            kind,
            object: RwLock::new(None),
            synced: AtomicBool::new(false),
            notifier,
            resync_period: DEFAULT_RESYNC_PERIOD,
            _marker: PhantomData,
        }
    }

    pub fn with_resync_period(mut self, resync_period: Duration) -> Self {
        self.resync_period = resync_period;
        self
    }

    /// A copy of the latest object, or `None` before it was first observed.
    pub fn get(&self) -> Option<K> {
        self.object
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn contains(&self) -> bool {
        self.object
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Whether the initial list has been delivered.
    pub fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    /// Run the list/watch loop until cancelled.
    #[tracing::instrument(skip_all, fields(kind = %self.kind))]
    pub async fn run(&self, source: Arc<dyn WatchSource<K>>, cancellation_token: CancellationToken) {
        info!("starting object cache");
        loop {
            let mut stream = source.watch();
            let resync = tokio::time::sleep(self.resync_period);
            tokio::pin!(resync);

            let ended = loop {
                select! {
                    biased;
                    _ = cancellation_token.cancelled() => {
                        info!("object cache shutdown requested");
                        return;
                    }
                    _ = &mut resync => {
                        debug!("resync period elapsed, relisting");
                        break false;
                    }
                    event = stream.next() => {
                        match event {
                            Some(Ok(event)) => self.apply(event),
                            Some(Err(e)) => {
                                // the backoff layer retries, keep serving the last snapshot
                                warn!("watch stream error: {e}");
                            }
                            None => break true,
                        }
                    }
                }
            };

            if ended {
                warn!("watch stream ended unexpectedly, restarting...");
                select! {
                    _ = cancellation_token.cancelled() => return,
                    _ = tokio::time::sleep(REWATCH_DELAY) => {}
                }
            }
        }
    }

    /// Apply one watch event and notify on any change of the snapshot.
    pub(crate) fn apply(&self, event: watcher::Event<K>) {
        match event {
            watcher::Event::Applied(object) => {
                debug!(name = %object.name_any(), "object updated");
                self.replace(object);
            }
            watcher::Event::Restarted(objects) => {
                debug!(count = objects.len(), "object listed");
                if let Some(object) = objects.into_iter().last() {
                    self.replace(object);
                }
                self.synced.store(true, Ordering::Release);
            }
            watcher::Event::Deleted(object) => {
                warn!(name = %object.name_any(), "object deleted, keep the last known version");
            }
        }
    }

    fn replace(&self, object: K) {
        *self
            .object
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(object);
        self.synced.store(true, Ordering::Release);
        self.notifier.notify(self.kind);
    }
}
