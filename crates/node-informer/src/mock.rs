//! In-memory collaborators for tests
//!
//! These stand in for the cluster API, the kubelet and the lifecycle source so
//! the informer can be driven deterministically, including under paused time.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use error_stack::Report;
use futures::future;
use futures::stream;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::watcher;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::apis::NodeSlo;
use crate::cache::WatchSource;
use crate::cache::WatchStream;
use crate::error::KubeletError;
use crate::kubelet::KubeletConnector;
use crate::kubelet::KubeletEndpoint;
use crate::kubelet::KubeletStub;
use crate::pleg::HandlerId;
use crate::pleg::Handlers;
use crate::pleg::PodAddedHandler;
use crate::pleg::PodLifecycleSource;
use crate::pod_meta::PodMeta;
use crate::states::StatesReader;

/// Fixed state handed to callbacks under test
#[derive(Default, Clone)]
pub struct MockStates {
    pub node: Option<Node>,
    pub node_slo: Option<NodeSlo>,
    pub pods: Vec<PodMeta>,
}

impl MockStates {
    /// States with an empty node and node SLO present
    pub fn populated() -> Self {
        Self {
            node: Some(Node::default()),
            node_slo: Some(NodeSlo::default()),
            pods: Vec::new(),
        }
    }
}

impl StatesReader for MockStates {
    fn has_synced(&self) -> bool {
        self.node.is_some() && self.node_slo.is_some()
    }

    fn get_node(&self) -> Option<Node> {
        self.node.clone()
    }

    fn get_node_slo(&self) -> Option<NodeSlo> {
        self.node_slo.clone()
    }

    fn get_all_pods(&self) -> Vec<PodMeta> {
        self.pods.clone()
    }
}

/// Watch source serving one object from memory
///
/// Every watch starts with a list of the current object, followed by the
/// objects passed to [`MockWatchSource::apply`].
pub struct MockWatchSource<K> {
    current: Mutex<Option<K>>,
    updates: broadcast::Sender<K>,
    watch_count: AtomicUsize,
    silent: bool,
}

impl<K> MockWatchSource<K>
where
    K: Clone + Send + Sync + 'static,
{
    pub fn new(initial: Option<K>) -> Self {
        let (updates, _) = broadcast::channel(16);
        Self {
            current: Mutex::new(initial),
            updates,
            watch_count: AtomicUsize::new(0),
            silent: false,
        }
    }

    /// A source whose watch never delivers anything, not even the initial list
    pub fn silent() -> Self {
        Self {
            silent: true,
            ..Self::new(None)
        }
    }

    /// Replace the object and deliver it to every open watch
    pub fn apply(&self, object: K) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Some(object.clone());
        // no open watch is fine, the next one lists the object
        let _ = self.updates.send(object);
    }

    /// Number of watches started so far
    pub fn watch_count(&self) -> usize {
        self.watch_count.load(Ordering::SeqCst)
    }
}

impl<K> WatchSource<K> for MockWatchSource<K>
where
    K: Clone + Send + Sync + 'static,
{
    fn watch(&self) -> WatchStream<K> {
        self.watch_count.fetch_add(1, Ordering::SeqCst);
        if self.silent {
            return stream::pending().boxed();
        }

        let receiver = self.updates.subscribe();
        let listed: Vec<K> = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect();

        let updates = BroadcastStream::new(receiver).filter_map(|update| {
            future::ready(
                update
                    .ok()
                    .map(|object| Ok::<_, watcher::Error>(watcher::Event::Applied(object))),
            )
        });
        let initial = Ok::<_, watcher::Error>(watcher::Event::Restarted(listed));
        stream::once(future::ready(initial))
            .chain(updates)
            .boxed()
    }
}

/// Kubelet answering from a configurable pod list
#[derive(Default)]
pub struct MockKubelet {
    pods: Mutex<Vec<Pod>>,
    calls: AtomicUsize,
    delay: Mutex<Duration>,
    fail: AtomicBool,
}

impl MockKubelet {
    pub fn new(pods: Vec<Pod>) -> Self {
        Self {
            pods: Mutex::new(pods),
            ..Default::default()
        }
    }

    pub fn set_pods(&self, pods: Vec<Pod>) {
        *self.pods.lock().unwrap_or_else(PoisonError::into_inner) = pods;
    }

    /// Delay every following request by `delay`
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap_or_else(PoisonError::into_inner) = delay;
    }

    /// Enable or disable error mode for testing error handling
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Number of requests received so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl KubeletStub for MockKubelet {
    async fn get_all_pods(&self) -> Result<Vec<Pod>, Report<KubeletError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap_or_else(PoisonError::into_inner);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(Report::new(KubeletError::Status {
                url: "mock://kubelet/pods/".to_string(),
                status: 503,
            }));
        }
        Ok(self
            .pods
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }
}

/// Connector handing out a shared [`MockKubelet`]
pub struct MockKubeletConnector {
    kubelet: Arc<MockKubelet>,
    fail: bool,
    endpoints: Mutex<Vec<KubeletEndpoint>>,
}

impl MockKubeletConnector {
    pub fn new(kubelet: Arc<MockKubelet>) -> Self {
        Self {
            kubelet,
            fail: false,
            endpoints: Mutex::new(Vec::new()),
        }
    }

    /// A connector that cannot read its credentials
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(Arc::new(MockKubelet::default()))
        }
    }

    /// Endpoints passed to [`KubeletConnector::connect`] so far
    pub fn endpoints(&self) -> Vec<KubeletEndpoint> {
        self.endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl KubeletConnector for MockKubeletConnector {
    fn connect(
        &self,
        endpoint: &KubeletEndpoint,
    ) -> Result<Arc<dyn KubeletStub>, Report<KubeletError>> {
        self.endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(endpoint.clone());
        if self.fail {
            return Err(Report::new(KubeletError::TokenRead {
                path: "mock://token".to_string(),
            }));
        }
        Ok(self.kubelet.clone())
    }
}

/// Lifecycle source fired by hand
#[derive(Default)]
pub struct MockPleg {
    handlers: Handlers,
}

impl MockPleg {
    pub fn emit_pod_added(&self, pod_uid: &str) {
        self.handlers.dispatch(pod_uid);
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }
}

impl PodLifecycleSource for MockPleg {
    fn add_handler(&self, handler: PodAddedHandler) -> HandlerId {
        self.handlers.add(handler)
    }

    fn remove_handler(&self, id: HandlerId) {
        self.handlers.remove(id);
    }
}
