//! Startup ordering and lifecycle of the node informer.
//!
//! [`NodeInformer::run`] walks through the startup sequence:
//!
//! 1. start the node and node SLO watch caches
//! 2. wait until both have listed their object
//! 3. resolve the kubelet endpoint from the node and connect to it
//! 4. start the pod tracker and subscribe it to the lifecycle source
//! 5. wait until the pod tracker has polled once
//! 6. start one callback runner per observable kind
//! 7. serve until cancelled
//!
//! A failure in steps 2, 3 or 5 aborts the sequence and every loop started so
//! far is stopped before `run` returns.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use k8s_openapi::api::core::v1::Node;
use tokio::select;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::apis::NodeSlo;
use crate::cache::ObjectCache;
use crate::cache::WatchSource;
use crate::callback::CallbackRegistry;
use crate::callback::ObjectKind;
use crate::config::InformerConfig;
use crate::error::InformerError;
use crate::kubelet::resolve_endpoint;
use crate::kubelet::KubeletConnector;
use crate::pleg::HandlerGuard;
use crate::pleg::PodLifecycleSource;
use crate::pod_meta::PodMeta;
use crate::pod_tracker::PodTracker;
use crate::runner::CallbackRunner;
use crate::runner::TriggerReceiver;
use crate::runner::UpdateNotifier;
use crate::states::StateView;
use crate::states::StatesReader;

/// How often a readiness barrier re-checks its sources.
const SYNC_POLL_PERIOD: Duration = Duration::from_millis(100);

/// Upper bound for the loops to exit once the informer is stopped.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// External collaborators the informer pulls state from.
pub struct InformerSources {
    pub node_watch: Arc<dyn WatchSource<Node>>,
    pub node_slo_watch: Arc<dyn WatchSource<NodeSlo>>,
    pub kubelet_connector: Arc<dyn KubeletConnector>,
    pub pleg: Arc<dyn PodLifecycleSource>,
}

pub struct NodeInformer {
    config: InformerConfig,
    sources: InformerSources,
    registry: Arc<CallbackRegistry>,
    states: Arc<StateView>,
    trigger_receivers: Mutex<Option<Vec<TriggerReceiver>>>,
}

impl NodeInformer {
    /// # Errors
    ///
    /// - [`InformerError::InvalidSyncInterval`] if the kubelet sync interval is
    ///   not positive
    /// - [`InformerError::InvalidTimeout`] if a configured timeout is zero
    pub fn new(
        config: InformerConfig,
        sources: InformerSources,
    ) -> Result<Self, Report<InformerError>> {
        config.validate()?;

        let (notifier, trigger_receivers) = UpdateNotifier::new();
        let notifier = Arc::new(notifier);
        let states = Arc::new(StateView {
            node: Arc::new(ObjectCache::new(ObjectKind::Node, notifier.clone())),
            node_slo: Arc::new(ObjectCache::new(ObjectKind::NodeSlo, notifier.clone())),
            pods: Arc::new(PodTracker::new(notifier, config.cgroup_driver)),
        });

        Ok(Self {
            config,
            sources,
            registry: Arc::new(CallbackRegistry::new()),
            states,
            trigger_receivers: Mutex::new(Some(trigger_receivers)),
        })
    }

    /// Register a callback invoked whenever state of `kind` changes.
    ///
    /// # Errors
    ///
    /// - [`InformerError::IllegalCallbackKind`] if `kind` does not accept callbacks
    /// - [`InformerError::DuplicateCallback`] if `name` is taken for `kind`
    pub fn register_callback<F>(
        &self,
        kind: ObjectKind,
        name: impl Into<String>,
        description: impl Into<String>,
        func: F,
    ) -> Result<(), Report<InformerError>>
    where
        F: Fn(&dyn StatesReader) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.registry.register(kind, name, description, func)
    }

    pub fn has_synced(&self) -> bool {
        self.states.has_synced()
    }

    pub fn get_node(&self) -> Option<Node> {
        self.states.get_node()
    }

    pub fn get_node_slo(&self) -> Option<NodeSlo> {
        self.states.get_node_slo()
    }

    pub fn get_all_pods(&self) -> Vec<PodMeta> {
        self.states.get_all_pods()
    }

    /// Run the informer until `cancellation_token` is cancelled.
    ///
    /// Cancellation during startup is not an error.
    ///
    /// # Errors
    ///
    /// - [`InformerError::AlreadyRunning`] if `run` was called before
    /// - [`InformerError::CacheSyncTimeout`] if a source does not sync in time
    /// - [`InformerError::NodeNotFound`] if the node does not exist
    /// - [`InformerError::NodeAddressNotFound`] if the kubelet address cannot be resolved
    /// - [`InformerError::KubeletConnectFailed`] if no kubelet client can be built
    #[tracing::instrument(skip_all, fields(node = %self.config.node_name))]
    pub async fn run(
        &self,
        cancellation_token: CancellationToken,
    ) -> Result<(), Report<InformerError>> {
        let trigger_receivers = self
            .trigger_receivers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| Report::new(InformerError::AlreadyRunning))?;

        let token = cancellation_token.child_token();
        let mut tasks = Vec::new();
        let result = self.serve(trigger_receivers, &token, &mut tasks).await;
        if let Err(e) = &result {
            error!("node informer failed: {e:?}");
        }

        token.cancel();
        wait_for_tasks_with_timeout(tasks, SHUTDOWN_TIMEOUT).await;
        info!("node informer stopped");
        result
    }

    async fn serve(
        &self,
        trigger_receivers: Vec<TriggerReceiver>,
        token: &CancellationToken,
        tasks: &mut Vec<JoinHandle<()>>,
    ) -> Result<(), Report<InformerError>> {
        let timeout = self.config.cache_sync_timeout;

        info!("starting informer for Node and NodeSLO");
        tasks.push(spawn_cache(
            self.states.node.clone(),
            self.sources.node_watch.clone(),
            token.clone(),
        ));
        tasks.push(spawn_cache(
            self.states.node_slo.clone(),
            self.sources.node_slo_watch.clone(),
            token.clone(),
        ));

        let node_cache = self.states.node.clone();
        let node_slo_cache = self.states.node_slo.clone();
        let cluster_synced = move || node_cache.has_synced() && node_slo_cache.has_synced();
        if !wait_for_sync("Node and NodeSLO", timeout, token, cluster_synced).await? {
            info!("stopped before the cluster caches synced");
            return Ok(());
        }
        info!("Node and NodeSLO informers synced");

        let node = self.states.node.get().ok_or_else(|| {
            Report::new(InformerError::NodeNotFound {
                node_name: self.config.node_name.clone(),
            })
        })?;
        let endpoint = resolve_endpoint(&node, self.config.kubelet_preferred_address_type)?;
        let stub = self
            .sources
            .kubelet_connector
            .connect(&endpoint)
            .change_context_lazy(|| InformerError::KubeletConnectFailed {
                endpoint: endpoint.to_string(),
            })?;
        info!(%endpoint, "kubelet stub created");

        // dropped on every return below, before the pod tracker is stopped
        let _pleg_handler = HandlerGuard::register(
            self.sources.pleg.clone(),
            self.states.pods.pod_added_handler(),
        );

        info!("starting pod tracker");
        tasks.push({
            let pods = self.states.pods.clone();
            let interval = self.config.kubelet_sync_interval();
            let request_timeout = self.config.kubelet_sync_timeout;
            let token = token.clone();
            tokio::spawn(async move {
                if let Err(e) = pods.run(stub, interval, request_timeout, token).await {
                    error!("pod tracker failed: {e:?}");
                }
            })
        });

        let pods = self.states.pods.clone();
        if !wait_for_sync("pods", timeout, token, move || pods.has_synced()).await? {
            info!("stopped before the pods synced");
            return Ok(());
        }
        info!("pods synced from kubelet");

        let states: Arc<dyn StatesReader> = self.states.clone();
        for trigger in trigger_receivers {
            info!(kind = %trigger.kind(), "starting callback runner");
            let runner = CallbackRunner::new(trigger, self.registry.clone(), states.clone());
            tasks.push(tokio::spawn(runner.run(token.clone())));
        }

        info!("node informer is ready");
        token.cancelled().await;
        info!("node informer shutdown requested");
        Ok(())
    }
}

fn spawn_cache<K>(
    cache: Arc<ObjectCache<K>>,
    source: Arc<dyn WatchSource<K>>,
    token: CancellationToken,
) -> JoinHandle<()>
where
    K: kube::Resource + Clone + std::fmt::Debug + Send + Sync + 'static,
{
    tokio::spawn(async move { cache.run(source, token).await })
}

/// Block until `synced` holds, the timeout elapses, or `token` is cancelled.
///
/// Returns `Ok(false)` on cancellation.
async fn wait_for_sync(
    what: &'static str,
    timeout: Duration,
    token: &CancellationToken,
    synced: impl Fn() -> bool,
) -> Result<bool, Report<InformerError>> {
    let poll = async {
        while !synced() {
            tokio::time::sleep(SYNC_POLL_PERIOD).await;
        }
    };

    select! {
        biased;
        _ = token.cancelled() => Ok(false),
        result = tokio::time::timeout(timeout, poll) => {
            result.map(|()| true).map_err(|_| {
                Report::new(InformerError::CacheSyncTimeout {
                    what,
                    seconds: timeout.as_secs(),
                })
            })
        }
    }
}

async fn wait_for_tasks_with_timeout(tasks: Vec<JoinHandle<()>>, timeout: Duration) {
    tokio::time::timeout(timeout, async {
        for task in tasks {
            if let Err(e) = task.await {
                error!("Task failed during shutdown: {e}");
            }
        }
    })
    .await
    .unwrap_or_else(|_| {
        warn!("Task shutdown timed out after {:?}", timeout);
    });
}
