use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use k8s_openapi::api::core::v1::DaemonEndpoint;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::api::core::v1::NodeAddress;
use k8s_openapi::api::core::v1::NodeDaemonEndpoints;
use k8s_openapi::api::core::v1::NodeStatus;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use node_informer::apis::NodeSlo;
use node_informer::config::InformerConfig;
use node_informer::kubelet::KubeletEndpoint;
use node_informer::mock::MockKubelet;
use node_informer::mock::MockKubeletConnector;
use node_informer::mock::MockPleg;
use node_informer::mock::MockWatchSource;
use node_informer::InformerError;
use node_informer::InformerSources;
use node_informer::NodeInformer;
use node_informer::ObjectKind;
use similar_asserts::assert_eq;
use test_log::test;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const NODE_NAME: &str = "node-1";

fn create_test_node(resource_version: &str, address_type: &str) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(NODE_NAME.to_string()),
            resource_version: Some(resource_version.to_string()),
            ..Default::default()
        },
        status: Some(NodeStatus {
            addresses: Some(vec![NodeAddress {
                type_: address_type.to_string(),
                address: "10.0.0.5".to_string(),
            }]),
            daemon_endpoints: Some(NodeDaemonEndpoints {
                kubelet_endpoint: Some(DaemonEndpoint { port: 10250 }),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn create_test_node_slo(resource_version: &str) -> NodeSlo {
    NodeSlo {
        metadata: ObjectMeta {
            name: Some(NODE_NAME.to_string()),
            resource_version: Some(resource_version.to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn create_test_pod(name: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            uid: Some(format!("uid-{name}")),
            ..Default::default()
        },
        ..Default::default()
    }
}

struct Harness {
    node_watch: Arc<MockWatchSource<Node>>,
    node_slo_watch: Arc<MockWatchSource<NodeSlo>>,
    kubelet: Arc<MockKubelet>,
    connector: Arc<MockKubeletConnector>,
    pleg: Arc<MockPleg>,
}

impl Harness {
    fn new() -> Self {
        Self::with_node_watch(MockWatchSource::new(Some(create_test_node(
            "1",
            "InternalIP",
        ))))
    }

    fn with_node_watch(node_watch: MockWatchSource<Node>) -> Self {
        let kubelet = Arc::new(MockKubelet::new(vec![
            create_test_pod("nginx"),
            create_test_pod("redis"),
        ]));
        Self {
            node_watch: Arc::new(node_watch),
            node_slo_watch: Arc::new(MockWatchSource::new(Some(create_test_node_slo("1")))),
            connector: Arc::new(MockKubeletConnector::new(kubelet.clone())),
            kubelet,
            pleg: Arc::new(MockPleg::default()),
        }
    }

    fn config(&self) -> InformerConfig {
        let mut config = InformerConfig::for_node(NODE_NAME);
        config.kubelet_sync_interval_seconds = 10;
        config
    }

    fn informer(&self, config: InformerConfig) -> Arc<NodeInformer> {
        let sources = InformerSources {
            node_watch: self.node_watch.clone(),
            node_slo_watch: self.node_slo_watch.clone(),
            kubelet_connector: self.connector.clone(),
            pleg: self.pleg.clone(),
        };
        Arc::new(NodeInformer::new(config, sources).unwrap())
    }
}

fn spawn_informer(
    informer: &Arc<NodeInformer>,
    token: &CancellationToken,
) -> JoinHandle<Result<(), Report<InformerError>>> {
    let informer = informer.clone();
    let token = token.clone();
    tokio::spawn(async move { informer.run(token).await })
}

async fn wait_until(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn counting_callback(
    informer: &NodeInformer,
    kind: ObjectKind,
    name: &str,
) -> Arc<AtomicUsize> {
    let count = Arc::new(AtomicUsize::new(0));
    let counter = count.clone();
    informer
        .register_callback(kind, name, "counts invocations", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
    count
}

#[test(tokio::test(start_paused = true))]
async fn silent_node_watch_times_out_cluster_sync() {
    let harness = Harness::with_node_watch(MockWatchSource::silent());
    let informer = harness.informer(harness.config());
    let token = CancellationToken::new();

    let started = tokio::time::Instant::now();
    let err = informer.run(token).await.unwrap_err();

    assert!(matches!(
        err.current_context(),
        InformerError::CacheSyncTimeout { seconds: 300, .. }
    ));
    assert!(started.elapsed() >= Duration::from_secs(300));
    assert_eq!(harness.kubelet.calls(), 0);
    assert_eq!(harness.pleg.handler_count(), 0);
    assert!(!informer.has_synced());
}

#[test(tokio::test(start_paused = true))]
async fn cancellation_during_startup_is_not_an_error() {
    let harness = Harness::with_node_watch(MockWatchSource::silent());
    let informer = harness.informer(harness.config());
    let token = CancellationToken::new();
    let handle = spawn_informer(&informer, &token);

    tokio::time::sleep(Duration::from_secs(10)).await;
    token.cancel();
    handle.await.unwrap().unwrap();
}

#[test(tokio::test(start_paused = true))]
async fn startup_reaches_ready_and_serves_copies() {
    let harness = Harness::new();
    let informer = harness.informer(harness.config());
    let token = CancellationToken::new();
    let handle = spawn_informer(&informer, &token);

    wait_until(|| informer.has_synced()).await;

    assert_eq!(
        harness.connector.endpoints(),
        vec![KubeletEndpoint {
            address: "10.0.0.5".to_string(),
            port: 10250
        }]
    );
    assert_eq!(harness.pleg.handler_count(), 1);

    let mut node = informer.get_node().unwrap();
    node.metadata.name = Some("mutated".to_string());
    assert_eq!(
        informer.get_node().unwrap().metadata.name.as_deref(),
        Some(NODE_NAME)
    );
    assert_eq!(
        informer.get_node_slo().unwrap().metadata.resource_version.as_deref(),
        Some("1")
    );

    let mut pods: Vec<String> = informer
        .get_all_pods()
        .iter()
        .map(|pod| pod.key())
        .collect();
    pods.sort();
    assert_eq!(pods, vec!["default/nginx", "default/redis"]);

    token.cancel();
    handle.await.unwrap().unwrap();
    assert_eq!(harness.pleg.handler_count(), 0);
}

#[test(tokio::test(start_paused = true))]
async fn synced_state_survives_kubelet_failures() {
    let harness = Harness::new();
    let mut config = harness.config();
    config.kubelet_sync_interval_seconds = 1;
    let informer = harness.informer(config);
    let token = CancellationToken::new();
    let handle = spawn_informer(&informer, &token);

    wait_until(|| informer.has_synced()).await;
    harness.kubelet.set_fail(true);
    let calls = harness.kubelet.calls();

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(harness.kubelet.calls() > calls);
    assert!(informer.has_synced());
    assert_eq!(informer.get_all_pods().len(), 2);

    token.cancel();
    handle.await.unwrap().unwrap();
}

#[test(tokio::test(start_paused = true))]
async fn pod_added_event_accelerates_polling() {
    let harness = Harness::new();
    let informer = harness.informer(harness.config());
    let token = CancellationToken::new();
    let handle = spawn_informer(&informer, &token);

    wait_until(|| informer.has_synced()).await;
    assert_eq!(harness.kubelet.calls(), 1);

    harness.kubelet.set_pods(vec![
        create_test_pod("nginx"),
        create_test_pod("redis"),
        create_test_pod("etcd"),
    ]);
    harness.pleg.emit_pod_added("uid-etcd");
    wait_until(|| informer.get_all_pods().len() == 3).await;
    assert_eq!(harness.kubelet.calls(), 2);

    token.cancel();
    handle.await.unwrap().unwrap();
}

#[test(tokio::test(start_paused = true))]
async fn missing_kubelet_address_is_fatal() {
    let harness = Harness::with_node_watch(MockWatchSource::new(Some(create_test_node(
        "1",
        "Hostname",
    ))));
    let informer = harness.informer(harness.config());

    let err = informer.run(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(
        err.current_context(),
        InformerError::NodeAddressNotFound { .. }
    ));
    assert!(harness.connector.endpoints().is_empty());
    assert_eq!(harness.pleg.handler_count(), 0);
}

#[test(tokio::test(start_paused = true))]
async fn missing_node_object_is_fatal() {
    let harness = Harness::with_node_watch(MockWatchSource::new(None));
    let informer = harness.informer(harness.config());

    let err = informer.run(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(
        err.current_context(),
        InformerError::NodeNotFound { node_name } if node_name == NODE_NAME
    ));
}

#[test(tokio::test(start_paused = true))]
async fn kubelet_connect_failure_is_fatal() {
    let mut harness = Harness::new();
    harness.connector = Arc::new(MockKubeletConnector::failing());
    let informer = harness.informer(harness.config());

    let err = informer.run(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(
        err.current_context(),
        InformerError::KubeletConnectFailed { endpoint } if endpoint == "10.0.0.5:10250"
    ));
    assert_eq!(harness.pleg.handler_count(), 0);
}

#[test(tokio::test(start_paused = true))]
async fn pod_sync_timeout_releases_lifecycle_handler() {
    let harness = Harness::new();
    harness.kubelet.set_fail(true);
    let mut config = harness.config();
    config.kubelet_sync_interval_seconds = 1;
    config.cache_sync_timeout = Duration::from_secs(5);
    let informer = harness.informer(config);

    let err = informer.run(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(
        err.current_context(),
        InformerError::CacheSyncTimeout { what: "pods", .. }
    ));
    assert_eq!(harness.pleg.handler_count(), 0);
    assert!(!informer.has_synced());
}

#[test(tokio::test(flavor = "multi_thread"))]
async fn callbacks_follow_updates_despite_failing_peer() {
    let harness = Harness::new();
    let informer = harness.informer(harness.config());
    informer
        .register_callback(ObjectKind::Node, "always-fails", "", |_| {
            anyhow::bail!("broken consumer")
        })
        .unwrap();
    let node_count = counting_callback(&informer, ObjectKind::Node, "node-counter");
    let node_slo_count = counting_callback(&informer, ObjectKind::NodeSlo, "slo-counter");

    let token = CancellationToken::new();
    let handle = spawn_informer(&informer, &token);

    // the initial list is dispatched once the runners start
    wait_until(|| node_count.load(Ordering::SeqCst) >= 1).await;
    wait_until(|| node_slo_count.load(Ordering::SeqCst) >= 1).await;

    let seen = node_count.load(Ordering::SeqCst);
    harness.node_watch.apply(create_test_node("2", "InternalIP"));
    wait_until(|| node_count.load(Ordering::SeqCst) > seen).await;
    wait_until(|| {
        informer.get_node().unwrap().metadata.resource_version.as_deref() == Some("2")
    })
    .await;

    let seen = node_slo_count.load(Ordering::SeqCst);
    harness.node_slo_watch.apply(create_test_node_slo("2"));
    wait_until(|| node_slo_count.load(Ordering::SeqCst) > seen).await;

    token.cancel();
    handle.await.unwrap().unwrap();
}

#[test]
fn registration_misuse_is_rejected() {
    let harness = Harness::new();
    let informer = harness.informer(harness.config());

    informer
        .register_callback(ObjectKind::Node, "dup", "", |_| Ok(()))
        .unwrap();
    let err = informer
        .register_callback(ObjectKind::Node, "dup", "", |_| Ok(()))
        .unwrap_err();
    assert!(matches!(
        err.current_context(),
        InformerError::DuplicateCallback { .. }
    ));

    let err = informer
        .register_callback(ObjectKind::Pods, "pods", "", |_| Ok(()))
        .unwrap_err();
    assert!(matches!(
        err.current_context(),
        InformerError::IllegalCallbackKind { kind: ObjectKind::Pods }
    ));
}
