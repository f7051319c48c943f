//! Pod set of the local node, polled from the kubelet.
//!
//! The tracker polls on a fixed interval. A lifecycle source can request one
//! extra poll ahead of schedule through [`PodTracker::pod_added_handler`]; at
//! most one such request is outstanding at a time, so a burst of pod creations
//! costs the kubelet a single extra call.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use error_stack::Report;
use tokio::select;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::callback::ObjectKind;
use crate::error::InformerError;
use crate::error::KubeletError;
use crate::kubelet::KubeletStub;
use crate::pleg::PodAddedHandler;
use crate::pod_meta::CgroupDriver;
use crate::pod_meta::PodMeta;
use crate::runner::UpdateNotifier;

pub struct PodTracker {
    pods: RwLock<HashMap<String, PodMeta>>,
    synced: AtomicBool,
    last_updated: RwLock<Option<DateTime<Utc>>>,
    notifier: Arc<UpdateNotifier>,
    driver: CgroupDriver,
    extra_sync_pending: Arc<AtomicBool>,
    extra_sync_tx: mpsc::Sender<String>,
    extra_sync_rx: Mutex<Option<mpsc::Receiver<String>>>,
}

impl PodTracker {
    pub fn new(notifier: Arc<UpdateNotifier>, driver: CgroupDriver) -> Self {
        let (extra_sync_tx, extra_sync_rx) = mpsc::channel(1);
        Self {
            pods: RwLock::new(HashMap::new()),
            synced: AtomicBool::new(false),
            last_updated: RwLock::new(None),
            notifier,
            driver,
            extra_sync_pending: Arc::new(AtomicBool::new(false)),
            extra_sync_tx,
            extra_sync_rx: Mutex::new(Some(extra_sync_rx)),
        }
    }

    /// Whether one poll has succeeded. Never reverts once true.
    pub fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    pub fn get_all_pods(&self) -> Vec<PodMeta> {
        self.pods
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Time of the last successful poll.
    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        *self
            .last_updated
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Handler for a lifecycle source that requests an extra poll.
    ///
    /// The request stays pending until the extra poll completes; requests
    /// arriving meanwhile are dropped.
    pub fn pod_added_handler(&self) -> PodAddedHandler {
        let pending = self.extra_sync_pending.clone();
        let sender = self.extra_sync_tx.clone();
        Arc::new(move |pod_uid: &str| {
            if pending
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                debug!(pod_uid = %pod_uid, "extra pods sync already pending, ignore this event");
                return;
            }
            if sender.try_send(pod_uid.to_string()).is_err() {
                pending.store(false, Ordering::Release);
                debug!(pod_uid = %pod_uid, "pod tracker is not running, drop extra sync request");
            }
        })
    }

    /// Poll the kubelet every `interval` until cancelled.
    ///
    /// # Errors
    ///
    /// - [`InformerError::InvalidSyncInterval`] if `interval` is zero
    /// - [`InformerError::InvalidTimeout`] if `timeout` is zero
    /// - [`InformerError::AlreadyRunning`] if the tracker was started before
    #[tracing::instrument(skip_all, fields(interval = ?interval))]
    pub async fn run(
        &self,
        stub: Arc<dyn KubeletStub>,
        interval: Duration,
        timeout: Duration,
        cancellation_token: CancellationToken,
    ) -> Result<(), Report<InformerError>> {
        if interval.is_zero() {
            return Err(Report::new(InformerError::InvalidSyncInterval { seconds: 0 }));
        }
        if timeout.is_zero() {
            return Err(Report::new(InformerError::InvalidTimeout {
                what: "kubelet sync",
            }));
        }
        let mut extra_sync_rx = self
            .extra_sync_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| Report::new(InformerError::AlreadyRunning))?;

        info!("starting pod tracker");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            select! {
                biased;
                _ = cancellation_token.cancelled() => {
                    info!("pod tracker shutdown requested");
                    break;
                }
                _ = ticker.tick() => {
                    self.sync_logged(stub.as_ref(), timeout).await;
                }
                Some(pod_uid) = extra_sync_rx.recv() => {
                    debug!(pod_uid = %pod_uid, "new pod observed, syncing pods ahead of schedule");
                    self.sync_logged(stub.as_ref(), timeout).await;
                    self.extra_sync_pending.store(false, Ordering::Release);
                }
            }
        }
        info!("pod tracker loop is exited");
        Ok(())
    }

    async fn sync_logged(&self, stub: &dyn KubeletStub, timeout: Duration) {
        if let Err(e) = self.sync(stub, timeout).await {
            // keep serving the last successful poll
            warn!("failed to sync pods from kubelet: {e:?}");
        }
    }

    async fn sync(
        &self,
        stub: &dyn KubeletStub,
        timeout: Duration,
    ) -> Result<(), Report<KubeletError>> {
        let pods = tokio::time::timeout(timeout, stub.get_all_pods())
            .await
            .map_err(|_| {
                Report::new(KubeletError::Timeout {
                    seconds: timeout.as_secs(),
                })
            })??;

        let mut next = HashMap::with_capacity(pods.len());
        for pod in pods {
            let meta = PodMeta::new(pod, self.driver);
            match meta.uid() {
                Some(uid) => {
                    next.insert(uid.to_string(), meta);
                }
                None => warn!(pod = %meta.key(), "pod without uid reported by kubelet, skipped"),
            }
        }
        let count = next.len();

        *self.pods.write().unwrap_or_else(PoisonError::into_inner) = next;
        *self
            .last_updated
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
        self.synced.store(true, Ordering::Release);
        debug!(count, "pods synced from kubelet");

        self.notifier.notify(ObjectKind::Pods);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::Pod;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use similar_asserts::assert_eq;
    use test_log::test;
    use tokio::task::JoinHandle;

    use super::*;
    use crate::mock::MockKubelet;

    const INTERVAL: Duration = Duration::from_secs(10);
    const TIMEOUT: Duration = Duration::from_secs(3);

    fn create_test_pod(name: &str, uid: Option<&str>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                uid: uid.map(str::to_string),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn tracker() -> Arc<PodTracker> {
        let (notifier, _receivers) = UpdateNotifier::new();
        Arc::new(PodTracker::new(Arc::new(notifier), CgroupDriver::Cgroupfs))
    }

    fn spawn_tracker(
        tracker: &Arc<PodTracker>,
        kubelet: &Arc<MockKubelet>,
        token: &CancellationToken,
    ) -> JoinHandle<Result<(), Report<InformerError>>> {
        let tracker = tracker.clone();
        let kubelet: Arc<dyn KubeletStub> = kubelet.clone();
        let token = token.clone();
        tokio::spawn(async move { tracker.run(kubelet, INTERVAL, TIMEOUT, token).await })
    }

    #[test(tokio::test(start_paused = true))]
    async fn pod_added_triggers_immediate_extra_sync() {
        let tracker = tracker();
        let kubelet = Arc::new(MockKubelet::new(vec![create_test_pod("a", Some("uid-a"))]));
        let token = CancellationToken::new();
        let handle = spawn_tracker(&tracker, &kubelet, &token);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(kubelet.calls(), 1);

        kubelet.set_pods(vec![
            create_test_pod("a", Some("uid-a")),
            create_test_pod("b", Some("uid-b")),
        ]);
        (tracker.pod_added_handler())("uid-b");
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(kubelet.calls(), 2);
        assert_eq!(tracker.get_all_pods().len(), 2);

        token.cancel();
        handle.await.unwrap().unwrap();
    }

    #[test(tokio::test(start_paused = true))]
    async fn events_during_in_flight_extra_sync_are_dropped() {
        let tracker = tracker();
        let kubelet = Arc::new(MockKubelet::new(Vec::new()));
        let token = CancellationToken::new();
        let handle = spawn_tracker(&tracker, &kubelet, &token);
        let handler = tracker.pod_added_handler();

        tokio::time::sleep(Duration::from_secs(1)).await;
        kubelet.set_delay(Duration::from_secs(2));
        handler("uid-1");
        tokio::time::sleep(Duration::from_secs(1)).await;
        // the extra sync started at t=1s is still in flight
        handler("uid-2");

        tokio::time::sleep(Duration::from_secs(7)).await;
        // initial poll plus exactly one extra poll before the t=10s tick
        assert_eq!(kubelet.calls(), 2);

        token.cancel();
        handle.await.unwrap().unwrap();
    }

    #[test(tokio::test(start_paused = true))]
    async fn synced_stays_true_after_failed_poll() {
        let tracker = tracker();
        let kubelet = Arc::new(MockKubelet::new(vec![create_test_pod("a", Some("uid-a"))]));
        let token = CancellationToken::new();
        assert!(!tracker.has_synced());
        let handle = spawn_tracker(&tracker, &kubelet, &token);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(tracker.has_synced());
        assert!(tracker.last_updated().is_some());

        kubelet.set_fail(true);
        tokio::time::sleep(INTERVAL).await;
        assert_eq!(kubelet.calls(), 2);
        assert!(tracker.has_synced());
        assert_eq!(tracker.get_all_pods().len(), 1);

        token.cancel();
        handle.await.unwrap().unwrap();
    }

    #[test(tokio::test(start_paused = true))]
    async fn slow_kubelet_is_bounded_by_timeout() {
        let tracker = tracker();
        let kubelet = Arc::new(MockKubelet::new(Vec::new()));
        kubelet.set_delay(Duration::from_secs(60));
        let token = CancellationToken::new();
        let handle = spawn_tracker(&tracker, &kubelet, &token);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!tracker.has_synced());

        token.cancel();
        handle.await.unwrap().unwrap();
    }

    #[test(tokio::test(start_paused = true))]
    async fn pods_without_uid_are_skipped() {
        let tracker = tracker();
        let kubelet = Arc::new(MockKubelet::new(vec![
            create_test_pod("a", Some("uid-a")),
            create_test_pod("broken", None),
        ]));
        let token = CancellationToken::new();
        let handle = spawn_tracker(&tracker, &kubelet, &token);

        tokio::time::sleep(Duration::from_secs(1)).await;
        let pods = tracker.get_all_pods();
        assert_eq!(pods.len(), 1);
        assert_eq!(pods[0].uid(), Some("uid-a"));

        token.cancel();
        handle.await.unwrap().unwrap();
    }

    #[test(tokio::test(start_paused = true))]
    async fn returned_pods_are_copies() {
        let tracker = tracker();
        let kubelet = Arc::new(MockKubelet::new(vec![create_test_pod("a", Some("uid-a"))]));
        let token = CancellationToken::new();
        let handle = spawn_tracker(&tracker, &kubelet, &token);
        tokio::time::sleep(Duration::from_secs(1)).await;

        let mut pods = tracker.get_all_pods();
        pods[0].pod.metadata.name = Some("mutated".to_string());
        pods.clear();

        let fresh = tracker.get_all_pods();
        assert_eq!(fresh[0].pod.metadata.name.as_deref(), Some("a"));

        token.cancel();
        handle.await.unwrap().unwrap();
    }

    #[test(tokio::test)]
    async fn zero_interval_is_rejected() {
        let tracker = tracker();
        let kubelet: Arc<dyn KubeletStub> = Arc::new(MockKubelet::new(Vec::new()));
        let err = tracker
            .run(kubelet, Duration::ZERO, TIMEOUT, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err.current_context(),
            InformerError::InvalidSyncInterval { .. }
        ));
    }

    #[test(tokio::test(start_paused = true))]
    async fn zero_request_timeout_is_rejected() {
        let tracker = tracker();
        let kubelet = Arc::new(MockKubelet::new(Vec::new()));
        let err = tracker
            .run(
                kubelet.clone(),
                INTERVAL,
                Duration::ZERO,
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err.current_context(),
            InformerError::InvalidTimeout { .. }
        ));
        assert_eq!(kubelet.calls(), 0);
        assert!(!tracker.has_synced());
    }

    #[test(tokio::test(start_paused = true))]
    async fn second_run_is_rejected() {
        let tracker = tracker();
        let kubelet = Arc::new(MockKubelet::new(Vec::new()));
        let token = CancellationToken::new();
        let handle = spawn_tracker(&tracker, &kubelet, &token);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = tracker
            .run(kubelet.clone(), INTERVAL, TIMEOUT, token.clone())
            .await
            .unwrap_err();
        assert!(matches!(err.current_context(), InformerError::AlreadyRunning));

        token.cancel();
        handle.await.unwrap().unwrap();
    }

    #[test]
    fn requests_coalesce_before_tracker_runs() {
        let tracker = tracker();
        let handler = tracker.pod_added_handler();
        handler("uid-1");
        // channel holds the first request, the second is coalesced
        handler("uid-2");
        assert!(tracker.extra_sync_pending.load(Ordering::Acquire));
    }
}
