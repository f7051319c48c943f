//! Coalescing triggers and the per-kind callback runners.
//!
//! A [`Trigger`] is a capacity-one, payload-less signal. Firing it while a
//! previous signal is still pending is a no-op, so a burst of updates collapses
//! into a single wake-up. The runner re-reads the current state when it wakes,
//! which makes dropping the duplicates safe.

use std::sync::Arc;

use tokio::select;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::trace;
use tracing::warn;

use crate::callback::CallbackRegistry;
use crate::callback::ObjectKind;
use crate::callback::UpdateCallback;
use crate::states::StatesReader;

/// Producer half of a coalescing trigger.
#[derive(Debug, Clone)]
pub struct Trigger {
    kind: ObjectKind,
    sender: mpsc::Sender<()>,
}

/// Consumer half of a coalescing trigger.
#[derive(Debug)]
pub struct TriggerReceiver {
    kind: ObjectKind,
    receiver: mpsc::Receiver<()>,
}

/// Create a trigger for `kind`.
pub fn trigger(kind: ObjectKind) -> (Trigger, TriggerReceiver) {
    let (sender, receiver) = mpsc::channel(1);
    (Trigger { kind, sender }, TriggerReceiver { kind, receiver })
}

impl Trigger {
    /// Signal that fresh state is available. Returns `false` when the signal was
    /// coalesced into one that is still pending, or nobody is listening anymore.
    pub fn fire(&self) -> bool {
        match self.sender.try_send(()) {
            Ok(()) => true,
            Err(TrySendError::Full(())) => {
                debug!(kind = %self.kind, "last callback runner has not finished, ignore this time");
                false
            }
            Err(TrySendError::Closed(())) => {
                trace!(kind = %self.kind, "callback runner has exited");
                false
            }
        }
    }
}

impl TriggerReceiver {
    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    /// Consume a pending signal without waiting.
    pub fn try_recv(&mut self) -> bool {
        self.receiver.try_recv().is_ok()
    }
}

/// Fans state updates out to the trigger of each observed kind.
#[derive(Debug)]
pub struct UpdateNotifier {
    node: Trigger,
    node_slo: Trigger,
}

impl UpdateNotifier {
    /// Create the notifier plus one receiver per registrable kind.
    pub fn new() -> (Self, Vec<TriggerReceiver>) {
        let (node, node_rx) = trigger(ObjectKind::Node);
        let (node_slo, node_slo_rx) = trigger(ObjectKind::NodeSlo);
        (Self { node, node_slo }, vec![node_rx, node_slo_rx])
    }

    pub fn notify(&self, kind: ObjectKind) {
        match kind {
            ObjectKind::Node => {
                self.node.fire();
            }
            ObjectKind::NodeSlo => {
                self.node_slo.fire();
            }
            ObjectKind::Pods => {
                trace!(kind = %kind, "no callback runner for kind");
            }
        }
    }
}

/// Worker loop invoking the callbacks of one kind, one trigger at a time.
pub struct CallbackRunner {
    trigger: TriggerReceiver,
    registry: Arc<CallbackRegistry>,
    states: Arc<dyn StatesReader>,
}

impl CallbackRunner {
    pub fn new(
        trigger: TriggerReceiver,
        registry: Arc<CallbackRegistry>,
        states: Arc<dyn StatesReader>,
    ) -> Self {
        Self {
            trigger,
            registry,
            states,
        }
    }

    #[tracing::instrument(skip_all, fields(kind = %self.trigger.kind))]
    pub async fn run(mut self, cancellation_token: CancellationToken) {
        info!("callback runner started");
        loop {
            select! {
                biased;
                _ = cancellation_token.cancelled() => {
                    break;
                }
                signal = self.trigger.receiver.recv() => {
                    if signal.is_none() {
                        warn!("trigger closed, stopping callback runner");
                        break;
                    }
                    self.run_callbacks().await;
                }
            }
        }
        info!("callback runner loop is exited");
    }

    async fn run_callbacks(&self) {
        let kind = self.trigger.kind;
        if !self.states.contains(kind) {
            warn!("no state of this kind has been observed, skip callbacks");
            return;
        }

        for callback in self.registry.callbacks(kind) {
            debug!(callback = %callback.name, "start running callback function");
            invoke(callback, self.states.clone()).await;
        }
    }
}

/// Run one callback on the blocking pool so neither an error nor a panic can
/// escape into the runner.
async fn invoke(callback: UpdateCallback, states: Arc<dyn StatesReader>) {
    let name = callback.name.clone();
    let func = callback.func.clone();
    match tokio::task::spawn_blocking(move || func(states.as_ref())).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!(callback = %name, "callback failed: {e:?}");
        }
        Err(e) if e.is_panic() => {
            error!(callback = %name, "callback panicked: {e}");
        }
        Err(e) => {
            error!(callback = %name, "callback task failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::mock::MockStates;

    async fn wait_for(count: &AtomicUsize, expected: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while count.load(Ordering::SeqCst) < expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("callback count not reached in time");
    }

    fn counting_registry(kind: ObjectKind, count: Arc<AtomicUsize>) -> Arc<CallbackRegistry> {
        let registry = Arc::new(CallbackRegistry::new());
        registry
            .register(kind, "counter", "count invocations", move |_| {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        registry
    }

    #[test]
    fn trigger_coalesces_pending_signals() {
        let (trigger, mut rx) = trigger(ObjectKind::Node);
        assert!(trigger.fire());
        assert!(!trigger.fire());
        assert!(!trigger.fire());

        assert!(rx.try_recv());
        assert!(!rx.try_recv());
        assert!(trigger.fire());
    }

    #[test(tokio::test(flavor = "multi_thread"))]
    async fn burst_of_triggers_runs_callbacks_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let registry = counting_registry(ObjectKind::NodeSlo, count.clone());
        let (trigger, rx) = trigger(ObjectKind::NodeSlo);
        for _ in 0..5 {
            trigger.fire();
        }

        let token = CancellationToken::new();
        let runner = CallbackRunner::new(rx, registry, Arc::new(MockStates::populated()));
        let handle = tokio::spawn(runner.run(token.clone()));

        wait_for(&count, 1).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // a trigger after the burst is drained wakes the runner again
        trigger.fire();
        wait_for(&count, 2).await;

        token.cancel();
        handle.await.unwrap();
    }

    #[test(tokio::test(flavor = "multi_thread"))]
    async fn failing_and_panicking_callbacks_are_isolated() {
        let count = Arc::new(AtomicUsize::new(0));
        let registry = Arc::new(CallbackRegistry::new());
        registry
            .register(ObjectKind::Node, "always-fails", "", |_| {
                anyhow::bail!("broken consumer")
            })
            .unwrap();
        registry
            .register(ObjectKind::Node, "always-panics", "", |_| {
                panic!("consumer bug")
            })
            .unwrap();
        let counter = count.clone();
        registry
            .register(ObjectKind::Node, "counter", "", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        let (trigger, rx) = trigger(ObjectKind::Node);
        let token = CancellationToken::new();
        let runner = CallbackRunner::new(rx, registry, Arc::new(MockStates::populated()));
        let handle = tokio::spawn(runner.run(token.clone()));

        trigger.fire();
        wait_for(&count, 1).await;
        trigger.fire();
        wait_for(&count, 2).await;

        token.cancel();
        handle.await.unwrap();
    }

    #[test(tokio::test(flavor = "multi_thread"))]
    async fn callbacks_skipped_until_state_is_observed() {
        let count = Arc::new(AtomicUsize::new(0));
        let registry = counting_registry(ObjectKind::Node, count.clone());
        let (trigger, rx) = trigger(ObjectKind::Node);
        let token = CancellationToken::new();
        let runner = CallbackRunner::new(rx, registry, Arc::new(MockStates::default()));
        let handle = tokio::spawn(runner.run(token.clone()));

        trigger.fire();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        token.cancel();
        handle.await.unwrap();
    }

    #[test(tokio::test)]
    async fn runner_stops_on_cancellation() {
        let (_trigger, rx) = trigger(ObjectKind::Node);
        let token = CancellationToken::new();
        token.cancel();
        let runner = CallbackRunner::new(
            rx,
            Arc::new(CallbackRegistry::new()),
            Arc::new(MockStates::default()),
        );
        tokio::time::timeout(Duration::from_secs(1), runner.run(token))
            .await
            .unwrap();
    }

    #[test]
    fn notifier_routes_by_kind() {
        let (notifier, mut receivers) = UpdateNotifier::new();
        notifier.notify(ObjectKind::NodeSlo);
        notifier.notify(ObjectKind::Pods);

        let kinds: Vec<_> = receivers.iter().map(TriggerReceiver::kind).collect();
        assert_eq!(kinds, vec![ObjectKind::Node, ObjectKind::NodeSlo]);
        assert!(!receivers[0].try_recv());
        assert!(receivers[1].try_recv());
    }
}
