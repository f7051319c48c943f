//! Pod lifecycle event sources.
//!
//! A lifecycle source reports new pods long before the next kubelet poll
//! would. The pod tracker subscribes with a [`PodAddedHandler`] and requests an
//! extra poll whenever it fires.

pub mod cgroup;

use std::collections::BTreeMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use tracing::debug;

pub use cgroup::CgroupPleg;

/// Invoked with the pod UID when a new pod shows up on the node.
pub type PodAddedHandler = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, derive_more::Display)]
#[display("handler-{_0}")]
pub struct HandlerId(u64);

pub trait PodLifecycleSource: Send + Sync {
    fn add_handler(&self, handler: PodAddedHandler) -> HandlerId;
    fn remove_handler(&self, id: HandlerId);
}

/// Registration of a handler that is removed again when the guard is dropped.
pub struct HandlerGuard {
    source: Arc<dyn PodLifecycleSource>,
    id: HandlerId,
}

impl HandlerGuard {
    pub fn register(source: Arc<dyn PodLifecycleSource>, handler: PodAddedHandler) -> Self {
        let id = source.add_handler(handler);
        debug!(%id, "pod added handler registered");
        Self { source, id }
    }
}

impl Drop for HandlerGuard {
    fn drop(&mut self) {
        self.source.remove_handler(self.id);
        debug!(id = %self.id, "pod added handler removed");
    }
}

/// Handler table shared by the lifecycle source implementations.
#[derive(Default)]
pub struct Handlers {
    next_id: AtomicU64,
    handlers: Mutex<BTreeMap<HandlerId, PodAddedHandler>>,
}

impl Handlers {
    pub fn add(&self, handler: PodAddedHandler) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, handler);
        id
    }

    pub fn remove(&self, id: HandlerId) {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    pub fn len(&self) -> usize {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke every handler with `pod_uid`, in registration order.
    pub fn dispatch(&self, pod_uid: &str) {
        // handlers may take their own locks, never call them under ours
        let handlers: Vec<PodAddedHandler> = self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for handler in handlers {
            handler(pod_uid);
        }
    }
}
