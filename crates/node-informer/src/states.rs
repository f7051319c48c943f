//! Read side of the informer state.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Node;

use crate::apis::NodeSlo;
use crate::cache::ObjectCache;
use crate::callback::ObjectKind;
use crate::pod_meta::PodMeta;
use crate::pod_tracker::PodTracker;

/// Read-only access to the aggregated node state.
///
/// Every accessor returns an owned copy; mutating it never affects the informer.
pub trait StatesReader: Send + Sync {
    fn has_synced(&self) -> bool;

    fn get_node(&self) -> Option<Node>;

    fn get_node_slo(&self) -> Option<NodeSlo>;

    /// All pods reported by the kubelet in the latest successful poll, in no particular order.
    fn get_all_pods(&self) -> Vec<PodMeta>;

    /// Whether an object of `kind` has been observed yet.
    fn contains(&self, kind: ObjectKind) -> bool {
        match kind {
            ObjectKind::Node => self.get_node().is_some(),
            ObjectKind::NodeSlo => self.get_node_slo().is_some(),
            ObjectKind::Pods => true,
        }
    }
}

/// The three state owners bundled behind one [`StatesReader`].
#[derive(Clone)]
pub struct StateView {
    pub(crate) node: Arc<ObjectCache<Node>>,
    pub(crate) node_slo: Arc<ObjectCache<NodeSlo>>,
    pub(crate) pods: Arc<PodTracker>,
}

impl StatesReader for StateView {
    fn has_synced(&self) -> bool {
        self.pods.has_synced() && self.node_slo.has_synced() && self.node.has_synced()
    }

    fn get_node(&self) -> Option<Node> {
        self.node.get()
    }

    fn get_node_slo(&self) -> Option<NodeSlo> {
        self.node_slo.get()
    }

    fn get_all_pods(&self) -> Vec<PodMeta> {
        self.pods.get_all_pods()
    }

    fn contains(&self, kind: ObjectKind) -> bool {
        match kind {
            ObjectKind::Node => self.node.contains(),
            ObjectKind::NodeSlo => self.node_slo.contains(),
            ObjectKind::Pods => true,
        }
    }
}
