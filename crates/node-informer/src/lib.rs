//! Node-local state informer.
//!
//! Keeps an in-process view of the local node, its `NodeSLO` policy object and
//! the pods the kubelet runs, and notifies registered callbacks when that view
//! changes. See [`informer::NodeInformer`] for the entry point.

pub mod apis;
pub mod cache;
pub mod callback;
pub mod config;
pub mod error;
pub mod informer;
pub mod kube_client;
pub mod kubelet;
pub mod mock;
pub mod pleg;
pub mod pod_meta;
pub mod pod_tracker;
pub mod runner;
pub mod states;

pub use callback::ObjectKind;
pub use error::InformerError;
pub use informer::InformerSources;
pub use informer::NodeInformer;
pub use states::StatesReader;
