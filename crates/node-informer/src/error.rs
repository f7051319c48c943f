//! Error types of the node informer.

use core::error::Error;

use crate::callback::ObjectKind;

/// Errors raised while wiring or running the node informer.
#[derive(Debug, derive_more::Display)]
pub enum InformerError {
    #[display("callback registration with kind {kind} is illegal")]
    IllegalCallbackKind { kind: ObjectKind },
    #[display("callback {name} is already registered for kind {kind}")]
    DuplicateCallback { kind: ObjectKind, name: String },
    #[display("kubelet sync interval must be positive, got {seconds}s")]
    InvalidSyncInterval { seconds: i64 },
    #[display("{what} timeout must be positive")]
    InvalidTimeout { what: &'static str },
    #[display("timed out after {seconds}s waiting for {what} to sync")]
    CacheSyncTimeout { what: &'static str, seconds: u64 },
    #[display("node {node_name} is not present in the synced cache")]
    NodeNotFound { node_name: String },
    #[display("node has no address of type {address_type}")]
    NodeAddressNotFound { address_type: String },
    #[display("failed to connect to kubelet at {endpoint}")]
    KubeletConnectFailed { endpoint: String },
    #[display("node informer is already running")]
    AlreadyRunning,
    #[display("failed to connect to Kubernetes API: {message}")]
    ConnectionFailed { message: String },
}

impl Error for InformerError {}

/// Errors returned by kubelet clients.
#[derive(Debug, derive_more::Display)]
pub enum KubeletError {
    #[display("failed to read kubelet token from {path}")]
    TokenRead { path: String },
    #[display("failed to build kubelet HTTP client")]
    ClientBuild,
    #[display("kubelet request to {url} failed")]
    Request { url: String },
    #[display("kubelet responded {status} for {url}")]
    Status { url: String, status: u16 },
    #[display("failed to decode kubelet pod list")]
    Decode,
    #[display("kubelet request timed out after {seconds}s")]
    Timeout { seconds: u64 },
}

impl Error for KubeletError {}
