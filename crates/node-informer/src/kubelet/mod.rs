//! Kubelet client boundary.
//!
//! The informer polls the kubelet's `/pods` endpoint for the pods running on
//! this node. [`resolve_endpoint`] derives where the kubelet listens from the
//! synced node object; a [`KubeletConnector`] turns that endpoint into a
//! [`KubeletStub`].

pub mod http;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use error_stack::Report;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::api::core::v1::Pod;
use tracing::warn;

use crate::error::InformerError;
use crate::error::KubeletError;

pub use http::HttpKubeletConnector;
pub use http::HttpKubeletStub;

/// Node address types understood by the informer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeAddressType {
    Hostname,
    ExternalIp,
    InternalIp,
    ExternalDns,
    InternalDns,
}

impl NodeAddressType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hostname => "Hostname",
            Self::ExternalIp => "ExternalIP",
            Self::InternalIp => "InternalIP",
            Self::ExternalDns => "ExternalDNS",
            Self::InternalDns => "InternalDNS",
        }
    }

    /// Parse a preferred address type, falling back to `InternalIP` when it is
    /// empty or unsupported.
    pub fn parse_or_default(preferred: &str) -> Self {
        preferred.parse().unwrap_or_else(|_| {
            warn!(
                preferred = %preferred,
                "wrong address type or empty type, InternalIP will be used"
            );
            Self::InternalIp
        })
    }
}

impl FromStr for NodeAddressType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Hostname" => Ok(Self::Hostname),
            "ExternalIP" => Ok(Self::ExternalIp),
            "InternalIP" => Ok(Self::InternalIp),
            "ExternalDNS" => Ok(Self::ExternalDns),
            "InternalDNS" => Ok(Self::InternalDns),
            other => Err(format!("unsupported node address type {other:?}")),
        }
    }
}

impl fmt::Display for NodeAddressType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the kubelet of this node can be reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KubeletEndpoint {
    pub address: String,
    pub port: i32,
}

impl fmt::Display for KubeletEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.address.contains(':') {
            write!(f, "[{}]:{}", self.address, self.port)
        } else {
            write!(f, "{}:{}", self.address, self.port)
        }
    }
}

/// Resolve the kubelet endpoint from the node status.
///
/// # Errors
///
/// - [`InformerError::NodeAddressNotFound`] if the node reports no address of
///   the selected type
pub fn resolve_endpoint(
    node: &Node,
    preferred: NodeAddressType,
) -> Result<KubeletEndpoint, Report<InformerError>> {
    let status = node.status.as_ref();
    let address = status
        .and_then(|s| s.addresses.as_ref())
        .and_then(|addresses| {
            addresses
                .iter()
                .find(|a| a.type_ == preferred.as_str())
                .map(|a| a.address.clone())
        })
        .ok_or_else(|| {
            Report::new(InformerError::NodeAddressNotFound {
                address_type: preferred.to_string(),
            })
        })?;
    let port = status
        .and_then(|s| s.daemon_endpoints.as_ref())
        .and_then(|d| d.kubelet_endpoint.as_ref())
        .map(|e| e.port)
        .unwrap_or_default();

    Ok(KubeletEndpoint { address, port })
}

/// Client of the kubelet status endpoint.
#[async_trait::async_trait]
pub trait KubeletStub: Send + Sync {
    /// All pods the kubelet currently knows about.
    async fn get_all_pods(&self) -> Result<Vec<Pod>, Report<KubeletError>>;
}

/// Builds a [`KubeletStub`] for a resolved endpoint.
pub trait KubeletConnector: Send + Sync {
    fn connect(
        &self,
        endpoint: &KubeletEndpoint,
    ) -> Result<Arc<dyn KubeletStub>, Report<KubeletError>>;
}
