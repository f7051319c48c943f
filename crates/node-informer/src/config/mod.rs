pub mod cli;
pub mod daemon;

use std::path::PathBuf;
use std::time::Duration;

use error_stack::Report;

use crate::error::InformerError;
use crate::kubelet::NodeAddressType;
use crate::pod_meta::CgroupDriver;

pub use cli::*;
pub use daemon::*;

/// Runtime configuration of the node informer.
#[derive(Debug, Clone)]
pub struct InformerConfig {
    pub node_name: String,
    pub kubelet_preferred_address_type: NodeAddressType,
    pub kubelet_sync_interval_seconds: i64,
    /// Timeout of a single kubelet request.
    pub kubelet_sync_timeout: Duration,
    /// Bound of every readiness barrier during startup.
    pub cache_sync_timeout: Duration,
    pub token_path: PathBuf,
    pub cgroup_root_dir: PathBuf,
    pub cgroup_driver: CgroupDriver,
}

impl InformerConfig {
    /// Defaults for `node_name`, matching the daemon flags.
    pub fn for_node(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            kubelet_preferred_address_type: NodeAddressType::InternalIp,
            kubelet_sync_interval_seconds: 1,
            kubelet_sync_timeout: Duration::from_secs(3),
            cache_sync_timeout: Duration::from_secs(300),
            token_path: PathBuf::from(DEFAULT_TOKEN_PATH),
            cgroup_root_dir: PathBuf::from(DEFAULT_CGROUP_ROOT_DIR),
            cgroup_driver: CgroupDriver::default(),
        }
    }

    /// # Errors
    ///
    /// - [`InformerError::InvalidSyncInterval`] if the kubelet sync interval is
    ///   not positive
    /// - [`InformerError::InvalidTimeout`] if the kubelet request timeout or the
    ///   cache sync timeout is zero
    pub fn validate(&self) -> Result<(), Report<InformerError>> {
        if self.kubelet_sync_interval_seconds <= 0 {
            return Err(Report::new(InformerError::InvalidSyncInterval {
                seconds: self.kubelet_sync_interval_seconds,
            }));
        }
        if self.kubelet_sync_timeout.is_zero() {
            return Err(Report::new(InformerError::InvalidTimeout {
                what: "kubelet sync",
            }));
        }
        if self.cache_sync_timeout.is_zero() {
            return Err(Report::new(InformerError::InvalidTimeout { what: "cache sync" }));
        }
        Ok(())
    }

    /// Kubelet poll interval. Zero when the configured value is not positive.
    pub fn kubelet_sync_interval(&self) -> Duration {
        Duration::from_secs(self.kubelet_sync_interval_seconds.max(0).unsigned_abs())
    }
}

impl From<&DaemonArgs> for InformerConfig {
    fn from(args: &DaemonArgs) -> Self {
        Self {
            node_name: args.node_name.clone(),
            kubelet_preferred_address_type: NodeAddressType::parse_or_default(
                &args.kubelet_preferred_address_type,
            ),
            kubelet_sync_interval_seconds: args.kubelet_sync_interval_seconds,
            kubelet_sync_timeout: Duration::from_secs(args.kubelet_sync_timeout_seconds),
            cache_sync_timeout: Duration::from_secs(args.cache_sync_timeout_seconds),
            token_path: args.token_path.clone(),
            cgroup_root_dir: args.cgroup_root_dir.clone(),
            cgroup_driver: args.cgroup_driver,
        }
    }
}
