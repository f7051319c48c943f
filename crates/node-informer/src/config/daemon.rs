use std::path::PathBuf;

use clap::Parser;

use crate::pod_meta::CgroupDriver;

pub const DEFAULT_TOKEN_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
pub const DEFAULT_CGROUP_ROOT_DIR: &str = "/host-cgroup/";

#[derive(Parser, Debug, Clone)]
pub struct DaemonArgs {
    #[arg(
        long,
        env = "NODE_NAME",
        help = "Name of the node this informer runs on"
    )]
    pub node_name: String,

    #[arg(
        long,
        env = "KUBECONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to kubeconfig file (defaults to cluster config or ~/.kube/config)"
    )]
    pub kubeconfig: Option<PathBuf>,

    #[arg(
        long,
        default_value = "InternalIP",
        help = "Node address type used to reach the kubelet: Hostname, ExternalIP, InternalIP, ExternalDNS or InternalDNS"
    )]
    pub kubelet_preferred_address_type: String,

    #[arg(
        long,
        default_value_t = 1,
        allow_negative_numbers = true,
        help = "Interval in seconds between two pod lists from the kubelet, must be positive"
    )]
    pub kubelet_sync_interval_seconds: i64,

    #[arg(
        long,
        default_value_t = 3,
        help = "Timeout in seconds of a single kubelet request"
    )]
    pub kubelet_sync_timeout_seconds: u64,

    #[arg(
        long,
        default_value_t = 300,
        help = "Timeout in seconds to wait for each state source to finish its first sync"
    )]
    pub cache_sync_timeout_seconds: u64,

    #[arg(
        long,
        default_value = DEFAULT_TOKEN_PATH,
        value_hint = clap::ValueHint::FilePath,
        help = "Service account token used to authenticate against the kubelet"
    )]
    pub token_path: PathBuf,

    #[arg(
        long,
        default_value = DEFAULT_CGROUP_ROOT_DIR,
        value_hint = clap::ValueHint::DirPath,
        help = "Host cgroup root mounted into the container"
    )]
    pub cgroup_root_dir: PathBuf,

    #[arg(
        long,
        value_enum,
        default_value_t = CgroupDriver::Cgroupfs,
        help = "Cgroup driver of the kubelet"
    )]
    pub cgroup_driver: CgroupDriver,
}
