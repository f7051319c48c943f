//! Pod metadata tracked by the informer.

use std::str::FromStr;

use k8s_openapi::api::core::v1::Container;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use serde::Deserialize;
use serde::Serialize;

/// How the kubelet lays out pod cgroups.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CgroupDriver {
    #[default]
    Cgroupfs,
    Systemd,
}

/// Kubernetes pod QoS class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum QosClass {
    Guaranteed,
    Burstable,
    BestEffort,
}

impl FromStr for QosClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Guaranteed" => Ok(Self::Guaranteed),
            "Burstable" => Ok(Self::Burstable),
            "BestEffort" => Ok(Self::BestEffort),
            other => Err(format!("unknown qos class {other}")),
        }
    }
}

impl QosClass {
    /// QoS class reported in the pod status, or computed from container resources.
    pub fn of(pod: &Pod) -> Self {
        pod.status
            .as_ref()
            .and_then(|status| status.qos_class.as_deref())
            .and_then(|class| class.parse().ok())
            .unwrap_or_else(|| Self::compute(pod))
    }

    fn compute(pod: &Pod) -> Self {
        let Some(spec) = pod.spec.as_ref() else {
            return Self::BestEffort;
        };
        let containers: Vec<&Container> = spec
            .containers
            .iter()
            .chain(spec.init_containers.iter().flatten())
            .collect();

        let mut has_any = false;
        let mut guaranteed = true;
        for container in containers {
            let resources = container.resources.as_ref();
            let requests = resources.and_then(|r| r.requests.as_ref());
            let limits = resources.and_then(|r| r.limits.as_ref());

            for name in ["cpu", "memory"] {
                let request = requests.and_then(|r| r.get(name));
                let limit = limits.and_then(|l| l.get(name));
                if request.is_some() || limit.is_some() {
                    has_any = true;
                }
                match (request, limit) {
                    // a missing request defaults to the limit
                    (None, Some(_)) => {}
                    (Some(request), Some(limit)) if quantities_equal(request, limit) => {}
                    _ => guaranteed = false,
                }
            }
        }

        if !has_any {
            Self::BestEffort
        } else if guaranteed {
            Self::Guaranteed
        } else {
            Self::Burstable
        }
    }
}

/// Compare two quantities by value, so `1000m` equals `1` and `1024Mi` equals `1Gi`.
fn quantities_equal(a: &Quantity, b: &Quantity) -> bool {
    match (quantity_nanos(a), quantity_nanos(b)) {
        (Some(a), Some(b)) => a == b,
        _ => a == b,
    }
}

/// Value of a quantity in billionths of its base unit.
fn quantity_nanos(quantity: &Quantity) -> Option<i128> {
    let s = quantity.0.trim();
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || matches!(c, '.' | '+' | '-')))
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(split);

    let (negative, number) = match number.as_bytes().first() {
        Some(b'-') => (true, &number[1..]),
        Some(b'+') => (false, &number[1..]),
        _ => (false, number),
    };
    let (int_part, frac_part) = number.split_once('.').unwrap_or((number, ""));
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }
    if !int_part.chars().chain(frac_part.chars()).all(|c| c.is_ascii_digit()) {
        return None;
    }
    let int_value: i128 = if int_part.is_empty() { 0 } else { int_part.parse().ok()? };
    // digits beyond nano precision are dropped
    let frac_digits = &frac_part[..frac_part.len().min(9)];
    let frac_value: i128 = if frac_digits.is_empty() {
        0
    } else {
        frac_digits.parse::<i128>().ok()? * 10_i128.pow(9 - frac_digits.len() as u32)
    };
    let nanos = int_value.checked_mul(1_000_000_000)?.checked_add(frac_value)?;

    let (binary, exponent): (i128, i32) = match suffix {
        "" => (1, 0),
        "Ki" => (1 << 10, 0),
        "Mi" => (1 << 20, 0),
        "Gi" => (1 << 30, 0),
        "Ti" => (1 << 40, 0),
        "Pi" => (1 << 50, 0),
        "Ei" => (1 << 60, 0),
        "n" => (1, -9),
        "u" => (1, -6),
        "m" => (1, -3),
        "k" => (1, 3),
        "M" => (1, 6),
        "G" => (1, 9),
        "T" => (1, 12),
        "P" => (1, 15),
        "E" => (1, 18),
        other => {
            let exponent = other.strip_prefix(['e', 'E'])?;
            (1, exponent.parse().ok()?)
        }
    };

    let mut value = nanos.checked_mul(binary)?;
    if exponent >= 0 {
        value = value.checked_mul(10_i128.checked_pow(exponent.unsigned_abs())?)?;
    } else {
        value /= 10_i128.checked_pow(exponent.unsigned_abs())?;
    }
    Some(if negative { -value } else { value })
}

/// One pod known to the kubelet, with its cgroup placement on this node.
#[derive(Debug, Clone, PartialEq)]
pub struct PodMeta {
    pub pod: Pod,
    /// Pod cgroup parent, relative to a cgroup subsystem root.
    pub cgroup_dir: String,
}

impl PodMeta {
    pub fn new(pod: Pod, driver: CgroupDriver) -> Self {
        let cgroup_dir = pod
            .metadata
            .uid
            .as_deref()
            .map(|uid| pod_cgroup_parent_dir(driver, QosClass::of(&pod), uid))
            .unwrap_or_default();
        Self { pod, cgroup_dir }
    }

    pub fn uid(&self) -> Option<&str> {
        self.pod.metadata.uid.as_deref()
    }

    /// `namespace/name`
    pub fn key(&self) -> String {
        format!(
            "{}/{}",
            self.pod.metadata.namespace.as_deref().unwrap_or_default(),
            self.pod.metadata.name.as_deref().unwrap_or_default()
        )
    }
}

/// Cgroup directory of the QoS tier `qos` under the kubepods root.
pub fn qos_cgroup_dir(driver: CgroupDriver, qos: QosClass) -> String {
    match (driver, qos) {
        (CgroupDriver::Cgroupfs, QosClass::Guaranteed) => "kubepods".to_string(),
        (CgroupDriver::Cgroupfs, QosClass::Burstable) => "kubepods/burstable".to_string(),
        (CgroupDriver::Cgroupfs, QosClass::BestEffort) => "kubepods/besteffort".to_string(),
        (CgroupDriver::Systemd, QosClass::Guaranteed) => "kubepods.slice".to_string(),
        (CgroupDriver::Systemd, QosClass::Burstable) => {
            "kubepods.slice/kubepods-burstable.slice".to_string()
        }
        (CgroupDriver::Systemd, QosClass::BestEffort) => {
            "kubepods.slice/kubepods-besteffort.slice".to_string()
        }
    }
}

pub fn pod_cgroup_parent_dir(driver: CgroupDriver, qos: QosClass, uid: &str) -> String {
    let qos_dir = qos_cgroup_dir(driver, qos);
    match driver {
        CgroupDriver::Cgroupfs => format!("{qos_dir}/pod{uid}"),
        CgroupDriver::Systemd => {
            let uid = uid.replace('-', "_");
            let prefix = match qos {
                QosClass::Guaranteed => "kubepods",
                QosClass::Burstable => "kubepods-burstable",
                QosClass::BestEffort => "kubepods-besteffort",
            };
            format!("{qos_dir}/{prefix}-pod{uid}.slice")
        }
    }
}

/// Extract the pod UID from a pod cgroup directory name, if it is one.
pub fn parse_pod_uid(driver: CgroupDriver, dir_name: &str) -> Option<String> {
    match driver {
        CgroupDriver::Cgroupfs => dir_name
            .strip_prefix("pod")
            .filter(|uid| !uid.is_empty())
            .map(str::to_string),
        CgroupDriver::Systemd => {
            let stem = dir_name.strip_suffix(".slice")?;
            let (_, uid) = stem.rsplit_once("-pod")?;
            (!uid.is_empty()).then(|| uid.replace('_', "-"))
        }
    }
}
