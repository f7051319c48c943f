use std::borrow::Cow;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ClusterResourceScope;
use serde::Deserialize;
use serde::Serialize;

/// Thresholds applied to best-effort workloads on the node.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceThresholdStrategy {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable: Option<bool>,
    /// Upper bound of node CPU usage (percent) before best-effort pods are suppressed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_suppress_threshold_percent: Option<i64>,
    /// `cpuset` or `cfsQuota`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_suppress_policy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_evict_threshold_percent: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_evict_lower_percent: Option<i64>,
    #[serde(
        rename = "cpuEvictBESatisfactionUpperPercent",
        skip_serializing_if = "Option::is_none"
    )]
    pub cpu_evict_be_satisfaction_upper_percent: Option<i64>,
    #[serde(
        rename = "cpuEvictBESatisfactionLowerPercent",
        skip_serializing_if = "Option::is_none"
    )]
    pub cpu_evict_be_satisfaction_lower_percent: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSloSpec {
    #[serde(
        rename = "resourceUsedThresholdWithBE",
        skip_serializing_if = "Option::is_none"
    )]
    pub resource_used_threshold_with_be: Option<ResourceThresholdStrategy>,
    #[serde(rename = "resourceQOSStrategy", skip_serializing_if = "Option::is_none")]
    pub resource_qos_strategy: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_burst_strategy: Option<serde_json::Value>,
}

/// Node-scoped QoS/colocation policy, `slo.koordinator.sh/v1alpha1` `NodeSLO`.
///
/// Cluster scoped and named after the node it applies to.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct NodeSlo {
    pub metadata: ObjectMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<NodeSloSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<serde_json::Value>,
}

impl kube::Resource for NodeSlo {
    type DynamicType = ();
    type Scope = ClusterResourceScope;

    fn group(_dt: &()) -> Cow<'_, str> {
        "slo.koordinator.sh".into()
    }

    fn version(_dt: &()) -> Cow<'_, str> {
        "v1alpha1".into()
    }

    fn kind(_dt: &()) -> Cow<'_, str> {
        "NodeSLO".into()
    }

    fn plural(_dt: &()) -> Cow<'_, str> {
        "nodeslos".into()
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}
