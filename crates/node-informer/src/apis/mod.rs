//! Custom resource types read by the informer.

pub mod node_slo;

pub use node_slo::NodeSlo;
pub use node_slo::NodeSloSpec;
pub use node_slo::ResourceThresholdStrategy;
