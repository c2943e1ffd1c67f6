pub mod pipeline;

pub use nori_common as common;
pub use nori_connectors as connectors;
pub use nori_optimizations as optimizations;
pub use nori_workflow_types as workflow_types;
