use std::sync::Arc;

use color_eyre::eyre::Result;
use nori_connectors::{
    RowBatchTryStream,
    elasticsearch::ElasticsearchConfig,
    query::TimeRange,
    read::{ReadRequest, read},
    search::Search,
};
use nori_optimizations::{Optimized, Optimizer, PushdownConfig};
use nori_workflow_types::step::WorkflowStep;
use tracing::{info, instrument};

/// A read started for a pipeline, and the steps that still have to run over its rows.
pub struct PlannedRead {
    pub stream: RowBatchTryStream,
    pub remaining: Vec<WorkflowStep>,
}

/// Pushes what it can of `steps` into a read of `range` and starts that read.
#[instrument(skip_all, fields(range = %range))]
pub fn plan_read(
    store: Arc<dyn Search>,
    config: &ElasticsearchConfig,
    range: TimeRange,
    steps: Vec<WorkflowStep>,
) -> Result<PlannedRead> {
    let Optimized { plan, steps } = Optimizer::new(PushdownConfig::from(config)).optimize(steps);
    info!(
        pushdown = %plan.pushdown,
        remaining = steps.len(),
        "Planned read"
    );

    let mut request = ReadRequest::new(range).with_pushdown(plan.pushdown);
    if let Some(filter) = plan.filter {
        request = request.with_filter(filter);
    }

    Ok(PlannedRead {
        stream: read(store, config, request)?,
        remaining: steps,
    })
}
