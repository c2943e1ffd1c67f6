use nori_connectors::aggregation::reduce_aggregation;
use nori_workflow_types::{
    log::Log,
    pushdown::{AggregationDescriptor, Pushdown},
    step::WorkflowStep,
    summarize::{Reduce, Reducer, ReducerSpec},
};
use tracing::debug;

use super::{Optimization, PushdownConfig, ReadPlan, is_time_field};

/// Runs a reduce inside the store, one time window per request. Only plain counts are
/// pushed, anything else keeps running in the pipeline.
pub struct PushReduceIntoRead {
    config: PushdownConfig,
}

impl PushReduceIntoRead {
    pub fn new(config: PushdownConfig) -> Self {
        Self { config }
    }

    fn descriptor(&self, reduce: &Reduce) -> Option<AggregationDescriptor> {
        if reduce.groupby.iter().any(|field| is_time_field(field)) {
            debug!("Not pushing reduce grouped by time");
            return None;
        }
        if !reduce.groupby.is_empty() && reduce.forget == Some(false) {
            debug!("Not pushing grouped reduce that keeps previous groups");
            return None;
        }

        let specs = reduce
            .exprs
            .iter()
            .map(|expr| expr.to_spec())
            .collect::<Option<Vec<ReducerSpec>>>()?;
        // Every count would read the same bucket doc_count, so only one can be named.
        if specs.len() > 1 {
            debug!(count = specs.len(), "Not pushing reduce with more than one reducer");
            return None;
        }
        for spec in &specs {
            if is_time_field(&spec.target_field)
                || spec.reducer != Reducer::Count
                || spec.arg_field.is_some()
            {
                debug!(field = %spec.target_field, "Not pushing reduce, only count() is pushed");
                return None;
            }
        }

        if reduce.every.is_some_and(|every| every.is_calendar())
            || reduce.on.is_some_and(|on| on.is_calendar())
        {
            debug!("Not pushing reduce over calendar windows");
            return None;
        }
        if reduce.every.is_some_and(|every| every.is_empty()) {
            debug!("Not pushing reduce over windows with no width");
            return None;
        }

        let es_aggr = reduce_aggregation(
            &reduce.groupby,
            &specs,
            reduce.every.as_ref(),
            reduce.on.as_ref(),
            &self.config.time_field,
            self.config.bucket_sizes,
        )?;

        let mut empty_result = Log::new();
        for spec in &specs {
            empty_result.insert(spec.target_field.clone(), spec.reducer.identity());
        }

        Some(AggregationDescriptor {
            es_aggr,
            count_field: specs.first().map(|spec| spec.target_field.clone()),
            empty_result,
            grouping: reduce.groupby.clone(),
            reduce_every: reduce.every,
            reduce_on: reduce.on,
            empty_fields: Vec::new(),
        })
    }
}

impl Optimization for PushReduceIntoRead {
    fn apply(&self, step: &WorkflowStep, plan: &ReadPlan) -> Option<ReadPlan> {
        let WorkflowStep::Reduce(reduce) = step else {
            return None;
        };
        if !matches!(plan.pushdown, Pushdown::None) {
            return None;
        }

        Some(ReadPlan {
            filter: plan.filter.clone(),
            pushdown: Pushdown::Reduce(self.descriptor(reduce)?),
        })
    }
}
