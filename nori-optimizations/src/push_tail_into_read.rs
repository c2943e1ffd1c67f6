use nori_workflow_types::{pushdown::Pushdown, step::WorkflowStep};

use super::{Optimization, ReadPlan};

/// The read pages backwards from the end of the range.
pub struct PushTailIntoRead;

impl Optimization for PushTailIntoRead {
    fn apply(&self, step: &WorkflowStep, plan: &ReadPlan) -> Option<ReadPlan> {
        let WorkflowStep::Tail(limit) = step else {
            return None;
        };

        let limit = match plan.pushdown {
            Pushdown::None => *limit,
            Pushdown::Tail(existing) => std::cmp::min(existing, *limit),
            _ => return None,
        };

        Some(ReadPlan {
            filter: plan.filter.clone(),
            pushdown: Pushdown::Tail(limit),
        })
    }
}
