use nori_workflow_types::{pushdown::Pushdown, step::WorkflowStep};

use super::{Optimization, ReadPlan};

pub struct PushHeadIntoRead;

impl Optimization for PushHeadIntoRead {
    fn apply(&self, step: &WorkflowStep, plan: &ReadPlan) -> Option<ReadPlan> {
        let WorkflowStep::Head(limit) = step else {
            return None;
        };

        let limit = match plan.pushdown {
            Pushdown::None => *limit,
            Pushdown::Head(existing) => std::cmp::min(existing, *limit),
            _ => return None,
        };

        Some(ReadPlan {
            filter: plan.filter.clone(),
            pushdown: Pushdown::Head(limit),
        })
    }
}
