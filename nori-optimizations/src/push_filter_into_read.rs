use nori_connectors::filter::compile_filter;
use nori_workflow_types::{expr::Expr, pushdown::Pushdown, step::WorkflowStep};

use super::{Optimization, ReadPlan};

/// Filters before any limit or reduction become part of the read's predicate.
pub struct PushFilterIntoRead;

impl Optimization for PushFilterIntoRead {
    fn apply(&self, step: &WorkflowStep, plan: &ReadPlan) -> Option<ReadPlan> {
        let WorkflowStep::Filter(expr) = step else {
            return None;
        };
        if !matches!(plan.pushdown, Pushdown::None) {
            return None;
        }
        compile_filter(expr).ok()?;

        let filter = match &plan.filter {
            Some(existing) => Expr::And(Box::new(existing.clone()), Box::new(expr.clone())),
            None => expr.clone(),
        };

        Some(ReadPlan {
            filter: Some(filter),
            pushdown: Pushdown::None,
        })
    }
}
