use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{expr::Expr, summarize::Reduce};

/// A pipeline step following a store read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStep {
    Head(u64),
    Tail(u64),
    Reduce(Reduce),
    Filter(Expr),

    /// Any step that never runs inside the store.
    Other(String),
}

impl fmt::Display for WorkflowStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkflowStep::Head(limit) => write!(f, "head {limit}"),
            WorkflowStep::Tail(limit) => write!(f, "tail {limit}"),
            WorkflowStep::Reduce(reduce) => write!(f, "{reduce}"),
            WorkflowStep::Filter(expr) => write!(f, "filter {expr}"),
            WorkflowStep::Other(name) => write!(f, "{name}"),
        }
    }
}
