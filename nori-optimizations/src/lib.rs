use nori_connectors::{aggregation::BucketSizes, elasticsearch::ElasticsearchConfig};
use nori_workflow_types::{
    expr::Expr,
    log::TIME_FIELD_NAME,
    pushdown::Pushdown,
    step::WorkflowStep,
};
use tracing::{debug, info, instrument};

use push_filter_into_read::PushFilterIntoRead;
use push_head_into_read::PushHeadIntoRead;
use push_reduce_into_read::PushReduceIntoRead;
use push_tail_into_read::PushTailIntoRead;

mod push_filter_into_read;
mod push_head_into_read;
mod push_reduce_into_read;
mod push_tail_into_read;


macro_rules! opt {
    ($optimization:expr) => {
        Box::new($optimization) as Box<dyn Optimization>
    };
}

/// What the read itself will do: the predicate it filters by and the work pushed into the
/// store.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReadPlan {
    pub filter: Option<Expr>,
    pub pushdown: Pushdown,
}

/// A step is pushed into the read by returning the new plan, or left alone with `None`.
pub trait Optimization: Send + Sync {
    fn apply(&self, step: &WorkflowStep, plan: &ReadPlan) -> Option<ReadPlan>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct Optimized {
    pub plan: ReadPlan,

    /// Steps left to run after the read, in order.
    pub steps: Vec<WorkflowStep>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PushdownConfig {
    /// The store's name for the time field.
    pub time_field: String,
    pub bucket_sizes: BucketSizes,
}

impl Default for PushdownConfig {
    fn default() -> Self {
        Self {
            time_field: "@timestamp".to_string(),
            bucket_sizes: BucketSizes::default(),
        }
    }
}

impl From<&ElasticsearchConfig> for PushdownConfig {
    fn from(config: &ElasticsearchConfig) -> Self {
        Self {
            time_field: config.time_field().to_string(),
            bucket_sizes: config.bucket_sizes(),
        }
    }
}

pub struct Optimizer {
    optimizations: Vec<Box<dyn Optimization>>,
}

impl Optimizer {
    pub fn empty() -> Self {
        Self {
            optimizations: vec![],
        }
    }

    pub fn new(config: PushdownConfig) -> Self {
        Self {
            optimizations: vec![
                opt!(PushFilterIntoRead),
                opt!(PushHeadIntoRead),
                opt!(PushTailIntoRead),
                opt!(PushReduceIntoRead::new(config)),
            ],
        }
    }

    /// Pushes the longest prefix of `steps` it can into the read. Never fails, a step that
    /// can't be pushed is simply left in the pipeline along with everything after it.
    #[instrument(skip_all, name = "optimize")]
    pub fn optimize(&self, steps: Vec<WorkflowStep>) -> Optimized {
        let mut plan = ReadPlan::default();
        let mut pushed = 0;

        'steps: for step in &steps {
            for optimization in &self.optimizations {
                if let Some(next) = optimization.apply(step, &plan) {
                    info!(%step, pushdown = %next.pushdown, "Pushed step into read");
                    plan = next;
                    pushed += 1;
                    continue 'steps;
                }
            }
            debug!(%step, "Step stays in the pipeline");
            break;
        }

        Optimized {
            plan,
            steps: steps.into_iter().skip(pushed).collect(),
        }
    }
}

impl Default for Optimizer {
    fn default() -> Self {
        Self::new(PushdownConfig::default())
    }
}

fn is_time_field(field: &str) -> bool {
    field == TIME_FIELD_NAME
}
