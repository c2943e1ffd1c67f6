use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    interval::{Interval, ReduceOn},
    log::Log,
};

#[derive(Debug, Serialize, Deserialize, Default, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Asc => write!(f, "asc"),
            Direction::Desc => write!(f, "desc"),
        }
    }
}

/// Everything needed to run a grouped / time-bucketed reduction inside the store.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct AggregationDescriptor {
    /// Bucket aggregation tree sent as the request's `aggregations`.
    pub es_aggr: Map<String, Value>,
    /// Output field that receives each bucket's document count.
    pub count_field: Option<String>,
    /// Row emitted for a time window without any matching point.
    pub empty_result: Log,
    pub grouping: Vec<String>,
    pub reduce_every: Option<Interval>,
    pub reduce_on: Option<ReduceOn>,
    /// Grouping fields the store has no mapping for, emitted as null.
    pub empty_fields: Vec<String>,
}

impl AggregationDescriptor {
    pub fn is_grouped(&self) -> bool {
        !self.grouping.is_empty()
    }
}

/// What a read has been asked to do on the store's side, claimed by one strategy at most.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Pushdown {
    #[default]
    None,
    Head(u64),
    Tail(u64),
    Reduce(AggregationDescriptor),
}

impl fmt::Display for Pushdown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pushdown::None => write!(f, "none"),
            Pushdown::Head(limit) => write!(f, "head({limit})"),
            Pushdown::Tail(limit) => write!(f, "tail({limit})"),
            Pushdown::Reduce(descriptor) => {
                write!(f, "reduce(by=[{}]", descriptor.grouping.join(", "))?;
                if let Some(every) = &descriptor.reduce_every {
                    write!(f, ", every={every}")?;
                }
                write!(f, ", aggs={})", Value::Object(descriptor.es_aggr.clone()))
            }
        }
    }
}
