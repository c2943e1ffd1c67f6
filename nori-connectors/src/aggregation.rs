use nori_workflow_types::{
    interval::{Interval, ReduceOn},
    json,
    log::TIME_FIELD_NAME,
    pushdown::AggregationDescriptor,
    summarize::{Reducer, ReducerSpec},
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const DEFAULT_CARDINALITY_BUCKET_SIZE: u64 = 10_000;
pub const DEFAULT_BUCKET_SIZE: u64 = 1_000_000;

const SUB_AGGREGATIONS_KEY: &str = "aggregations";

/// Terms bucket sizes. Trees containing a cardinality aggregation get the smaller size as
/// the store computes those per bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketSizes {
    pub cardinality: u64,
    pub default: u64,
}

impl Default for BucketSizes {
    fn default() -> Self {
        Self {
            cardinality: DEFAULT_CARDINALITY_BUCKET_SIZE,
            default: DEFAULT_BUCKET_SIZE,
        }
    }
}

/// Store aggregation computing `reducer` over `arg_field`, `None` for reducers the store
/// cannot compute.
pub fn reducer_aggregation(reducer: &str, arg_field: &str) -> Option<Value> {
    let op = match reducer.parse::<Reducer>().ok()? {
        Reducer::Avg => "avg",
        Reducer::Count => "value_count",
        Reducer::CountUnique => "cardinality",
        Reducer::Max => "max",
        Reducer::Min => "min",
        Reducer::Sum => "sum",
    };
    Some(json!({ op: { "field": arg_field } }))
}

fn contains_cardinality(aggs: &Map<String, Value>) -> bool {
    aggs.values().any(|agg| {
        agg.get("cardinality").is_some()
            || matches!(
                agg.get(SUB_AGGREGATIONS_KEY),
                Some(Value::Object(sub)) if contains_cardinality(sub)
            )
    })
}

pub fn bucket_size_for(sub_aggregation: &Map<String, Value>, sizes: BucketSizes) -> u64 {
    if contains_cardinality(sub_aggregation) {
        sizes.cardinality
    } else {
        sizes.default
    }
}

fn with_sub_aggregations(mut node: Map<String, Value>, sub: Map<String, Value>) -> Value {
    if !sub.is_empty() {
        node.insert(SUB_AGGREGATIONS_KEY.to_string(), Value::Object(sub));
    }
    Value::Object(node)
}

/// Nests one terms bucket per group field around `sub_aggregation`, the first field
/// outermost.
pub fn bucket_aggregation(
    group_fields: &[String],
    sub_aggregation: Map<String, Value>,
    sizes: BucketSizes,
) -> Map<String, Value> {
    let size = bucket_size_for(&sub_aggregation, sizes);

    let mut current = sub_aggregation;
    for field in group_fields.iter().rev() {
        let mut terms = Map::new();
        terms.insert(
            "terms".to_string(),
            json!({
                "field": field,
                "size": size,
            }),
        );

        let mut wrapper = Map::new();
        wrapper.insert(field.clone(), with_sub_aggregations(terms, current));
        current = wrapper;
    }
    current
}

/// Time buckets of width `every` keyed under the time dimension's name. `None` when the
/// width or the offset can't be expressed natively.
pub fn date_histogram_aggregation(
    time_field: &str,
    every: &Interval,
    on: Option<&ReduceOn>,
    sub_aggregation: Map<String, Value>,
) -> Option<Map<String, Value>> {
    let mut histogram = Map::new();
    histogram.insert("field".to_string(), Value::from(time_field));
    histogram.insert("min_doc_count".to_string(), Value::from(0));

    match every {
        Interval::Millis(ms) => {
            histogram.insert("fixed_interval".to_string(), Value::from(format!("{ms}ms")));
        }
        Interval::Months(..) => {
            let token = every.native_calendar_token()?;
            histogram.insert("calendar_interval".to_string(), Value::from(token));
        }
    }

    if let Some(on) = on {
        if on.is_calendar() {
            return None;
        }
        let offset = on.offset_millis(every)?;
        if offset != 0 {
            histogram.insert("offset".to_string(), Value::from(format!("{offset}ms")));
        }
    }

    let mut node = Map::new();
    node.insert("date_histogram".to_string(), Value::Object(histogram));

    let mut wrapper = Map::new();
    wrapper.insert(
        TIME_FIELD_NAME.to_string(),
        with_sub_aggregations(node, sub_aggregation),
    );
    Some(wrapper)
}

/// The full aggregation tree of a reduction: reducer leaves, optionally wrapped by a date
/// histogram, wrapped by the group-by buckets.
pub fn reduce_aggregation(
    grouping: &[String],
    reducers: &[ReducerSpec],
    every: Option<&Interval>,
    on: Option<&ReduceOn>,
    time_field: &str,
    sizes: BucketSizes,
) -> Option<Map<String, Value>> {
    let mut leaves = Map::new();
    for spec in reducers {
        let Some(arg_field) = &spec.arg_field else {
            // Bare counts read the bucket's document count.
            if spec.reducer == Reducer::Count {
                continue;
            }
            return None;
        };
        leaves.insert(
            spec.target_field.clone(),
            reducer_aggregation(&spec.reducer.to_string(), arg_field)?,
        );
    }

    let leaf = match every {
        Some(every) => date_histogram_aggregation(time_field, every, on, leaves)?,
        None => leaves,
    };

    Some(bucket_aggregation(grouping, leaf, sizes))
}

/// Walks the group-by path of `grouping` down to the subtree below the last bucket.
fn leaf_aggregation(es_aggr: &Map<String, Value>, grouping: &[String]) -> Map<String, Value> {
    let mut current = es_aggr;
    for field in grouping {
        match current
            .get(field)
            .and_then(|node| node.get(SUB_AGGREGATIONS_KEY))
            .and_then(Value::as_object)
        {
            Some(sub) => current = sub,
            None => return Map::new(),
        }
    }
    current.clone()
}

/// Drops a grouping field the store has no mapping for: the field is reported as null
/// from now on and the buckets are rebuilt around the same leaves. `None` when the field
/// isn't grouped on, so dropping it can't help.
pub fn remove_field(
    descriptor: &AggregationDescriptor,
    field: &str,
    sizes: BucketSizes,
) -> Option<AggregationDescriptor> {
    if !descriptor.grouping.iter().any(|f| f == field) {
        return None;
    }

    let leaf = leaf_aggregation(&descriptor.es_aggr, &descriptor.grouping);

    let mut removed = descriptor.clone();
    removed.grouping.retain(|f| f != field);
    if !removed.empty_fields.iter().any(|f| f == field) {
        removed.empty_fields.push(field.to_string());
    }
    removed.es_aggr = bucket_aggregation(&removed.grouping, leaf, sizes);
    Some(removed)
}

/// Whether the tree holds a date histogram under the time dimension's name, at any depth.
pub fn has_date_histogram(es_aggr: &Map<String, Value>) -> bool {
    es_aggr.iter().any(|(name, node)| {
        (name == TIME_FIELD_NAME && node.get("date_histogram").is_some())
            || matches!(
                node.get(SUB_AGGREGATIONS_KEY),
                Some(Value::Object(sub)) if has_date_histogram(sub)
            )
    })
}
