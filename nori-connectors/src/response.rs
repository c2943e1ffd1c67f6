use color_eyre::eyre::{Context, Result, bail, eyre};
use hashbrown::HashMap;
use nori_common::time_utils::{format_rfc3339, from_millis, value_to_datetime};
use nori_workflow_types::{
    log::{Log, TIME_FIELD_NAME},
    pushdown::AggregationDescriptor,
};
use serde_json::Value;

use crate::{
    FetchError,
    aggregation::has_date_histogram,
    search::{AggregationBucket, AggregationBucketsOrValue, SearchResponse},
};

struct DecodeContext<'a> {
    descriptor: &'a AggregationDescriptor,
    /// Group-by fields, followed by the time dimension when a date histogram is present.
    keys: Vec<&'a str>,
    time_bucketed: bool,
}

impl DecodeContext<'_> {
    fn leaf_row(
        &self,
        values: &HashMap<String, AggregationBucketsOrValue>,
        doc_count: u64,
        keys_stack: &[(&str, Value)],
    ) -> Log {
        let mut log = Log::new();

        for (name, value) in values {
            if let AggregationBucketsOrValue::Value(value) = value {
                log.insert(name.clone(), value.value.clone());
            }
        }
        if let Some(count_field) = &self.descriptor.count_field {
            log.insert(count_field.clone(), Value::from(doc_count));
        }
        for field in &self.descriptor.empty_fields {
            log.insert(field.clone(), Value::Null);
        }
        for (key, value) in keys_stack {
            log.insert(key.to_string(), value.clone());
        }

        log
    }

    fn bucket_key(&self, key: &str, bucket: &AggregationBucket) -> Result<Value> {
        if self.time_bucketed && key == TIME_FIELD_NAME {
            // Histogram keys are epoch millis, `key_as_string` covers stores that key by date.
            let dt = match (bucket.key.as_i64(), &bucket.key_as_string) {
                (Some(millis), _) => from_millis(millis),
                (None, Some(formatted)) => value_to_datetime(&Value::from(formatted.as_str())),
                (None, None) => value_to_datetime(&bucket.key),
            }
            .map_err(|e| eyre!("parse time bucket key: {e}"))?;
            return Ok(Value::from(format_rfc3339(dt)));
        }
        Ok(bucket.key.clone())
    }

    fn parse_buckets<'k>(
        &'k self,
        buckets_or_value: &HashMap<String, AggregationBucketsOrValue>,
        level: usize,
        keys_stack: &mut Vec<(&'k str, Value)>,
        logs: &mut Vec<Log>,
    ) -> Result<()> {
        let key = self.keys[level];
        let Some(node) = buckets_or_value.get(key) else {
            bail!("aggregation '{key}' not found in response");
        };
        let AggregationBucketsOrValue::Buckets(buckets) = node else {
            bail!("expected buckets for '{key}', not a value");
        };

        if buckets.buckets.is_empty() {
            // No time buckets is just an empty window, no buckets for a group-by field
            // means the field isn't mapped.
            if self.time_bucketed && key == TIME_FIELD_NAME {
                return Ok(());
            }
            bail!(FetchError::MissingField(key.to_string()));
        }

        let is_leaf = level + 1 == self.keys.len();
        for bucket in &buckets.buckets {
            keys_stack.push((key, self.bucket_key(key, bucket)?));

            if is_leaf {
                let skip_empty = self.time_bucketed
                    && self.descriptor.is_grouped()
                    && bucket.doc_count == 0;
                if !skip_empty {
                    let row =
                        self.leaf_row(&bucket.buckets_or_value, bucket.doc_count, keys_stack);
                    logs.push(row);
                }
            } else {
                self.parse_buckets(&bucket.buckets_or_value, level + 1, keys_stack, logs)?;
            }

            keys_stack.pop();
        }

        Ok(())
    }
}

/// Flattens an aggregation response into one row per leaf bucket, or a single row when
/// nothing is grouped or time bucketed.
pub fn rows_from_response(
    response: &SearchResponse,
    descriptor: &AggregationDescriptor,
) -> Result<Vec<Log>> {
    let time_bucketed = has_date_histogram(&descriptor.es_aggr);

    let mut keys: Vec<&str> = descriptor.grouping.iter().map(String::as_str).collect();
    if time_bucketed {
        keys.push(TIME_FIELD_NAME);
    }

    let context = DecodeContext {
        descriptor,
        keys,
        time_bucketed,
    };

    let mut logs = Vec::new();
    if context.keys.is_empty() {
        logs.push(context.leaf_row(&response.aggregations, response.hits.total, &[]));
    } else {
        context
            .parse_buckets(&response.aggregations, 0, &mut Vec::new(), &mut logs)
            .context("parse aggregation response")?;
    }

    if logs.iter().any(|log| log.contains_key(TIME_FIELD_NAME)) {
        logs.sort_by_cached_key(|log| {
            log.get(TIME_FIELD_NAME)
                .and_then(|time| value_to_datetime(time).ok())
        });
    }

    Ok(logs)
}
