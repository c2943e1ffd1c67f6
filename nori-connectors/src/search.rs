use std::fmt;

use async_trait::async_trait;
use color_eyre::eyre::{Result, bail};
use hashbrown::HashMap;
use nori_workflow_types::log::Log;
use serde::{Deserialize, Deserializer, de::Error as _};
use serde_json::Value;
use tracing::debug;

use crate::{
    FetchError,
    classify::{Fault, classify},
    instrumentation::instrument_operation,
};

/// The store's search endpoint. Faults are returned as `ConnectorError` reports.
#[async_trait]
pub trait Search: fmt::Debug + Send + Sync {
    /// Label used in metrics.
    fn name(&self) -> &'static str;

    async fn search(&self, indices: &[String], body: &Value) -> Result<SearchResponse>;
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct SearchResponse {
    #[serde(default)]
    pub hits: SearchHits,

    #[serde(default)]
    pub aggregations: HashMap<String, AggregationBucketsOrValue>,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct SearchHits {
    #[serde(default, deserialize_with = "deserialize_total")]
    pub total: u64,

    #[serde(default)]
    pub hits: Vec<SearchHit>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchHit {
    #[serde(rename = "_source", default)]
    pub source: Log,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AggregationBucket {
    #[serde(default)]
    pub key: Value,

    #[serde(rename = "key_as_string", default)]
    pub key_as_string: Option<String>,

    pub doc_count: u64,

    #[serde(flatten)]
    pub buckets_or_value: HashMap<String, AggregationBucketsOrValue>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
pub enum AggregationBucketsOrValue {
    Value(AggregationValue),
    Buckets(AggregationBuckets),
}

#[derive(Debug, Deserialize, Clone)]
pub struct AggregationValue {
    pub value: Value,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AggregationBuckets {
    pub buckets: Vec<AggregationBucket>,
}

/// Older stores report `hits.total` as a number, newer ones as `{"value": n}`. A total
/// that is only a lower bound is refused.
fn deserialize_total<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Total {
        Count(u64),
        Object {
            value: u64,
            #[serde(default)]
            relation: Option<String>,
        },
    }

    match Total::deserialize(deserializer)? {
        Total::Count(count) => Ok(count),
        Total::Object { value, relation } if relation.as_deref() == Some("gte") => Err(
            D::Error::custom(format!("hits.total is a lower bound ({value}), not an exact count")),
        ),
        Total::Object { value, .. } => Ok(value),
    }
}

/// Runs a search, turning absent or not yet usable indices into an empty result and every
/// other classified fault into a `FetchError`.
pub async fn search_or_empty(
    store: &dyn Search,
    indices: &[String],
    body: &Value,
    operation: &str,
) -> Result<SearchResponse> {
    let e = match instrument_operation(store.name(), operation, || store.search(indices, body))
        .await
    {
        Ok(response) => return Ok(response),
        Err(e) => e,
    };

    match classify(&e) {
        Fault::MissingIndex(index) => {
            debug!(?index, "Index does not exist, treating as empty");
            Ok(SearchResponse::default())
        }
        Fault::NewIndex => {
            debug!("Index has no active shards yet, treating as empty");
            Ok(SearchResponse::default())
        }
        Fault::MissingField(field) => bail!(FetchError::MissingField(field)),
        Fault::ResultWindowOverflow(limit) => bail!(FetchError::ResultWindowOverflow(limit)),
        Fault::ConnectionFailure(reason) => bail!(FetchError::ConnectionFailure(reason)),
        Fault::Unclassified => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn total_in_both_shapes() {
        let old: SearchResponse =
            serde_json::from_value(json!({"hits": {"total": 3, "hits": []}})).unwrap();
        assert_eq!(old.hits.total, 3);

        let new: SearchResponse = serde_json::from_value(json!({
            "hits": {"total": {"value": 7, "relation": "eq"}, "hits": []}
        }))
        .unwrap();
        assert_eq!(new.hits.total, 7);
    }

    #[test]
    fn lower_bound_total_is_refused() {
        let result = serde_json::from_value::<SearchResponse>(json!({
            "hits": {"total": {"value": 10000, "relation": "gte"}, "hits": []}
        }));
        assert!(result.is_err());
    }

    #[test]
    fn nested_aggregations() {
        let response: SearchResponse = serde_json::from_value(json!({
            "hits": {"total": 2, "hits": []},
            "aggregations": {
                "host": {
                    "doc_count_error_upper_bound": 0,
                    "sum_other_doc_count": 0,
                    "buckets": [
                        {"key": "a", "doc_count": 2, "avg_cpu": {"value": 0.5}}
                    ]
                }
            }
        }))
        .unwrap();

        let Some(AggregationBucketsOrValue::Buckets(host)) = response.aggregations.get("host")
        else {
            panic!("expected buckets");
        };
        assert_eq!(host.buckets[0].doc_count, 2);
        assert!(matches!(
            host.buckets[0].buckets_or_value.get("avg_cpu"),
            Some(AggregationBucketsOrValue::Value(v)) if v.value == json!(0.5)
        ));
    }
}
