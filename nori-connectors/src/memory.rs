use std::{cmp::Ordering, collections::BTreeMap};

use async_trait::async_trait;
use color_eyre::eyre::{Context, Result, bail};
use hashbrown::{HashMap, HashSet};
use nori_common::{
    humantime_utils::parse_millis,
    metrics::CONNECTOR_MEMORY,
    time_utils::{
        floor_millis, format_rfc3339, from_millis, to_millis, truncate_millis, value_to_datetime,
    },
};
use nori_workflow_types::{json, log::Log};
use parking_lot::RwLock;
use serde_json::{Map, Value};

use crate::{
    ConnectorError,
    search::{Search, SearchResponse},
};

const DEFAULT_MAX_RESULT_WINDOW: u64 = 10000;
const DEFAULT_SIZE: u64 = 10;

type Storage = HashMap<String, Vec<Log>>;

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRequest {
    pub indices: Vec<String>,
    pub body: Value,
}

/// An in-memory store answering the subset of the search language this crate sends.
/// Every request is recorded.
#[derive(Debug)]
pub struct MemoryStore {
    storage: RwLock<Storage>,
    requests: RwLock<Vec<RecordedRequest>>,
    max_result_window: u64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            storage: RwLock::new(HashMap::new()),
            requests: RwLock::new(Vec::new()),
            max_result_window: DEFAULT_MAX_RESULT_WINDOW,
        }
    }

    pub fn with_max_result_window(mut self, max_result_window: u64) -> Self {
        self.max_result_window = max_result_window;
        self
    }

    pub fn insert(&self, index: &str, logs: impl IntoIterator<Item = Log>) {
        self.storage
            .write()
            .entry(index.to_string())
            .or_default()
            .extend(logs);
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.read().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.read().len()
    }

    fn evaluate(&self, indices: &[String], body: &Value) -> Result<Value> {
        let storage = self.storage.read();
        let names = resolve_indices(&storage, indices)?;

        let from = body.get("from").and_then(Value::as_u64).unwrap_or(0);
        let size = body.get("size").and_then(Value::as_u64).unwrap_or(DEFAULT_SIZE);
        if from + size > self.max_result_window {
            bail!(server_error(
                400,
                "illegal_argument_exception",
                &format!(
                    "Result window is too large, from + size must be less than or equal to: \
                     [{}] but was [{}]. See the scroll api for a more efficient way to request \
                     large data sets.",
                    self.max_result_window,
                    from + size
                ),
            ));
        }

        let mut matched: Vec<(&str, &Log)> = Vec::new();
        for name in &names {
            let Some(logs) = storage.get(name.as_str()) else {
                continue;
            };
            for log in logs {
                let is_match = match body.get("query") {
                    Some(query) => matches(log, query)?,
                    None => true,
                };
                if is_match {
                    matched.push((name.as_str(), log));
                }
            }
        }

        if let Some(sort) = body.get("sort") {
            let (field, descending) = parse_sort(sort)?;
            matched.sort_by(|(_, a), (_, b)| {
                let order = match (lookup(a, field), lookup(b, field)) {
                    (Some(a), Some(b)) => compare_values(a, b).unwrap_or(Ordering::Equal),
                    (Some(_), None) => return Ordering::Less,
                    (None, Some(_)) => return Ordering::Greater,
                    (None, None) => Ordering::Equal,
                };
                if descending { order.reverse() } else { order }
            });
        }

        let hits: Vec<Value> = matched
            .iter()
            .skip(from as usize)
            .take(size as usize)
            .map(|(index, log)| json!({"_index": index, "_source": log}))
            .collect();

        let mut response = Map::new();
        response.insert(
            "hits".to_string(),
            json!({
                "total": {"value": matched.len(), "relation": "eq"},
                "hits": hits,
            }),
        );

        let aggregations = body
            .get("aggregations")
            .or_else(|| body.get("aggs"))
            .and_then(Value::as_object);
        if let Some(aggregations) = aggregations {
            let docs: Vec<&Log> = matched.iter().map(|(_, log)| *log).collect();
            response.insert(
                "aggregations".to_string(),
                Value::Object(aggregate(aggregations, &docs)?),
            );
        }

        Ok(Value::Object(response))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Search for MemoryStore {
    fn name(&self) -> &'static str {
        CONNECTOR_MEMORY
    }

    async fn search(&self, indices: &[String], body: &Value) -> Result<SearchResponse> {
        self.requests.write().push(RecordedRequest {
            indices: indices.to_vec(),
            body: body.clone(),
        });

        let response = self.evaluate(indices, body)?;
        serde_json::from_value(response).context("decode memory store response")
    }
}

fn server_error(status: u16, kind: &str, reason: &str) -> ConnectorError {
    let cause = json!({"type": kind, "reason": reason});
    ConnectorError::ServerResp(
        status,
        json!({
            "error": {"root_cause": [cause], "type": kind, "reason": reason},
            "status": status,
        })
        .to_string(),
    )
}

fn bad_request(reason: impl AsRef<str>) -> ConnectorError {
    server_error(400, "parsing_exception", reason.as_ref())
}

fn resolve_indices(storage: &Storage, patterns: &[String]) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for pattern in patterns.iter().flat_map(|p| p.split(',')) {
        if pattern.contains('*') {
            let mut found: Vec<String> = storage
                .keys()
                .filter(|name| glob_match(pattern, name))
                .cloned()
                .collect();
            found.sort();
            names.extend(found);
        } else if storage.contains_key(pattern) {
            names.push(pattern.to_string());
        } else {
            let reason = format!("no such index [{pattern}]");
            let cause = json!({
                "type": "index_not_found_exception",
                "reason": reason,
                "index": pattern,
            });
            bail!(ConnectorError::ServerResp(
                404,
                json!({
                    "error": {
                        "root_cause": [cause],
                        "type": "index_not_found_exception",
                        "reason": reason,
                        "index": pattern,
                    },
                    "status": 404,
                })
                .to_string(),
            ));
        }
    }

    let mut seen = HashSet::new();
    names.retain(|name| seen.insert(name.clone()));
    Ok(names)
}

fn lookup<'a>(log: &'a Log, field: &str) -> Option<&'a Value> {
    if let Some(value) = log.get(field) {
        return (!value.is_null()).then_some(value);
    }
    let mut parts = field.split('.');
    let mut current = log.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    (!current.is_null()).then_some(current)
}

fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    if let (Some(a), Some(b)) = (a.as_f64(), b.as_f64()) {
        return a.partial_cmp(&b);
    }
    // Dates resolve to the millisecond.
    if let (Ok(a), Ok(b)) = (value_to_datetime(a), value_to_datetime(b)) {
        return Some(truncate_millis(a).cmp(&truncate_millis(b)));
    }
    if let (Some(a), Some(b)) = (a.as_str(), b.as_str()) {
        return Some(a.cmp(b));
    }
    (a == b).then_some(Ordering::Equal)
}

fn values_equal(a: &Value, b: &Value) -> bool {
    a == b || compare_values(a, b) == Some(Ordering::Equal)
}

/// `*` matches any run of characters, `?` exactly one.
fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();

    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;
    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            backtrack = Some((p, t));
            p += 1;
        } else if let Some((star, matched)) = backtrack {
            p = star + 1;
            t = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|c| *c == '*')
}

fn contains_text(value: &Value, needle: &str) -> bool {
    match value {
        Value::String(s) => s.to_lowercase().contains(needle),
        Value::Array(values) => values.iter().any(|v| contains_text(v, needle)),
        Value::Object(map) => map.values().any(|v| contains_text(v, needle)),
        _ => false,
    }
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn clause_list(value: Option<&Value>) -> Vec<&Value> {
    match value {
        Some(Value::Array(clauses)) => clauses.iter().collect(),
        Some(clause @ Value::Object(_)) => vec![clause],
        _ => Vec::new(),
    }
}

/// The single `{field: value}` pair of a leaf query.
fn field_and_value(body: &Value) -> Result<(&str, &Value)> {
    let Some((field, value)) = body.as_object().and_then(|m| m.iter().next()) else {
        bail!(bad_request(format!("expected a field in {body}")));
    };
    Ok((field.as_str(), value))
}

fn matches(log: &Log, clause: &Value) -> Result<bool> {
    let Some((kind, body)) = clause.as_object().and_then(|m| m.iter().next()) else {
        bail!(bad_request(format!("malformed query clause {clause}")));
    };

    Ok(match kind.as_str() {
        "match_all" => true,
        "match_none" => false,
        "filtered" => match body.get("filter") {
            Some(filter) => matches(log, filter)?,
            None => true,
        },
        "bool" => matches_bool(log, body)?,
        "term" => {
            let (field, expected) = field_and_value(body)?;
            let expected = expected.get("value").unwrap_or(expected);
            lookup(log, field).is_some_and(|value| values_equal(value, expected))
        }
        "terms" => {
            let (field, expected) = field_and_value(body)?;
            let Some(expected) = expected.as_array() else {
                bail!(bad_request(format!("terms on [{field}] expects an array")));
            };
            lookup(log, field)
                .is_some_and(|value| expected.iter().any(|e| values_equal(value, e)))
        }
        "range" => {
            let (field, bounds) = field_and_value(body)?;
            let Some(value) = lookup(log, field) else {
                return Ok(false);
            };
            let Some(bounds) = bounds.as_object() else {
                bail!(bad_request(format!("range on [{field}] expects bounds")));
            };
            let mut in_range = true;
            for (op, bound) in bounds {
                let order = compare_values(value, bound);
                in_range &= match op.as_str() {
                    "gte" => matches!(order, Some(Ordering::Greater | Ordering::Equal)),
                    "gt" => order == Some(Ordering::Greater),
                    "lte" => matches!(order, Some(Ordering::Less | Ordering::Equal)),
                    "lt" => order == Some(Ordering::Less),
                    _ => true,
                };
            }
            in_range
        }
        "exists" => {
            let Some(field) = body.get("field").and_then(Value::as_str) else {
                bail!(bad_request("exists expects a field"));
            };
            lookup(log, field).is_some()
        }
        "wildcard" => {
            let (field, pattern) = field_and_value(body)?;
            let pattern = pattern.get("value").unwrap_or(pattern);
            let Some(pattern) = pattern.as_str() else {
                bail!(bad_request(format!("wildcard on [{field}] expects a string")));
            };
            lookup(log, field).is_some_and(|value| glob_match(pattern, &as_text(value)))
        }
        "multi_match" => {
            let Some(query) = body.get("query").and_then(Value::as_str) else {
                bail!(bad_request("multi_match expects a query string"));
            };
            let needle = query.to_lowercase();
            log.values().any(|value| contains_text(value, &needle))
        }
        other => bail!(bad_request(format!("unknown query [{other}]"))),
    })
}

fn matches_bool(log: &Log, body: &Value) -> Result<bool> {
    let must = clause_list(body.get("must"));
    let filter = clause_list(body.get("filter"));
    let must_not = clause_list(body.get("must_not"));
    let should = clause_list(body.get("should"));

    for clause in must.iter().chain(filter.iter()) {
        if !matches(log, clause)? {
            return Ok(false);
        }
    }
    for clause in &must_not {
        if matches(log, clause)? {
            return Ok(false);
        }
    }

    if !should.is_empty() {
        let minimum = body
            .get("minimum_should_match")
            .and_then(Value::as_u64)
            .unwrap_or(if must.is_empty() && filter.is_empty() { 1 } else { 0 });
        let mut matched = 0;
        for clause in &should {
            if matches(log, clause)? {
                matched += 1;
            }
        }
        return Ok(matched >= minimum);
    }

    Ok(true)
}

fn parse_sort(sort: &Value) -> Result<(&str, bool)> {
    let sort = match sort {
        Value::Array(sorts) if sorts.len() == 1 => &sorts[0],
        other => other,
    };
    let (field, options) = field_and_value(sort)?;
    let order = options
        .get("order")
        .and_then(Value::as_str)
        .or_else(|| options.as_str())
        .unwrap_or("asc");
    Ok((field, order == "desc"))
}

fn aggregate(aggregations: &Map<String, Value>, docs: &[&Log]) -> Result<Map<String, Value>> {
    let mut results = Map::new();
    for (name, spec) in aggregations {
        let Some(spec) = spec.as_object() else {
            bail!(bad_request(format!("aggregation [{name}] is not an object")));
        };
        let sub = spec
            .get("aggregations")
            .or_else(|| spec.get("aggs"))
            .and_then(Value::as_object);

        let result = if let Some(terms) = spec.get("terms") {
            terms_aggregation(terms, sub, docs)?
        } else if let Some(histogram) = spec.get("date_histogram") {
            date_histogram(histogram, sub, docs)?
        } else {
            metric_aggregation(name, spec, docs)?
        };
        results.insert(name.clone(), result);
    }
    Ok(results)
}

fn bucket(
    key: Value,
    key_as_string: Option<String>,
    docs: &[&Log],
    sub: Option<&Map<String, Value>>,
) -> Result<Value> {
    let mut bucket = match sub {
        Some(sub) => aggregate(sub, docs)?,
        None => Map::new(),
    };
    bucket.insert("key".to_string(), key);
    if let Some(key_as_string) = key_as_string {
        bucket.insert("key_as_string".to_string(), Value::from(key_as_string));
    }
    bucket.insert("doc_count".to_string(), Value::from(docs.len()));
    Ok(Value::Object(bucket))
}

fn aggregation_field(body: &Value) -> Result<&str> {
    body.get("field")
        .and_then(Value::as_str)
        .ok_or_else(|| bad_request(format!("aggregation {body} expects a field")).into())
}

fn terms_aggregation(
    body: &Value,
    sub: Option<&Map<String, Value>>,
    docs: &[&Log],
) -> Result<Value> {
    let field = aggregation_field(body)?;
    let size = body.get("size").and_then(Value::as_u64).unwrap_or(DEFAULT_SIZE) as usize;

    let mut groups: Vec<(Value, Vec<&Log>)> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();
    for doc in docs {
        let Some(value) = lookup(doc, field) else {
            continue;
        };
        let position = *positions.entry(value.to_string()).or_insert_with(|| {
            groups.push((value.clone(), Vec::new()));
            groups.len() - 1
        });
        groups[position].1.push(*doc);
    }

    groups.sort_by(|(a_key, a_docs), (b_key, b_docs)| {
        b_docs
            .len()
            .cmp(&a_docs.len())
            .then_with(|| as_text(a_key).cmp(&as_text(b_key)))
    });
    let sum_other_doc_count: usize = groups.iter().skip(size).map(|(_, d)| d.len()).sum();
    groups.truncate(size);

    let buckets = groups
        .into_iter()
        .map(|(key, docs)| bucket(key, None, &docs, sub))
        .collect::<Result<Vec<_>>>()?;

    Ok(json!({
        "doc_count_error_upper_bound": 0,
        "sum_other_doc_count": sum_other_doc_count,
        "buckets": buckets,
    }))
}

fn date_histogram(
    body: &Value,
    sub: Option<&Map<String, Value>>,
    docs: &[&Log],
) -> Result<Value> {
    let field = aggregation_field(body)?;
    if body.get("calendar_interval").is_some() {
        bail!(bad_request("calendar_interval is not supported by the memory store"));
    }
    let Some(interval) = body.get("fixed_interval").and_then(Value::as_str) else {
        bail!(bad_request("date_histogram expects a fixed_interval"));
    };
    let width = parse_millis(interval).map_err(bad_request)?;
    if width <= 0 {
        bail!(bad_request("date_histogram interval must be positive"));
    }
    let offset = match body.get("offset").and_then(Value::as_str) {
        Some(offset) => parse_millis(offset).map_err(bad_request)?,
        None => 0,
    };
    let min_doc_count = body.get("min_doc_count").and_then(Value::as_u64).unwrap_or(0);

    let mut keyed: BTreeMap<i64, Vec<&Log>> = BTreeMap::new();
    for doc in docs {
        let Some(dt) = lookup(doc, field).and_then(|v| value_to_datetime(v).ok()) else {
            continue;
        };
        keyed
            .entry(floor_millis(to_millis(dt), width, offset))
            .or_default()
            .push(*doc);
    }

    let mut buckets = Vec::new();
    if let (Some(first), Some(last)) = (
        keyed.keys().next().copied(),
        keyed.keys().next_back().copied(),
    ) {
        let mut key = first;
        while key <= last {
            let docs = keyed.get(&key).map(Vec::as_slice).unwrap_or_default();
            if docs.len() as u64 >= min_doc_count {
                let key_as_string = from_millis(key).map(format_rfc3339).ok();
                buckets.push(bucket(Value::from(key), key_as_string, docs, sub)?);
            }
            key += width;
        }
    }

    Ok(json!({"buckets": buckets}))
}

fn metric_aggregation(name: &str, spec: &Map<String, Value>, docs: &[&Log]) -> Result<Value> {
    let Some((kind, body)) = spec
        .iter()
        .find(|(kind, _)| kind.as_str() != "aggregations" && kind.as_str() != "aggs")
    else {
        bail!(bad_request(format!("aggregation [{name}] is empty")));
    };
    let field = aggregation_field(body)?;
    let values: Vec<&Value> = docs.iter().filter_map(|doc| lookup(doc, field)).collect();
    let numbers: Vec<f64> = values.iter().filter_map(|v| v.as_f64()).collect();

    let value = match kind.as_str() {
        "value_count" => json!(values.len()),
        "cardinality" => {
            let distinct: HashSet<String> = values.iter().map(|v| v.to_string()).collect();
            json!(distinct.len())
        }
        "sum" => json!(numbers.iter().sum::<f64>()),
        "avg" => {
            if numbers.is_empty() {
                Value::Null
            } else {
                json!(numbers.iter().sum::<f64>() / numbers.len() as f64)
            }
        }
        "min" => json!(numbers.iter().copied().reduce(f64::min)),
        "max" => json!(numbers.iter().copied().reduce(f64::max)),
        other => bail!(bad_request(format!("unknown aggregation type [{other}]"))),
    };

    Ok(json!({"value": value}))
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;
    use crate::{
        classify::{Fault, classify},
        search::AggregationBucketsOrValue,
    };

    fn log(value: Value) -> Log {
        value.as_object().unwrap().clone()
    }

    fn store() -> MemoryStore {
        let store = MemoryStore::new();
        store.insert(
            "logs",
            [
                log(json!({
                    "@timestamp": "2024-01-01T00:00:00Z", "host": "a", "cpu": 1, "msg": "Disk full"
                })),
                log(json!({"@timestamp": "2024-01-01T00:01:00Z", "host": "b", "cpu": 3})),
                log(json!({
                    "@timestamp": "2024-01-01T00:02:00Z", "host": "a", "cpu": 5,
                    "user": {"name": "x"}
                })),
            ],
        );
        store
    }

    fn query(filter: Value) -> Value {
        json!({"size": 100, "query": {"filtered": {"filter": {"bool": {"must": [filter]}}}}})
    }

    #[test_case(json!({"match_all": {}}), 3 ; "match all")]
    #[test_case(json!({"term": {"host": "a"}}), 2 ; "term")]
    #[test_case(json!({"terms": {"host": ["b", "c"]}}), 1 ; "terms")]
    #[test_case(json!({"range": {"cpu": {"gte": 3}}}), 2 ; "numeric range")]
    #[test_case(json!({"range": {"@timestamp": {"gte": "2024-01-01T00:01:00Z", "lt": "2024-01-01T00:02:00Z"}}}), 1 ; "time range")]
    #[test_case(json!({"exists": {"field": "user.name"}}), 1 ; "dotted exists")]
    #[test_case(json!({"wildcard": {"host": "?"}}), 3 ; "wildcard")]
    #[test_case(json!({"multi_match": {"query": "disk FULL", "type": "phrase", "fields": ["*"]}}), 1 ; "free text")]
    #[test_case(json!({"bool": {"must_not": [{"term": {"host": "a"}}]}}), 1 ; "must not")]
    #[test_case(json!({"bool": {"should": [{"term": {"cpu": 1}}, {"term": {"cpu": 5}}], "minimum_should_match": 1}}), 2 ; "should")]
    #[tokio::test]
    async fn filters(filter: Value, expected: u64) {
        let response = store()
            .search(&["logs".to_string()], &query(filter))
            .await
            .unwrap();
        assert_eq!(response.hits.total, expected);
    }

    #[tokio::test]
    async fn sort_and_page() {
        let store = store();
        let response = store
            .search(
                &["*".to_string()],
                &json!({
                    "from": 1,
                    "size": 1,
                    "sort": {"@timestamp": {"order": "desc", "unmapped_type": "date"}},
                }),
            )
            .await
            .unwrap();

        assert_eq!(response.hits.total, 3);
        assert_eq!(response.hits.hits.len(), 1);
        assert_eq!(response.hits.hits[0].source["host"], json!("b"));
        assert_eq!(store.request_count(), 1);
    }

    #[tokio::test]
    async fn missing_index_is_classified() {
        let err = store()
            .search(&["nope".to_string()], &json!({}))
            .await
            .unwrap_err();
        assert_eq!(classify(&err), Fault::MissingIndex("nope".to_string()));
    }

    #[tokio::test]
    async fn result_window_is_enforced() {
        let err = store()
            .with_max_result_window(5)
            .search(&["logs".to_string()], &json!({"from": 3, "size": 3}))
            .await
            .unwrap_err();
        assert_eq!(classify(&err), Fault::ResultWindowOverflow(5));
    }

    #[tokio::test]
    async fn terms_with_metric_and_histogram() {
        let response = store()
            .search(
                &["logs".to_string()],
                &json!({
                    "size": 0,
                    "aggregations": {
                        "host": {
                            "terms": {"field": "host", "size": 10},
                            "aggregations": {
                                "cpu": {"sum": {"field": "cpu"}},
                                "time": {"date_histogram": {
                                    "field": "@timestamp",
                                    "fixed_interval": "60000ms",
                                    "min_doc_count": 0
                                }}
                            }
                        },
                        "missing": {"terms": {"field": "nope", "size": 10}}
                    }
                }),
            )
            .await
            .unwrap();

        let Some(AggregationBucketsOrValue::Buckets(host)) = response.aggregations.get("host")
        else {
            panic!("expected host buckets");
        };
        assert_eq!(host.buckets.len(), 2);
        assert_eq!(host.buckets[0].key, json!("a"));
        assert_eq!(host.buckets[0].doc_count, 2);
        assert!(matches!(
            host.buckets[0].buckets_or_value.get("cpu"),
            Some(AggregationBucketsOrValue::Value(v)) if v.value == json!(6.0)
        ));

        let Some(AggregationBucketsOrValue::Buckets(time)) =
            host.buckets[0].buckets_or_value.get("time")
        else {
            panic!("expected time buckets");
        };
        let counts: Vec<u64> = time.buckets.iter().map(|b| b.doc_count).collect();
        assert_eq!(counts, vec![1, 0, 1]);

        let Some(AggregationBucketsOrValue::Buckets(missing)) =
            response.aggregations.get("missing")
        else {
            panic!("expected missing buckets");
        };
        assert!(missing.buckets.is_empty());
    }

    #[test_case("*", "anything", true)]
    #[test_case("log*", "logs-2024", true)]
    #[test_case("log?", "logs", true)]
    #[test_case("log?", "logs-2024", false)]
    #[test_case("*-2024", "logs-2023", false)]
    fn globs(pattern: &str, text: &str, expected: bool) {
        assert_eq!(glob_match(pattern, text), expected);
    }
}
