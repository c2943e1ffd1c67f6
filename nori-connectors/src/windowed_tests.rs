use nori_workflow_types::json;
use serde_json::Map;
use time::macros::datetime;

use super::*;
use crate::{
    aggregation::bucket_aggregation,
    test_utils::{INDEX, ScriptedStore, TIME_FIELD, at, indices, point, range, store_with},
};

fn options(concurrency: usize) -> AggregationOptions {
    AggregationOptions {
        time_field: TIME_FIELD.to_string(),
        concurrency,
        bucket_sizes: BucketSizes::default(),
    }
}

fn count_descriptor(grouping: &[&str], every: Option<Interval>) -> AggregationDescriptor {
    let grouping: Vec<String> = grouping.iter().map(|f| f.to_string()).collect();
    let mut empty_result = Log::new();
    empty_result.insert("count".to_string(), json!(0));

    AggregationDescriptor {
        es_aggr: bucket_aggregation(&grouping, Map::new(), BucketSizes::default()),
        count_field: Some("count".to_string()),
        empty_result,
        grouping,
        reduce_every: every,
        reduce_on: None,
        empty_fields: Vec::new(),
    }
}

fn with_field(mut log: Log, field: &str, value: Value) -> Log {
    log.insert(field.to_string(), value);
    log
}

fn host_point(seconds: i64, host: &str) -> Log {
    with_field(point(seconds, 0), "host", json!(host))
}

async fn drain(fetcher: &mut WindowedAggregationFetcher) -> Vec<Row> {
    let mut rows = Vec::new();
    loop {
        let batch = fetcher.fetch().await.unwrap();
        rows.extend(batch.rows);
        if batch.eof {
            return rows;
        }
    }
}

fn summary(rows: &[Row], fields: &[&str]) -> Vec<Value> {
    rows.iter()
        .map(|row| {
            let mut picked = Map::new();
            for field in fields {
                picked.insert(
                    field.to_string(),
                    row.log.get(*field).cloned().unwrap_or(Value::Null),
                );
            }
            Value::Object(picked)
        })
        .collect()
}

#[test]
fn boundaries_without_width_cover_range() {
    assert_eq!(
        bucket_boundaries(range(5, 100), None, None).unwrap(),
        vec![at(5), at(100)]
    );
}

#[test]
fn boundaries_are_aligned_to_width() {
    assert_eq!(
        bucket_boundaries(range(10, 180), Some(&Interval::Millis(60_000)), None).unwrap(),
        vec![at(0), at(60), at(120), at(180)]
    );
}

#[test]
fn boundaries_follow_offset() {
    let on = ReduceOn::Offset(Interval::Millis(30_000));
    assert_eq!(
        bucket_boundaries(range(0, 120), Some(&Interval::Millis(60_000)), Some(&on)).unwrap(),
        vec![at(-30), at(30), at(90), at(150)]
    );
}

#[test]
fn boundaries_follow_moment() {
    let on = ReduceOn::Moment(datetime!(2020-06-01 00:00:15 UTC));
    assert_eq!(
        bucket_boundaries(range(0, 60), Some(&Interval::Millis(60_000)), Some(&on)).unwrap(),
        vec![at(-45), at(15), at(75)]
    );
}

#[test]
fn boundaries_reject_calendar_offset() {
    let on = ReduceOn::Offset(Interval::Months(1));
    assert!(bucket_boundaries(range(0, 60), Some(&Interval::Millis(60_000)), Some(&on)).is_err());
}

#[test]
fn boundaries_reject_empty_width() {
    for every in [Interval::Millis(0), Interval::Millis(-60_000), Interval::Months(0)] {
        assert!(bucket_boundaries(range(0, 60), Some(&every), None).is_err(), "{every:?}");
    }
}

#[test]
fn monthly_boundaries() {
    let start = datetime!(2024-01-15 00:00:00 UTC);
    let end = datetime!(2024-03-02 00:00:00 UTC);
    assert_eq!(
        bucket_boundaries(TimeRange::new(start, end), Some(&Interval::Months(1)), None).unwrap(),
        vec![
            datetime!(2024-01-01 00:00:00 UTC),
            datetime!(2024-02-01 00:00:00 UTC),
            datetime!(2024-03-01 00:00:00 UTC),
            datetime!(2024-04-01 00:00:00 UTC),
        ]
    );
}

#[tokio::test]
async fn ungrouped_gap_is_backfilled() {
    let store = store_with([point(10, 1), point(20, 2), point(130, 3)]);
    let mut fetcher = WindowedAggregationFetcher::new(
        store.clone(),
        indices(),
        range(0, 180),
        count_descriptor(&[], Some(Interval::Millis(60_000))),
        options(10),
    )
    .unwrap();

    let rows = drain(&mut fetcher).await;
    assert_eq!(
        summary(&rows, &["time", "count"]),
        vec![
            json!({"time": "2024-01-01T00:01:00Z", "count": 2}),
            json!({"time": "2024-01-01T00:02:00Z", "count": 0}),
            json!({"time": "2024-01-01T00:03:00Z", "count": 1}),
        ]
    );
    assert!(rows.iter().all(|row| row.epsilon));
    assert_eq!(store.request_count(), 3);
}

#[tokio::test]
async fn backfill_spans_batches() {
    let store = store_with([point(10, 1), point(250, 2)]);
    let mut fetcher = WindowedAggregationFetcher::new(
        store,
        indices(),
        range(0, 300),
        count_descriptor(&[], Some(Interval::Millis(60_000))),
        options(2),
    )
    .unwrap();

    let first = fetcher.fetch().await.unwrap();
    assert!(!first.eof);
    assert_eq!(summary(&first.rows, &["count"]), vec![json!({"count": 1})]);

    let rest = drain(&mut fetcher).await;
    assert_eq!(
        summary(&rest, &["time", "count"]),
        vec![
            json!({"time": "2024-01-01T00:02:00Z", "count": 0}),
            json!({"time": "2024-01-01T00:03:00Z", "count": 0}),
            json!({"time": "2024-01-01T00:04:00Z", "count": 0}),
            json!({"time": "2024-01-01T00:05:00Z", "count": 1}),
        ]
    );
}

#[tokio::test]
async fn grouped_gaps_are_not_backfilled() {
    let store = store_with([
        host_point(10, "a"),
        host_point(20, "a"),
        host_point(30, "b"),
        host_point(130, "a"),
    ]);
    let mut fetcher = WindowedAggregationFetcher::new(
        store,
        indices(),
        range(0, 180),
        count_descriptor(&["host"], Some(Interval::Millis(60_000))),
        options(10),
    )
    .unwrap();

    let rows = drain(&mut fetcher).await;
    assert_eq!(
        summary(&rows, &["time", "host", "count"]),
        vec![
            json!({"time": "2024-01-01T00:01:00Z", "host": "a", "count": 2}),
            json!({"time": "2024-01-01T00:01:00Z", "host": "b", "count": 1}),
            json!({"time": "2024-01-01T00:03:00Z", "host": "a", "count": 1}),
        ]
    );
}

#[tokio::test]
async fn missing_field_retries_only_that_window() {
    let store = store_with([
        host_point(10, "a"),
        host_point(20, "a"),
        with_field(host_point(130, "a"), "dc", json!("east")),
    ]);
    let mut fetcher = WindowedAggregationFetcher::new(
        store.clone(),
        indices(),
        range(0, 180),
        count_descriptor(&["host", "dc"], Some(Interval::Millis(60_000))),
        options(10),
    )
    .unwrap();

    let rows = drain(&mut fetcher).await;
    assert_eq!(
        summary(&rows, &["time", "host", "dc", "count"]),
        vec![
            json!({"time": "2024-01-01T00:01:00Z", "host": "a", "dc": null, "count": 2}),
            json!({"time": "2024-01-01T00:03:00Z", "host": "a", "dc": "east", "count": 1}),
        ]
    );
    assert_eq!(rows[0].log.get("dc"), Some(&Value::Null));

    // First window twice, the empty and the last window once each.
    assert_eq!(store.request_count(), 4);
    assert_eq!(fetcher.descriptor().grouping, vec!["host".to_string()]);
    assert_eq!(fetcher.descriptor().empty_fields, vec!["dc".to_string()]);
}

#[tokio::test]
async fn dropping_the_only_group_falls_back_to_ungrouped() {
    let store = store_with([point(10, 1), point(20, 2)]);
    let mut fetcher = WindowedAggregationFetcher::new(
        store.clone(),
        indices(),
        range(0, 60),
        count_descriptor(&["host"], None),
        options(10),
    )
    .unwrap();

    let rows = drain(&mut fetcher).await;
    assert_eq!(
        summary(&rows, &["time", "host", "count"]),
        vec![json!({"time": "2024-01-01T00:01:00Z", "host": null, "count": 2})]
    );
    assert_eq!(store.request_count(), 2);
    assert!(!fetcher.descriptor().is_grouped());
}

#[tokio::test]
async fn unrecoverable_missing_field_surfaces() {
    let store = ScriptedStore::new([]).with_error(json!({
        "error": {
            "root_cause": [{
                "type": "query_shard_exception",
                "reason": "No mapping found for [nope] in order to sort on"
            }]
        }
    }));
    let mut fetcher = WindowedAggregationFetcher::new(
        Arc::new(store),
        indices(),
        range(0, 60),
        count_descriptor(&["host"], None),
        options(10),
    )
    .unwrap();

    let err = fetcher.fetch().await.unwrap_err();
    assert_eq!(
        err.downcast_ref::<FetchError>(),
        Some(&FetchError::MissingField("nope".to_string()))
    );
}

#[tokio::test]
async fn single_window_without_width() {
    let store = store_with([point(10, 1), point(20, 2)]);
    let mut fetcher = WindowedAggregationFetcher::new(
        store.clone(),
        indices(),
        range(0, 60),
        count_descriptor(&[], None),
        options(10),
    )
    .unwrap();

    let rows = drain(&mut fetcher).await;
    assert_eq!(
        summary(&rows, &["time", "count"]),
        vec![json!({"time": "2024-01-01T00:01:00Z", "count": 2})]
    );

    let body = &store.requests()[0].body;
    assert_eq!(body["size"], json!(0));
    assert!(body.get("aggregations").is_none());
    assert_eq!(store.requests()[0].indices, vec![INDEX.to_string()]);
}
