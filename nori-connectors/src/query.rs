use std::fmt;

use nori_common::time_utils::format_rfc3339;
use nori_workflow_types::{json, pushdown::Direction};
use serde_json::{Map, Value};
use time::OffsetDateTime;

/// Half open `[start, end)` time range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: OffsetDateTime,
    pub end: OffsetDateTime,
}

impl TimeRange {
    pub fn new(start: OffsetDateTime, end: OffsetDateTime) -> Self {
        Self { start, end }
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {})",
            format_rfc3339(self.start),
            format_rfc3339(self.end)
        )
    }
}

pub fn range_filter(time_field: &str, range: TimeRange) -> Value {
    json!({
        "range": {
            time_field: {
                "gte": format_rfc3339(range.start),
                "lt": format_rfc3339(range.end),
            }
        }
    })
}

/// Exact match on one instant, used while bridging over tied timestamps.
pub fn instant_filter(time_field: &str, instant: OffsetDateTime) -> Value {
    json!({
        "term": {
            time_field: format_rfc3339(instant)
        }
    })
}

#[derive(Debug, Clone, Default)]
pub struct SearchBody {
    from: u64,
    size: u64,
    sort: Option<(String, Direction)>,
    filters: Vec<Value>,
    aggregations: Option<Map<String, Value>>,
}

impl SearchBody {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from(mut self, from: u64) -> Self {
        self.from = from;
        self
    }

    pub fn size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    pub fn sort(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.sort = Some((field.into(), direction));
        self
    }

    /// Filters are ANDed together.
    pub fn filter(mut self, filter: Value) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn maybe_filter(self, filter: Option<&Value>) -> Self {
        match filter {
            Some(filter) => self.filter(filter.clone()),
            None => self,
        }
    }

    pub fn aggregations(mut self, aggregations: Map<String, Value>) -> Self {
        if !aggregations.is_empty() {
            self.aggregations = Some(aggregations);
        }
        self
    }

    pub fn build(self) -> Value {
        let mut body = Map::new();
        body.insert("from".to_string(), json!(self.from));
        body.insert("size".to_string(), json!(self.size));
        // Paging compares against the total, which must be exact.
        body.insert("track_total_hits".to_string(), json!(true));

        if let Some((field, direction)) = self.sort {
            body.insert(
                "sort".to_string(),
                json!({
                    field: {
                        "order": direction.to_string(),
                        "unmapped_type": "date",
                    }
                }),
            );
        }

        body.insert(
            "query".to_string(),
            json!({
                "filtered": {
                    "filter": {
                        "bool": {
                            "must": self.filters,
                        }
                    }
                }
            }),
        );

        if let Some(aggregations) = self.aggregations {
            body.insert("aggregations".to_string(), Value::Object(aggregations));
        }

        Value::Object(body)
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    #[test]
    fn body_shape() {
        let range = TimeRange::new(
            datetime!(2024-01-01 00:00:00 UTC),
            datetime!(2024-01-02 00:00:00 UTC),
        );
        let body = SearchBody::new()
            .from(20)
            .size(10)
            .sort("@timestamp", Direction::Desc)
            .filter(range_filter("@timestamp", range))
            .maybe_filter(Some(&json!({"term": {"level": "error"}})))
            .build();

        assert_eq!(
            body,
            json!({
                "from": 20,
                "size": 10,
                "track_total_hits": true,
                "sort": {"@timestamp": {"order": "desc", "unmapped_type": "date"}},
                "query": {"filtered": {"filter": {"bool": {"must": [
                    {"range": {"@timestamp": {
                        "gte": "2024-01-01T00:00:00Z",
                        "lt": "2024-01-02T00:00:00Z"
                    }}},
                    {"term": {"level": "error"}}
                ]}}}}
            })
        );
    }

    #[test]
    fn empty_aggregations_are_omitted() {
        let body = SearchBody::new().aggregations(Map::new()).build();
        assert!(body.get("aggregations").is_none());
        assert!(body.get("sort").is_none());
    }

    #[test]
    fn instant_filter_is_term() {
        assert_eq!(
            instant_filter("ts", datetime!(2024-01-01 00:00:00.5 UTC)),
            json!({"term": {"ts": "2024-01-01T00:00:00.5Z"}})
        );
    }
}
