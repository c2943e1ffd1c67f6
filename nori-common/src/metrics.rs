use once_cell::sync::Lazy;
use prometheus::{
    HistogramVec, IntCounterVec, exponential_buckets, register_histogram_vec,
    register_int_counter_vec,
};

pub static METRICS: Lazy<Metrics> = Lazy::new(Metrics::default);

// Connector name labels
pub const CONNECTOR_ELASTICSEARCH: &str = "elasticsearch";
pub const CONNECTOR_MEMORY: &str = "memory";

// Connector operation labels
pub const OP_PAGE: &str = "page";
pub const OP_BRIDGE: &str = "bridge";
pub const OP_AGGREGATE_BUCKET: &str = "aggregate_bucket";

// Status labels
pub const STATUS_SUCCESS: &str = "success";
pub const ERROR_UNKNOWN: &str = "unknown_error";
pub const ERROR_SERVER: &str = "server_error";
pub const ERROR_CONNECTION: &str = "connection_failure";
pub const ERROR_MISSING_INDEX: &str = "missing_index";
pub const ERROR_NEW_INDEX: &str = "new_index";
pub const ERROR_MISSING_FIELD: &str = "missing_field";
pub const ERROR_RESULT_WINDOW: &str = "result_window_overflow";

pub struct Metrics {
    pub connector_request_duration: HistogramVec,
    pub connector_requests_total: IntCounterVec,
    pub connector_errors_total: IntCounterVec,
    pub fetched_rows: IntCounterVec,
    pub bridge_fetch_rounds: IntCounterVec,
    pub field_removal_retries: IntCounterVec,
    pub backfilled_rows: IntCounterVec,
}

/// From 0.05s to 508.798s
fn duration_buckets() -> Vec<f64> {
    exponential_buckets(0.05, 1.85, 15).unwrap()
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            connector_request_duration: register_histogram_vec!(
                "nori_connector_request_duration",
                "Duration of connector requests in seconds",
                &["connector", "operation"],
                duration_buckets(),
            )
            .expect("create connector_request_duration"),

            connector_requests_total: register_int_counter_vec!(
                "nori_connector_requests_total",
                "Total number of connector requests",
                &["connector", "status"]
            )
            .expect("create connector_requests_total"),

            connector_errors_total: register_int_counter_vec!(
                "nori_connector_errors_total",
                "Total number of connector errors",
                &["connector", "error_type"]
            )
            .expect("create connector_errors_total"),

            fetched_rows: register_int_counter_vec!(
                "nori_fetched_rows",
                "Number of rows emitted by the store fetchers",
                &["connector", "operation"]
            )
            .expect("create fetched_rows"),

            bridge_fetch_rounds: register_int_counter_vec!(
                "nori_bridge_fetch_rounds",
                "Number of bridge fetch rounds over rows sharing a timestamp",
                &["connector"]
            )
            .expect("create bridge_fetch_rounds"),

            field_removal_retries: register_int_counter_vec!(
                "nori_field_removal_retries",
                "Number of aggregation retries after dropping a missing grouping field",
                &["connector"]
            )
            .expect("create field_removal_retries"),

            backfilled_rows: register_int_counter_vec!(
                "nori_backfilled_rows",
                "Number of empty-result rows spliced into windowed aggregations",
                &["connector"]
            )
            .expect("create backfilled_rows"),
        }
    }
}
