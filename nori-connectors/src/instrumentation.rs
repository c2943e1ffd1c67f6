use std::time::Instant;

use color_eyre::eyre::Result;
use nori_common::metrics::{ERROR_SERVER, ERROR_UNKNOWN, METRICS, STATUS_SUCCESS};

use crate::{
    ConnectorError,
    classify::{Fault, classify},
};

pub fn error_type_label(err: &color_eyre::Report) -> &'static str {
    match classify(err) {
        Fault::Unclassified => match err.downcast_ref::<ConnectorError>() {
            Some(ConnectorError::ServerResp(..)) => ERROR_SERVER,
            _ => ERROR_UNKNOWN,
        },
        fault => fault.label(),
    }
}

pub fn record_operation_result<T>(
    connector_name: &str,
    operation: &str,
    result: &Result<T>,
    duration: f64,
) {
    METRICS
        .connector_request_duration
        .with_label_values(&[connector_name, operation])
        .observe(duration);

    match result {
        Ok(_) => {
            METRICS
                .connector_requests_total
                .with_label_values(&[connector_name, STATUS_SUCCESS])
                .inc();
        }
        Err(e) => {
            let error_type = error_type_label(e);
            METRICS
                .connector_errors_total
                .with_label_values(&[connector_name, error_type])
                .inc();
        }
    }
}

pub async fn instrument_operation<F, Fut, T>(
    connector_name: &str,
    operation: &str,
    f: F,
) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let start = Instant::now();
    let result = f().await;
    let duration = start.elapsed().as_secs_f64();

    record_operation_result(connector_name, operation, &result, duration);
    result
}
