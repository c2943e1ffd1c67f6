use std::pin::Pin;

use color_eyre::eyre::Result;
use futures_util::Stream;
use nori_workflow_types::log::Row;
use thiserror::Error;

pub mod aggregation;
pub mod classify;
pub mod elasticsearch;
pub mod filter;
pub mod instrumentation;
pub mod memory;
pub mod paginate;
pub mod query;
pub mod read;
pub mod response;
pub mod search;
pub mod windowed;

#[cfg(test)]
mod test_utils;

pub type RowBatchTryStream = Pin<Box<dyn Stream<Item = Result<Vec<Row>>> + Send>>;

/// Transport level failures, as returned by a `Search` implementation.
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server response error ({0}): {1}")]
    ServerResp(u16, String),
}

/// Faults surfaced by the fetchers after classification.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error(
        "results count mismatch: expected {expected} rows but got {got}, the result set changed \
         while paging"
    )]
    ResultsCountMismatch { expected: u64, got: u64 },

    #[error(
        "cannot page through more than {0} points with an identical timestamp, raise \
         deep_paging_limit to read them all"
    )]
    DeepPagingLimit(u64),

    #[error(
        "result window is too large, the store allows at most {0} rows per request, raise the \
         index's max_result_window or lower fetch_size"
    )]
    ResultWindowOverflow(u64),

    #[error("failed to connect to the store: {0}")]
    ConnectionFailure(String),

    #[error("field '{0}' is not in the store's mapping")]
    MissingField(String),
}
