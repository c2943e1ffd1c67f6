use std::{sync::Arc, time::Duration};

use async_stream::try_stream;
use color_eyre::eyre::{Result, bail, eyre};
use nori_common::{
    metrics::{METRICS, OP_BRIDGE, OP_PAGE},
    time_utils::{format_rfc3339, truncate_millis, value_to_datetime},
};
use nori_workflow_types::{
    log::{Batch, Log, Row, TIME_FIELD_NAME},
    pushdown::Direction,
};
use serde_json::Value;
use time::OffsetDateTime;
use tracing::{debug, instrument};

use crate::{
    FetchError, RowBatchTryStream,
    query::{SearchBody, TimeRange, instant_filter, range_filter},
    search::{Search, SearchResponse, search_or_empty},
};

const ONE_MILLI: Duration = Duration::from_millis(1);

pub const DEFAULT_TIME_FIELD: &str = "@timestamp";
pub const DEFAULT_FETCH_SIZE: u64 = 10000;
pub const DEFAULT_DEEP_PAGING_LIMIT: u64 = 10000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOptions {
    /// The store's name for the time field, renamed to `time` on emitted rows.
    pub time_field: String,
    pub fetch_size: u64,
    /// Largest `from + size` allowed while bridging over a single timestamp.
    pub deep_paging_limit: u64,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            time_field: DEFAULT_TIME_FIELD.to_string(),
            fetch_size: DEFAULT_FETCH_SIZE,
            deep_paging_limit: DEFAULT_DEEP_PAGING_LIMIT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchState {
    Idle,
    Paging,
    Bridging,
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchCursor {
    pub query_start: OffsetDateTime,
    pub query_end: OffsetDateTime,
    pub direction: Direction,
    pub limit: Option<u64>,
    pub emitted_count: u64,
    pub bridge_offset: u64,
    pub last_seen_timestamp: Option<OffsetDateTime>,
    pub bridging: bool,
}

impl FetchCursor {
    fn new(range: TimeRange) -> Self {
        Self {
            query_start: range.start,
            query_end: range.end,
            direction: Direction::Asc,
            limit: None,
            emitted_count: 0,
            bridge_offset: 0,
            last_seen_timestamp: None,
            bridging: false,
        }
    }

    fn range(&self) -> TimeRange {
        TimeRange::new(self.query_start, self.query_end)
    }

    fn remaining(&self) -> Option<u64> {
        self.limit
            .map(|limit| limit.saturating_sub(self.emitted_count))
    }
}

/// Reads raw rows in time order, one page per call, without skipping or repeating rows
/// that share a timestamp across page boundaries.
#[derive(Debug)]
pub struct PaginatedFetcher {
    store: Arc<dyn Search>,
    indices: Vec<String>,
    filter: Option<Value>,
    options: FetchOptions,
    cursor: FetchCursor,
    state: FetchState,
}

impl PaginatedFetcher {
    pub fn new(
        store: Arc<dyn Search>,
        indices: Vec<String>,
        range: TimeRange,
        options: FetchOptions,
    ) -> Self {
        Self {
            store,
            indices,
            filter: None,
            options,
            cursor: FetchCursor::new(range),
            state: FetchState::Idle,
        }
    }

    pub fn with_filter(mut self, filter: Option<Value>) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.cursor.direction = direction;
        self
    }

    pub fn with_limit(mut self, limit: Option<u64>) -> Self {
        self.cursor.limit = limit;
        self
    }

    pub fn cursor(&self) -> &FetchCursor {
        &self.cursor
    }

    pub fn state(&self) -> FetchState {
        self.state
    }

    /// Returns the next non-empty batch, or an empty one with `eof` set once the range or
    /// the limit is exhausted.
    #[instrument(skip(self), name = "paginated fetch", fields(state = ?self.state))]
    pub async fn fetch(&mut self) -> Result<Batch> {
        loop {
            if self.state != FetchState::Done
                && (self.cursor.remaining() == Some(0) || self.cursor.range().is_empty())
            {
                self.state = FetchState::Done;
            }

            let batch = match self.state {
                FetchState::Done => return Ok(Batch::eof()),
                FetchState::Bridging => self.fetch_bridge().await?,
                FetchState::Idle | FetchState::Paging => self.fetch_page().await?,
            };

            if batch.eof || !batch.rows.is_empty() {
                return Ok(batch);
            }
        }
    }

    pub fn into_stream(mut self) -> RowBatchTryStream {
        Box::pin(try_stream! {
            loop {
                let batch = self.fetch().await?;
                if !batch.rows.is_empty() {
                    yield batch.rows;
                }
                if batch.eof {
                    break;
                }
            }
        })
    }

    fn request_size(&self) -> u64 {
        match self.cursor.remaining() {
            Some(remaining) => remaining.min(self.options.fetch_size),
            None => self.options.fetch_size,
        }
    }

    async fn fetch_page(&mut self) -> Result<Batch> {
        self.state = FetchState::Paging;

        let size = self.request_size();
        let body = SearchBody::new()
            .from(0)
            .size(size)
            .sort(&self.options.time_field, self.cursor.direction)
            .filter(range_filter(&self.options.time_field, self.cursor.range()))
            .maybe_filter(self.filter.as_ref())
            .build();

        let response = search_or_empty(&*self.store, &self.indices, &body, OP_PAGE).await?;
        let total = response.hits.total;
        let mut rows = self.normalize_hits(response)?;
        let got = rows.len() as u64;

        debug!(
            range = %self.cursor.range(),
            size,
            got,
            total,
            "Fetched page"
        );

        if got == total {
            self.state = FetchState::Done;
            return Ok(self.emit(rows, OP_PAGE));
        }
        if got != size {
            bail!(FetchError::ResultsCountMismatch {
                expected: size,
                got
            });
        }
        if self.cursor.remaining() == Some(got) {
            return Ok(self.emit(rows, OP_PAGE));
        }

        let (Some((first, _)), Some((last, _))) = (rows.first(), rows.last()) else {
            return Err(eyre!("non final page returned no rows"));
        };
        let (first, last) = (*first, *last);

        if first == last {
            debug!(timestamp = %format_rfc3339(last), "Whole page shares one timestamp, bridging");
            self.cursor.bridging = true;
            self.cursor.bridge_offset = 0;
            self.cursor.last_seen_timestamp = Some(last);
            self.state = FetchState::Bridging;
            return Ok(Batch::default());
        }

        // Rows at the last timestamp are fetched again by the next page.
        rows.retain(|(ts, _)| *ts != last);
        self.cursor.last_seen_timestamp = Some(last);
        match self.cursor.direction {
            Direction::Asc => self.cursor.query_start = last,
            Direction::Desc => self.cursor.query_end = last + ONE_MILLI,
        }

        Ok(self.emit(rows, OP_PAGE))
    }

    async fn fetch_bridge(&mut self) -> Result<Batch> {
        let Some(instant) = self.cursor.last_seen_timestamp else {
            return Err(eyre!("bridging without a timestamp to bridge over"));
        };

        let size = self.request_size();
        let from = self.cursor.bridge_offset;
        if from + size > self.options.deep_paging_limit {
            bail!(FetchError::DeepPagingLimit(self.options.deep_paging_limit));
        }

        let body = SearchBody::new()
            .from(from)
            .size(size)
            .sort(&self.options.time_field, self.cursor.direction)
            .filter(instant_filter(&self.options.time_field, instant))
            .maybe_filter(self.filter.as_ref())
            .build();

        METRICS
            .bridge_fetch_rounds
            .with_label_values(&[self.store.name()])
            .inc();

        let response = search_or_empty(&*self.store, &self.indices, &body, OP_BRIDGE).await?;
        let total = response.hits.total;
        let rows = self.normalize_hits(response)?;
        let got = rows.len() as u64;

        debug!(
            timestamp = %format_rfc3339(instant),
            from,
            size,
            got,
            total,
            "Fetched bridge page"
        );

        let bridge_done = got + from >= total;
        if !bridge_done && got != size {
            bail!(FetchError::ResultsCountMismatch {
                expected: size,
                got
            });
        }

        self.cursor.bridge_offset += got;
        if bridge_done {
            self.cursor.bridging = false;
            self.cursor.bridge_offset = 0;
            self.state = FetchState::Paging;
            match self.cursor.direction {
                Direction::Asc => self.cursor.query_start = instant + ONE_MILLI,
                Direction::Desc => self.cursor.query_end = instant,
            }
        }

        let mut batch = self.emit(rows, OP_BRIDGE);
        if !batch.eof && self.cursor.range().is_empty() {
            self.state = FetchState::Done;
            batch.eof = true;
        }
        Ok(batch)
    }

    /// Renames the store's time field to `time` and parses it, so rows can be compared. The
    /// row keeps the full timestamp but is keyed by its millisecond.
    fn normalize_hits(&self, response: SearchResponse) -> Result<Vec<(OffsetDateTime, Log)>> {
        response
            .hits
            .hits
            .into_iter()
            .map(|hit| {
                let mut log = hit.source;
                let Some(value) = log.remove(&self.options.time_field) else {
                    bail!(
                        "row is missing time field '{}': {:?}",
                        self.options.time_field,
                        log
                    );
                };
                let ts = value_to_datetime(&value).map_err(|e| eyre!(e))?;
                log.insert(TIME_FIELD_NAME.to_string(), Value::from(format_rfc3339(ts)));
                Ok((truncate_millis(ts), log))
            })
            .collect()
    }

    fn emit(&mut self, mut rows: Vec<(OffsetDateTime, Log)>, operation: &str) -> Batch {
        if let Some(remaining) = self.cursor.remaining() {
            rows.truncate(remaining as usize);
        }
        if self.cursor.direction == Direction::Desc {
            rows.reverse();
        }

        self.cursor.emitted_count += rows.len() as u64;
        if self.cursor.remaining() == Some(0) {
            self.state = FetchState::Done;
        }

        METRICS
            .fetched_rows
            .with_label_values(&[self.store.name(), operation])
            .inc_by(rows.len() as u64);

        Batch {
            rows: rows.into_iter().map(|(_, log)| Row::new(log)).collect(),
            eof: self.state == FetchState::Done,
        }
    }
}

#[cfg(test)]
#[path = "paginate_tests.rs"]
mod tests;
