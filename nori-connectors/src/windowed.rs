use std::sync::Arc;

use async_stream::try_stream;
use color_eyre::eyre::{Result, bail, eyre};
use futures_util::future::join_all;
use nori_common::{
    metrics::{METRICS, OP_AGGREGATE_BUCKET},
    time_utils::format_rfc3339,
};
use nori_workflow_types::{
    interval::{Interval, ReduceOn},
    log::{Batch, Log, Row, TIME_FIELD_NAME},
    pushdown::AggregationDescriptor,
};
use serde_json::Value;
use time::OffsetDateTime;
use tracing::{debug, instrument, warn};

use crate::{
    FetchError, RowBatchTryStream,
    aggregation::{BucketSizes, remove_field},
    paginate::DEFAULT_TIME_FIELD,
    query::{SearchBody, TimeRange, range_filter},
    response::rows_from_response,
    search::{Search, search_or_empty},
};

pub const DEFAULT_AGGREGATION_CONCURRENCY: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregationOptions {
    pub time_field: String,
    /// Bucket requests in flight at once.
    pub concurrency: usize,
    pub bucket_sizes: BucketSizes,
}

impl Default for AggregationOptions {
    fn default() -> Self {
        Self {
            time_field: DEFAULT_TIME_FIELD.to_string(),
            concurrency: DEFAULT_AGGREGATION_CONCURRENCY,
            bucket_sizes: BucketSizes::default(),
        }
    }
}

/// Ascending window boundaries covering `range`, aligned to `every` and phased by `on`.
/// Without a width the whole range is one window.
pub fn bucket_boundaries(
    range: TimeRange,
    every: Option<&Interval>,
    on: Option<&ReduceOn>,
) -> Result<Vec<OffsetDateTime>> {
    if range.is_empty() {
        return Ok(Vec::new());
    }
    let Some(every) = every else {
        return Ok(vec![range.start, range.end]);
    };

    let offset = match on {
        Some(on) => on
            .offset_millis(every)
            .ok_or_else(|| eyre!("cannot phase {every} buckets by a calendar offset"))?,
        None => 0,
    };

    let mut boundary = every.floor(range.start, offset).map_err(|e| eyre!(e))?;
    let mut boundaries = vec![boundary];
    while boundary < range.end {
        let next = every.advance(boundary);
        if next <= boundary {
            bail!("bucket width {every} does not advance past {}", format_rfc3339(boundary));
        }
        boundary = next;
        boundaries.push(boundary);
    }
    Ok(boundaries)
}

/// Runs an aggregation once per time window, a bounded number of windows at a time, and
/// emits the windows' rows in window order.
#[derive(Debug)]
pub struct WindowedAggregationFetcher {
    store: Arc<dyn Search>,
    indices: Vec<String>,
    filter: Option<Value>,
    options: AggregationOptions,
    descriptor: AggregationDescriptor,
    range: TimeRange,
    boundaries: Vec<OffsetDateTime>,
    next_bucket: usize,
    /// Last window that produced rows, for filling gaps between windows.
    last_row_bucket: Option<usize>,
}

impl WindowedAggregationFetcher {
    pub fn new(
        store: Arc<dyn Search>,
        indices: Vec<String>,
        range: TimeRange,
        descriptor: AggregationDescriptor,
        options: AggregationOptions,
    ) -> Result<Self> {
        let boundaries = bucket_boundaries(
            range,
            descriptor.reduce_every.as_ref(),
            descriptor.reduce_on.as_ref(),
        )?;

        Ok(Self {
            store,
            indices,
            filter: None,
            options,
            descriptor,
            range,
            boundaries,
            next_bucket: 0,
            last_row_bucket: None,
        })
    }

    pub fn with_filter(mut self, filter: Option<Value>) -> Self {
        self.filter = filter;
        self
    }

    /// The descriptor in use, minus any grouping fields found missing so far.
    pub fn descriptor(&self) -> &AggregationDescriptor {
        &self.descriptor
    }

    pub fn boundaries(&self) -> &[OffsetDateTime] {
        &self.boundaries
    }

    fn bucket_count(&self) -> usize {
        self.boundaries.len().saturating_sub(1)
    }

    fn window(&self, bucket: usize) -> TimeRange {
        TimeRange::new(
            self.boundaries[bucket].max(self.range.start),
            self.boundaries[bucket + 1].min(self.range.end),
        )
    }

    /// Fetches the next batch of windows.
    #[instrument(
        skip(self),
        name = "windowed aggregation fetch",
        fields(next_bucket = self.next_bucket)
    )]
    pub async fn fetch(&mut self) -> Result<Batch> {
        let bucket_count = self.bucket_count();
        if self.next_bucket >= bucket_count {
            return Ok(Batch::eof());
        }

        let first = self.next_bucket;
        let last = (first + self.options.concurrency.max(1)).min(bucket_count);

        let requests = (first..last)
            .map(|bucket| self.fetch_bucket(self.window(bucket), self.descriptor.clone()));
        let results = join_all(requests).await;

        let mut rows = Vec::new();
        for (bucket, result) in (first..last).zip(results) {
            let (logs, used) = result?;
            self.merge_removed_fields(&used);

            if logs.is_empty() {
                continue;
            }

            if !self.descriptor.is_grouped() {
                if let Some(previous) = self.last_row_bucket {
                    for gap in previous + 1..bucket {
                        rows.push(self.empty_row(gap));
                    }
                    let filled = bucket - previous - 1;
                    if filled > 0 {
                        debug!(filled, "Backfilled empty windows");
                        METRICS
                            .backfilled_rows
                            .with_label_values(&[self.store.name()])
                            .inc_by(filled as u64);
                    }
                }
                self.last_row_bucket = Some(bucket);
            }

            let stamp = self.bucket_end(bucket);
            rows.extend(logs.into_iter().map(|mut log| {
                log.insert(TIME_FIELD_NAME.to_string(), stamp.clone());
                Row { log, epsilon: true }
            }));
        }
        self.next_bucket = last;

        METRICS
            .fetched_rows
            .with_label_values(&[self.store.name(), OP_AGGREGATE_BUCKET])
            .inc_by(rows.len() as u64);

        Ok(Batch {
            rows,
            eof: self.next_bucket >= bucket_count,
        })
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

    fn bucket_end(&self, bucket: usize) -> Value {
        Value::from(format_rfc3339(self.boundaries[bucket + 1]))
    }

    fn empty_row(&self, bucket: usize) -> Row {
        let mut log = self.descriptor.empty_result.clone();
        for field in &self.descriptor.empty_fields {
            log.insert(field.clone(), Value::Null);
        }
        log.insert(TIME_FIELD_NAME.to_string(), self.bucket_end(bucket));
        Row { log, epsilon: true }
    }

    /// Fields a single window dropped are dropped for every later window too.
    fn merge_removed_fields(&mut self, used: &AggregationDescriptor) {
        for field in &used.empty_fields {
            if self.descriptor.empty_fields.contains(field) {
                continue;
            }
            if let Some(removed) =
                remove_field(&self.descriptor, field, self.options.bucket_sizes)
            {
                self.descriptor = removed;
            }
        }
    }

    async fn fetch_bucket(
        &self,
        window: TimeRange,
        mut descriptor: AggregationDescriptor,
    ) -> Result<(Vec<Log>, AggregationDescriptor)> {
        loop {
            let body = SearchBody::new()
                .size(0)
                .filter(range_filter(&self.options.time_field, window))
                .maybe_filter(self.filter.as_ref())
                .aggregations(descriptor.es_aggr.clone())
                .build();

            let result = match search_or_empty(
                &*self.store,
                &self.indices,
                &body,
                OP_AGGREGATE_BUCKET,
            )
            .await
            {
                Ok(response) if response.hits.total == 0 => Ok(Vec::new()),
                Ok(response) => rows_from_response(&response, &descriptor),
                Err(e) => Err(e),
            };

            let e = match result {
                Ok(logs) => {
                    debug!(%window, rows = logs.len(), "Fetched aggregation window");
                    return Ok((logs, descriptor));
                }
                Err(e) => e,
            };

            let Some(FetchError::MissingField(field)) = e.downcast_ref::<FetchError>() else {
                return Err(e);
            };
            let Some(removed) = remove_field(&descriptor, field, self.options.bucket_sizes) else {
                return Err(e);
            };

            warn!(%window, %field, "Grouping field is not mapped, retrying window without it");
            METRICS
                .field_removal_retries
                .with_label_values(&[self.store.name()])
                .inc();
            descriptor = removed;
        }
    }
}

#[cfg(test)]
#[path = "windowed_tests.rs"]
mod tests;
