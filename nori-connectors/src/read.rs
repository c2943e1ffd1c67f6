use std::sync::Arc;

use async_stream::try_stream;
use color_eyre::eyre::Result;
use nori_workflow_types::{
    expr::Expr,
    log::Row,
    pushdown::{Direction, Pushdown},
};
use tracing::{info, instrument};

use crate::{
    RowBatchTryStream,
    elasticsearch::ElasticsearchConfig,
    filter::FilterCompiler,
    paginate::PaginatedFetcher,
    query::TimeRange,
    search::Search,
    windowed::WindowedAggregationFetcher,
};

/// One read over a time range, with whatever the optimizer pushed down.
#[derive(Debug, Clone)]
pub struct ReadRequest {
    pub range: TimeRange,
    pub filter: Option<Expr>,
    pub pushdown: Pushdown,
    /// Field whose comparisons are already handled elsewhere and should match everything.
    pub skip_field: Option<String>,
}

impl ReadRequest {
    pub fn new(range: TimeRange) -> Self {
        Self {
            range,
            filter: None,
            pushdown: Pushdown::None,
            skip_field: None,
        }
    }

    pub fn with_filter(mut self, filter: Expr) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_pushdown(mut self, pushdown: Pushdown) -> Self {
        self.pushdown = pushdown;
        self
    }

    pub fn with_skip_field(mut self, field: impl Into<String>) -> Self {
        self.skip_field = Some(field.into());
        self
    }
}

/// Streams the rows of `request` from `store`. Batches are chronological, except that
/// windowed aggregations are ordered by window. Dropping the stream stops any further
/// requests.
#[instrument(skip_all, fields(range = %request.range, pushdown = %request.pushdown))]
pub fn read(
    store: Arc<dyn Search>,
    config: &ElasticsearchConfig,
    request: ReadRequest,
) -> Result<RowBatchTryStream> {
    let compiler = match &request.skip_field {
        Some(field) => FilterCompiler::with_skip_field(field.clone()),
        None => FilterCompiler::default(),
    };
    let filter = request
        .filter
        .as_ref()
        .map(|expr| compiler.compile(expr))
        .transpose()?;

    info!(filter = ?filter, "Reading from {}", store.name());

    let indices = config.indices().to_vec();
    let paginated = |store: Arc<dyn Search>| {
        PaginatedFetcher::new(store, indices.clone(), request.range, config.fetch_options())
            .with_filter(filter.clone())
    };

    Ok(match request.pushdown {
        Pushdown::None => paginated(store).into_stream(),
        Pushdown::Head(limit) => paginated(store).with_limit(Some(limit)).into_stream(),
        Pushdown::Tail(limit) => tail_stream(
            paginated(store)
                .with_direction(Direction::Desc)
                .with_limit(Some(limit)),
        ),
        Pushdown::Reduce(descriptor) => WindowedAggregationFetcher::new(
            store,
            indices.clone(),
            request.range,
            descriptor,
            config.aggregation_options(),
        )?
        .with_filter(filter.clone())
        .into_stream(),
    })
}

/// Pages backwards from the end of the range, then emits everything oldest first.
fn tail_stream(mut fetcher: PaginatedFetcher) -> RowBatchTryStream {
    Box::pin(try_stream! {
        let mut batches: Vec<Vec<Row>> = Vec::new();
        loop {
            let batch = fetcher.fetch().await?;
            if !batch.rows.is_empty() {
                batches.push(batch.rows);
            }
            if batch.eof {
                break;
            }
        }

        let rows: Vec<Row> = batches.into_iter().rev().flatten().collect();
        if !rows.is_empty() {
            yield rows;
        }
    })
}
