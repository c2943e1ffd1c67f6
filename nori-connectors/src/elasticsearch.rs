use std::time::Duration;

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use bytes::BytesMut;
use color_eyre::eyre::{Context, Result, bail, eyre};
use nori_common::{
    humantime_utils::{deserialize_duration, serialize_duration},
    metrics::CONNECTOR_ELASTICSEARCH,
};
use reqwest::{Client, RequestBuilder, Response, header};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::instrument;

use crate::{
    ConnectorError,
    aggregation::{BucketSizes, DEFAULT_BUCKET_SIZE, DEFAULT_CARDINALITY_BUCKET_SIZE},
    paginate::{DEFAULT_DEEP_PAGING_LIMIT, DEFAULT_FETCH_SIZE, DEFAULT_TIME_FIELD, FetchOptions},
    search::{Search, SearchResponse},
    windowed::{AggregationOptions, DEFAULT_AGGREGATION_CONCURRENCY},
};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
#[derive(Default)]
pub enum ElasticsearchAuth {
    #[default]
    None,
    Basic {
        username: String,
        password: String,
    },
    ApiKey {
        key: String,
    },
}

impl ElasticsearchAuth {
    fn apply_to_request(&self, req: RequestBuilder) -> RequestBuilder {
        match self {
            ElasticsearchAuth::None => req,
            ElasticsearchAuth::Basic { username, password } => {
                let credentials = format!("{username}:{password}");
                let encoded = BASE64.encode(credentials);
                req.header(header::AUTHORIZATION, format!("Basic {encoded}"))
            }
            ElasticsearchAuth::ApiKey { key } => {
                req.header(header::AUTHORIZATION, format!("ApiKey {key}"))
            }
        }
    }
}

fn default_indices() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_time_field() -> String {
    DEFAULT_TIME_FIELD.to_string()
}

fn default_fetch_size() -> u64 {
    DEFAULT_FETCH_SIZE
}

fn default_deep_paging_limit() -> u64 {
    DEFAULT_DEEP_PAGING_LIMIT
}

fn default_aggregation_concurrency() -> usize {
    DEFAULT_AGGREGATION_CONCURRENCY
}

fn default_cardinality_bucket_size() -> u64 {
    DEFAULT_CARDINALITY_BUCKET_SIZE
}

fn default_bucket_size() -> u64 {
    DEFAULT_BUCKET_SIZE
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ElasticsearchConfig {
    url: String,

    #[serde(default)]
    auth: ElasticsearchAuth,

    #[serde(default = "default_indices")]
    indices: Vec<String>,

    #[serde(default = "default_time_field")]
    time_field: String,

    #[serde(default = "default_fetch_size")]
    fetch_size: u64,

    /// Largest offset reachable while paging through rows sharing one timestamp.
    #[serde(default = "default_deep_paging_limit")]
    deep_paging_limit: u64,

    #[serde(default = "default_aggregation_concurrency")]
    aggregation_concurrency: usize,

    #[serde(default = "default_cardinality_bucket_size")]
    cardinality_bucket_size: u64,

    #[serde(default = "default_bucket_size")]
    bucket_size: u64,

    #[serde(
        default = "default_request_timeout",
        serialize_with = "serialize_duration",
        deserialize_with = "deserialize_duration"
    )]
    request_timeout: Duration,
}

impl ElasticsearchConfig {
    pub fn new(url: String) -> Self {
        Self {
            url,
            auth: ElasticsearchAuth::None,
            indices: default_indices(),
            time_field: default_time_field(),
            fetch_size: default_fetch_size(),
            deep_paging_limit: default_deep_paging_limit(),
            aggregation_concurrency: default_aggregation_concurrency(),
            cardinality_bucket_size: default_cardinality_bucket_size(),
            bucket_size: default_bucket_size(),
            request_timeout: default_request_timeout(),
        }
    }

    pub fn with_indices(mut self, indices: Vec<String>) -> Self {
        self.indices = indices;
        self
    }

    pub fn with_time_field(mut self, time_field: impl Into<String>) -> Self {
        self.time_field = time_field.into();
        self
    }

    pub fn with_fetch_size(mut self, fetch_size: u64) -> Self {
        self.fetch_size = fetch_size;
        self
    }

    pub fn with_deep_paging_limit(mut self, deep_paging_limit: u64) -> Self {
        self.deep_paging_limit = deep_paging_limit;
        self
    }

    pub fn with_aggregation_concurrency(mut self, aggregation_concurrency: usize) -> Self {
        self.aggregation_concurrency = aggregation_concurrency;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn indices(&self) -> &[String] {
        &self.indices
    }

    pub fn time_field(&self) -> &str {
        &self.time_field
    }

    pub fn bucket_sizes(&self) -> BucketSizes {
        BucketSizes {
            cardinality: self.cardinality_bucket_size,
            default: self.bucket_size,
        }
    }

    pub fn fetch_options(&self) -> FetchOptions {
        FetchOptions {
            time_field: self.time_field.clone(),
            fetch_size: self.fetch_size,
            deep_paging_limit: self.deep_paging_limit,
        }
    }

    pub fn aggregation_options(&self) -> AggregationOptions {
        AggregationOptions {
            time_field: self.time_field.clone(),
            concurrency: self.aggregation_concurrency,
            bucket_sizes: self.bucket_sizes(),
        }
    }
}

async fn response_to_bytes(response: Response) -> Result<BytesMut> {
    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        bail!(ConnectorError::ServerResp(status.as_u16(), text));
    }
    let bytes = response.bytes().await.context("bytes from response")?;
    Ok(bytes.into())
}

#[instrument(skip_all, name = "elasticsearch send_request")]
async fn send_request(req: RequestBuilder) -> Result<BytesMut> {
    match req.send().await {
        Ok(response) => response_to_bytes(response).await,
        Err(e) => Err(eyre!(ConnectorError::Http(e))),
    }
}

/// `Search` over an Elasticsearch compatible `_search` endpoint.
#[derive(Debug)]
pub struct ElasticsearchClient {
    config: ElasticsearchConfig,
    client: Client,
}

impl ElasticsearchClient {
    pub fn new(config: ElasticsearchConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .context("build http client")?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &ElasticsearchConfig {
        &self.config
    }

    fn search_url(&self, indices: &[String]) -> String {
        format!(
            "{}/{}/_search",
            self.config.url.trim_end_matches('/'),
            indices.join(",")
        )
    }
}

#[async_trait]
impl Search for ElasticsearchClient {
    fn name(&self) -> &'static str {
        CONNECTOR_ELASTICSEARCH
    }

    #[instrument(skip(self, body), name = "elasticsearch search")]
    async fn search(&self, indices: &[String], body: &Value) -> Result<SearchResponse> {
        let req = self
            .config
            .auth
            .apply_to_request(self.client.post(self.search_url(indices)))
            .json(body);

        let mut bytes = send_request(req).await?;
        simd_json::serde::from_slice(bytes.as_mut()).context("parse search response")
    }
}
