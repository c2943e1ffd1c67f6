use std::{collections::VecDeque, sync::Arc};

use async_trait::async_trait;
use color_eyre::eyre::{Result, bail, eyre};
use ctor::ctor;
use nori_workflow_types::{json, log::Log};
use parking_lot::Mutex;
use serde_json::Value;
use time::{Duration, OffsetDateTime, macros::datetime};

use crate::{
    ConnectorError,
    memory::MemoryStore,
    query::TimeRange,
    search::{Search, SearchResponse},
};

pub const INDEX: &str = "logs";
pub const TIME_FIELD: &str = "@timestamp";
pub const BASE: OffsetDateTime = datetime!(2024-01-01 00:00:00 UTC);

#[ctor]
fn init() {
    color_eyre::install().unwrap();
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

pub fn at(seconds: i64) -> OffsetDateTime {
    BASE + Duration::seconds(seconds)
}

pub fn range(start_seconds: i64, end_seconds: i64) -> TimeRange {
    TimeRange::new(at(start_seconds), at(end_seconds))
}

/// A stored document `seconds` after `BASE`, with `id` to tell tied points apart.
pub fn point(seconds: i64, id: u64) -> Log {
    let mut log = Log::new();
    log.insert(
        TIME_FIELD.to_string(),
        Value::from(nori_common::time_utils::format_rfc3339(at(seconds))),
    );
    log.insert("id".to_string(), json!(id));
    log
}

pub fn store_with(points: impl IntoIterator<Item = Log>) -> Arc<MemoryStore> {
    let store = MemoryStore::new();
    store.insert(INDEX, points);
    Arc::new(store)
}

pub fn indices() -> Vec<String> {
    vec![INDEX.to_string()]
}

/// Answers searches from a fixed script of responses, in order. Errors are returned as
/// the store's error payload.
#[derive(Debug, Default)]
pub struct ScriptedStore {
    responses: Mutex<VecDeque<Result<Value, Value>>>,
}

impl ScriptedStore {
    pub fn new(responses: impl IntoIterator<Item = Value>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().map(Ok).collect()),
        }
    }

    pub fn with_error(self, payload: Value) -> Self {
        self.responses.lock().push_back(Err(payload));
        self
    }
}

#[async_trait]
impl Search for ScriptedStore {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn search(&self, _indices: &[String], _body: &Value) -> Result<SearchResponse> {
        let response = self
            .responses
            .lock()
            .pop_front()
            .ok_or_else(|| eyre!("scripted store ran out of responses"))?;
        match response {
            Ok(response) => Ok(serde_json::from_value(response)?),
            Err(payload) => bail!(ConnectorError::ServerResp(400, payload.to_string())),
        }
    }
}
