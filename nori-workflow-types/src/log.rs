use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Name of the time key on every emitted row, whatever the store calls it.
pub const TIME_FIELD_NAME: &str = "time";

pub type Log = Map<String, Value>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub log: Log,

    /// The row's time is a bucket boundary rather than an exact point time.
    #[serde(default)]
    pub epsilon: bool,
}

impl Row {
    pub fn new(log: Log) -> Self {
        Self {
            log,
            epsilon: false,
        }
    }

    pub fn time(&self) -> Option<&Value> {
        self.log.get(TIME_FIELD_NAME)
    }
}

impl From<Log> for Row {
    fn from(log: Log) -> Self {
        Self::new(log)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    pub rows: Vec<Row>,
    pub eof: bool,
}

impl Batch {
    pub fn eof() -> Self {
        Self {
            rows: Vec::new(),
            eof: true,
        }
    }
}
