pub mod expr;
pub mod interval;
pub mod log;
pub mod pushdown;
pub mod step;
pub mod summarize;

#[cfg(test)]
mod interval_tests;

pub use serde_json::json;
