pub mod humantime_utils;
pub mod metrics;
pub mod time_utils;
