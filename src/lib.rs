pub mod app;
pub mod catalog;
pub mod chat;
pub mod cli;
pub mod error;
pub mod ingest;
pub mod metering;
pub mod platform;
pub mod reporting;
pub mod storage;

pub use error::{Error, Result};
