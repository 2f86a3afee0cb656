//! Pipeline drivers: email ingest and the retry passes.

pub mod ingest;
pub mod retry;

pub use ingest::{IngestOutcome, IngestPipeline};
pub use retry::RetryDriver;
