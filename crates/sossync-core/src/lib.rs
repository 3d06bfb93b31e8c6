// Public fallible APIs in this crate share one concrete error contract (`SyncError`).
// Repeating per-function `# Errors` boilerplate obscures behavior more than it clarifies.
#![allow(
    clippy::missing_errors_doc,
    reason = "crate-wide fallible API uses one explicit error type; per-item boilerplate would duplicate contract"
)]

pub(crate) mod cache;
pub mod config;
pub mod divergence;
pub mod error;
pub mod exporter;
pub mod filter;
pub mod models;
pub mod poller;
pub mod sos;
pub mod source;
pub mod token_store;
pub mod trim;
pub mod writer;

pub use error::{Result, SyncError};
pub use exporter::{CancelToken, Exporter, RunSummary};
