//! Error taxonomy for the harness.
//!
//! Only configuration errors are allowed to terminate a run. API errors are
//! recovered by the retry wrapper in `api`, and everything below that is
//! degraded into a warning or a NaN/zero measurement by the driver.

use thiserror::Error;

/// Failures raised by the monitoring API or by history-store probes.
///
/// All variants are retried by [`crate::api::ensure_call`]; `NoHistory` marks
/// a query that succeeded on the wire but returned zero records, which the
/// latency probe counts as a failed trial.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("server rejected request: {0}")]
    Rejected(String),

    #[error("query returned no history")]
    NoHistory,
}

/// Fatal configuration problems, raised before any measurement begins.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown history backend: {0:?}")]
    UnknownBackend(String),

    #[error("num_hosts must be greater than zero")]
    EmptyPopulation,
}
