//! Management-API seam.
//!
//! The driver only talks to the server through the [`MonitorApi`] trait and
//! the [`ensure_call`] retry wrapper. The JSON-RPC implementation lives in
//! [`rpc`]; tests substitute in-memory fakes.

pub mod rpc;

use crate::error::ApiError;
use crate::results::ErrorLog;
use chrono::NaiveDateTime;

pub use rpc::RpcClient;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Clone)]
pub struct HostRef {
    pub id: u64,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct ItemRef {
    pub id: u64,
    pub value_type: ValueType,
}

/// Data types a monitored item can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Float,
    Str,
    Log,
    Integer,
    Text,
}

impl ValueType {
    /// Types the read probes may query for; log/text histories are not
    /// filled by the benchmark setup.
    pub const SUPPORTED: &'static [ValueType] =
        &[ValueType::Float, ValueType::Str, ValueType::Integer];

    pub fn code(self) -> u8 {
        match self {
            ValueType::Float => 0,
            ValueType::Str => 1,
            ValueType::Log => 2,
            ValueType::Integer => 3,
            ValueType::Text => 4,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(ValueType::Float),
            1 => Some(ValueType::Str),
            2 => Some(ValueType::Log),
            3 => Some(ValueType::Integer),
            4 => Some(ValueType::Text),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HistoryRecord {
    pub item_id: u64,
    pub clock: i64,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostStatus {
    Monitored,
    Unmonitored,
}

/// Operations the harness needs from the monitoring server's management API.
///
/// Implementations must be shareable across probe worker threads. Every call
/// may fail with a recoverable [`ApiError`]; the driver never invokes these
/// outside the retry wrapper.
pub trait MonitorApi: Send + Sync {
    fn login(&self) -> ApiResult<()>;
    fn is_logged_in(&self) -> bool;
    fn api_version(&self) -> ApiResult<String>;

    fn create_host(
        &self,
        name: &str,
        group: &str,
        template: &str,
        agent: &crate::config::AgentAddr,
        status: HostStatus,
    ) -> ApiResult<()>;
    fn delete_host(&self, host_id: u64) -> ApiResult<()>;

    fn enable_hosts(&self, hostnames: &[String]) -> ApiResult<()>;
    fn disable_hosts(&self, hostnames: &[String]) -> ApiResult<()>;

    fn get_host_id(&self, hostname: &str) -> ApiResult<Option<u64>>;
    fn get_enabled_hosts(&self) -> ApiResult<Vec<HostRef>>;
    fn get_registered_test_hosts(&self, group: &str) -> ApiResult<Vec<HostRef>>;

    fn get_items(&self, hostname: &str) -> ApiResult<Vec<ItemRef>>;
    fn get_enabled_items(&self, host_ids: &[u64]) -> ApiResult<Vec<ItemRef>>;
    fn get_items_range(&self, hostnames: &[String]) -> ApiResult<(u64, u64)>;

    fn get_history(
        &self,
        item: &ItemRef,
        begin: NaiveDateTime,
        end: NaiveDateTime,
    ) -> ApiResult<Vec<HistoryRecord>>;
    fn get_history_by_host(
        &self,
        host_id: u64,
        value_type: ValueType,
        begin: NaiveDateTime,
        end: NaiveDateTime,
    ) -> ApiResult<Vec<HistoryRecord>>;
    /// History of the item with key `key` on `hostname`. An unknown key
    /// yields an empty history, not an error.
    fn get_history_by_key(
        &self,
        hostname: &str,
        key: &str,
        begin: NaiveDateTime,
        end: NaiveDateTime,
    ) -> ApiResult<Vec<HistoryRecord>>;

    fn ensure_logged_in(&self) -> ApiResult<()> {
        if self.is_logged_in() {
            Ok(())
        } else {
            self.login()
        }
    }
}

/// Retry wrapper around any fallible API interaction.
///
/// Retries up to `max_retry` extra attempts with no backoff, then re-raises
/// the last error. Every failure is appended to the error sink, whether the
/// call eventually succeeds or not, so transparently-retried failures stay
/// visible in the audit trail.
pub fn ensure_call<T>(
    max_retry: u32,
    error_log: &ErrorLog,
    mut op: impl FnMut() -> ApiResult<T>,
) -> ApiResult<T> {
    let mut retries = 0;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) => {
                error_log.record(&err.to_string());
                if retries >= max_retry {
                    return Err(err);
                }
                retries += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn error_log() -> (tempfile::TempDir, ErrorLog) {
        let dir = tempfile::tempdir().unwrap();
        let log = ErrorLog::new(dir.path().join("errors.csv"));
        (dir, log)
    }

    fn flaky(failures: usize) -> impl FnMut() -> ApiResult<u32> {
        let mut remaining = failures;
        move || {
            if remaining > 0 {
                remaining -= 1;
                Err(ApiError::Transport("connection refused".to_string()))
            } else {
                Ok(42)
            }
        }
    }

    #[test]
    fn succeeds_after_k_failures_and_logs_each() {
        let (_dir, log) = error_log();
        let result = ensure_call(3, &log, flaky(3));
        assert_eq!(result.unwrap(), 42);
        assert_eq!(log.row_count(), 3);
    }

    #[test]
    fn immediate_success_logs_nothing() {
        let (_dir, log) = error_log();
        assert_eq!(ensure_call(3, &log, flaky(0)).unwrap(), 42);
        assert_eq!(log.row_count(), 0);
    }

    #[test]
    fn exhausted_retries_propagate_the_final_error() {
        let (_dir, log) = error_log();
        let result = ensure_call(2, &log, flaky(4));
        assert!(matches!(result, Err(ApiError::Transport(_))));
        // One entry per attempt: the initial call plus two retries.
        assert_eq!(log.row_count(), 3);
    }

    #[test]
    fn zero_retries_means_one_attempt() {
        let (_dir, log) = error_log();
        assert!(ensure_call(0, &log, flaky(1)).is_err());
        assert_eq!(log.row_count(), 1);
    }
}
