//! Pluggable history store used by the read benchmark.
//!
//! The backend is picked by name in the configuration; an unknown name is a
//! fatal configuration error raised before any measurement begins. Probes
//! only see the [`HistoryStore`] capability interface.

use crate::api::{ApiResult, HistoryRecord, ItemRef, MonitorApi};
use crate::config::BenchConfig;
use crate::error::{ApiError, ConfigError};
use chrono::NaiveDateTime;
use std::process::Command;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// The product's own history storage, queried through the management API.
    Native,
    /// Storage managed by an external history CLI tool; ranged reads still go
    /// through the management API, but filling and clearing data is delegated
    /// to the tool.
    Command,
}

impl BackendKind {
    pub fn parse(name: &str) -> Result<Self, ConfigError> {
        match name {
            "native" => Ok(BackendKind::Native),
            "command" => Ok(BackendKind::Command),
            other => Err(ConfigError::UnknownBackend(other.to_string())),
        }
    }
}

/// Capability interface of a history backend.
pub trait HistoryStore: Send + Sync {
    fn get_histories(
        &self,
        item: &ItemRef,
        begin: NaiveDateTime,
        end: NaiveDateTime,
    ) -> ApiResult<Vec<HistoryRecord>>;

    /// Pre-fill history data for one item over the configured data window.
    fn setup_histories(&self, item: &ItemRef) -> ApiResult<()>;

    /// Drop all benchmark history data. Callers treat failures as
    /// best-effort: a failed clear degrades the measurement, it does not
    /// abort the run.
    fn cleanup_histories(&self) -> ApiResult<()>;
}

pub fn open_backend(
    config: &BenchConfig,
    api: Arc<dyn MonitorApi>,
) -> Result<Box<dyn HistoryStore>, ConfigError> {
    match BackendKind::parse(&config.history_backend)? {
        BackendKind::Native => Ok(Box::new(NativeStore { api })),
        BackendKind::Command => Ok(Box::new(CommandStore {
            api,
            program: config.history_command.clone(),
            begin_time: config.history_data.begin_time.clone().unwrap_or_default(),
            end_time: config.history_data.end_time.clone().unwrap_or_default(),
            interval: config.history_data.interval,
        })),
    }
}

struct NativeStore {
    api: Arc<dyn MonitorApi>,
}

impl HistoryStore for NativeStore {
    fn get_histories(
        &self,
        item: &ItemRef,
        begin: NaiveDateTime,
        end: NaiveDateTime,
    ) -> ApiResult<Vec<HistoryRecord>> {
        self.api.get_history(item, begin, end)
    }

    fn setup_histories(&self, _item: &ItemRef) -> ApiResult<()> {
        Err(ApiError::Rejected(
            "native backend cannot pre-fill history data; \
             let the server accumulate data or use the command backend"
                .to_string(),
        ))
    }

    fn cleanup_histories(&self) -> ApiResult<()> {
        Err(ApiError::Rejected(
            "native backend cannot clear history data".to_string(),
        ))
    }
}

struct CommandStore {
    api: Arc<dyn MonitorApi>,
    program: String,
    begin_time: String,
    end_time: String,
    interval: i64,
}

impl CommandStore {
    fn run(&self, args: &[String]) -> ApiResult<()> {
        let output = Command::new(&self.program)
            .args(args)
            .output()
            .map_err(|err| ApiError::Transport(format!("spawn {}: {err}", self.program)))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(ApiError::Rejected(format!(
                "{} {} failed: {}",
                self.program,
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

impl HistoryStore for CommandStore {
    fn get_histories(
        &self,
        item: &ItemRef,
        begin: NaiveDateTime,
        end: NaiveDateTime,
    ) -> ApiResult<Vec<HistoryRecord>> {
        self.api.get_history(item, begin, end)
    }

    fn setup_histories(&self, item: &ItemRef) -> ApiResult<()> {
        self.run(&[
            "fill".to_string(),
            item.id.to_string(),
            item.value_type.code().to_string(),
            self.begin_time.clone(),
            self.end_time.clone(),
            self.interval.to_string(),
        ])
    }

    fn cleanup_histories(&self) -> ApiResult<()> {
        self.run(&["delete".to_string()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn known_backend_names_parse() {
        assert_eq!(BackendKind::parse("native").unwrap(), BackendKind::Native);
        assert_eq!(BackendKind::parse("command").unwrap(), BackendKind::Command);
    }

    #[test]
    fn unknown_backend_name_is_a_config_error() {
        let err = BackendKind::parse("cassandra").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownBackend(name) if name == "cassandra"));
    }
}
