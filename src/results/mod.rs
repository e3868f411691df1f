//! Persisted measurement results.
//!
//! Every measurement product is appended to a CSV sink: one header line
//! (emitted lazily on the first `add`), then data lines in measurement
//! order. Field values never contain commas, so the writer never needs to
//! quote and the files stay trivially `cut`/`awk`-able.

pub mod stats;

use crate::Result;
use crate::config::BenchConfig;
use anyhow::Context;
use chrono::{Local, NaiveDateTime};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

/// One column of a result schema: `key` addresses values in a [`Row`],
/// `title` is what lands in the header line.
#[derive(Debug, Clone, Copy)]
pub struct Column {
    pub key: &'static str,
    pub title: &'static str,
}

/// A field value. Times render in the server's log format
/// (`YYYYMMDD:HHMMSS.mmm`, millisecond-truncated local time); floats render
/// naturally, which keeps NaN visible in the output instead of masking it.
#[derive(Debug, Clone)]
pub enum Value {
    Time(NaiveDateTime),
    Int(i64),
    Float(f64),
    Str(String),
}

impl Value {
    fn render(&self) -> String {
        match self {
            Value::Time(t) => t.format("%Y%m%d:%H%M%S%.3f").to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Str(s) => s.clone(),
        }
    }
}

/// A result row keyed by column key. Keys missing from the row render as
/// empty fields.
pub type Row = BTreeMap<&'static str, Value>;

/// Append-only structured-record writer/reader.
pub struct ResultSink {
    path: PathBuf,
    columns: &'static [Column],
    has_header: bool,
    rows: Vec<Vec<String>>,
}

impl ResultSink {
    pub fn new(path: impl Into<PathBuf>, columns: &'static [Column]) -> Self {
        Self {
            path: path.into(),
            columns,
            has_header: false,
            rows: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record. The header line is written exactly once, before
    /// the first data line, no matter how often `add` is called.
    pub fn add(&mut self, row: &Row) -> Result<()> {
        let rendered: Vec<String> = self
            .columns
            .iter()
            .map(|column| row.get(column.key).map(Value::render).unwrap_or_default())
            .collect();

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open result file {}", self.path.display()))?;
        let mut writer = csv::Writer::from_writer(file);

        if !self.has_header {
            writer.write_record(self.columns.iter().map(|column| column.title))?;
            self.has_header = true;
        }
        writer.write_record(&rendered)?;
        writer.flush()?;

        self.rows.push(rendered);
        Ok(())
    }

    /// Read back all data rows of a previously written file, replacing the
    /// in-memory row set. The header line is discarded.
    pub fn load(&mut self, path: Option<&Path>) -> Result<()> {
        let path = path.unwrap_or(&self.path);
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_path(path)
            .with_context(|| format!("open result file {}", path.display()))?;

        self.rows.clear();
        for record in reader.records() {
            let record = record?;
            self.rows.push(record.iter().map(str::to_string).collect());
        }
        Ok(())
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    /// Iterate stored rows grouped by contiguous runs of equal integer
    /// values at `column`. This is a streaming run-length partition, not a
    /// group-by: the driver writes rows in level order, so contiguity is
    /// equivalent to grouping by level while staying cheaper than a sort.
    /// Equal legend values separated by a different one form separate groups.
    pub fn each_legend<F>(&self, column: usize, mut f: F)
    where
        F: FnMut(i64, &[Vec<String>]),
    {
        let mut start = 0;
        while start < self.rows.len() {
            let legend = legend_at(&self.rows[start], column);
            let mut end = start + 1;
            while end < self.rows.len() && legend_at(&self.rows[end], column) == legend {
                end += 1;
            }
            f(legend, &self.rows[start..end]);
            start = end;
        }
    }

    /// Remove the backing file and forget all in-memory state, so the next
    /// `add` starts a fresh file with a fresh header.
    pub fn cleanup(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("failed to remove {}: {err}", self.path.display());
            }
        }
        self.has_header = false;
        self.rows.clear();
    }
}

fn legend_at(row: &[String], column: usize) -> i64 {
    row.get(column)
        .and_then(|field| field.trim().parse().ok())
        .unwrap_or(0)
}

pub const WRITE_THROUGHPUT_COLUMNS: &[Column] = &[
    Column { key: "begin_time", title: "Begin time" },
    Column { key: "end_time", title: "End time" },
    Column { key: "n_enabled_hosts", title: "Enabled hosts" },
    Column { key: "n_enabled_items", title: "Enabled items" },
    Column { key: "dbsync_average", title: "Average processing time [msec/history]" },
    Column { key: "n_written_items", title: "Written histories" },
    Column { key: "total_time", title: "Total processing time [sec]" },
    Column { key: "n_read_items", title: "Read histories" },
    Column { key: "total_read_time", title: "Total read time [sec]" },
    Column { key: "n_agent_errors", title: "Agent errors" },
];

pub const READ_LATENCY_LOG_COLUMNS: &[Column] = &[
    Column { key: "n_enabled_hosts", title: "Enabled hosts" },
    Column { key: "n_enabled_items", title: "Enabled items" },
    Column { key: "history_duration", title: "History duration" },
    Column { key: "read_latency", title: "Read latency [sec]" },
];

pub const READ_LATENCY_COLUMNS: &[Column] = &[
    Column { key: "n_enabled_hosts", title: "Enabled hosts" },
    Column { key: "n_enabled_items", title: "Enabled items" },
    Column { key: "history_duration", title: "History duration" },
    Column { key: "read_latency", title: "Read latency [sec]" },
    Column { key: "success_count", title: "Success count" },
    Column { key: "error_count", title: "Error count" },
];

pub const READ_THROUGHPUT_LOG_COLUMNS: &[Column] = &[
    Column { key: "time", title: "Time" },
    Column { key: "n_enabled_hosts", title: "Enabled hosts" },
    Column { key: "n_enabled_items", title: "Enabled items" },
    Column { key: "thread", title: "Thread" },
    Column { key: "history_duration", title: "History duration" },
    Column { key: "processed_items", title: "Processed items" },
    Column { key: "processed_time", title: "Processed time" },
];

pub const READ_THROUGHPUT_COLUMNS: &[Column] = &[
    Column { key: "n_enabled_hosts", title: "Enabled hosts" },
    Column { key: "n_enabled_items", title: "Enabled items" },
    Column { key: "history_duration", title: "History duration" },
    Column { key: "read_histories", title: "Read histories" },
    Column { key: "read_time", title: "Total read time" },
    Column { key: "written_histories", title: "Written histories" },
];

pub const SELF_HISTORY_COLUMNS: &[Column] = &[
    Column { key: "n_enabled_hosts", title: "Enabled hosts" },
    Column { key: "n_enabled_items", title: "Enabled items" },
    Column { key: "clock", title: "Clock" },
    Column { key: "value", title: "Value" },
];

pub const ERROR_LOG_COLUMNS: &[Column] = &[
    Column { key: "time", title: "Time" },
    Column { key: "message", title: "Message" },
];

/// Durable audit trail of API failures. Shared across probe workers, so the
/// sink sits behind a mutex; recording must never panic or propagate.
pub struct ErrorLog {
    inner: Mutex<ResultSink>,
}

impl ErrorLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            inner: Mutex::new(ResultSink::new(path, ERROR_LOG_COLUMNS)),
        }
    }

    pub fn record(&self, message: &str) {
        let mut sink = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let mut row = Row::new();
        row.insert("time", Value::Time(Local::now().naive_local()));
        // Commas would make the writer quote the field, breaking the
        // no-quoting file contract; flatten them instead.
        row.insert("message", Value::Str(message.replace(',', ";")));
        if let Err(err) = sink.add(&row) {
            tracing::warn!("failed to append to error log: {err}");
        }
    }

    pub fn cleanup(&self) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cleanup();
    }

    #[cfg(test)]
    pub fn row_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .rows()
            .len()
    }
}

/// The full set of sinks one benchmark run writes to.
pub struct BenchmarkResults {
    pub write_throughput: ResultSink,
    pub read_throughput: ResultSink,
    pub read_throughput_log: ResultSink,
    pub read_latency: ResultSink,
    pub read_latency_log: ResultSink,
    /// One sink per configured self-monitoring target, in config order.
    pub histories: Vec<ResultSink>,
    pub error_log: ErrorLog,
}

impl BenchmarkResults {
    pub fn new(config: &BenchConfig) -> Self {
        Self {
            write_throughput: ResultSink::new(
                &config.write_throughput_result_file,
                WRITE_THROUGHPUT_COLUMNS,
            ),
            read_throughput: ResultSink::new(
                &config.read_throughput.result_file,
                READ_THROUGHPUT_COLUMNS,
            ),
            read_throughput_log: ResultSink::new(
                &config.read_throughput.log_file,
                READ_THROUGHPUT_LOG_COLUMNS,
            ),
            read_latency: ResultSink::new(&config.read_latency.result_file, READ_LATENCY_COLUMNS),
            read_latency_log: ResultSink::new(
                &config.read_latency.log_file,
                READ_LATENCY_LOG_COLUMNS,
            ),
            histories: config
                .histories
                .iter()
                .map(|target| ResultSink::new(&target.path, SELF_HISTORY_COLUMNS))
                .collect(),
            error_log: ErrorLog::new(&config.error_log_file),
        }
    }

    pub fn cleanup(&mut self) {
        self.write_throughput.cleanup();
        self.read_throughput.cleanup();
        self.read_throughput_log.cleanup();
        self.read_latency.cleanup();
        self.read_latency_log.cleanup();
        for sink in &mut self.histories {
            sink.cleanup();
        }
        self.error_log.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;

    fn latency_row(hosts: i64, items: i64, duration: i64, latency: f64) -> Row {
        let mut row = Row::new();
        row.insert("n_enabled_hosts", Value::Int(hosts));
        row.insert("n_enabled_items", Value::Int(items));
        row.insert("history_duration", Value::Int(duration));
        row.insert("read_latency", Value::Float(latency));
        row
    }

    #[test]
    fn header_is_written_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("latency.csv");
        let mut sink = ResultSink::new(&path, READ_LATENCY_LOG_COLUMNS);

        sink.add(&latency_row(10, 300, 600, 0.25)).unwrap();
        sink.add(&latency_row(10, 300, 600, 0.5)).unwrap();
        sink.add(&latency_row(20, 600, 600, 0.75)).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(
            lines[0],
            "Enabled hosts,Enabled items,History duration,Read latency [sec]"
        );
        assert_eq!(lines[1], "10,300,600,0.25");
    }

    #[test]
    fn load_round_trips_data_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("latency.csv");

        let mut sink = ResultSink::new(&path, READ_LATENCY_LOG_COLUMNS);
        sink.add(&latency_row(10, 300, 600, 0.25)).unwrap();
        sink.add(&latency_row(20, 600, 600, 0.5)).unwrap();
        let written = sink.rows().to_vec();

        let mut reloaded = ResultSink::new(&path, READ_LATENCY_LOG_COLUMNS);
        reloaded.load(None).unwrap();
        assert_eq!(reloaded.rows(), &written[..]);
    }

    #[test]
    fn missing_fields_render_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("latency.csv");
        let mut sink = ResultSink::new(&path, READ_LATENCY_LOG_COLUMNS);

        let mut row = Row::new();
        row.insert("n_enabled_hosts", Value::Int(10));
        sink.add(&row).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().nth(1).unwrap(), "10,,,");
    }

    #[test]
    fn time_values_use_log_timestamp_format() {
        let timestamp = NaiveDate::from_ymd_opt(2012, 11, 28)
            .unwrap()
            .and_hms_milli_opt(15, 28, 40, 119)
            .unwrap();
        assert_eq!(Value::Time(timestamp).render(), "20121128:152840.119");
    }

    #[test]
    fn nan_floats_stay_visible() {
        assert_eq!(Value::Float(f64::NAN).render(), "NaN");
    }

    #[test]
    fn each_legend_groups_contiguous_runs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("latency.csv");
        let mut sink = ResultSink::new(&path, READ_LATENCY_LOG_COLUMNS);

        for (items, latency) in [(300, 0.1), (300, 0.2), (600, 0.3), (600, 0.4)] {
            sink.add(&latency_row(10, items, 600, latency)).unwrap();
        }

        let mut seen = Vec::new();
        sink.each_legend(1, |legend, rows| seen.push((legend, rows.len())));
        assert_eq!(seen, vec![(300, 2), (600, 2)]);
    }

    #[test]
    fn each_legend_is_order_dependent() {
        // Interleaved legends split into separate runs rather than being
        // re-merged. Rows from a re-measured level would therefore form a
        // second cohort in the statistics output; that matches the file
        // format contract (one group per output line, in file order).
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("latency.csv");
        let mut sink = ResultSink::new(&path, READ_LATENCY_LOG_COLUMNS);

        for items in [300, 300, 600, 300] {
            sink.add(&latency_row(10, items, 600, 0.1)).unwrap();
        }

        let mut seen = Vec::new();
        sink.each_legend(1, |legend, rows| seen.push((legend, rows.len())));
        assert_eq!(seen, vec![(300, 2), (600, 1), (300, 1)]);
    }

    #[test]
    fn cleanup_resets_header_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("latency.csv");
        let mut sink = ResultSink::new(&path, READ_LATENCY_LOG_COLUMNS);

        sink.add(&latency_row(10, 300, 600, 0.25)).unwrap();
        sink.cleanup();
        assert!(!path.exists());

        sink.add(&latency_row(20, 600, 600, 0.5)).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("Enabled hosts"));
        assert_eq!(text.lines().count(), 2);
    }

    #[test]
    fn error_log_records_are_appended() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("errors.csv");
        let errors = ErrorLog::new(&path);

        errors.record("transport failure: connection refused");
        errors.record("request timed out: history.get");

        assert_eq!(errors.row_count(), 2);
        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 3);
        assert!(text.lines().nth(1).unwrap().contains("connection refused"));
    }

    #[test]
    fn error_messages_with_commas_stay_unquoted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("errors.csv");
        let errors = ErrorLog::new(&path);

        errors.record("transport failure: error sending request, retried");

        let text = fs::read_to_string(&path).unwrap();
        let line = text.lines().nth(1).unwrap();
        assert!(!line.contains('"'), "field must not be quoted: {line}");
        assert_eq!(line.split(',').count(), 2, "exactly two fields: {line}");
        assert!(line.ends_with("transport failure: error sending request; retried"));
    }
}
