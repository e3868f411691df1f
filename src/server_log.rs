//! Parsing for the monitoring server's operational log.
//!
//! Every line carries a `PID:YYYYMMDD:HHMMSS.mmm ` prefix followed by free
//! text. Three kinds of entries matter here: history-syncer completions,
//! poller completions, and agent communication failures. Everything else is
//! ignored.
//!
//! Example:
//! 22974:20121128:152840.119 history syncer #4 (1 loop) spent 0.010062 seconds while processing 123 items

use anyhow::Context;
use chrono::{NaiveDate, NaiveDateTime};
use regex::Regex;
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

/// Syncer aggregate for one parsed window.
///
/// `average_msec_per_item` is `total_elapsed / total_items * 1000`; with no
/// items written it is NaN, and that NaN flows through to the result row.
#[derive(Debug, Clone, Copy)]
pub struct DbsyncTotals {
    pub average_msec_per_item: f64,
    pub total_items: u64,
    pub total_elapsed: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct PollerTotals {
    pub total_items: u64,
    pub total_elapsed: f64,
}

/// Streaming parser over the server log with running per-kind tallies.
///
/// `parse` resets the tallies and repopulates them from the file, keeping
/// only entries inside the optional `[begin, end]` window (both bounds
/// inclusive).
pub struct ServerLog {
    path: PathBuf,
    archive_dir: Option<PathBuf>,

    syncer_items: u64,
    syncer_elapsed: f64,
    poller_items: u64,
    poller_elapsed: f64,
    agent_errors: u64,
}

impl ServerLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            archive_dir: None,
            syncer_items: 0,
            syncer_elapsed: 0.0,
            poller_items: 0,
            poller_elapsed: 0.0,
            agent_errors: 0,
        }
    }

    pub fn set_archive_dir(&mut self, dir: impl Into<PathBuf>) {
        self.archive_dir = Some(dir.into());
    }

    fn clear(&mut self) {
        self.syncer_items = 0;
        self.syncer_elapsed = 0.0;
        self.poller_items = 0;
        self.poller_elapsed = 0.0;
        self.agent_errors = 0;
    }

    /// Parse the log, tallying entries whose timestamp falls inside the
    /// window. Lines that match none of the known patterns are skipped.
    pub fn parse(
        &mut self,
        begin: Option<NaiveDateTime>,
        end: Option<NaiveDateTime>,
    ) -> anyhow::Result<()> {
        self.clear();

        // Prefix: pid, then a fixed-width local timestamp with milliseconds.
        let prefix_re =
            Regex::new(r"^\s*(\d+):(\d{4})(\d{2})(\d{2}):(\d{2})(\d{2})(\d{2})\.(\d{3}) (.*)$")?;
        let syncer_re = Regex::new(
            r"^history syncer #(\d+) \(1 loop\) spent (\d+\.\d+) seconds while processing (\d+) items$",
        )?;
        let poller_re =
            Regex::new(r"^poller #(\d+) spent (\d+\.\d+) seconds while updating (\d+) values$")?;
        let agent_error_re = Regex::new(r"^agent item .+ on host .+ failed: .*$")?;

        let file = fs::File::open(&self.path)
            .with_context(|| format!("open server log {}", self.path.display()))?;
        let reader = BufReader::new(file);

        for line in reader.lines() {
            let line = line.with_context(|| format!("read server log {}", self.path.display()))?;
            let Some(caps) = prefix_re.captures(&line) else {
                continue;
            };

            let Some(timestamp) = timestamp_from_captures(&caps) else {
                continue;
            };
            if !in_window(timestamp, begin, end) {
                continue;
            }

            let entry = caps.get(9).map(|m| m.as_str()).unwrap_or_default();
            if let Some(c) = syncer_re.captures(entry) {
                let elapsed: f64 = c[2].parse().unwrap_or(0.0);
                let items: u64 = c[3].parse().unwrap_or(0);
                // Empty syncer loops carry no throughput information.
                if items > 0 {
                    self.syncer_items += items;
                    self.syncer_elapsed += elapsed;
                }
            } else if let Some(c) = poller_re.captures(entry) {
                let elapsed: f64 = c[2].parse().unwrap_or(0.0);
                let items: u64 = c[3].parse().unwrap_or(0);
                // Zero-value poller windows still count.
                self.poller_items += items;
                self.poller_elapsed += elapsed;
            } else if agent_error_re.is_match(entry) {
                self.agent_errors += 1;
            }
        }

        Ok(())
    }

    /// Mean milliseconds per written item over the parsed window, not a mean
    /// of per-entry averages. 0/0 yields NaN on purpose.
    pub fn dbsync_totals(&self) -> DbsyncTotals {
        DbsyncTotals {
            average_msec_per_item: self.syncer_elapsed / self.syncer_items as f64 * 1000.0,
            total_items: self.syncer_items,
            total_elapsed: self.syncer_elapsed,
        }
    }

    pub fn poller_totals(&self) -> PollerTotals {
        PollerTotals {
            total_items: self.poller_items,
            total_elapsed: self.poller_elapsed,
        }
    }

    pub fn agent_error_count(&self) -> u64 {
        self.agent_errors
    }

    /// Move the current log to the archive location, tagged with `suffix`
    /// (typically the enabled-host count). Rotation failures are warned
    /// about, never fatal: losing one archive must not abort a run.
    pub fn rotate(&self, suffix: &str) {
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "server.log".to_string());

        let dest = match &self.archive_dir {
            Some(dir) => dir.join(format!("{file_name}.{suffix}")),
            None => self.path.with_file_name(format!("{file_name}.{suffix}")),
        };

        if let Some(parent) = dest.parent() {
            if let Err(err) = fs::create_dir_all(parent) {
                tracing::warn!(
                    "failed to create archive directory {}: {err}",
                    parent.display()
                );
                return;
            }
        }
        if let Err(err) = fs::rename(&self.path, &dest) {
            tracing::warn!(
                "failed to rotate {} to {}: {err}",
                self.path.display(),
                dest.display()
            );
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn timestamp_from_captures(caps: &regex::Captures<'_>) -> Option<NaiveDateTime> {
    let field = |i: usize| caps.get(i).and_then(|m| m.as_str().parse::<u32>().ok());
    let date = NaiveDate::from_ymd_opt(field(2)? as i32, field(3)?, field(4)?)?;
    date.and_hms_milli_opt(field(5)?, field(6)?, field(7)?, field(8)?)
}

fn in_window(
    timestamp: NaiveDateTime,
    begin: Option<NaiveDateTime>,
    end: Option<NaiveDateTime>,
) -> bool {
    if let Some(begin) = begin {
        if timestamp < begin {
            return false;
        }
    }
    if let Some(end) = end {
        if timestamp > end {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    const SYNCER_LOG: &str = "\
22974:20121128:152840.119 history syncer #4 (1 loop) spent 0.010062 seconds while processing 123 items
22974:20121128:152845.310 history syncer #4 (1 loop) spent 0.000100 seconds while processing 0 items
22975:20121128:152850.421 history syncer #1 (1 loop) spent 1.500000 seconds while processing 877 items
22975:20121128:152930.000 history syncer #2 (1 loop) spent 0.489938 seconds while processing 2000 items
22975:20121128:153015.900 history syncer #2 (1 loop) spent 2.000000 seconds while processing 1000 items
22970:20121128:152841.000 some unrelated diagnostic line
";

    const POLLER_LOG: &str = "\
3021:20130123:174509.000 poller #3 spent 0.118722 seconds while updating 2000 values
3021:20130123:174515.200 poller #5 spent 13.000000 seconds while updating 256 values
3021:20130123:174539.000 poller #5 spent 0.000001 seconds while updating 0 values
3021:20130123:174600.000 poller #5 spent 9.000000 seconds while updating 999 values
";

    const AGENT_ERROR_LOG: &str = "\
4001:20121122:145559.900 agent item \"system.cpu.load\" on host \"TestHost0\" failed: first network error
4001:20121122:145600.500 agent item \"system.cpu.load\" on host \"TestHost1\" failed: first network error
4001:20121122:145600.700 agent item \"vm.memory.size\" on host \"TestHost2\" failed: first network error
4001:20121122:145600.900 agent item \"system.cpu.load\" on host \"TestHost3\" failed: first network error
4001:20121122:145601.000 agent item \"system.cpu.load\" on host \"TestHost4\" failed: first network error
4001:20121122:145601.100 agent item \"system.cpu.load\" on host \"TestHost5\" failed: first network error
";

    fn log_file(content: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.log");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        (dir, path)
    }

    fn local(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32, ms: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_milli_opt(h, mi, s, ms)
            .unwrap()
    }

    #[test]
    fn syncer_totals_skip_empty_loops() {
        let (_dir, path) = log_file(SYNCER_LOG);
        let mut log = ServerLog::new(&path);
        log.parse(None, None).unwrap();

        let totals = log.dbsync_totals();
        assert_eq!(totals.total_items, 4000);
        assert!((totals.total_elapsed - 4.0).abs() < 1e-9);
        // sum(elapsed) / sum(items) * 1000, not a mean of per-entry rates.
        assert!((totals.average_msec_per_item - 1.0).abs() < 1e-9);
    }

    #[test]
    fn window_excludes_entries_outside_bounds() {
        let (_dir, path) = log_file(SYNCER_LOG);
        let mut log = ServerLog::new(&path);

        let begin = local(2012, 11, 28, 15, 28, 50, 0);
        let end = local(2012, 11, 28, 15, 29, 30, 0);
        log.parse(Some(begin), Some(end)).unwrap();

        // The 123-item entry sits before the window and the 1000-item entry
        // after it; dropping them shrinks the total by exactly their counts.
        let totals = log.dbsync_totals();
        assert_eq!(totals.total_items, 2877);
        assert!((totals.total_elapsed - 1.989938).abs() < 1e-9);
    }

    #[test]
    fn window_bounds_are_inclusive() {
        let (_dir, path) = log_file(SYNCER_LOG);
        let mut log = ServerLog::new(&path);

        // Bounds sitting exactly on the first and last entry timestamps.
        let begin = local(2012, 11, 28, 15, 28, 40, 119);
        let end = local(2012, 11, 28, 15, 30, 15, 900);
        log.parse(Some(begin), Some(end)).unwrap();
        assert_eq!(log.dbsync_totals().total_items, 4000);
    }

    #[test]
    fn empty_window_average_is_nan() {
        let (_dir, path) = log_file(SYNCER_LOG);
        let mut log = ServerLog::new(&path);

        let begin = local(2020, 1, 1, 0, 0, 0, 0);
        log.parse(Some(begin), None).unwrap();

        let totals = log.dbsync_totals();
        assert_eq!(totals.total_items, 0);
        assert!(totals.average_msec_per_item.is_nan());
    }

    #[test]
    fn poller_totals_include_zero_value_windows() {
        let (_dir, path) = log_file(POLLER_LOG);
        let mut log = ServerLog::new(&path);

        let begin = local(2013, 1, 23, 17, 45, 9, 0);
        let end = local(2013, 1, 23, 17, 45, 39, 0);
        log.parse(Some(begin), Some(end)).unwrap();

        let totals = log.poller_totals();
        assert_eq!(totals.total_items, 2256);
        assert!((totals.total_elapsed - 13.118723).abs() < 1e-9);
    }

    #[test]
    fn agent_errors_are_window_sensitive() {
        let (_dir, path) = log_file(AGENT_ERROR_LOG);
        let mut log = ServerLog::new(&path);

        log.parse(None, None).unwrap();
        assert_eq!(log.agent_error_count(), 6);

        let begin = local(2012, 11, 22, 14, 56, 0, 500);
        let end = local(2012, 11, 22, 14, 56, 1, 0);
        log.parse(Some(begin), Some(end)).unwrap();
        assert_eq!(log.agent_error_count(), 4);
    }

    #[test]
    fn reparse_resets_tallies() {
        let (_dir, path) = log_file(SYNCER_LOG);
        let mut log = ServerLog::new(&path);

        log.parse(None, None).unwrap();
        log.parse(None, None).unwrap();
        assert_eq!(log.dbsync_totals().total_items, 4000);
    }

    #[test]
    fn missing_file_is_an_error() {
        let mut log = ServerLog::new("/nonexistent/server.log");
        assert!(log.parse(None, None).is_err());
    }

    #[test]
    fn rotate_moves_into_archive_dir() {
        let (dir, path) = log_file(SYNCER_LOG);
        let archive = dir.path().join("archive");

        let mut log = ServerLog::new(&path);
        log.set_archive_dir(&archive);
        log.rotate("40");

        assert!(!path.exists());
        assert!(archive.join("server.log.40").exists());
    }

    #[test]
    fn rotate_missing_file_warns_only() {
        let log = ServerLog::new("/nonexistent/server.log");
        // Must not panic or error out.
        log.rotate("0");
    }
}
