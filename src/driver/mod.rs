//! Benchmark orchestration.
//!
//! The driver owns the synthetic host population and walks it through a
//! level-stepped ramp: enable one more slice of hosts, let the server settle,
//! measure, repeat until the whole population is enabled. Write mode harvests
//! the server's own operational log over the measurement window; read mode
//! sweeps configured history durations with latency trials and a concurrent
//! throughput pool.

pub mod probe;

use crate::Result;
use crate::api::{HostStatus, MonitorApi, ensure_call, rpc::is_test_hostname};
use crate::config::BenchConfig;
use crate::error::ApiError;
use crate::history::{HistoryStore, open_backend};
use crate::results::{BenchmarkResults, Row, Value};
use crate::server_log::ServerLog;
use anyhow::Context;
use chrono::{Duration as ChronoDuration, Local, NaiveDateTime};
use rand::Rng;
use rand::seq::SliceRandom;
use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Host status updates go out in slices this big, one API call per slice.
const HOST_UPDATE_CHUNK: usize = 10;

/// Retry budget for a single latency trial, independent of the configured
/// API retry budget.
const LATENCY_RETRY_BOUND: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BenchmarkMode {
    Write,
    Read,
}

/// One slice of the host population, enabled as a unit.
#[derive(Debug, Clone)]
pub struct Level {
    pub index: usize,
    pub hostnames: Vec<String>,
}

/// Split the population into FIFO levels of `step` hosts each; the last
/// level takes the remainder. Order within and across levels follows the
/// population order.
pub fn partition_levels(hostnames: &[String], step: usize) -> VecDeque<Level> {
    hostnames
        .chunks(step)
        .enumerate()
        .map(|(index, chunk)| Level {
            index,
            hostnames: chunk.to_vec(),
        })
        .collect()
}

/// Pick a random `duration`-second window inside the filled data range.
/// When the range is narrower than the requested duration the window is
/// anchored at its start instead.
pub(crate) fn random_time_range(
    data_begin: NaiveDateTime,
    data_end: NaiveDateTime,
    duration: i64,
) -> (NaiveDateTime, NaiveDateTime) {
    let slack = (data_end - data_begin).num_seconds() - duration;
    let offset = if slack > 0 {
        rand::thread_rng().gen_range(0..slack)
    } else {
        0
    };
    let begin = data_begin + ChronoDuration::seconds(offset);
    (begin, begin + ChronoDuration::seconds(duration))
}

pub struct BenchmarkDriver {
    config: BenchConfig,
    api: Arc<dyn MonitorApi>,
    store: Box<dyn HistoryStore>,
    server_log: ServerLog,
    results: BenchmarkResults,

    hostnames: Vec<String>,
    remaining: VecDeque<Level>,
    processed: Vec<Level>,

    n_enabled_hosts: usize,
    n_enabled_items: usize,

    mode: BenchmarkMode,
    /// Time range of pre-filled history data that read probes draw from.
    data_window: Option<(NaiveDateTime, NaiveDateTime)>,
}

impl BenchmarkDriver {
    pub fn new(config: BenchConfig, api: Arc<dyn MonitorApi>) -> Result<Self> {
        config.validate()?;
        let store = open_backend(&config, api.clone())?;

        let mut hostnames: Vec<String> = (0..config.num_hosts)
            .map(|i| format!("TestHost{i}"))
            .collect();
        if config.shuffle_hosts {
            hostnames.shuffle(&mut rand::thread_rng());
        }
        let remaining = partition_levels(&hostnames, config.step());

        let mut server_log = ServerLog::new(&config.server_log_file);
        server_log.set_archive_dir(&config.log_archive_dir);
        let results = BenchmarkResults::new(&config);

        Ok(Self {
            config,
            api,
            store,
            server_log,
            results,
            hostnames,
            remaining,
            processed: Vec::new(),
            n_enabled_hosts: 0,
            n_enabled_items: 0,
            mode: BenchmarkMode::Write,
            data_window: None,
        })
    }

    /// Full write benchmark: register the population, ramp through every
    /// level, then deregister.
    pub fn run(&mut self) -> Result<()> {
        self.api.ensure_logged_in()?;
        self.setup(HostStatus::Unmonitored)?;
        self.run_without_setup()?;
        self.cleanup_test_hosts()?;
        Ok(())
    }

    /// Write benchmark against an already-registered population.
    pub fn run_without_setup(&mut self) -> Result<()> {
        self.api.ensure_logged_in()?;
        self.results.cleanup();
        self.config.export(None)?;
        self.disable_all_test_hosts()?;

        let total_levels = self.remaining.len();
        anyhow::ensure!(
            total_levels > 0,
            "host population partitions into zero levels"
        );

        while let Some(level) = self.remaining.pop_front() {
            println!(
                "Processing level {}/{} ({} hosts) ...",
                level.index + 1,
                total_levels,
                level.hostnames.len()
            );
            self.setup_level(level)?;
            self.warmup();
            self.measure()?;
            self.rotate_server_log();
        }

        self.disable_all_test_hosts()?;
        println!("Processed {} levels.", self.processed.len());
        Ok(())
    }

    /// Read benchmark: resolve the data window, then ramp through the levels
    /// measuring latency and throughput instead of write performance.
    pub fn run_reading_benchmark(&mut self) -> Result<()> {
        self.api.ensure_logged_in()?;
        self.mode = BenchmarkMode::Read;
        self.resolve_data_window()?;
        self.run_without_setup()
    }

    /// Register the synthetic population, replacing any leftovers from a
    /// previous run. Hosts are spread round-robin over the configured agents.
    pub fn setup(&self, status: HostStatus) -> Result<()> {
        self.api.ensure_logged_in()?;
        anyhow::ensure!(
            !self.config.agents.is_empty(),
            "at least one agent address is required"
        );
        self.cleanup_test_hosts()?;

        println!("Register {} hosts ...", self.hostnames.len());
        for (i, hostname) in self.hostnames.iter().enumerate() {
            let agent = &self.config.agents[i % self.config.agents.len()];
            ensure_call(self.config.max_retry_count, &self.results.error_log, || {
                self.api.create_host(
                    hostname,
                    &self.config.host_group,
                    &self.config.template_name,
                    agent,
                    status,
                )
            })?;
        }
        Ok(())
    }

    /// Deregister all test hosts and remove this run's output files,
    /// including the rotated-log archive.
    pub fn cleanup(&mut self) -> Result<()> {
        self.api.ensure_logged_in()?;
        self.cleanup_test_hosts()?;
        self.results.cleanup();
        remove_if_exists(Path::new(&self.config.config_output_path));
        remove_dir_if_exists(Path::new(&self.config.log_archive_dir));
        Ok(())
    }

    /// Pre-fill history data for every data host through the history store.
    pub fn fill_history(&self) -> Result<()> {
        self.api.ensure_logged_in()?;
        for hostname in self.data_hostnames() {
            println!("Fill history for {hostname} ...");
            let items = ensure_call(self.config.max_retry_count, &self.results.error_log, || {
                self.api.get_items(hostname)
            })?;
            for item in &items {
                self.store
                    .setup_histories(item)
                    .with_context(|| format!("fill history for item {}", item.id))?;
            }
        }
        Ok(())
    }

    fn setup_level(&mut self, level: Level) -> Result<()> {
        self.set_host_statuses(&level.hostnames, true)?;
        self.update_enabled_counts()?;
        self.processed.push(level);
        println!(
            "Enabled hosts: {}, enabled items: {}",
            self.n_enabled_hosts, self.n_enabled_items
        );

        if self.config.clear_db_on_every_step {
            println!("Clear history data ...");
            // Best effort: a failed clear degrades the measurement, it must
            // not abort the ramp.
            if let Err(err) = self.store.cleanup_histories() {
                tracing::warn!("failed to clear history data: {err}");
            }
        }
        Ok(())
    }

    fn set_host_statuses(&self, hostnames: &[String], enable: bool) -> Result<()> {
        for chunk in hostnames.chunks(HOST_UPDATE_CHUNK) {
            ensure_call(self.config.max_retry_count, &self.results.error_log, || {
                if enable {
                    self.api.enable_hosts(chunk)
                } else {
                    self.api.disable_hosts(chunk)
                }
            })?;
        }
        Ok(())
    }

    fn disable_all_test_hosts(&self) -> Result<()> {
        let hosts = ensure_call(self.config.max_retry_count, &self.results.error_log, || {
            self.api.get_enabled_hosts()
        })?;
        let names: Vec<String> = hosts
            .into_iter()
            .map(|host| host.name)
            .filter(|name| is_test_hostname(name))
            .collect();
        if names.is_empty() {
            return Ok(());
        }
        println!("Disable {} hosts ...", names.len());
        self.set_host_statuses(&names, false)
    }

    /// Re-count enabled hosts and items from the server instead of trusting
    /// the local ramp arithmetic; a host the server failed to enable must not
    /// be attributed to the measurement.
    fn update_enabled_counts(&mut self) -> Result<()> {
        let (n_hosts, n_items) =
            ensure_call(self.config.max_retry_count, &self.results.error_log, || {
                let hosts = self.api.get_enabled_hosts()?;
                let ids: Vec<u64> = hosts
                    .iter()
                    .filter(|host| is_test_hostname(&host.name))
                    .map(|host| host.id)
                    .collect();
                let items = self.api.get_enabled_items(&ids)?;
                Ok((ids.len(), items.len()))
            })?;
        self.n_enabled_hosts = n_hosts;
        self.n_enabled_items = n_items;
        Ok(())
    }

    fn cleanup_test_hosts(&self) -> Result<()> {
        let hosts = ensure_call(self.config.max_retry_count, &self.results.error_log, || {
            self.api.get_registered_test_hosts(&self.config.host_group)
        })?;
        if hosts.is_empty() {
            return Ok(());
        }
        println!("Remove {} registered hosts ...", hosts.len());
        for host in &hosts {
            ensure_call(self.config.max_retry_count, &self.results.error_log, || {
                self.api.delete_host(host.id)
            })?;
        }
        Ok(())
    }

    fn warmup(&self) {
        println!("Warming up for {} seconds ...", self.config.warmup_duration);
        thread::sleep(Duration::from_secs(self.config.warmup_duration));
    }

    fn measure(&mut self) -> Result<()> {
        match self.mode {
            BenchmarkMode::Write => self.measure_write(),
            BenchmarkMode::Read => self.measure_read(),
        }
    }

    fn measure_write(&mut self) -> Result<()> {
        println!(
            "Measuring write performance for {} seconds ...",
            self.config.measurement_duration
        );
        let begin = Local::now().naive_local();
        thread::sleep(Duration::from_secs(self.config.measurement_duration));
        let end = Local::now().naive_local();

        let (row, _) = self.harvest_write_window(begin, end);
        self.results.write_throughput.add(&row)?;
        self.collect_self_histories(begin, end)?;
        Ok(())
    }

    /// Harvest the server's own self-monitoring items over the window: one
    /// configured key per sink, one row per history record.
    fn collect_self_histories(&mut self, begin: NaiveDateTime, end: NaiveDateTime) -> Result<()> {
        for (i, target) in self.config.histories.clone().iter().enumerate() {
            let records =
                ensure_call(self.config.max_retry_count, &self.results.error_log, || {
                    self.api
                        .get_history_by_key(&target.host, &target.key, begin, end)
                })?;
            for record in records {
                let mut row = Row::new();
                row.insert("n_enabled_hosts", Value::Int(self.n_enabled_hosts as i64));
                row.insert("n_enabled_items", Value::Int(self.n_enabled_items as i64));
                row.insert("clock", Value::Int(record.clock));
                row.insert("value", Value::Str(record.value));
                self.results.histories[i].add(&row)?;
            }
        }
        Ok(())
    }

    /// Collect the configured self-monitoring histories over the most recent
    /// sweep-length window, without running a benchmark.
    pub fn test_history(&mut self) -> Result<()> {
        self.api.ensure_logged_in()?;
        let end = Local::now().naive_local();
        let begin = end - ChronoDuration::seconds(self.config.history_duration.max);
        self.collect_self_histories(begin, end)
    }

    /// Build a write-throughput row for `[begin, end]` from the server's
    /// operational log. An unreadable log degrades to a row with empty
    /// measurement fields rather than aborting the ramp. Returns the row and
    /// the number of histories the server wrote in the window.
    fn harvest_write_window(&mut self, begin: NaiveDateTime, end: NaiveDateTime) -> (Row, u64) {
        let mut row = Row::new();
        row.insert("begin_time", Value::Time(begin));
        row.insert("end_time", Value::Time(end));
        row.insert("n_enabled_hosts", Value::Int(self.n_enabled_hosts as i64));
        row.insert("n_enabled_items", Value::Int(self.n_enabled_items as i64));

        match self.server_log.parse(Some(begin), Some(end)) {
            Ok(()) => {
                let dbsync = self.server_log.dbsync_totals();
                let poller = self.server_log.poller_totals();
                row.insert("dbsync_average", Value::Float(dbsync.average_msec_per_item));
                row.insert("n_written_items", Value::Int(dbsync.total_items as i64));
                row.insert("total_time", Value::Float(dbsync.total_elapsed));
                row.insert("n_read_items", Value::Int(poller.total_items as i64));
                row.insert("total_read_time", Value::Float(poller.total_elapsed));
                row.insert(
                    "n_agent_errors",
                    Value::Int(self.server_log.agent_error_count() as i64),
                );
                (row, dbsync.total_items)
            }
            Err(err) => {
                tracing::warn!(
                    "failed to parse server log {}: {err}",
                    self.server_log.path().display()
                );
                (row, 0)
            }
        }
    }

    fn measure_read(&mut self) -> Result<()> {
        let sweep = self.config.history_duration.clone();
        let step = sweep.step.max(1);
        let mut duration = sweep.min;
        while duration <= sweep.max {
            self.measure_read_latency(duration)?;
            self.measure_read_throughput(duration)?;
            duration += step;
        }
        Ok(())
    }

    /// Sequential latency trials over one history duration. Each trial reads
    /// a random window of one random item; a trial that keeps failing after
    /// its retry budget, or that reads an empty window, counts as an error
    /// instead of a latency sample.
    fn measure_read_latency(&mut self, duration: i64) -> Result<()> {
        println!("Measuring read latency (history duration: {duration}s) ...");
        let mut total_time = 0.0;
        let mut success_count: i64 = 0;
        let mut error_count: i64 = 0;

        for _ in 0..self.config.read_latency.try_count {
            let outcome = ensure_call(LATENCY_RETRY_BOUND, &self.results.error_log, || {
                self.latency_trial(duration)
            });
            match outcome {
                Ok(latency) => {
                    total_time += latency;
                    success_count += 1;

                    let mut row = Row::new();
                    row.insert("n_enabled_hosts", Value::Int(self.n_enabled_hosts as i64));
                    row.insert("n_enabled_items", Value::Int(self.n_enabled_items as i64));
                    row.insert("history_duration", Value::Int(duration));
                    row.insert("read_latency", Value::Float(latency));
                    self.results.read_latency_log.add(&row)?;
                }
                Err(_) => error_count += 1,
            }
        }

        let average = if success_count > 0 {
            total_time / success_count as f64
        } else {
            0.0
        };

        let mut row = Row::new();
        row.insert("n_enabled_hosts", Value::Int(self.n_enabled_hosts as i64));
        row.insert("n_enabled_items", Value::Int(self.n_enabled_items as i64));
        row.insert("history_duration", Value::Int(duration));
        row.insert("read_latency", Value::Float(average));
        row.insert("success_count", Value::Int(success_count));
        row.insert("error_count", Value::Int(error_count));
        self.results.read_latency.add(&row)?;

        println!("Average read latency: {average} sec ({success_count} ok, {error_count} failed)");
        Ok(())
    }

    fn latency_trial(&self, duration: i64) -> std::result::Result<f64, ApiError> {
        let (data_begin, data_end) = self
            .data_window
            .ok_or_else(|| ApiError::Rejected("benchmark data window is not set".to_string()))?;
        let item = probe::random_enabled_item(self.api.as_ref(), self.data_hostnames())?;
        let (begin, end) = random_time_range(data_begin, data_end, duration);

        let started = Instant::now();
        let histories = self.store.get_histories(&item, begin, end)?;
        let elapsed = started.elapsed().as_secs_f64();

        if histories.is_empty() {
            return Err(ApiError::NoHistory);
        }
        Ok(elapsed)
    }

    fn measure_read_throughput(&mut self, duration: i64) -> Result<()> {
        println!(
            "Measuring read throughput with {} threads for {} seconds ...",
            self.config.read_throughput.num_threads, self.config.measurement_duration
        );
        let (data_begin, data_end) = self
            .data_window
            .context("benchmark data window is not set")?;

        let begin = Local::now().naive_local();
        let deadline = Instant::now() + Duration::from_secs(self.config.measurement_duration);
        let outcome = {
            let ctx = probe::ProbeContext {
                api: self.api.as_ref(),
                store: self.store.as_ref(),
                error_log: &self.results.error_log,
                max_retry: self.config.max_retry_count,
                data_hostnames: self.data_hostnames(),
                data_begin,
                data_end,
                target: probe::ProbeTarget::from_config(&self.config.read_throughput.history_group),
                history_duration: duration,
            };
            probe::run(&ctx, self.config.read_throughput.num_threads, deadline)
        };
        let end = Local::now().naive_local();

        // The server keeps writing while we read; harvest its log over the
        // same window so read and write load stay comparable side by side.
        let (write_row, written) = self.harvest_write_window(begin, end);

        let mut row = Row::new();
        row.insert("n_enabled_hosts", Value::Int(self.n_enabled_hosts as i64));
        row.insert("n_enabled_items", Value::Int(self.n_enabled_items as i64));
        row.insert("history_duration", Value::Int(duration));
        row.insert("read_histories", Value::Int(outcome.total_items as i64));
        row.insert("read_time", Value::Float(outcome.total_time));
        row.insert("written_histories", Value::Int(written as i64));
        self.results.read_throughput.add(&row)?;
        self.results.write_throughput.add(&write_row)?;

        for entry in &outcome.log {
            let mut row = Row::new();
            row.insert("time", Value::Time(entry.time));
            row.insert("n_enabled_hosts", Value::Int(self.n_enabled_hosts as i64));
            row.insert("n_enabled_items", Value::Int(self.n_enabled_items as i64));
            row.insert("thread", Value::Int(entry.thread as i64));
            row.insert("history_duration", Value::Int(duration));
            row.insert("processed_items", Value::Int(entry.processed_items as i64));
            row.insert("processed_time", Value::Float(entry.processed_time));
            self.results.read_throughput_log.add(&row)?;
        }

        println!(
            "Total read histories: {} in {} sec",
            outcome.total_items, outcome.total_time
        );
        Ok(())
    }

    /// Hosts carrying pre-filled history data: the head of the population.
    fn data_hostnames(&self) -> &[String] {
        let n = self.config.history_data.num_hosts.min(self.hostnames.len());
        &self.hostnames[..n]
    }

    fn resolve_data_window(&mut self) -> Result<()> {
        let data = &self.config.history_data;
        match (&data.begin_time, &data.end_time) {
            (Some(begin), Some(end)) => {
                let begin = parse_window_time(begin)?;
                let end = parse_window_time(end)?;
                anyhow::ensure!(begin < end, "history data window is empty");
                self.data_window = Some((begin, end));
                Ok(())
            }
            _ => self.setup_benchmark_data(),
        }
    }

    /// No explicit data window: enable the data hosts, let the server
    /// accumulate real history for the configured fill time, and use that
    /// interval as the window.
    fn setup_benchmark_data(&mut self) -> Result<()> {
        let hostnames = self.data_hostnames().to_vec();
        println!(
            "Filling benchmark data using {} hosts for {} seconds ...",
            hostnames.len(),
            self.config.history_data.fill_time
        );
        self.set_host_statuses(&hostnames, true)?;
        let begin = Local::now().naive_local();
        thread::sleep(Duration::from_secs(self.config.history_data.fill_time));
        let end = Local::now().naive_local();
        self.set_host_statuses(&hostnames, false)?;

        self.data_window = Some((begin, end));
        Ok(())
    }

    fn rotate_server_log(&self) {
        if self.config.rotate_server_log {
            self.server_log.rotate(&self.n_enabled_hosts.to_string());
        }
    }
}

fn parse_window_time(text: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S")
        .with_context(|| format!("parse history data time {text:?}"))
}

fn remove_if_exists(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!("failed to remove {}: {err}", path.display());
        }
    }
}

fn remove_dir_if_exists(path: &Path) {
    if let Err(err) = fs::remove_dir_all(path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!("failed to remove {}: {err}", path.display());
        }
    }
}
