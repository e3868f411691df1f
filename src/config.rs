//! Benchmark configuration.
//!
//! One explicit struct, loaded from a JSON file and passed by reference to
//! every component. Defaults mirror a small local setup so `monbench run`
//! works against a server on localhost without a config file.

use crate::Result;
use crate::error::ConfigError;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchConfig {
    /// Management API endpoint.
    pub uri: String,
    pub login_user: String,
    pub login_pass: String,

    /// Retry budget for a single API call wrapped in `ensure_call`.
    pub max_retry_count: u32,

    /// Size of the synthetic host population.
    pub num_hosts: usize,
    /// Hosts enabled per level. 0 (or >= num_hosts) means one single level.
    pub hosts_step: usize,
    /// Shuffle the population once before partitioning into levels.
    pub shuffle_hosts: bool,

    pub host_group: String,
    pub template_name: String,
    pub agents: Vec<AgentAddr>,

    /// Operational log of the server under test.
    pub server_log_file: String,
    /// Where rotated logs are archived.
    pub log_archive_dir: String,
    pub rotate_server_log: bool,

    /// Settling time after enabling a level, seconds.
    pub warmup_duration: u64,
    /// Measurement window, seconds.
    pub measurement_duration: u64,

    /// Clear the history store between levels.
    pub clear_db_on_every_step: bool,

    /// History store used by read probes: "native" or "command".
    pub history_backend: String,
    /// External CLI driven by the "command" backend.
    pub history_command: String,

    pub write_throughput_result_file: String,
    pub config_output_path: String,
    pub error_log_file: String,

    /// Self-monitoring items of the server under test, harvested after every
    /// write measurement.
    pub histories: Vec<HistoryTarget>,

    pub read_latency: ReadLatencyConfig,
    pub read_throughput: ReadThroughputConfig,

    /// Historical-range sweep for read mode, seconds.
    pub history_duration: DurationSweep,

    /// Window of pre-filled history data that read probes draw from.
    pub history_data: HistoryDataConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentAddr {
    pub ip_address: String,
    pub port: u16,
}

/// One self-monitoring item to harvest: the item `key` on `host`, appended
/// to its own result file at `path`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryTarget {
    pub host: String,
    pub key: String,
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadLatencyConfig {
    /// Trials per history-duration bucket.
    pub try_count: u32,
    pub result_file: String,
    pub log_file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadThroughputConfig {
    pub num_threads: usize,
    /// "item" probes one random enabled item, "host" one random enabled host.
    pub history_group: String,
    pub result_file: String,
    pub log_file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DurationSweep {
    pub min: i64,
    pub max: i64,
    pub step: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryDataConfig {
    /// Hosts enabled while filling benchmark data.
    pub num_hosts: usize,
    /// Seconds to let the server accumulate data when no explicit window is given.
    pub fill_time: u64,
    /// Explicit data window, "YYYY-MM-DD HH:MM:SS" local time.
    pub begin_time: Option<String>,
    pub end_time: Option<String>,
    /// Sampling interval of filled data, seconds.
    pub interval: i64,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            uri: "http://localhost/api".to_string(),
            login_user: "Admin".to_string(),
            login_pass: "admin".to_string(),
            max_retry_count: 2,
            num_hosts: 10,
            hosts_step: 0,
            shuffle_hosts: false,
            host_group: "Linux servers".to_string(),
            template_name: "Template_Linux_5sec".to_string(),
            agents: vec![AgentAddr {
                ip_address: "127.0.0.1".to_string(),
                port: 10050,
            }],
            server_log_file: "/tmp/monitor_server.log".to_string(),
            log_archive_dir: "output/log".to_string(),
            rotate_server_log: false,
            warmup_duration: 60,
            measurement_duration: 60,
            clear_db_on_every_step: false,
            history_backend: "native".to_string(),
            history_command: "history-cli".to_string(),
            write_throughput_result_file: "output/result-write-throughput.csv".to_string(),
            config_output_path: "output/config.json".to_string(),
            error_log_file: "output/log/errors.csv".to_string(),
            histories: Vec::new(),
            read_latency: ReadLatencyConfig::default(),
            read_throughput: ReadThroughputConfig::default(),
            history_duration: DurationSweep::default(),
            history_data: HistoryDataConfig::default(),
        }
    }
}

impl Default for ReadLatencyConfig {
    fn default() -> Self {
        Self {
            try_count: 10,
            result_file: "output/result-read-latency.csv".to_string(),
            log_file: "output/log/read-latency.log".to_string(),
        }
    }
}

impl Default for ReadThroughputConfig {
    fn default() -> Self {
        Self {
            num_threads: 10,
            history_group: "item".to_string(),
            result_file: "output/result-read-throughput.csv".to_string(),
            log_file: "output/log/read-throughput.log".to_string(),
        }
    }
}

impl Default for DurationSweep {
    fn default() -> Self {
        Self {
            min: 600,
            max: 600,
            step: 600,
        }
    }
}

impl Default for HistoryDataConfig {
    fn default() -> Self {
        Self {
            num_hosts: 40,
            fill_time: 60 * 60,
            begin_time: None,
            end_time: None,
            interval: 5,
        }
    }
}

impl BenchConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("read config file {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that must not reach measurement.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.num_hosts == 0 {
            return Err(ConfigError::EmptyPopulation);
        }
        // Backend names are checked here so an unknown name fails at startup,
        // not when the first probe runs.
        crate::history::BackendKind::parse(&self.history_backend)?;
        Ok(())
    }

    /// Write the resolved configuration next to the results, so a result set
    /// always carries the tunables that produced it.
    pub fn export(&self, path: Option<&Path>) -> Result<()> {
        let path = path.unwrap_or_else(|| Path::new(&self.config_output_path));
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text).with_context(|| format!("write config {}", path.display()))?;
        Ok(())
    }

    /// Hosts enabled per level. A zero or oversized `hosts_step` collapses
    /// the ramp into a single level covering the whole population.
    pub fn step(&self) -> usize {
        if self.hosts_step > 0 && self.hosts_step < self.num_hosts {
            self.hosts_step
        } else {
            self.num_hosts
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn step_clamps_to_population() {
        let mut config = BenchConfig::default();
        config.num_hosts = 41;
        config.hosts_step = 10;
        assert_eq!(config.step(), 10);

        config.hosts_step = 0;
        assert_eq!(config.step(), 41);

        config.hosts_step = 100;
        assert_eq!(config.step(), 41);
    }

    #[test]
    fn unknown_backend_is_fatal() {
        let mut config = BenchConfig::default();
        config.history_backend = "cassandra".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_merges_partial_file_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bench.json");
        std::fs::write(&path, r#"{ "num_hosts": 41, "hosts_step": 10 }"#).unwrap();

        let config = BenchConfig::load(&path).unwrap();
        assert_eq!(config.num_hosts, 41);
        assert_eq!(config.step(), 10);
        // Untouched fields keep their defaults.
        assert_eq!(config.max_retry_count, 2);
        assert_eq!(config.read_throughput.num_threads, 10);
    }

    #[test]
    fn history_targets_parse_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bench.json");
        std::fs::write(
            &path,
            r#"{
                "histories": [
                    { "host": "MonitorServer", "key": "system.cpu.load",
                      "path": "output/history-cpu.csv" }
                ]
            }"#,
        )
        .unwrap();

        let config = BenchConfig::load(&path).unwrap();
        assert_eq!(config.histories.len(), 1);
        assert_eq!(config.histories[0].key, "system.cpu.load");
    }

    #[test]
    fn export_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/config.json");

        let mut config = BenchConfig::default();
        config.num_hosts = 7;
        config.export(Some(&path)).unwrap();

        let reloaded = BenchConfig::load(&path).unwrap();
        assert_eq!(reloaded.num_hosts, 7);
    }
}
