use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod api;
mod config;
mod driver;
mod error;
mod history;
mod results;
mod server_log;

pub type Result<T> = anyhow::Result<T>;

use api::{HostStatus, MonitorApi, RpcClient};
use config::BenchConfig;
use driver::BenchmarkDriver;
use results::{READ_LATENCY_LOG_COLUMNS, ResultSink, stats};

#[derive(Parser)]
#[command(name = "monbench")]
#[command(about = "Monitoring server benchmark harness", long_about = None)]
struct Cli {
    /// Benchmark configuration file (JSON). Defaults target localhost.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register the host population, run the write benchmark, deregister.
    Run,
    /// Run the write benchmark against already-registered hosts.
    RunWithoutSetup,
    /// Run the read benchmark: latency and throughput over each configured
    /// history duration.
    ReadBench,
    /// Register the synthetic host population.
    Setup {
        /// Register hosts already enabled for monitoring.
        #[arg(long)]
        monitored: bool,
    },
    /// Deregister test hosts and remove output files.
    Cleanup,
    /// Pre-fill history data through the configured backend.
    FillHistory,
    /// Collect the configured self-monitoring histories once, over the most
    /// recent sweep-length window.
    TestHistory,
    /// Print read-latency statistics for a persisted latency log.
    Stats {
        /// Log file to analyze; defaults to the configured read-latency log.
        file: Option<PathBuf>,
    },
    /// Print the server's API version.
    ApiVersion,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => BenchConfig::load(path)?,
        None => BenchConfig::default(),
    };

    // Statistics are pure post-processing; no server connection needed.
    if let Commands::Stats { file } = &cli.cmd {
        let mut sink = ResultSink::new(&config.read_latency.log_file, READ_LATENCY_LOG_COLUMNS);
        sink.load(file.as_deref())?;
        let statistics = stats::analyze(&sink);
        stats::write_report(&statistics, &mut std::io::stdout().lock())?;
        return Ok(());
    }

    let api: Arc<dyn MonitorApi> = Arc::new(RpcClient::new(
        &config.uri,
        &config.login_user,
        &config.login_pass,
    )?);

    match cli.cmd {
        Commands::Run => BenchmarkDriver::new(config, api)?.run(),
        Commands::RunWithoutSetup => BenchmarkDriver::new(config, api)?.run_without_setup(),
        Commands::ReadBench => BenchmarkDriver::new(config, api)?.run_reading_benchmark(),
        Commands::Setup { monitored } => {
            let status = if monitored {
                HostStatus::Monitored
            } else {
                HostStatus::Unmonitored
            };
            BenchmarkDriver::new(config, api)?.setup(status)
        }
        Commands::Cleanup => BenchmarkDriver::new(config, api)?.cleanup(),
        Commands::FillHistory => BenchmarkDriver::new(config, api)?.fill_history(),
        Commands::TestHistory => BenchmarkDriver::new(config, api)?.test_history(),
        Commands::ApiVersion => {
            api.ensure_logged_in()?;
            println!("{}", api.api_version()?);
            Ok(())
        }
        Commands::Stats { .. } => unreachable!("handled above"),
    }
}
