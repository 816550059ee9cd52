use crate::clock::{Clock, SystemClock};
use crate::compact::{compact_store, join_measurements};
use crate::engine::{record, MeasurementEngine};
use crate::model::{HistoryEntry, MeasurementResult, ProbeConfig};
use crate::storage::{self, FileStore, HistoryStore};
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Parser, Clone)]
#[command(
    name = "netpulse",
    version,
    about = "Periodic network speed, latency and packet loss sampling"
)]
pub struct Cli {
    /// History file (JSON lines)
    #[arg(long, global = true)]
    pub history: Option<PathBuf>,

    /// Log level (overridden by RUST_LOG)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    /// Append logs to this file instead of stderr
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub probes: ProbeArgs,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run one measurement and append it to history (default)
    Run {
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the full history to stdout
    Data {
        #[arg(long, value_enum, default_value_t = DataFormat::Json)]
        format: DataFormat,
    },
    /// Fold old history into hourly and six-hourly medians
    Compact,
    /// Measure and compact on a fixed interval until interrupted
    #[command(alias = "service")]
    Daemon {
        /// Time between measurement cycles
        #[arg(long, default_value = "30m")]
        interval: humantime::Duration,

        /// Also serve the HTTP API on this address
        #[arg(long)]
        addr: Option<String>,
    },
    /// Serve stored history as JSON over HTTP
    Serve {
        #[arg(default_value = "127.0.0.1:4321")]
        addr: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DataFormat {
    Json,
    Csv,
}

#[derive(Debug, Args, Clone)]
pub struct ProbeArgs {
    /// GET endpoint streaming a large payload
    #[arg(
        long,
        global = true,
        default_value = "https://speed.cloudflare.com/__down?bytes=104857600"
    )]
    pub download_url: String,

    /// POST endpoint accepting a streamed body
    #[arg(long, global = true, default_value = "https://speed.cloudflare.com/__up")]
    pub upload_url: String,

    /// GET endpoint with a tiny payload
    #[arg(long, global = true, default_value = "https://speed.cloudflare.com/__down?bytes=1")]
    pub latency_url: String,

    /// Number of latency probes per cycle
    #[arg(long, global = true, default_value_t = 20)]
    pub latency_count: u32,

    /// Per-request timeout for latency probes
    #[arg(long, global = true, default_value = "5s")]
    pub latency_timeout: humantime::Duration,

    /// Pause between latency probes
    #[arg(long, global = true, default_value = "100ms")]
    pub latency_interval: humantime::Duration,

    /// Download phase duration
    #[arg(long, global = true, default_value = "10s")]
    pub download_duration: humantime::Duration,

    /// Upload phase duration
    #[arg(long, global = true, default_value = "10s")]
    pub upload_duration: humantime::Duration,

    /// Concurrent upload streams
    #[arg(long, global = true, default_value_t = 3)]
    pub upload_streams: usize,
}

/// Build a `ProbeConfig` from CLI arguments.
pub fn build_config(args: &ProbeArgs) -> ProbeConfig {
    ProbeConfig {
        download_url: args.download_url.clone(),
        upload_url: args.upload_url.clone(),
        latency_url: args.latency_url.clone(),
        latency_count: args.latency_count,
        latency_timeout: Duration::from(args.latency_timeout),
        latency_interval: Duration::from(args.latency_interval),
        download_duration: Duration::from(args.download_duration),
        upload_duration: Duration::from(args.upload_duration),
        upload_streams: args.upload_streams.max(1),
        ..ProbeConfig::default()
    }
}

fn open_store(args: &Cli) -> Result<FileStore> {
    let path = args
        .history
        .clone()
        .unwrap_or_else(storage::default_history_path);
    FileStore::open(&path).with_context(|| format!("failed to open history {}", path.display()))
}

pub async fn run(args: Cli, clock: SystemClock) -> Result<()> {
    let command = args.command.clone().unwrap_or(Command::Run { json: false });
    match command {
        Command::Run { json } => run_measurement(&args, &clock, json).await,
        Command::Data { format } => print_data(&args, format),
        Command::Compact => {
            let mut store = open_store(&args)?;
            let stats = compact_store(&mut store, &clock, join_measurements)
                .context("failed to compact history")?;
            println!("{} entries -> {} entries", stats.before, stats.after);
            Ok(())
        }
        Command::Daemon { interval, addr } => {
            let store = open_store(&args)?;
            let engine = MeasurementEngine::new(build_config(&args.probes));
            crate::daemon::run(engine, store, Arc::new(clock), interval.into(), addr).await
        }
        Command::Serve { addr } => {
            let store = open_store(&args)?;
            let shared = Arc::new(tokio::sync::Mutex::new(store));
            let shutdown = async {
                let _ = tokio::signal::ctrl_c().await;
            };
            crate::server::serve(&addr, shared, shutdown).await
        }
    }
}

async fn run_measurement(args: &Cli, clock: &dyn Clock, json: bool) -> Result<()> {
    let engine = MeasurementEngine::new(build_config(&args.probes));
    let measurement = engine.run().await;

    let mut store = open_store(args)?;
    let report = record(&mut store, clock, measurement).context("failed to track results")?;

    if json {
        let entry = HistoryEntry::new(report.result, report.time);
        println!("{}", serde_json::to_string_pretty(&entry)?);
    } else {
        print_text(&report.result);
    }

    match report.failures {
        Some(failures) => Err(anyhow::Error::new(failures).context("measurement incomplete")),
        None => Ok(()),
    }
}

fn print_text(r: &MeasurementResult) {
    println!(
        "Latency: {:.1} ms (jitter: {:.1} ms), Packet loss: {:.1}%",
        r.latency.as_secs_f64() * 1000.0,
        r.jitter.as_secs_f64() * 1000.0,
        r.packet_loss
    );
    println!("Download speed: {:.2} Mbps", r.download_speed);
    println!("Upload speed: {:.2} Mbps", r.upload_speed);
}

fn print_data(args: &Cli, format: DataFormat) -> Result<()> {
    let mut store = open_store(args)?;
    let entries: Vec<HistoryEntry<MeasurementResult>> = store
        .retrieve_all()
        .context("failed to retrieve test results")?;
    let stdout = std::io::stdout().lock();
    match format {
        DataFormat::Json => storage::write_json(stdout, &entries)?,
        DataFormat::Csv => storage::write_csv(stdout, &entries)?,
    }
    println!();
    Ok(())
}
