mod cli;
mod clock;
mod compact;
mod daemon;
mod engine;
mod error;
mod logging;
mod model;
mod server;
mod stats;
mod storage;

use anyhow::{Context, Result};
use clap::Parser;

fn main() -> Result<()> {
    let args = cli::Cli::parse();
    logging::setup_logging(&args.log_level, args.log_file.as_deref())?;

    // Must be read while the process is still single-threaded.
    let clock = clock::SystemClock::local();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?
        .block_on(cli::run(args, clock))
}
