//! Binary entrypoint for the energomer-reader service.
//!
//! Commands:
//! - `start` - run the polling service against the configured meters
//! - `init` - create a starter `config.toml`
//!
//! See the library crate docs for module-level details: `energomer_reader::`.
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use log::info;

use energomer_reader::config::Config;
use energomer_reader::poll::PollScheduler;
use energomer_reader::sink::{ReadingSink, SqlSink};
use energomer_reader::watermark::WatermarkStore;

#[derive(Parser)]
#[command(name = "energomer-reader")]
#[command(about = "Polls Energomer-125 meters over TCP and backfills hourly archive gaps")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the polling service
    Start,
    /// Write a starter configuration file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Init => {
            init_logging(&None, cli.verbose);
            Config::create_default(&cli.config).await?;
            info!("Wrote starter configuration to {}", cli.config);
        }
        Commands::Start => {
            let config = Config::load(&cli.config).await?;
            init_logging(&Some(config.clone()), cli.verbose);
            info!("Service started (v{})", env!("CARGO_PKG_VERSION"));

            let store = WatermarkStore::load(&config.watermark_file)?;
            let sink: Arc<dyn ReadingSink> = Arc::new(SqlSink::open(
                &config.sink.database,
                config.sink.query_insert.clone(),
            )?);
            let scheduler =
                PollScheduler::new(PathBuf::from(&cli.config), config, store, sink);
            scheduler.run().await?;
        }
    }
    Ok(())
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity overrides the configured level.
    let level = match verbosity {
        0 => config
            .as_ref()
            .and_then(|cfg| cfg.logging.level.parse().ok())
            .unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(level);

    if let Some(file) = config.as_ref().and_then(|cfg| cfg.logging.file.clone()) {
        if let Ok(f) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&file)
        {
            let file_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
            // When stdout is a terminal, mirror log lines there as well.
            let is_tty = atty::is(atty::Stream::Stdout);
            builder.format(move |fmt, record| {
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                let line = format!("{} [{}] {}", ts, record.level(), record.args());
                if let Ok(mut guard) = file_mutex.lock() {
                    let _ = writeln!(guard, "{}", line);
                }
                if is_tty {
                    writeln!(fmt, "{}", line)?;
                }
                Ok(())
            });
        }
    }
    let _ = builder.try_init();
}
