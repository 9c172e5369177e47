use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use lead_monitor::config::Config;
use lead_monitor::Monitor;

#[derive(Parser, Debug)]
#[command(name = "lead-monitor", about = "Monitoring, anomaly detection and alerting for the lead pipeline")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/lead-monitor/config.toml")]
    config: String,

    /// Validate config and exit
    #[arg(long)]
    check: bool,

    /// Print version and exit
    #[arg(short, long)]
    version: bool,

    /// Collect once, print a performance report as JSON and exit
    #[arg(long)]
    report: bool,
}

#[tokio::main(worker_threads = 2)]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.version {
        println!("lead-monitor {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    // Load configuration
    let config = Config::load(&cli.config)?;

    if cli.check {
        println!("Configuration is valid.");
        return Ok(());
    }

    // Initialize logging
    init_logging(&config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        hostname = %config.monitor.hostname,
        "Starting lead monitor"
    );

    let result = if cli.report { report_once(config).await } else { run(config).await };
    if let Err(e) = result {
        error!(error = %e, "Monitor terminated with error");
        return Err(e);
    }

    Ok(())
}

fn init_logging(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.monitor.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(config: Config) -> Result<()> {
    let monitor = Monitor::new(config).context("Failed to initialize monitor")?;
    monitor.start();

    tokio::signal::ctrl_c().await.context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    monitor.stop().await;
    Ok(())
}

async fn report_once(config: Config) -> Result<()> {
    let period = chrono::Duration::from_std(config.monitor.report_interval())
        .context("report_interval out of range")?;
    let monitor = Monitor::new(config).context("Failed to initialize monitor")?;

    // the tick loop primes the rate probes immediately; one more tick a
    // second later gives them a delta
    monitor.start();
    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    monitor.collector().tick().await;
    let report = monitor.generate_performance_report(period).await;
    monitor.stop().await;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
