//! SDS observer entry point
//!
//! Samples host activity in alternating ON/OFF windows and records each
//! window as a newline-delimited JSON file.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

use sds_observer::{
    ConfigOverrides, CycleContext, EventSource, ForwardingSink, HttpForwarder, ObserverConfig,
    ObserverError, ObserverMetrics, ProcessTableSource, SamplingScheduler,
};

/// SDS observer command line interface
#[derive(Parser)]
#[command(name = "sds-observer")]
#[command(about = "Sparse-sampling host telemetry agent")]
#[command(version)]
struct Cli {
    /// Path to JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Output directory for events
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Sampling duration in seconds
    #[arg(long)]
    sampling_on: Option<u64>,

    /// Sampling off duration in seconds
    #[arg(long)]
    sampling_off: Option<u64>,

    /// Optional HTTP endpoint to send events
    #[arg(long = "http")]
    http_endpoint: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Enable JSON logging
    #[arg(long)]
    json_logs: bool,

    /// Also write JSON logs to this file, rotated daily
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Prometheus textfile updated after every cycle
    #[arg(long)]
    metrics_file: Option<PathBuf>,

    /// Subcommand
    #[command(subcommand)]
    command: Option<Commands>,
}

/// Available commands
#[derive(Subcommand)]
enum Commands {
    /// Run the sampling loop (default)
    Run,

    /// Validate configuration
    Config {
        /// Show effective configuration
        #[arg(long)]
        show: bool,
    },
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            output_dir: self.output.clone(),
            sampling_on: self.sampling_on,
            sampling_off: self.sampling_off,
            http_endpoint: self.http_endpoint.clone(),
            verbose: self.verbose,
            metrics_file: self.metrics_file.clone(),
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let guard = match initialize_logging(&cli) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {:#}", e);
            process::exit(1);
        }
    };

    let result = match &cli.command {
        Some(Commands::Config { show }) => handle_config(&cli, *show),
        Some(Commands::Run) | None => run(&cli).await,
    };

    if let Err(e) = result {
        error!("{:#}", e);
        drop(guard);
        process::exit(1);
    }
}

/// Initialize logging based on command line flags
fn initialize_logging(cli: &Cli) -> anyhow::Result<Option<WorkerGuard>> {
    let log_level = if cli.verbose {
        "debug".to_string()
    } else {
        cli.log_level.to_lowercase()
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("sds_observer={}", log_level).parse()?)
        .add_directive("hyper=warn".parse()?)
        .add_directive("reqwest=warn".parse()?);

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    if cli.json_logs {
        layers.push(fmt::layer().json().boxed());
    } else {
        layers.push(fmt::layer().with_target(false).boxed());
    }

    let guard = match &cli.log_file {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
            let file_name = path
                .file_name()
                .context("log file path has no file name")?;
            let appender = tracing_appender::rolling::daily(
                dir.unwrap_or_else(|| std::path::Path::new(".")),
                file_name,
            );
            let (writer, guard) = tracing_appender::non_blocking(appender);
            layers.push(fmt::layer().json().with_ansi(false).with_writer(writer).boxed());
            Some(guard)
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .init();

    Ok(guard)
}

/// Load configuration from flags and the optional file
fn load_configuration(cli: &Cli) -> anyhow::Result<ObserverConfig> {
    if let Some(path) = &cli.config {
        info!("Loading configuration from: {}", path.display());
    }
    let config = ObserverConfig::load(cli.config.as_deref(), &cli.overrides())
        .map_err(ObserverError::from)
        .context("Failed to load config")?;
    Ok(config)
}

/// Handle configuration commands
fn handle_config(cli: &Cli, show: bool) -> anyhow::Result<()> {
    let config = load_configuration(cli)?;
    if show {
        println!("{}", serde_json::to_string_pretty(&config)?);
    } else {
        println!("Configuration is valid");
    }
    Ok(())
}

/// Run the sampling loop until SIGINT/SIGTERM
async fn run(cli: &Cli) -> anyhow::Result<()> {
    let config = Arc::new(load_configuration(cli)?);

    std::fs::create_dir_all(&config.output_dir)
        .map_err(|source| ObserverError::OutputDir {
            path: config.output_dir.clone(),
            source,
        })
        .context("Failed to create output directory")?;

    let metrics = Arc::new(ObserverMetrics::new()?);

    let source: Arc<dyn EventSource> = Arc::new(
        ProcessTableSource::new(&config)
            .map_err(ObserverError::from)
            .context("Failed to create collector")?,
    );

    let forwarder = match &config.http_endpoint {
        Some(endpoint) => {
            let forwarder = HttpForwarder::new(endpoint, &config, metrics.clone())
                .map_err(ObserverError::from)
                .context("Failed to create forwarder")?;
            info!("Forwarding events to {}", forwarder.endpoint());
            Some(Arc::new(forwarder))
        }
        None => None,
    };

    info!("Starting SDS observer");

    let scheduler = SamplingScheduler::new(CycleContext {
        config: config.clone(),
        source,
        forwarder: forwarder
            .clone()
            .map(|f| f as Arc<dyn ForwardingSink>),
        metrics,
    });
    let report = scheduler.run(shutdown_signal()).await;

    if let Some(forwarder) = forwarder {
        match Arc::try_unwrap(forwarder) {
            Ok(forwarder) => forwarder.shutdown(config.shutdown_grace()).await,
            Err(_) => warn!("Forwarder still in use at shutdown, queued events are dropped"),
        }
    }

    info!(
        "SDS observer stopped: {} cycles completed, {} failed",
        report.cycles_completed, report.cycles_failed
    );
    Ok(())
}

/// Resolve on SIGINT or SIGTERM
async fn shutdown_signal() {
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        result = signal::ctrl_c() => {
            if let Err(e) = result {
                warn!("Failed to listen for SIGINT: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Received SIGINT");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}
