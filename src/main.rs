//! apiserve - a generic HTTP API server with phased graceful shutdown
//!
//! Usage:
//!     apiserve --config <path>
//!
//! See --help for more options.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use apiserve::config::{load_config, Config};
use apiserve::server::{ServingInfo, Signal};
use apiserve::util::{init_logging, stop_on_termination};
use apiserve::{GenericServer, ServerConfig};

/// A generic HTTP API server with readiness gating and graceful shutdown.
#[derive(Parser, Debug)]
#[command(name = "apiserve")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(&cli.config).with_context(|| {
        format!(
            "failed to load configuration from '{}'",
            cli.config.display()
        )
    })?;

    // CLI overrides config
    let log_level = cli
        .log_level
        .as_deref()
        .unwrap_or(&config.global.log_level);
    init_logging(log_level, &config.global.log_format).context("failed to initialize logging")?;

    if cli.validate {
        info!("configuration is valid");
        println!("Configuration is valid.");
        println!(
            "  Serving: {}:{} ({})",
            config.serving.bind_address, config.serving.bind_port, config.serving.bind_network
        );
        println!(
            "  Shutdown: delay {}, timeout {}",
            humantime::format_duration(config.shutdown.delay_duration),
            humantime::format_duration(config.shutdown.timeout)
        );
        return Ok(());
    }

    info!(
        config_path = %cli.config.display(),
        bind_address = %config.serving.bind_address,
        bind_port = config.serving.bind_port,
        shutdown_delay = ?config.shutdown.delay_duration,
        shutdown_timeout = ?config.shutdown.timeout,
        "apiserve starting"
    );

    run(config)
}

/// Build the runtime and serve until a termination signal arrives.
fn run(config: Config) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    runtime.block_on(run_async(config))
}

async fn run_async(config: Config) -> Result<()> {
    let mut server_config = ServerConfig::new().with_shutdown(&config.shutdown);
    let serving = ServingInfo::bind(&config.serving).with_context(|| {
        format!(
            "failed to bind {}:{}",
            config.serving.bind_address, config.serving.bind_port
        )
    })?;
    if let Some(serving) = serving {
        info!(address = %serving.local_addr(), "listening");
        server_config = server_config.with_serving(serving);
    }

    let server = GenericServer::new(server_config).context("failed to build server")?;
    let prepared = server.prepare_run().context("failed to prepare server")?;

    let stop = Signal::new("Stop");
    let _termination = stop_on_termination(stop.clone());
    info!("press Ctrl+C to stop");

    prepared
        .run(stop.signaled())
        .await
        .context("server exited with an error")?;

    info!("apiserve shut down complete");
    Ok(())
}
