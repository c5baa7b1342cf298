//! Communication Service (comsrv)
//!
//! Loads the channel configuration, starts every enabled channel and runs
//! until Ctrl+C or SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use comsrv::config::{ComsrvConfig, DEFAULT_CONFIG_PATH};
use comsrv::logging::init_logging;
use comsrv::publisher::MemoryPublisher;
use comsrv::runtime::{start_communication_service, validate_channels, wait_for_shutdown};

#[derive(Debug, Clone, Parser)]
#[command(name = "comsrv", version, about = "Industrial communication service")]
struct Args {
    /// Service configuration file (YAML)
    #[arg(short, long, env = "COMSRV_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level or filter directives, overrides the configuration
    #[arg(short, long)]
    log_level: Option<String>,

    /// Build every channel from configuration, then exit
    #[arg(long)]
    validate: bool,

    /// Print the effective configuration as YAML, then exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = ComsrvConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    if args.print_config {
        print!("{}", serde_yaml::to_string(&config)?);
        return Ok(());
    }

    let _log_guard = init_logging(&config.logging, args.log_level.as_deref())?;
    info!(
        "{} v{} starting with {}",
        config.service.name,
        env!("CARGO_PKG_VERSION"),
        args.config.display()
    );

    if args.validate {
        let checked = validate_channels(&config)?;
        info!("Validation completed successfully: {} channels", checked);
        return Ok(());
    }

    let publisher = Arc::new(MemoryPublisher::new());
    let handle = start_communication_service(&config, publisher.clone()).await?;
    if !handle.failed_channels().is_empty() {
        warn!("Channels not running: {:?}", handle.failed_channels());
    }

    wait_for_shutdown().await;
    handle.shutdown().await;
    info!("Published {} updates in total", publisher.published());
    Ok(())
}
