//! dinoxd — the dinox supervisor daemon.
//!
//! Runs a service process next to its HTTP health check:
//! - Health monitor (fixed-interval probes, consecutive-failure tracking)
//! - Restart policy enforcement
//! - Process supervisor (spawn, stop, restart with backoff)
//! - Status API
//!
//! # Usage
//!
//! ```text
//! dinoxd init --path dinox.toml
//! dinoxd check --config dinox.toml
//! dinoxd run --config dinox.toml --status-addr 127.0.0.1:9500
//! ```

mod daemon;
mod process;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use dinox_core::ServiceConfig;

const DEFAULT_FILTER: &str = "info,dinoxd=debug,dinox_health=debug";

#[derive(Parser)]
#[command(name = "dinoxd", about = "dinox service supervisor", version)]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Supervise the service and serve the status API.
    Run {
        /// Service definition file.
        #[arg(short, long, default_value = "dinox.toml")]
        config: PathBuf,

        /// Address for the status API.
        #[arg(long, default_value = "127.0.0.1:9500")]
        status_addr: SocketAddr,
    },
    /// Validate a service definition and print the resolved health check.
    Check {
        #[arg(short, long, default_value = "dinox.toml")]
        config: PathBuf,
    },
    /// Write the default dinox-app service definition.
    Init {
        #[arg(short, long, default_value = "dinox.toml")]
        path: PathBuf,

        /// Service name.
        #[arg(long, default_value = "dinox-app")]
        name: String,

        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Run { config, status_addr } => daemon::run_daemon(&config, status_addr).await,
        Command::Check { config } => check(&config),
        Command::Init { path, name, force } => init(&path, &name, force),
    }
}

fn check(path: &Path) -> anyhow::Result<()> {
    let config = ServiceConfig::from_file(path)?;
    config.validate()?;
    let spec = config.health_check()?;

    println!("service:      {}", config.service.name);
    println!("restart:      {}", config.service.restart);
    for port in config.ports()? {
        println!("port:         {port}");
    }
    for volume in config.volumes()? {
        println!("volume:       {volume}");
    }
    println!("health url:   {}", spec.url());
    println!("interval:     {:?}", spec.interval);
    println!("timeout:      {:?}", spec.timeout);
    println!("retries:      {}", spec.retries);
    if !spec.start_period.is_zero() {
        println!("start period: {:?}", spec.start_period);
    }
    Ok(())
}

fn init(path: &Path, name: &str, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }
    let config = ServiceConfig::scaffold(name);
    std::fs::write(path, config.to_toml_string()?)?;
    println!("wrote {}", path.display());
    Ok(())
}
