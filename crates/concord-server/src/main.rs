//! # Concord
//!
//! WAMP router server: routed RPC and publish/subscribe over WebSocket and
//! RawSocket.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! concord
//!
//! # Run with custom config
//! concord --config /path/to/concord.toml
//!
//! # Print the effective configuration and exit
//! concord --print-config
//!
//! # Run with environment variables
//! CONCORD__PORT=8080 CONCORD__HOST=0.0.0.0 concord
//! ```

mod config;
mod connection;
mod handlers;
mod metrics;

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

struct Args {
    config: Option<PathBuf>,
    print_config: bool,
}

fn parse_args() -> Result<Args> {
    let mut args = Args {
        config: None,
        print_config: false,
    };
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-c" | "--config" => {
                let path = iter.next().context("--config requires a path")?;
                args.config = Some(PathBuf::from(path));
            }
            "--print-config" => args.print_config = true,
            "-h" | "--help" => {
                println!("usage: concord [--config <path>] [--print-config]");
                std::process::exit(0);
            }
            other => bail!("Unknown argument '{other}'"),
        }
    }
    Ok(args)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "concord=info,concord_core=info,concord_transport=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = parse_args()?;
    let config = config::Config::load(args.config.as_deref())?;

    if args.print_config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    tracing::info!("Starting concord on {}:{}", config.host, config.port);

    metrics::init_metrics();

    handlers::run_server(config).await?;

    Ok(())
}
