//! Edge proxy binary.
//!
//! # Architecture Overview
//!
//! ```text
//!                    ┌──────────────────────────────────────────────────────┐
//!                    │                    EDGE PROXY                         │
//!                    │                                                       │
//!  Client Request    │  ┌──────────┐   ┌────────────┐   ┌───────────────┐   │
//!  ──────────────────┼─▶│   net    │──▶│ middleware │──▶│   routing     │   │
//!                    │  │ listener │   │   chain    │   │ virtual hosts │   │
//!                    │  │  + tls   │   └────────────┘   └───────┬───────┘   │
//!                    │  └──────────┘                            │           │
//!                    │             ┌──────────┬─────────────────┼────────┐  │
//!                    │             ▼          ▼                 ▼        ▼  │
//!                    │         ┌───────┐ ┌────────┐   ┌──────────────┐ ┌────┐│
//!                    │         │ proxy │ │ static │   │load_balancer │ │path││
//!                    │         └───┬───┘ └────────┘   │  + health    │ │rtr ││
//!                    │             │                  └──────┬───────┘ └────┘│
//!                    │             └────────┬────────────────┘               │
//!                    │                      ▼                                │
//!                    │               ┌─────────────┐                         │
//!                    │               │ http client │─────────────────────────┼──▶ Backends
//!                    │               └─────────────┘                         │
//!                    │  Cross-cutting: config, observability, security,      │
//!                    │                 lifecycle                             │
//!                    └──────────────────────────────────────────────────────┘
//! ```

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;

use edge_proxy::config::load_config;
use edge_proxy::observability::{logging, metrics};
use edge_proxy::EdgeServerSet;

#[derive(Debug, Parser)]
#[command(name = "edge-proxy", version, about = "Multi-tenant edge reverse proxy")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "config/edge.toml")]
    config: PathBuf,

    /// Validate the configuration and exit.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{}: {}", cli.config.display(), err);
            return ExitCode::FAILURE;
        }
    };

    if cli.check {
        println!("{}: configuration ok", cli.config.display());
        return ExitCode::SUCCESS;
    }

    logging::init(&config.observability);
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        listeners = config.listeners.len(),
        "edge-proxy starting"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => {
                if let Err(err) = metrics::init_metrics(addr) {
                    tracing::error!(error = %err, "Failed to start metrics exporter");
                }
            }
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let servers = match EdgeServerSet::start(&config).await {
        Ok(servers) => servers,
        Err(err) => {
            tracing::error!(error = %err, "Startup failed");
            return ExitCode::FAILURE;
        }
    };

    servers.run_until_signal().await;
    tracing::info!("Shutdown complete");
    ExitCode::SUCCESS
}
