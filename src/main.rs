//! mcp-aggregator
//!
//! Aggregating JSON-RPC proxy for MCP tool servers.
//!
//! # Architecture Overview
//!
//! ```text
//!                      ┌──────────────────────────────────────────────────────┐
//!                      │                   AGGREGATOR                         │
//!                      │                                                      │
//!   Client request     │  ┌──────────┐   ┌────────────┐   ┌──────────────┐    │
//!   ───────────────────┼─▶│ http /   │──▶│ dispatcher │──▶│    cache     │    │
//!                      │  │ stdio    │   │            │   │ exact+content│    │
//!                      │  └──────────┘   └─────┬──────┘   │ + coalescing │    │
//!                      │                       │          └──────┬───────┘    │
//!                      │                       ▼                 │ miss       │
//!                      │                ┌────────────┐           ▼            │
//!                      │                │ hash ring  │    ┌──────────────┐    │
//!                      │                │ + health   │───▶│ pool → conn  │────┼──▶ Backend
//!                      │                └────────────┘    └──────────────┘    │    (stdio/http/
//!                      │                                                      │     sse/ws)
//!                      │  ┌────────────────────────────────────────────────┐  │
//!                      │  │ reload (generations) · prober · observability  │  │
//!                      │  └────────────────────────────────────────────────┘  │
//!                      └──────────────────────────────────────────────────────┘
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};

use mcp_aggregator::config::{load_config, save_config, AggregatorConfig, BackendConfig, TransportKind};
use mcp_aggregator::lifecycle;

#[derive(Parser)]
#[command(name = "mcp-aggregator")]
#[command(version, about = "Aggregating JSON-RPC proxy for MCP tool servers", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the aggregator
    Start {
        #[arg(short, long, default_value = "aggregator.toml")]
        config: PathBuf,

        /// Serve JSON-RPC on stdin/stdout instead of HTTP
        #[arg(long)]
        stdio: bool,
    },
    /// Append a backend to the config file
    AddBackend {
        #[arg(short, long, default_value = "aggregator.toml")]
        config: PathBuf,

        #[arg(long)]
        id: String,

        /// stdio, http, sse or websocket
        #[arg(long)]
        transport: TransportKind,

        /// URL, or executable for stdio
        #[arg(long)]
        endpoint: String,

        #[arg(long, default_value_t = 1)]
        weight: u32,

        /// Argument for a stdio backend (repeatable)
        #[arg(long = "arg", allow_hyphen_values = true)]
        args: Vec<String>,

        /// KEY=VALUE environment for a stdio backend (repeatable)
        #[arg(long = "env", value_parser = parse_env)]
        env: Vec<(String, String)>,

        /// Skip the initialize handshake on new connections
        #[arg(long)]
        no_handshake: bool,
    },
    /// Print the configured backends
    List {
        #[arg(short, long, default_value = "aggregator.toml")]
        config: PathBuf,
    },
    /// Validate the config file without starting
    Validate {
        #[arg(short, long, default_value = "aggregator.toml")]
        config: PathBuf,
    },
}

fn parse_env(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", raw)),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start { config, stdio } => {
            lifecycle::start(&config, stdio).await?;
        }
        Commands::AddBackend {
            config,
            id,
            transport,
            endpoint,
            weight,
            args,
            env,
            no_handshake,
        } => {
            let mut document = load_or_default(&config)?;
            document.backends.push(BackendConfig {
                id: id.clone(),
                transport,
                endpoint,
                args,
                env: env.into_iter().collect::<BTreeMap<_, _>>(),
                weight,
                handshake: !no_handshake,
            });
            save_config(&config, &document)?;
            println!("Added backend '{}' to {}", id, config.display());
        }
        Commands::List { config } => {
            let document = load_config(&config)?;
            if document.backends.is_empty() {
                println!("No backends configured");
            }
            for backend in &document.backends {
                println!(
                    "{:<20} {:<10} weight={:<3} {}",
                    backend.id, backend.transport, backend.weight, backend.endpoint
                );
            }
        }
        Commands::Validate { config } => {
            let document = load_config(&config)?;
            println!(
                "{} is valid: {} backend(s), {} virtual nodes each",
                config.display(),
                document.backends.len(),
                document.ring.virtual_nodes
            );
        }
    }

    Ok(())
}

fn load_or_default(path: &Path) -> Result<AggregatorConfig, Box<dyn std::error::Error>> {
    if path.exists() {
        Ok(load_config(path)?)
    } else {
        Ok(AggregatorConfig::default())
    }
}
