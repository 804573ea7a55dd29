//! profiler-wire
//!
//! `probe` connects to an agent, negotiates, prints its VM properties, and
//! detaches. `agent` serves the current process to any controller that
//! connects.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use profiler_wire::agent::{serve, ProcessAgent};
use profiler_wire::config::Config;
use profiler_wire::session::Session;
use profiler_wire::transport::tcp;

#[derive(Parser, Debug)]
#[command(name = "profiler-wire")]
#[command(about = "Profiling controller/agent wire protocol tools")]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// JSON configuration file (defaults to $PROFILER_WIRE_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Connect to an agent and print its VM properties
    Probe {
        /// Agent address, e.g. 127.0.0.1:5140
        addr: String,
    },
    /// Serve this process as an agent
    Agent {
        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1:5140")]
        listen: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging (stderr so stdout carries only probe output)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    info!(
        protocol_version = %config.protocol_version,
        min_agent_version = %config.min_agent_version,
        "Loaded configuration"
    );

    match args.command {
        Mode::Probe { addr } => probe(&config, &addr).await,
        Mode::Agent { listen } => run_agent(&config, &listen).await,
    }
}

async fn probe(config: &Config, addr: &str) -> Result<()> {
    let session_config = config.session_config();
    let channel = tcp::connect(addr, config.channel_config(), session_config.connect_timeout).await?;
    let session = Session::establish(channel, session_config)
        .await
        .with_context(|| format!("Failed to negotiate with agent at {addr}"))?;

    println!("{}", session.vm_properties());

    session.detach().await.context("Failed to detach from agent")?;
    Ok(())
}

async fn run_agent(config: &Config, listen: &str) -> Result<()> {
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to listen on {listen}"))?;
    info!(addr = %listener.local_addr()?, "Agent listening");

    let handler = Arc::new(ProcessAgent::new(config.protocol_version, config.agent_id));

    loop {
        let (channel, peer) = tcp::accept(&listener, config.channel_config()).await?;
        let handler = Arc::clone(&handler);
        tokio::spawn(async move {
            match serve(Arc::new(channel), handler.as_ref()).await {
                Ok(()) => info!(%peer, "Controller session ended"),
                Err(e) => warn!(%peer, error = %e, "Controller session failed"),
            }
        });
    }
}
