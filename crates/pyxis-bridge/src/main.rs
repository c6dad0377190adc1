//! Pyxis bridge - MCP code-execution sandbox broker.
//!
//! Serves a single `run_python` tool over stdio. Submitted code runs in
//! an ephemeral, network-isolated container while tool calls from inside
//! the container are proxied to upstream MCP servers on the host.

#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

mod bridge;
mod error;
mod frontend;
mod invocation;
mod response;

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use rmcp::ServiceExt;
use tracing::info;
use tracing_subscriber::EnvFilter;

use pyxis_core::{BridgeSettings, OutputMode};

use crate::bridge::Bridge;
use crate::frontend::PyxisServer;

/// How many stale per-invocation IPC directories to keep around for
/// debugging before the startup sweep removes the oldest.
const STALE_IPC_KEEP: usize = 50;

/// MCP code-execution sandbox bridge.
#[derive(Parser)]
#[command(name = "pyxis-bridge", version, about, long_about = None)]
struct Cli {
    /// Container runtime binary (overrides PYXIS_RUNTIME).
    #[arg(long)]
    runtime: Option<String>,

    /// Container image (overrides PYXIS_IMAGE).
    #[arg(long)]
    image: Option<String>,

    /// Response rendering: compact or structured (overrides
    /// PYXIS_OUTPUT_MODE).
    #[arg(long)]
    output_mode: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout is the MCP transport; all diagnostics go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut settings = BridgeSettings::from_env();
    if let Some(runtime) = cli.runtime {
        settings.runtime = Some(runtime);
    }
    if let Some(image) = cli.image {
        settings.image = image;
    }
    if let Some(mode) = cli.output_mode {
        settings.output_mode = OutputMode::parse(Some(&mode));
    }

    let bridge = Arc::new(Bridge::new(settings)?);
    bridge.state_dir().cleanup_stale_ipc_dirs(STALE_IPC_KEEP);

    info!("Pyxis bridge listening on stdio");
    let service = PyxisServer::new(Arc::clone(&bridge))
        .serve(rmcp::transport::stdio())
        .await?;
    service.waiting().await?;

    bridge.shutdown().await;
    Ok(())
}
