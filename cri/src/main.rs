//! Kina CRI - Kubernetes Container Runtime Interface binary.
//!
//! Serves CRI RuntimeService and ImageService over a Unix domain socket,
//! mapping each pod sandbox onto one lightweight VM managed by the
//! `container` CLI.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use kina_backend::ContainerCli;
use kina_core::config::ShimConfig;

use kina_cri::server::CriServer;

/// Kina CRI Runtime
#[derive(Parser, Debug)]
#[command(name = "kina-cri", about = "Kina CRI Runtime")]
struct Args {
    /// Path to the Unix domain socket for CRI communication.
    #[arg(long, default_value = "/var/run/kina/kina-cri.sock")]
    socket: PathBuf,

    /// TCP address for the exec/attach/port-forward streaming server.
    #[arg(long, default_value = "127.0.0.1:10260")]
    streaming_addr: String,

    /// Path to the backend `container` CLI. Autodetected when omitted.
    #[arg(long)]
    backend_cli: Option<PathBuf>,

    /// Image sandbox VMs boot from. Must carry a POSIX shell.
    #[arg(long)]
    sandbox_image: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = ShimConfig::default();
    config.socket_path = args.socket;
    config.streaming_addr = args.streaming_addr;
    config.backend.cli_path = args.backend_cli;
    if let Some(image) = args.sandbox_image {
        config.sandbox.image = image;
    }

    tracing::info!(
        socket = %config.socket_path.display(),
        streaming_addr = %config.streaming_addr,
        sandbox_image = %config.sandbox.image,
        "Starting Kina CRI Runtime"
    );

    let backend = Arc::new(ContainerCli::new(&config.backend)?);

    let server = CriServer::new(config, backend);
    server.serve().await?;

    Ok(())
}
