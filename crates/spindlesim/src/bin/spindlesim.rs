//! spindlesim daemon binary
//!
//! Runs a simulated acquisition instrument on a UDP port until killed.
//! Point a spindle session at it with the client's outbound address.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use spindlesim::{Server, ServerConfig};
use tracing::info;

#[derive(Parser)]
#[command(name = "spindlesim")]
#[command(about = "Simulated neural acquisition instrument")]
#[command(version)]
struct Cli {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1")]
    listen: String,

    /// UDP port for the instrument side of the link
    #[arg(short, long, default_value = "51001")]
    port: u16,

    /// Number of channels streaming at boot (channels 0..N)
    #[arg(short, long, default_value = "4")]
    channels: u16,

    /// Device serial number
    #[arg(long, default_value = "12648430")]
    serial: u32,

    /// Heartbeat period in milliseconds
    #[arg(long, default_value = "100")]
    heartbeat_ms: u64,

    /// Directory for recording manifests
    #[arg(long, default_value = "recordings")]
    record_dir: PathBuf,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    info!("spindlesim {} starting", env!("CARGO_PKG_VERSION"));

    let config = ServerConfig {
        listen_address: cli.listen,
        listen_port: cli.port,
        enabled_channels: (0..cli.channels).collect(),
        serial: cli.serial,
        record_dir: Some(cli.record_dir),
        heartbeat_interval: Duration::from_millis(cli.heartbeat_ms),
        freeze_clock: false,
    };

    let server = Server::start(config)?;
    info!(addr = %server.local_addr(), channels = cli.channels, "instrument online");

    server.join();
    Ok(())
}
