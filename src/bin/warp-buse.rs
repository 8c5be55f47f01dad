//! warp-buse - serve a file or memory buffer as /dev/nbdX

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use warp_buse::{BlockBackend, Device, DeviceConfig, FileBackend, MemoryBackend};

#[derive(Parser)]
#[command(name = "warp-buse")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// TOML device configuration
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Device size in bytes (defaults to the size of --file)
    #[arg(short, long)]
    size: Option<u64>,

    /// Back the device with this file instead of memory
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// Kernel device node, e.g. /dev/nbd0
    device: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match &cli.config {
        Some(path) => DeviceConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => DeviceConfig::default(),
    };

    match (&cli.file, cli.size) {
        (Some(path), Some(size)) => {
            let backend = FileBackend::create(path, size)
                .with_context(|| format!("creating {}", path.display()))?;
            serve(&cli.device, size, backend, config).await
        }
        (Some(path), None) => {
            let backend = FileBackend::open(path)
                .with_context(|| format!("opening {}", path.display()))?;
            let size = backend.size();
            serve(&cli.device, size, backend, config).await
        }
        (None, Some(size)) => serve(&cli.device, size, MemoryBackend::new(size), config).await,
        (None, None) => bail!("either --size or --file is required"),
    }
}

async fn serve<B>(path: &Path, size: u64, backend: B, config: DeviceConfig) -> Result<()>
where
    B: BlockBackend + 'static,
{
    let device = Arc::new(
        Device::create_with_config(path, size, backend, config)
            .with_context(|| format!("creating device on {}", path.display()))?,
    );

    let shutdown = device.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, disconnecting");
            shutdown.disconnect();
        }
    });

    info!("Serving {} bytes on {}", size, path.display());
    device.connect().await.context("serving device")?;
    Ok(())
}
