//! canflash - command-line firmware flasher for CAN bootloaders
//!
//! Flashes an application image through the raw IAP protocol or through
//! UDS over ISO-TP, and offers a few bench helpers around the bus.

mod commands;
mod config;
mod output;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::commands::Protocol;
use crate::config::Overrides;
use crate::output::OutputContext;

#[derive(Parser)]
#[command(name = "canflash")]
#[command(author, version, about = "Firmware flasher for CAN bootloaders")]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "CANFLASH_CONFIG")]
    config: Option<PathBuf>,

    /// CAN interface (e.g. can0, vcan0)
    #[arg(short, long, env = "CANFLASH_INTERFACE")]
    interface: Option<String>,

    /// Bus bit rate in bit/s
    #[arg(long)]
    bitrate: Option<u32>,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    /// Minimal output (for scripting)
    #[arg(short, long)]
    quiet: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Flash through the raw-frame IAP bootloader
    Iap {
        /// Firmware image (raw binary)
        file: PathBuf,

        /// Retransmissions of an unacknowledged data packet
        #[arg(long)]
        max_retries: Option<u32>,

        /// Print every frame exchanged with the device
        #[arg(long)]
        show_frames: bool,
    },

    /// Flash through UDS over ISO-TP
    Uds {
        /// Firmware image (raw binary)
        file: PathBuf,

        /// Request CAN ID (host -> device)
        #[arg(long)]
        tx_id: Option<String>,

        /// Response CAN ID (device -> host)
        #[arg(long)]
        rx_id: Option<String>,

        /// Print every frame exchanged with the device
        #[arg(long)]
        show_frames: bool,
    },

    /// Show size, padding and CRC-32 of an image without touching the bus
    Info {
        /// Firmware image (raw binary)
        file: PathBuf,
    },

    /// Transmit one standard CAN frame
    Send {
        /// Identifier, e.g. 0x7E0
        id: String,

        /// Up to 8 data bytes as hex, e.g. "02 10 03"
        #[arg(default_value = "")]
        data: String,
    },

    /// Print received frames until Ctrl-C
    Monitor {
        /// Stop after this many seconds
        #[arg(long)]
        duration: Option<u64>,

        /// Only show these identifiers (repeatable)
        #[arg(long = "id")]
        ids: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let filter = if cli.verbose {
        EnvFilter::new("canflash=debug,canflash_cli=debug")
    } else {
        EnvFilter::new("warn")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    let ctx = OutputContext::new(cli.no_color, cli.quiet);

    let mut overrides = Overrides {
        interface: cli.interface.clone(),
        bitrate: cli.bitrate,
        ..Default::default()
    };

    match cli.command {
        Commands::Iap {
            file,
            max_retries,
            show_frames,
        } => {
            overrides.max_retries = max_retries;
            let config = config::resolve(cli.config.as_deref(), &overrides)?;
            commands::flash(Protocol::Iap, &file, &config, show_frames, &ctx).await?;
        }

        Commands::Uds {
            file,
            tx_id,
            rx_id,
            show_frames,
        } => {
            overrides.tx_id = tx_id;
            overrides.rx_id = rx_id;
            let config = config::resolve(cli.config.as_deref(), &overrides)?;
            commands::flash(Protocol::Uds, &file, &config, show_frames, &ctx).await?;
        }

        Commands::Info { file } => {
            let config = config::resolve(cli.config.as_deref(), &overrides)?;
            commands::info(&file, &config, &ctx)?;
        }

        Commands::Send { id, data } => {
            let config = config::resolve(cli.config.as_deref(), &overrides)?;
            commands::send(&config, &id, &data, &ctx).await?;
        }

        Commands::Monitor { duration, ids } => {
            let config = config::resolve(cli.config.as_deref(), &overrides)?;
            commands::monitor(&config, duration, &ids, &ctx).await?;
        }
    }

    Ok(())
}
