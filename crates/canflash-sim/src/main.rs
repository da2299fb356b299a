//! canflash device simulator
//!
//! Runs a simulated flashing target on a CAN interface so the host tool can
//! be exercised without hardware.
//!
//! # Usage
//!
//! ```bash
//! # IAP bootloader on a virtual bus
//! canflash-sim --interface vcan0 iap
//!
//! # UDS ECU that needs two response-pending frames to erase
//! canflash-sim --interface vcan0 uds --erase-pending 2
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use canflash::config::FlasherConfig;
use canflash::transport::{create_transport, FrameTransport};
use canflash_sim::{IapBootloader, IapFaults, SimDevice, UdsEcu, UdsFaults};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[derive(Parser, Debug)]
#[command(name = "canflash-sim")]
#[command(about = "Simulated flashing target for canflash development")]
struct Args {
    /// Configuration file shared with the host tool (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// CAN interface name (overrides the config file)
    #[arg(short, long)]
    interface: Option<String>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    device: Device,
}

#[derive(Subcommand, Debug)]
enum Device {
    /// Raw-frame IAP bootloader
    Iap {
        /// Withhold the first ACK of this data sequence number (repeatable)
        #[arg(long = "drop-ack")]
        drop_acks: Vec<u8>,

        /// Report a plain boot before the ready frame
        #[arg(long)]
        plain_boot: bool,

        /// Compute a wrong CRC at end of transmission
        #[arg(long)]
        corrupt_crc: bool,
    },
    /// UDS application with bootloader
    Uds {
        /// Response-pending frames sent before the erase completes
        #[arg(long, default_value_t = 0)]
        erase_pending: u32,

        /// Compute a wrong CRC on transfer exit
        #[arg(long)]
        corrupt_crc: bool,

        /// Power up in the bootloader
        #[arg(long)]
        bootloader: bool,

        /// Block size advertised in flow control frames
        #[arg(long, default_value_t = 0)]
        block_size: u8,

        /// Raw STmin advertised in flow control frames
        #[arg(long, default_value_t = 0)]
        st_min: u8,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.verbose {
        "canflash_sim=debug,canflash=debug"
    } else {
        "canflash_sim=info,canflash=info"
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = match &args.config {
        Some(path) => FlasherConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => FlasherConfig::default(),
    };
    if let Some(interface) = args.interface {
        config.channel.interface = interface;
    }
    config.validate().context("Invalid configuration")?;

    let device: Box<dyn SimDevice> = match args.device {
        Device::Iap {
            drop_acks,
            plain_boot,
            corrupt_crc,
        } => {
            let mut faults = IapFaults {
                plain_boot_first: plain_boot,
                corrupt_crc,
                ..Default::default()
            };
            for sequence in drop_acks {
                *faults.drop_acks.entry(sequence).or_insert(0) += 1;
            }
            Box::new(IapBootloader::with_faults(
                config.iap.clone(),
                config.image.max_size,
                faults,
            ))
        }
        Device::Uds {
            erase_pending,
            corrupt_crc,
            bootloader,
            block_size,
            st_min,
        } => {
            let faults = UdsFaults {
                erase_pending,
                corrupt_crc,
                start_in_bootloader: bootloader,
            };
            Box::new(
                UdsEcu::with_faults(&config.isotp, config.image.max_size, faults)
                    .with_flow_control(block_size, st_min),
            )
        }
    };

    let transport = create_transport(&config.channel)
        .with_context(|| format!("Failed to open {}", config.channel.interface))?;

    info!(
        device = device.name(),
        interface = %config.channel.interface,
        "Simulator ready - waiting for frames"
    );
    info!("Press Ctrl+C to stop");

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down...");
        }
        signal.cancel();
    });

    let result = serve(transport.clone(), device, shutdown).await;
    if let Err(e) = transport.close().await {
        error!(error = %e, "Failed to close transport");
    }
    result?;

    info!("Simulator stopped");
    Ok(())
}

/// Feed every received frame to the device and transmit its replies
async fn serve(
    transport: Arc<dyn FrameTransport>,
    mut device: Box<dyn SimDevice>,
    shutdown: CancellationToken,
) -> Result<()> {
    let idle = Duration::from_millis(1);

    while !shutdown.is_cancelled() {
        let frames = transport.receive(64).await.context("Receive failed")?;
        if frames.is_empty() {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(idle) => continue,
            }
        }

        for frame in frames {
            for reply in device.on_frame(&frame) {
                debug!(
                    id = format!("0x{:03X}", reply.id()),
                    data = %hex::encode(reply.data()),
                    "Reply"
                );
                transport
                    .transmit(&reply)
                    .await
                    .context("Transmit failed")?;
            }
        }
    }
    Ok(())
}
