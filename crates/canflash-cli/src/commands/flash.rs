//! Flash commands - firmware update over either protocol

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use canflash::config::FlasherConfig;
use canflash::flash::{FlashSession, TransferProgress};
use canflash::image::FirmwareImage;
use canflash::transport::{create_transport, FrameTransport, MonitoredTransport};
use canflash::{raw_iap_strategy, uds_strategy};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use super::ctrl_c_token;
use crate::output::OutputContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Iap,
    Uds,
}

/// Flash `file_path` to the device
pub async fn flash(
    protocol: Protocol,
    file_path: &Path,
    config: &FlasherConfig,
    show_frames: bool,
    ctx: &OutputContext,
) -> Result<()> {
    // The image is checked before the bus is touched
    let image = FirmwareImage::load(file_path, config.image.max_size)
        .with_context(|| format!("Failed to load firmware: {}", file_path.display()))?;
    ctx.info(&format!(
        "Firmware: {} bytes ({} padding), CRC-32 0x{:08X}",
        image.original_len(),
        image.padding_len(),
        image.crc32()
    ));

    let transport = create_transport(&config.channel)
        .with_context(|| format!("Failed to open CAN interface {}", config.channel.interface))?;
    let monitored = Arc::new(MonitoredTransport::new(transport));
    let frame_printer = show_frames.then(|| print_frames(&monitored, ctx.quiet));
    let link: Arc<dyn FrameTransport> = monitored.clone();

    let pb = ProgressBar::new(u64::from(image.size()));
    pb.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}",
        )?
        .progress_chars("=>-"),
    );
    if ctx.quiet || show_frames {
        pb.set_draw_target(indicatif::ProgressDrawTarget::hidden());
    }

    let bar = pb.clone();
    let on_progress = move |progress: &TransferProgress| {
        bar.set_position(u64::from(progress.offset));
        bar.set_message(format!("block {}", progress.blocks));
    };

    let cancel = ctrl_c_token();
    pb.set_message(match protocol {
        Protocol::Iap => "waiting for bootloader",
        Protocol::Uds => "entering programming session",
    });

    let result = match protocol {
        Protocol::Iap => {
            let mut session = FlashSession::new(raw_iap_strategy(link, config), image)
                .with_cancellation(cancel)
                .with_progress(on_progress);
            session.run().await
        }
        Protocol::Uds => {
            let mut session = FlashSession::new(uds_strategy(link, config), image)
                .with_cancellation(cancel)
                .with_progress(on_progress);
            session.run().await
        }
    };

    if let Err(e) = monitored.close().await {
        ctx.warn(&format!("Failed to close CAN interface: {}", e));
    }
    // Dropping the last handle closes the tap, the printer drains and exits
    drop(monitored);
    if let Some(printer) = frame_printer {
        let _ = tokio::time::timeout(Duration::from_secs(1), printer).await;
    }

    match result {
        Ok(progress) => {
            pb.finish_with_message("verified");
            ctx.success(&format!(
                "Firmware update completed: {} bytes in {} blocks, verified by device",
                progress.offset, progress.blocks
            ));
            Ok(())
        }
        Err(failure) => {
            pb.abandon_with_message("failed");
            ctx.print_failure(&failure);
            Err(failure.into())
        }
    }
}

/// Print every frame crossing `transport` until it is dropped
fn print_frames(transport: &MonitoredTransport, quiet: bool) -> JoinHandle<()> {
    let mut events = transport.subscribe();
    let ctx = OutputContext { quiet };
    let start = Instant::now();

    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => ctx.print_frame(&event, start),
                Err(RecvError::Lagged(missed)) => {
                    ctx.warn(&format!("... {} frames not shown", missed));
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}
