//! Info command - image facts without touching the bus

use std::path::Path;

use anyhow::{Context, Result};
use canflash::config::FlasherConfig;
use canflash::flash::raw_iap::PACKET_PAYLOAD;
use canflash::image::FirmwareImage;

use crate::output::OutputContext;

/// Show size, padding and CRC-32 of a firmware image
pub fn info(file_path: &Path, config: &FlasherConfig, ctx: &OutputContext) -> Result<()> {
    let image = FirmwareImage::load(file_path, config.image.max_size)
        .with_context(|| format!("Failed to load firmware: {}", file_path.display()))?;

    let size = image.size() as usize;
    let pairs = vec![
        ("File", file_path.display().to_string()),
        ("Size", format!("{} bytes", image.original_len())),
        ("Padded size", format!("{} bytes", size)),
        ("Padding", format!("{} bytes", image.padding_len())),
        ("CRC-32", format!("0x{:08X}", image.crc32())),
        ("IAP packets", size.div_ceil(PACKET_PAYLOAD).to_string()),
        (
            "UDS blocks",
            size.div_ceil(config.uds_flash.max_block_size).to_string(),
        ),
    ];

    ctx.print_kv(&pairs);
    Ok(())
}
