//! Send command - transmit one raw frame

use anyhow::{Context, Result};
use canflash::config::{parse_can_id, FlasherConfig};
use canflash::frame::CanFrame;
use canflash::transport::create_transport;

use crate::output::{format_bytes, OutputContext};

/// Parse hex data bytes, ignoring whitespace
pub fn parse_data(text: &str) -> Result<Vec<u8>> {
    let compact: String = text.split_whitespace().collect();
    hex::decode(&compact).with_context(|| format!("Invalid hex data: {}", text))
}

/// Transmit one standard CAN frame
pub async fn send(config: &FlasherConfig, id: &str, data: &str, ctx: &OutputContext) -> Result<()> {
    let id = parse_can_id(id).context("Invalid CAN ID")?;
    let data = parse_data(data)?;
    let frame = CanFrame::new(id, &data).context("Invalid frame")?;

    let transport = create_transport(&config.channel)
        .with_context(|| format!("Failed to open CAN interface {}", config.channel.interface))?;
    transport
        .transmit(&frame)
        .await
        .context("Failed to transmit frame")?;
    transport.close().await?;

    ctx.success(&format!(
        "Sent {:03X} [{}] {}",
        frame.id(),
        frame.dlc(),
        format_bytes(frame.data())
    ));
    Ok(())
}
