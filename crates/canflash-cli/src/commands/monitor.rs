//! Monitor command - print bus traffic

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use canflash::config::{parse_can_id, FlasherConfig};
use canflash::transport::{create_transport, FrameTransport, MonitoredTransport};
use tokio::sync::broadcast::error::RecvError;

use super::ctrl_c_token;
use crate::output::OutputContext;

const POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Print received frames until Ctrl-C or `duration` seconds
pub async fn monitor(
    config: &FlasherConfig,
    duration: Option<u64>,
    ids: &[String],
    ctx: &OutputContext,
) -> Result<()> {
    let filter = ids
        .iter()
        .map(|id| parse_can_id(id))
        .collect::<Result<HashSet<u32>, _>>()
        .context("Invalid --id")?;

    let transport = create_transport(&config.channel)
        .with_context(|| format!("Failed to open CAN interface {}", config.channel.interface))?;
    let monitored = Arc::new(MonitoredTransport::new(transport));
    let mut events = monitored.subscribe();

    ctx.info(&format!(
        "Monitoring {} - press Ctrl+C to stop",
        config.channel.interface
    ));

    let cancel = ctrl_c_token();
    if let Some(secs) = duration {
        let stop = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            stop.cancel();
        });
    }

    // This task is the channel's only consumer; the printer below listens
    let pump = {
        let monitored = monitored.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            while !cancel.is_cancelled() {
                match monitored.receive(64).await {
                    Ok(frames) if frames.is_empty() => tokio::time::sleep(POLL_INTERVAL).await,
                    Ok(_) => {}
                    Err(e) => {
                        cancel.cancel();
                        return Err(e);
                    }
                }
            }
            Ok(())
        })
    };

    let start = Instant::now();
    let mut shown = 0u64;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Ok(event) => {
                    if filter.is_empty() || filter.contains(&event.frame.id()) {
                        ctx.print_frame(&event, start);
                        shown += 1;
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    ctx.warn(&format!("... {} frames not shown", missed));
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    let received = pump.await.context("Receive task failed")?;
    monitored.close().await?;
    received.context("Receive failed")?;

    ctx.info(&format!("{} frames shown", shown));
    Ok(())
}
