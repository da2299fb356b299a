//! Terminal output for the canflash CLI

use std::time::Instant;

use canflash::flash::FlashFailure;
use canflash::transport::{Direction, FrameEvent};
use colored::Colorize;

/// Context for output rendering
pub struct OutputContext {
    pub quiet: bool,
}

impl OutputContext {
    pub fn new(no_color: bool, quiet: bool) -> Self {
        if no_color {
            colored::control::set_override(false);
        }
        Self { quiet }
    }

    /// Print a success message (unless in quiet mode)
    pub fn success(&self, msg: &str) {
        if !self.quiet {
            println!("{}", msg.green());
        }
    }

    /// Print an info message (unless in quiet mode)
    pub fn info(&self, msg: &str) {
        if !self.quiet {
            println!("{}", msg);
        }
    }

    /// Print a warning message
    pub fn warn(&self, msg: &str) {
        eprintln!("{}", msg.yellow());
    }

    /// Print an error message
    pub fn error(&self, msg: &str) {
        eprintln!("{}", msg.red());
    }

    /// Print key-value pairs
    pub fn print_kv(&self, pairs: &[(&str, String)]) {
        let width = pairs.iter().map(|(k, _)| k.len()).max().unwrap_or(0);
        for (key, value) in pairs {
            println!("{:width$}  {}", key.bold(), value, width = width);
        }
    }

    /// Print one frame crossing the channel, timed from `start`
    pub fn print_frame(&self, event: &FrameEvent, start: Instant) {
        let elapsed = event.timestamp.saturating_duration_since(start);
        let direction = match event.direction {
            Direction::Tx => "TX".cyan(),
            Direction::Rx => "RX".magenta(),
        };
        println!(
            "{:>10.3}  {}  {:03X}  [{}]  {}",
            elapsed.as_secs_f64(),
            direction,
            event.frame.id(),
            event.frame.dlc(),
            format_bytes(event.frame.data())
        );
    }

    /// Print the context of a failed update
    pub fn print_failure(&self, failure: &FlashFailure) {
        self.error(&format!("Firmware update failed: {}", failure.source));
        let mut pairs = vec![
            ("State", failure.state.to_string()),
            ("Image size", format!("{} bytes", failure.size)),
            ("Image CRC-32", format!("0x{:08X}", failure.crc32)),
        ];
        if let Some(nrc) = failure.last_nrc {
            pairs.push((
                "Last NRC",
                format!("0x{:02X} {} ({})", u8::from(nrc), nrc, nrc.description()),
            ));
        }
        for (key, value) in pairs {
            eprintln!("  {}: {}", key.bold(), value);
        }
    }
}

/// Space-separated upper-case hex
pub fn format_bytes(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
